//! Device records and the id-indexed device registry.

use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RingError;

/// A storage device participating in the ring.
///
/// `parts`, `parts_wanted` and `pending_removal` are builder bookkeeping
/// maintained by the rebalance engine; everything else is operator input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Stable id; the index of this device's slot in the registry.
    pub id: u32,
    /// Relative capacity. Share of partitions is proportional to weight.
    pub weight: f64,
    /// Top-level failure domain.
    pub region: u32,
    /// Failure domain within a region.
    pub zone: u32,
    /// Listening address (IPv4/IPv6 literal or hostname, no brackets).
    pub ip: String,
    /// Listening port.
    pub port: u16,
    /// Address used for replication traffic.
    pub replication_ip: String,
    /// Port used for replication traffic.
    pub replication_port: u16,
    /// Device name on the host, e.g. `sda1`.
    pub name: String,
    /// Free-form operator metadata.
    pub meta: String,
    /// Partition replicas currently assigned to this device.
    pub parts: u64,
    /// Signed deficit (positive) or surplus (negative) toward the ideal share.
    pub parts_wanted: i64,
    /// Set by `remove`; the device sheds its replicas on the next rebalance
    /// and is dropped from the registry once it holds none.
    pub pending_removal: bool,
}

/// Operator input for adding a device.
#[derive(Debug, Clone, Default)]
pub struct DeviceSpec {
    /// Explicit id, or `None` for the lowest free slot.
    pub id: Option<u32>,
    /// Top-level failure domain.
    pub region: u32,
    /// Failure domain within a region.
    pub zone: u32,
    /// Listening address.
    pub ip: String,
    /// Listening port.
    pub port: u16,
    /// Replication address; defaults to `ip`.
    pub replication_ip: Option<String>,
    /// Replication port; defaults to `port`.
    pub replication_port: Option<u16>,
    /// Device name on the host.
    pub name: String,
    /// Free-form metadata.
    pub meta: String,
    /// Relative capacity.
    pub weight: f64,
}

/// Field updates applied by `set_info`.
///
/// Only the identity-ish fields are editable here; weight changes go
/// through `set_weight` and failure domains are fixed at add time.
#[derive(Debug, Clone, Default)]
pub struct InfoChanges {
    /// New listening address.
    pub ip: Option<String>,
    /// New listening port.
    pub port: Option<u16>,
    /// New replication address.
    pub replication_ip: Option<String>,
    /// New replication port.
    pub replication_port: Option<u16>,
    /// New device name.
    pub name: Option<String>,
    /// New metadata.
    pub meta: Option<String>,
}

/// A partial device record used to select devices.
///
/// String fields match by substring, numeric fields by exact value. An
/// empty criteria matches every device in the registry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchCriteria {
    /// Exact device id.
    pub id: Option<u32>,
    /// Exact region.
    pub region: Option<u32>,
    /// Exact zone.
    pub zone: Option<u32>,
    /// Address substring.
    pub ip: Option<String>,
    /// Exact port.
    pub port: Option<u16>,
    /// Replication address substring.
    pub replication_ip: Option<String>,
    /// Exact replication port.
    pub replication_port: Option<u16>,
    /// Device name substring.
    pub name: Option<String>,
    /// Metadata substring.
    pub meta: Option<String>,
    /// Exact weight.
    pub weight: Option<f64>,
}

impl SearchCriteria {
    /// True when no field is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Does `dev` satisfy every field set on this criteria?
    pub fn matches(&self, dev: &Device) -> bool {
        if self.id.is_some_and(|id| id != dev.id) {
            return false;
        }
        if self.region.is_some_and(|r| r != dev.region) {
            return false;
        }
        if self.zone.is_some_and(|z| z != dev.zone) {
            return false;
        }
        if self.port.is_some_and(|p| p != dev.port) {
            return false;
        }
        if self
            .replication_port
            .is_some_and(|p| p != dev.replication_port)
        {
            return false;
        }
        if self.weight.is_some_and(|w| w != dev.weight) {
            return false;
        }
        if self.ip.as_deref().is_some_and(|q| !dev.ip.contains(q)) {
            return false;
        }
        if self
            .replication_ip
            .as_deref()
            .is_some_and(|q| !dev.replication_ip.contains(q))
        {
            return false;
        }
        if self.name.as_deref().is_some_and(|q| !dev.name.contains(q)) {
            return false;
        }
        if self.meta.as_deref().is_some_and(|q| !dev.meta.contains(q)) {
            return false;
        }
        true
    }
}

/// Normalize an address for storage.
///
/// Bracketed IPv6 literals are accepted and stored without brackets; bare
/// IPv6 literals are canonicalized; IPv4 literals and resolvable hostnames
/// are stored verbatim.
pub fn normalize_address(addr: &str) -> Result<String, RingError> {
    if let Some(inner) = addr.strip_prefix('[') {
        let inner = inner
            .strip_suffix(']')
            .ok_or_else(|| RingError::InvalidAddress(addr.to_string()))?;
        let ip: Ipv6Addr = inner
            .parse()
            .map_err(|_| RingError::InvalidAddress(addr.to_string()))?;
        return Ok(ip.to_string());
    }
    if let Ok(ip) = addr.parse::<Ipv6Addr>() {
        return Ok(ip.to_string());
    }
    if addr.parse::<Ipv4Addr>().is_ok() {
        return Ok(addr.to_string());
    }
    // Hostname: anything non-empty without whitespace.
    if addr.is_empty() || addr.chars().any(char::is_whitespace) {
        return Err(RingError::InvalidAddress(addr.to_string()));
    }
    Ok(addr.to_string())
}

/// Reject empty device names and names with leading/trailing whitespace.
pub fn validate_device_name(name: &str) -> Result<(), RingError> {
    if name.is_empty() || name.trim() != name {
        return Err(RingError::InvalidDeviceName(name.to_string()));
    }
    Ok(())
}

/// Sparse, id-indexed collection of devices.
///
/// A device finalized out of the ring leaves a hole (`None`) at its slot;
/// `add` without an explicit id takes the lowest free slot. Exactly one
/// device occupies a given id at a time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceRegistry {
    slots: Vec<Option<Device>>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a registry from raw slots, e.g. when recovering a builder
    /// from a ring artifact.
    pub fn from_slots(slots: Vec<Option<Device>>) -> Self {
        Self { slots }
    }

    /// The raw id-indexed slots, holes included.
    pub fn slots(&self) -> &[Option<Device>] {
        &self.slots
    }

    /// Look up a device by id.
    pub fn get(&self, id: u32) -> Option<&Device> {
        self.slots.get(id as usize)?.as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: u32) -> Option<&mut Device> {
        self.slots.get_mut(id as usize)?.as_mut()
    }

    /// All devices in the registry, pending-removal ones included.
    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        self.slots.iter_mut().filter_map(Option::as_mut)
    }

    /// Devices that still participate in placement (not pending removal).
    pub fn active(&self) -> impl Iterator<Item = &Device> {
        self.iter().filter(|d| !d.pending_removal)
    }

    /// Number of devices, pending-removal ones included.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// True when the registry holds no devices at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of weights over active devices.
    pub fn total_weight(&self) -> f64 {
        self.active().map(|d| d.weight).sum()
    }

    /// Add a device, returning its assigned id.
    pub fn add(&mut self, spec: DeviceSpec) -> Result<u32, RingError> {
        validate_device_name(&spec.name)?;
        if spec.weight < 0.0 || !spec.weight.is_finite() {
            return Err(RingError::InvalidWeight(spec.weight));
        }
        let ip = normalize_address(&spec.ip)?;
        let replication_ip = match &spec.replication_ip {
            Some(rip) => normalize_address(rip)?,
            None => ip.clone(),
        };
        let replication_port = spec.replication_port.unwrap_or(spec.port);

        if let Some(existing) = self
            .iter()
            .find(|d| d.ip == ip && d.port == spec.port && d.name == spec.name)
        {
            return Err(RingError::DuplicateIdentity {
                ip: existing.ip.clone(),
                port: existing.port,
                name: existing.name.clone(),
            });
        }

        let id = match spec.id {
            Some(id) => {
                if self.get(id).is_some() {
                    return Err(RingError::DuplicateId(id));
                }
                id
            }
            None => self.next_free_id(),
        };
        if self.slots.len() <= id as usize {
            self.slots.resize(id as usize + 1, None);
        }

        let dev = Device {
            id,
            weight: spec.weight,
            region: spec.region,
            zone: spec.zone,
            ip,
            port: spec.port,
            replication_ip,
            replication_port,
            name: spec.name,
            meta: spec.meta,
            parts: 0,
            parts_wanted: 0,
            pending_removal: false,
        };
        debug!(
            id,
            region = dev.region,
            zone = dev.zone,
            ip = %dev.ip,
            port = dev.port,
            name = %dev.name,
            weight = dev.weight,
            "added device"
        );
        self.slots[id as usize] = Some(dev);
        Ok(id)
    }

    /// All devices matching `criteria`, in id order.
    pub fn search(&self, criteria: &SearchCriteria) -> Vec<&Device> {
        self.iter().filter(|d| criteria.matches(d)).collect()
    }

    /// Resolve a criteria to exactly one device id.
    pub fn resolve_one(&self, criteria: &SearchCriteria) -> Result<u32, RingError> {
        let matched = self.search(criteria);
        match matched.len() {
            0 => Err(RingError::NoMatchingDevice),
            1 => Ok(matched[0].id),
            n => Err(RingError::AmbiguousMatch(n)),
        }
    }

    /// Flag a device for removal: weight zeroed, replicas shed on the next
    /// rebalance. The assignment table is untouched until then.
    pub fn remove(&mut self, criteria: &SearchCriteria) -> Result<u32, RingError> {
        let id = self.resolve_one(criteria)?;
        let dev = self.get_mut(id).ok_or(RingError::NoMatchingDevice)?;
        dev.weight = 0.0;
        dev.pending_removal = true;
        debug!(id, "device flagged for removal");
        Ok(id)
    }

    /// Set the weight of exactly one matching device.
    pub fn set_weight(&mut self, criteria: &SearchCriteria, weight: f64) -> Result<u32, RingError> {
        if weight < 0.0 || !weight.is_finite() {
            return Err(RingError::InvalidWeight(weight));
        }
        let id = self.resolve_one(criteria)?;
        let dev = self.get_mut(id).ok_or(RingError::NoMatchingDevice)?;
        debug!(id, old = dev.weight, new = weight, "set device weight");
        dev.weight = weight;
        Ok(id)
    }

    /// Update identity fields of exactly one matching device.
    ///
    /// The updated (ip, port, device name) tuple must not collide with any
    /// other device's identity.
    pub fn set_info(&mut self, criteria: &SearchCriteria, changes: InfoChanges) -> Result<u32, RingError> {
        let id = self.resolve_one(criteria)?;

        if let Some(name) = &changes.name {
            validate_device_name(name)?;
        }
        let new_ip = match &changes.ip {
            Some(ip) => Some(normalize_address(ip)?),
            None => None,
        };
        let new_rip = match &changes.replication_ip {
            Some(rip) => Some(normalize_address(rip)?),
            None => None,
        };

        let current = self.get(id).ok_or(RingError::NoMatchingDevice)?;
        let ip = new_ip.unwrap_or_else(|| current.ip.clone());
        let port = changes.port.unwrap_or(current.port);
        let name = changes.name.clone().unwrap_or_else(|| current.name.clone());
        if let Some(other) = self
            .iter()
            .find(|d| d.id != id && d.ip == ip && d.port == port && d.name == name)
        {
            return Err(RingError::DuplicateIdentity {
                ip: other.ip.clone(),
                port: other.port,
                name: other.name.clone(),
            });
        }

        let dev = self.get_mut(id).ok_or(RingError::NoMatchingDevice)?;
        dev.ip = ip;
        dev.port = port;
        dev.name = name;
        if let Some(rip) = new_rip {
            dev.replication_ip = rip;
        }
        if let Some(rport) = changes.replication_port {
            dev.replication_port = rport;
        }
        if let Some(meta) = changes.meta {
            dev.meta = meta;
        }
        debug!(id, "updated device info");
        Ok(id)
    }

    /// Drop a finalized device from the registry, leaving a hole.
    pub(crate) fn finalize(&mut self, id: u32) {
        if let Some(slot) = self.slots.get_mut(id as usize) {
            debug!(id, "finalized device removal");
            *slot = None;
        }
    }

    fn next_free_id(&self) -> u32 {
        self.slots
            .iter()
            .position(Option::is_none)
            .unwrap_or(self.slots.len()) as u32
    }
}
