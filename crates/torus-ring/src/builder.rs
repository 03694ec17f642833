//! The [`RingBuilder`] facade: devices + assignment table + metadata.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::device::{Device, DeviceRegistry, DeviceSpec, InfoChanges, SearchCriteria};
use crate::error::RingError;
use crate::table::AssignmentTable;

/// The mutable planning state of a ring.
///
/// A builder is an explicit value threaded through
/// load → mutate → rebalance → save; no global state survives between
/// invocations. Any topology-changing mutation invalidates the cached
/// dispersion score; only a rebalance recomputes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingBuilder {
    pub(crate) part_power: u32,
    pub(crate) replicas: f64,
    pub(crate) min_part_hours: u32,
    pub(crate) overload: f64,
    pub(crate) version: u64,
    pub(crate) dispersion: Option<f64>,
    pub(crate) devices: DeviceRegistry,
    pub(crate) table: AssignmentTable,
}

impl RingBuilder {
    /// Create an empty builder with `2^part_power` partitions.
    pub fn new(part_power: u32, replicas: f64, min_part_hours: u32) -> Result<Self, RingError> {
        if part_power > 32 {
            return Err(RingError::InvalidPartPower(part_power));
        }
        if replicas <= 0.0 || !replicas.is_finite() {
            return Err(RingError::InvalidReplicas(replicas));
        }
        Ok(Self {
            part_power,
            replicas,
            min_part_hours,
            overload: 0.0,
            version: 0,
            dispersion: None,
            devices: DeviceRegistry::new(),
            table: AssignmentTable::new(part_power, replicas),
        })
    }

    /// Rebuild a builder from ring-artifact data (devices and assignment
    /// rows). Per-device replica counts are recomputed from the rows; the
    /// move history starts out empty.
    pub fn from_ring_data(
        part_power: u32,
        replicas: f64,
        min_part_hours: u32,
        devices: Vec<Option<Device>>,
        rows: Vec<Vec<Option<u32>>>,
        version: u64,
    ) -> Result<Self, RingError> {
        if replicas <= 0.0 || !replicas.is_finite() {
            return Err(RingError::InvalidReplicas(replicas));
        }
        let parts = 1u64 << part_power;
        let mut devices = DeviceRegistry::from_slots(devices);
        for dev in devices.iter_mut() {
            dev.parts = 0;
            dev.parts_wanted = 0;
        }
        let table = AssignmentTable::from_rows(rows, parts);
        for (replica, partition, slot) in table.slots() {
            if let Some(id) = slot {
                match devices.get_mut(id) {
                    Some(dev) => dev.parts += 1,
                    None => {
                        return Err(RingError::StructuralCorruption {
                            replica,
                            partition,
                            device: id,
                        });
                    }
                }
            }
        }
        Ok(Self {
            part_power,
            replicas,
            min_part_hours,
            overload: 0.0,
            version,
            dispersion: None,
            devices,
            table,
        })
    }

    // ----- metadata accessors -----

    /// Number of partitions (`2^part_power`).
    pub fn parts(&self) -> u64 {
        self.table.parts()
    }

    /// The partition power.
    pub fn part_power(&self) -> u32 {
        self.part_power
    }

    /// Replicas per partition (may be fractional).
    pub fn replicas(&self) -> f64 {
        self.replicas
    }

    /// Minimum dwell time before a partition may be voluntarily moved again.
    pub fn min_part_hours(&self) -> u32 {
        self.min_part_hours
    }

    /// Allowed fractional excess above a device's ideal share.
    pub fn overload(&self) -> f64 {
        self.overload
    }

    /// Monotonic counter incremented by each rebalance that changed the table.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The cached dispersion score, if a rebalance has computed one since
    /// the last topology change.
    pub fn dispersion(&self) -> Option<f64> {
        self.dispersion
    }

    /// The device registry.
    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    /// The assignment table.
    pub fn table(&self) -> &AssignmentTable {
        &self.table
    }

    /// Seconds until the partitions stamped by the last rebalance become
    /// movable again; 0 if the dwell time has passed (or nothing ever moved).
    pub fn min_part_seconds_left(&self, now: u64) -> u64 {
        match self.table.last_rebalance() {
            None => 0,
            Some(at) => {
                (u64::from(self.min_part_hours) * 3600).saturating_sub(now.saturating_sub(at))
            }
        }
    }

    // ----- registry mutations (all invalidate the dispersion cache) -----

    /// Add a device; returns its assigned id.
    pub fn add_device(&mut self, spec: DeviceSpec) -> Result<u32, RingError> {
        let id = self.devices.add(spec)?;
        self.dispersion = None;
        Ok(id)
    }

    /// Flag exactly one matching device for removal.
    pub fn remove_device(&mut self, criteria: &SearchCriteria) -> Result<u32, RingError> {
        let id = self.devices.remove(criteria)?;
        self.dispersion = None;
        Ok(id)
    }

    /// Set the weight of exactly one matching device.
    pub fn set_weight(&mut self, criteria: &SearchCriteria, weight: f64) -> Result<u32, RingError> {
        let id = self.devices.set_weight(criteria, weight)?;
        self.dispersion = None;
        Ok(id)
    }

    /// Update identity fields of exactly one matching device.
    pub fn set_info(
        &mut self,
        criteria: &SearchCriteria,
        changes: InfoChanges,
    ) -> Result<u32, RingError> {
        let id = self.devices.set_info(criteria, changes)?;
        self.dispersion = None;
        Ok(id)
    }

    /// All devices matching `criteria`, in id order.
    pub fn search(&self, criteria: &SearchCriteria) -> Vec<&Device> {
        self.devices.search(criteria)
    }

    /// Change the replica count. Shrinking drops the highest replica rows
    /// immediately; growing leaves unassigned slots for the next rebalance.
    pub fn set_replicas(&mut self, replicas: f64) -> Result<(), RingError> {
        if replicas <= 0.0 || !replicas.is_finite() {
            return Err(RingError::InvalidReplicas(replicas));
        }
        let dropped = self.table.resize_replicas(replicas);
        for id in dropped {
            if let Some(dev) = self.devices.get_mut(id) {
                dev.parts = dev.parts.saturating_sub(1);
            }
        }
        debug!(old = self.replicas, new = replicas, "set replica count");
        self.replicas = replicas;
        self.dispersion = None;
        Ok(())
    }

    /// Change the minimum dwell time.
    pub fn set_min_part_hours(&mut self, hours: u32) {
        self.min_part_hours = hours;
    }

    /// Change the overload factor (a fraction, e.g. 0.1 for 10%).
    pub fn set_overload(&mut self, overload: f64) -> Result<(), RingError> {
        if overload < 0.0 || !overload.is_finite() {
            return Err(RingError::InvalidOverload(overload));
        }
        self.overload = overload;
        Ok(())
    }

    /// Forget all move history so every partition is immediately movable.
    pub fn pretend_min_part_hours_passed(&mut self) {
        self.table.reset_move_history();
    }

    /// Partitions with at least one replica on a matching device, as
    /// `(partition, matched replica count)` sorted by count descending
    /// then partition ascending.
    pub fn list_parts(&self, criteria: &SearchCriteria) -> Result<Vec<(u64, usize)>, RingError> {
        let matched: HashSet<u32> = self.search(criteria).iter().map(|d| d.id).collect();
        if matched.is_empty() {
            return Err(RingError::NoMatchingDevice);
        }
        let mut counts: Vec<(u64, usize)> = (0..self.parts())
            .filter_map(|part| {
                let count = self
                    .table
                    .devices_for_part(part)
                    .filter(|(_, d)| matched.contains(d))
                    .count();
                (count > 0).then_some((part, count))
            })
            .collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        Ok(counts)
    }
}

/// Current unix time in seconds.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
