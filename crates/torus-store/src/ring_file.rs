//! Servable ring format: the compact artifact handed to proxies.
//!
//! A ring file carries only what the data path needs to route a
//! partition to its devices: the device list and the replica-to-partition
//! assignment rows, plus a content fingerprint so operators can tell
//! whether a ring still matches the builder it came from. The builder's
//! move history and tuning knobs deliberately stay out.

use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use torus_ring::{Device, RingBuilder};
use tracing::debug;

use crate::builder_file::check_header;
use crate::error::StoreError;

const RING_MAGIC: &[u8; 4] = b"TRRG";
const RING_FORMAT: u8 = 1;

/// One device as seen by the data path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RingDevice {
    /// Stable id; assignment rows reference devices by this.
    pub id: u32,
    /// Top-level failure domain.
    pub region: u32,
    /// Failure domain within a region.
    pub zone: u32,
    /// Listening address.
    pub ip: String,
    /// Listening port.
    pub port: u16,
    /// Replication address.
    pub replication_ip: String,
    /// Replication port.
    pub replication_port: u16,
    /// Device name on the host.
    pub name: String,
    /// Free-form operator metadata.
    pub meta: String,
    /// Relative capacity.
    pub weight: f64,
}

/// The decoded contents of a ring file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingArtifact {
    /// Partition count is `2^part_power`.
    pub part_power: u32,
    /// Replica count the assignments were built for.
    pub replicas: f64,
    /// Builder version at the rebalance that produced this ring.
    pub builder_version: u64,
    /// Every device referenced by the assignments.
    pub devices: Vec<RingDevice>,
    /// One row per replica; each row maps partition index to device id.
    pub assignments: Vec<Vec<Option<u32>>>,
    /// BLAKE3 of the encoded devices and assignments.
    pub fingerprint: [u8; 32],
}

/// Whether a ring file still reflects a builder's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingFreshness {
    /// Device list and assignments match the builder exactly.
    UpToDate,
    /// The ring exists but was built from different builder contents.
    Obsolete,
    /// No ring file at the path.
    Missing,
    /// The file exists but is unreadable or corrupt.
    Invalid,
}

impl RingArtifact {
    /// Snapshot `builder` into a servable artifact.
    pub fn from_builder(builder: &RingBuilder) -> Result<Self, StoreError> {
        let devices = ring_devices(builder);
        let assignments = builder.table().rows().to_vec();
        let fingerprint = content_fingerprint(&devices, &assignments)?;
        Ok(Self {
            part_power: builder.part_power(),
            replicas: builder.replicas(),
            builder_version: builder.version(),
            devices,
            assignments,
            fingerprint,
        })
    }
}

/// Flatten the builder's registry into the servable device list.
///
/// Pending-removal devices are included while they still hold replicas;
/// the data path must keep reaching them until the evacuation finishes.
fn ring_devices(builder: &RingBuilder) -> Vec<RingDevice> {
    builder
        .devices()
        .iter()
        .map(|d: &Device| RingDevice {
            id: d.id,
            region: d.region,
            zone: d.zone,
            ip: d.ip.clone(),
            port: d.port,
            replication_ip: d.replication_ip.clone(),
            replication_port: d.replication_port,
            name: d.name.clone(),
            meta: d.meta.clone(),
            weight: d.weight,
        })
        .collect()
}

fn content_fingerprint(
    devices: &[RingDevice],
    assignments: &[Vec<Option<u32>>],
) -> Result<[u8; 32], StoreError> {
    let encoded = postcard::to_allocvec(&(devices, assignments))?;
    Ok(*blake3::hash(&encoded).as_bytes())
}

/// Serialize `builder`'s current assignments to a ring file at `path`.
pub fn write_ring(builder: &RingBuilder, path: &Path) -> Result<(), StoreError> {
    let artifact = RingArtifact::from_builder(builder)?;
    let payload = postcard::to_allocvec(&artifact)?;
    let mut data = Vec::with_capacity(payload.len() + 5);
    data.extend_from_slice(RING_MAGIC);
    data.push(RING_FORMAT);
    data.extend_from_slice(&payload);

    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, &data)?;
    fs::rename(&tmp_path, path)?;
    debug!(
        path = %path.display(),
        devices = artifact.devices.len(),
        builder_version = artifact.builder_version,
        "ring written"
    );
    Ok(())
}

/// Load and verify a ring file.
pub fn load_ring(path: &Path) -> Result<RingArtifact, StoreError> {
    let data = fs::read(path)?;
    let payload = check_header(&data, RING_MAGIC, RING_FORMAT, "ring")?;
    let artifact: RingArtifact = postcard::from_bytes(payload)?;
    let expected = content_fingerprint(&artifact.devices, &artifact.assignments)?;
    if artifact.fingerprint != expected {
        return Err(StoreError::InvalidFormat { kind: "ring" });
    }
    Ok(artifact)
}

/// Compare the ring file at `path` against `builder`'s current contents.
///
/// Never fails: unreadable or corrupt files report as
/// [`RingFreshness::Invalid`] and a missing file as
/// [`RingFreshness::Missing`], so status displays stay total.
pub fn ring_freshness(builder: &RingBuilder, path: &Path) -> RingFreshness {
    let artifact = match load_ring(path) {
        Ok(artifact) => artifact,
        Err(StoreError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
            return RingFreshness::Missing;
        }
        Err(_) => return RingFreshness::Invalid,
    };
    let devices = ring_devices(builder);
    match content_fingerprint(&devices, builder.table().rows()) {
        Ok(fp) if fp == artifact.fingerprint => RingFreshness::UpToDate,
        _ => RingFreshness::Obsolete,
    }
}

/// Recover a mutable builder from a ring artifact.
///
/// The ring does not carry move history or tuning, so the recovered
/// builder treats every partition as immediately movable and starts from
/// the given `min_part_hours` with default overload. Good enough to keep
/// operating after a lost builder file.
pub fn builder_from_ring(
    artifact: &RingArtifact,
    min_part_hours: u32,
) -> Result<RingBuilder, StoreError> {
    let slot_count = artifact
        .devices
        .iter()
        .map(|d| d.id as usize + 1)
        .max()
        .unwrap_or(0);
    let mut slots: Vec<Option<Device>> = vec![None; slot_count];
    for dev in &artifact.devices {
        slots[dev.id as usize] = Some(Device {
            id: dev.id,
            weight: dev.weight,
            region: dev.region,
            zone: dev.zone,
            ip: dev.ip.clone(),
            port: dev.port,
            replication_ip: dev.replication_ip.clone(),
            replication_port: dev.replication_port,
            name: dev.name.clone(),
            meta: dev.meta.clone(),
            parts: 0,
            parts_wanted: 0,
            pending_removal: false,
        });
    }
    let builder = RingBuilder::from_ring_data(
        artifact.part_power,
        artifact.replicas,
        min_part_hours,
        slots,
        artifact.assignments.clone(),
        artifact.builder_version,
    )?;
    builder.validate(false)?;
    Ok(builder)
}
