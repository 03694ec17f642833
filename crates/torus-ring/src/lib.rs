//! Partition placement and rebalance engine for Torus rings.
//!
//! A Torus ring maps a fixed number of *partitions* (2^part_power hash
//! slots) onto a weighted, failure-domain-aware set of storage devices.
//! This crate owns the mutable planning state — the [`RingBuilder`] — and
//! the incremental rebalance algorithm that moves partition replicas
//! toward a weight-proportional, dispersion-clean assignment while
//! honoring a minimum dwell time between moves of the same partition.
//!
//! The core is purely in-memory and single-threaded. The only source of
//! nondeterminism is the seed fed into [`RingBuilder::rebalance_at`]:
//! given identical builder state and the same seed, the resulting
//! assignment table is bit-identical.
//!
//! Persistence of builder state and the compact servable ring artifact
//! live in the `torus-store` crate.

mod analysis;
mod builder;
mod device;
mod error;
mod planner;
mod table;
mod validate;

pub use analysis::{BALANCE_TOLERANCE, DispersionReport, MAX_BALANCE};
pub use builder::RingBuilder;
pub use device::{
    Device, DeviceRegistry, DeviceSpec, InfoChanges, SearchCriteria, normalize_address,
    validate_device_name,
};
pub use error::RingError;
pub use planner::{RebalanceReport, RebalanceStatus};
pub use table::AssignmentTable;
