//! Error types for ring builder operations.

/// Errors returned by builder operations.
#[derive(Debug, thiserror::Error)]
pub enum RingError {
    /// An explicit device id is already occupied.
    #[error("device id {0} is already in use")]
    DuplicateId(u32),

    /// A device with the same (ip, port, device name) tuple already exists.
    #[error("a device at {ip}:{port}/{name} already exists")]
    DuplicateIdentity {
        /// Listening address of the colliding identity.
        ip: String,
        /// Listening port of the colliding identity.
        port: u16,
        /// Device name of the colliding identity.
        name: String,
    },

    /// Device name is empty or has leading/trailing whitespace.
    #[error("invalid device name {0:?}")]
    InvalidDeviceName(String),

    /// Address is neither a valid IP literal nor a plausible hostname.
    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    /// Weight must be non-negative.
    #[error("invalid weight {0}")]
    InvalidWeight(f64),

    /// Replica count must be positive.
    #[error("replica count must be positive, got {0}")]
    InvalidReplicas(f64),

    /// Partition power out of range.
    #[error("partition power must be between 0 and 32, got {0}")]
    InvalidPartPower(u32),

    /// Overload factor must be non-negative.
    #[error("overload must be non-negative, got {0}")]
    InvalidOverload(f64),

    /// A search resolved to no device.
    #[error("no device matched the search criteria")]
    NoMatchingDevice,

    /// A search that must resolve to exactly one device matched several.
    #[error("search matched {0} devices, expected exactly one")]
    AmbiguousMatch(usize),

    /// Rebalance was asked to place partitions with no weighted devices.
    #[error("no devices with weight to place partitions on")]
    NoDevices,

    /// Fewer usable devices than replicas per partition.
    #[error("need at least {needed} devices for {replicas} replicas, have {available}")]
    TooFewDevicesForReplicas {
        /// Devices required (ceil of the replica count).
        needed: usize,
        /// Usable (non-removed) devices present.
        available: usize,
        /// Configured replica count.
        replicas: f64,
    },

    /// The assignment table references a device that is not in the registry.
    #[error("partition {partition} replica {replica} references unknown device {device}")]
    StructuralCorruption {
        /// Replica row of the bad entry.
        replica: usize,
        /// Partition of the bad entry.
        partition: u64,
        /// The dangling device id.
        device: u32,
    },

    /// Two replicas of one partition landed on the same device.
    #[error("partition {partition} has multiple replicas on device {device}")]
    DuplicateReplicaPlacement {
        /// The offending partition.
        partition: u64,
        /// The device holding more than one of its replicas.
        device: u32,
    },

    /// A device's replica count disagrees with the assignment table, or the
    /// table's total assignment count is wrong.
    #[error("assignment count mismatch: expected {expected}, found {found}")]
    PartsCountMismatch {
        /// The device whose count is off, or `None` for the table total.
        device: Option<u32>,
        /// Expected number of assignments.
        expected: u64,
        /// Number of assignments actually found.
        found: u64,
    },

    /// Strict validation found a device too far from its ideal share.
    #[error("device {device} balance {balance:.2} exceeds tolerance {tolerance:.2}")]
    BalanceOutOfTolerance {
        /// The out-of-tolerance device.
        device: u32,
        /// Its signed balance percentage.
        balance: f64,
        /// The allowed tolerance.
        tolerance: f64,
    },
}
