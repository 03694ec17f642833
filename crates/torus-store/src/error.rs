//! Error types for builder and ring persistence.

/// Errors returned by load and save operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Codec(#[from] postcard::Error),

    /// The file is not a builder or ring file (bad magic or truncated).
    #[error("not a valid {kind} file")]
    InvalidFormat {
        /// Human-readable file kind ("builder" or "ring").
        kind: &'static str,
    },

    /// The file carries a format version this build does not understand.
    #[error("unsupported {kind} format version {version}")]
    UnsupportedVersion {
        /// Human-readable file kind.
        kind: &'static str,
        /// The version byte found in the file.
        version: u8,
    },

    /// The decoded payload failed ring-level consistency checks.
    #[error(transparent)]
    Ring(#[from] torus_ring::RingError),
}
