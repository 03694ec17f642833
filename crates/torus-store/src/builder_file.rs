//! Builder file format: the full mutable planning state.
//!
//! Layout: 4 magic bytes, 1 format version byte, then the
//! postcard-encoded [`RingBuilder`]. Writes go to a temp file in the same
//! directory and are renamed into place, so a crashed save never leaves a
//! half-written builder behind.

use std::fs;
use std::path::Path;

use torus_ring::RingBuilder;
use tracing::debug;

use crate::error::StoreError;

const BUILDER_MAGIC: &[u8; 4] = b"TRSB";
const BUILDER_FORMAT: u8 = 1;

/// Serialize `builder` to `path` atomically.
pub fn save_builder(builder: &RingBuilder, path: &Path) -> Result<(), StoreError> {
    let payload = postcard::to_allocvec(builder)?;
    let mut data = Vec::with_capacity(payload.len() + 5);
    data.extend_from_slice(BUILDER_MAGIC);
    data.push(BUILDER_FORMAT);
    data.extend_from_slice(&payload);

    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, &data)?;
    fs::rename(&tmp_path, path)?;
    debug!(path = %path.display(), bytes = data.len(), "builder saved");
    Ok(())
}

/// Load a builder previously written by [`save_builder`].
pub fn load_builder(path: &Path) -> Result<RingBuilder, StoreError> {
    let data = fs::read(path)?;
    let payload = check_header(&data, BUILDER_MAGIC, BUILDER_FORMAT, "builder")?;
    let builder: RingBuilder = postcard::from_bytes(payload)?;
    builder.validate(false)?;
    Ok(builder)
}

/// Strip and verify a magic + format-version header.
pub(crate) fn check_header<'d>(
    data: &'d [u8],
    magic: &[u8; 4],
    format: u8,
    kind: &'static str,
) -> Result<&'d [u8], StoreError> {
    if data.len() < 5 || &data[..4] != magic {
        return Err(StoreError::InvalidFormat { kind });
    }
    if data[4] != format {
        return Err(StoreError::UnsupportedVersion {
            kind,
            version: data[4],
        });
    }
    Ok(&data[5..])
}
