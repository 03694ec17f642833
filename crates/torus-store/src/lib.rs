//! On-disk persistence for Torus rings.
//!
//! Two file formats live here, both postcard payloads behind a small
//! magic + format-version header, both written atomically via a temp
//! file and rename:
//!
//! - **Builder files** (`*.builder`) hold the full mutable planning
//!   state, move history included. Operators keep these.
//! - **Ring files** (`*.ring`) hold the compact servable artifact the
//!   data path consumes, fingerprinted so staleness against a builder is
//!   detectable without comparing structures field by field.

mod builder_file;
mod error;
mod ring_file;

pub use builder_file::{load_builder, save_builder};
pub use error::StoreError;
pub use ring_file::{
    RingArtifact, RingDevice, RingFreshness, builder_from_ring, load_ring, ring_freshness,
    write_ring,
};
