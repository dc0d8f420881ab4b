//! StreamVault Core
//!
//! This crate holds the pieces of StreamVault that are shared between the
//! store and anything that needs to understand its on-disk bytes:
//!
//! 1. **Record codec**: the binary layout of a single message record as it
//!    appears inside a block file, including the keyed 64-bit checksum.
//! 2. **Varints**: LEB128 unsigned varints and the ZigZag signed variant
//!    used by the block index files and consumer state files.
//! 3. **Errors**: codec-level error types.
//!
//! Everything above this layer (blocks, caches, retention, consumers) lives
//! in `streamvault-store`.

pub mod error;
pub mod record;
pub mod varint;

pub use error::{Error, Result};
pub use record::{DecodedRecord, RecordHasher};
