//! Codec Error Types
//!
//! Errors that can surface while encoding or decoding on-disk records.
//! Store-level errors (closed store, retention refusals, cache misses) live
//! in `streamvault-store`; this crate only knows about bytes.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("malformed or corrupt record")]
    BadRecord,

    #[error("record exceeds maximum encodable size")]
    RecordTooLarge,
}
