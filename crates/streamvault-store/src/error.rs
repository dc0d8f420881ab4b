//! Store Error Types
//!
//! The error taxonomy of the file store. Callers mostly care about the
//! first group (terminal or retryable conditions surfaced by the public
//! operations); the cache-miss variants are internal signals that the read
//! path resolves by loading a block and retrying once.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Operation attempted after `stop`.
    #[error("store is closed")]
    Closed,

    /// Removals are refused while a snapshot is streaming.
    #[error("snapshot in progress")]
    SnapshotInProgress,

    /// Sequence is past the end of the stream.
    #[error("end of stream reached")]
    Eof,

    /// Sequence falls in a deleted hole or an evicted gap.
    #[error("message not found")]
    MsgNotFound,

    /// Refused by the DiscardNew policy on message count.
    #[error("maximum messages exceeded")]
    MaxMsgs,

    /// Refused by the DiscardNew policy on byte total.
    #[error("maximum bytes exceeded")]
    MaxBytes,

    /// Encoded record would not fit the length field.
    #[error("message too large")]
    MsgTooLarge,

    /// Record failed to decode or its checksum did not validate.
    #[error("malformed or corrupt message")]
    BadMsg,

    /// Target sequence is present in a block's delete map.
    #[error("deleted message")]
    DeletedMsg,

    /// Block has no cache loaded.
    #[error("no message cache")]
    NoCache,

    /// Record bytes are not resident in the cache buffer.
    #[error("partial cache")]
    PartialCache,

    /// Block has no bytes pending flush.
    #[error("message block does not have pending data")]
    NoPending,

    /// A flush is already running for the block.
    #[error("flush is already running")]
    FlushRunning,

    /// Storage directory cannot be listed.
    #[error("storage directory not readable")]
    NotReadable,

    /// Consumer cursor update failed validation.
    #[error("bad consumer state: {0}")]
    BadConsumerState(String),

    /// State or index file failed its header or field checks.
    #[error("corrupt state file")]
    CorruptState,

    /// The pre-snapshot checksum sweep found corrupt records.
    #[error("snapshot check detected {0} bad messages")]
    SnapshotCheck(usize),

    /// Invalid configuration at open time.
    #[error("invalid store config: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<streamvault_core::Error> for Error {
    fn from(err: streamvault_core::Error) -> Self {
        match err {
            streamvault_core::Error::BadRecord => Error::BadMsg,
            streamvault_core::Error::RecordTooLarge => Error::MsgTooLarge,
        }
    }
}
