//! StreamVault Store
//!
//! This crate implements the file-backed message store for StreamVault
//! streams: a monotonically numbered, append-only sequence of records
//! persisted in size-bounded block files.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────┐
//! │  Publishers │
//! └──────┬──────┘
//!        │ store_msg
//!        ▼
//! ┌──────────────────┐   kick    ┌───────────────────┐
//! │ FileStore        │──────────►│ coalescing flusher│
//! │ - block set      │           └─────────┬─────────┘
//! │ - stream state   │                     ▼
//! │ - retention      │           msgs/<index>.blk + .idx
//! └──────┬───────────┘
//!        │ load_msg / remove_msg
//!        ▼
//! ┌──────────────────┐           ┌───────────────────┐
//! │ MsgBlock caches  │           │ obs/<name>/o.dat  │ ◄─ consumer cursors
//! └──────────────────┘           └───────────────────┘
//! ```
//!
//! ## Main Components
//!
//! - [`FileStore`]: the stream store. Write path with block roll-over,
//!   cache-aware reads and removals, retention enforcement (count, bytes,
//!   age), purge, and crash recovery from the block index files.
//! - [`ConsumerFileStore`]: durable per-consumer cursor state.
//! - [`TemplateFileStore`]: JSON + checksum storage for stream templates.
//! - [`FileStore::snapshot`]: consistent tar+gzip snapshot streaming.
//!
//! ## Durability model
//!
//! Writes land in a per-block write-through cache and are acknowledged
//! immediately; a background flusher coalesces and appends them to the
//! block file, and a sync timer fsyncs on an interval. Every record ends
//! with a keyed 64-bit checksum that is verified on first read and during
//! recovery, so torn or corrupted tails are detected and cut off.
//!
//! ## Usage
//!
//! ```ignore
//! use streamvault_store::{FileStore, FileStoreConfig, StreamConfig};
//!
//! let fs = FileStore::open(
//!     FileStoreConfig { store_dir: "/data/orders".into(), ..Default::default() },
//!     StreamConfig { name: "orders".into(), ..Default::default() },
//! ).await?;
//!
//! let (seq, _ts) = fs.store_msg("orders.new", &[], b"hello").await?;
//! let msg = fs.load_msg(seq).await?;
//! assert_eq!(&msg.payload[..], b"hello");
//!
//! fs.stop().await?;
//! ```

mod block;
pub mod config;
pub mod consumer;
pub mod error;
pub mod snapshot;
pub mod state;
pub mod store;
pub mod template;

pub use config::{
    dyn_block_size, ConsumerConfig, DiscardPolicy, FileConsumerInfo, FileStoreConfig,
    FileStreamInfo, RetentionPolicy, StorageType, StreamConfig, StreamTemplate,
};
pub use consumer::ConsumerFileStore;
pub use error::{Error, Result};
pub use snapshot::SnapshotResult;
pub use state::{ConsumerState, SequencePair, StoredMsg, StreamState};
pub use store::{FileStore, StorageUpdateFn};
pub use template::TemplateFileStore;

/// Current time as nanoseconds since the Unix epoch.
pub(crate) fn now_nanos() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}
