//! Store Configuration
//!
//! Configuration for the file store itself (`FileStoreConfig`) and for the
//! stream it persists (`StreamConfig`), plus the constants that govern the
//! on-disk layout and the background machinery.
//!
//! ## FileStoreConfig
//!
//! - **store_dir**: parent directory for all storage
//! - **block_size**: maximum size of one block file; 0 derives a size from
//!   the retention settings
//! - **cache_expire**: idle time before a block's cache buffer is dropped
//! - **sync_interval**: how often block and index files are fsync'd
//!
//! ## Usage
//!
//! ```ignore
//! use streamvault_store::{FileStore, FileStoreConfig, StreamConfig};
//!
//! let fcfg = FileStoreConfig {
//!     store_dir: "/data/streams/orders".into(),
//!     ..Default::default()
//! };
//! let cfg = StreamConfig {
//!     name: "orders".to_string(),
//!     max_msgs: 1_000_000,
//!     ..Default::default()
//! };
//! let fs = FileStore::open(fcfg, cfg).await?;
//! ```

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Magic byte identifying store state files (index, consumer state).
pub(crate) const MAGIC: u8 = 22;
/// On-disk format version.
pub(crate) const VERSION: u8 = 1;
/// Length of the magic + version prefix.
pub(crate) const FILE_HDR_LEN: usize = 2;

/// Directory for message block files under the store dir.
pub(crate) const MSG_DIR: &str = "msgs";
/// Rename target used by purge; removed out of band.
pub(crate) const PURGE_DIR: &str = "__msgs__";
/// Directory for consumer state under the store dir.
pub(crate) const CONSUMER_DIR: &str = "obs";
/// Directory for stream templates under the store dir.
pub(crate) const TEMPLATES_DIR: &str = "templates";
/// Consumer cursor state file name.
pub(crate) const CONSUMER_STATE_FILE: &str = "o.dat";
/// Stream / consumer / template metadata file.
pub(crate) const META_FILE: &str = "meta.inf";
/// Hex checksum of the metadata file.
pub(crate) const META_SUM_FILE: &str = "meta.sum";

/// Maximum size of a write buffer we will keep around for re-use.
pub(crate) const MAX_BUF_REUSE: usize = 2 * 1024 * 1024;
/// Default cache buffer expiration.
pub(crate) const DEFAULT_CACHE_BUFFER_EXPIRATION: Duration = Duration::from_secs(5);
/// Cache slot-index expiration.
pub(crate) const DEFAULT_CACHE_IDX_EXPIRATION: Duration = Duration::from_secs(5 * 60);
/// Default background sync interval.
pub(crate) const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(10);
/// The flusher keeps gathering until at least this much is pending.
pub(crate) const COALESCE_MINIMUM: usize = 4 * 1024;
/// Maximum time the flusher will wait to gather messages.
pub(crate) const MAX_FLUSH_WAIT: Duration = Duration::from_millis(8);

/// Default block size for limits-based streams.
pub const DEFAULT_STREAM_BLOCK_SIZE: u64 = 64 * 1024 * 1024;
/// Default block size for work-queue or interest-based streams.
pub const DEFAULT_OTHER_BLOCK_SIZE: u64 = 32 * 1024 * 1024;
/// Maximum allowed block size.
pub const MAX_BLOCK_SIZE: u64 = 2 * DEFAULT_STREAM_BLOCK_SIZE;
/// Minimum block size we will derive.
pub const MIN_BLOCK_SIZE: u64 = 32 * 1000;

pub(crate) fn blk_file_name(index: u64) -> String {
    format!("{}.blk", index)
}

pub(crate) fn idx_file_name(index: u64) -> String {
    format!("{}.idx", index)
}

/// Parse a block index out of a `<index>.blk` file name.
pub(crate) fn parse_blk_file_name(name: &str) -> Option<u64> {
    name.strip_suffix(".blk")?.parse().ok()
}

/// File store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStoreConfig {
    /// Where the parent directory for all storage will be located.
    pub store_dir: PathBuf,

    /// The file block size. This also represents the maximum overhead size.
    /// 0 means derive from the stream's retention settings.
    #[serde(default)]
    pub block_size: u64,

    /// How long with no activity until we expire a block cache.
    #[serde(default, with = "duration_ms")]
    pub cache_expire: Duration,

    /// How often we sync to disk in the background.
    #[serde(default, with = "duration_ms")]
    pub sync_interval: Duration,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::new(),
            block_size: 0,
            cache_expire: Duration::ZERO,
            sync_interval: Duration::ZERO,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

/// How a stream decides which messages to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Retain until the configured limits are hit.
    #[default]
    Limits,
    /// Retain until consumed (work queue).
    WorkQueue,
    /// Retain while any consumer is interested.
    Interest,
}

/// What to do with new messages once a limit is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardPolicy {
    /// Drop the oldest messages to make room.
    #[default]
    Old,
    /// Refuse new messages.
    New,
}

/// Backing storage type for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    #[default]
    File,
    Memory,
}

/// Stream configuration persisted in `meta.inf`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,

    /// Maximum number of live messages; 0 or negative means unlimited.
    #[serde(default)]
    pub max_msgs: i64,

    /// Maximum total bytes of live messages; 0 or negative means unlimited.
    #[serde(default)]
    pub max_bytes: i64,

    /// Maximum message age before expiration; zero disables.
    #[serde(default, with = "duration_ms")]
    pub max_age: Duration,

    #[serde(default)]
    pub retention: RetentionPolicy,

    #[serde(default)]
    pub discard: DiscardPolicy,

    #[serde(default)]
    pub storage: StorageType,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            max_msgs: 0,
            max_bytes: 0,
            max_age: Duration::ZERO,
            retention: RetentionPolicy::default(),
            discard: DiscardPolicy::default(),
            storage: StorageType::default(),
        }
    }
}

/// Stream metadata as written to `meta.inf`: config plus creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStreamInfo {
    pub created: DateTime<Utc>,
    #[serde(flatten)]
    pub config: StreamConfig,
}

/// Consumer configuration persisted under `obs/<name>/meta.inf`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub durable_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_subject: Option<String>,

    /// How long a delivery may stay unacknowledged before redelivery.
    #[serde(default, with = "duration_ms")]
    pub ack_wait: Duration,

    /// Maximum delivery attempts; 0 means unlimited.
    #[serde(default)]
    pub max_deliver: i64,
}

/// Consumer metadata as written to its `meta.inf`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConsumerInfo {
    pub created: DateTime<Utc>,
    pub name: String,
    #[serde(flatten)]
    pub config: ConsumerConfig,
}

/// A stream template: a named stream config plus a stream limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamTemplate {
    pub name: String,
    pub config: StreamConfig,
    pub max_streams: u32,
}

/// Derive a block size when the config leaves it at zero.
///
/// With a byte limit we size blocks at 25% of it (rounded up to the nearest
/// 100, clamped to the supported range) so retention deletes whole blocks
/// reasonably often. Otherwise limits-based streams get large blocks and
/// everything else a smaller default.
pub fn dyn_block_size(retention: RetentionPolicy, max_bytes: i64) -> u64 {
    if max_bytes > 0 {
        let mut blk_size = (max_bytes as u64 / 4) + 1;
        let rem = blk_size % 100;
        if rem != 0 {
            blk_size += 100 - rem;
        }
        return blk_size.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE);
    }

    if retention == RetentionPolicy::Limits {
        DEFAULT_STREAM_BLOCK_SIZE
    } else {
        DEFAULT_OTHER_BLOCK_SIZE
    }
}
