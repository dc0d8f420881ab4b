//! Consumer Cursor Store
//!
//! Durable per-consumer state: where delivery has progressed, the floor of
//! contiguous acknowledgements, and the message-by-message bookkeeping in
//! between (`pending` deliveries awaiting ack, `redelivered` counts).
//!
//! Each consumer owns a directory `obs/<name>/` with its config
//! (`meta.inf` + `meta.sum`) and a compact binary state file (`o.dat`).
//!
//! ## State file layout
//!
//! ```text
//! magic version
//! ack_floor.consumer_seq            uvarint
//! ack_floor.stream_seq              uvarint
//! delivered.consumer_seq - floor    uvarint
//! delivered.stream_seq  - floor     uvarint
//! pending_len                       uvarint
//!   [min_ts_seconds                 varint
//!    (seq - floor, ts_sec - min)*   uvarint, varint]
//! redelivered_len                   uvarint
//!   (seq, count)*                   uvarint, uvarint
//! ```
//!
//! Pending timestamps are downsampled to seconds; sub-second resolution is
//! not needed for redelivery decisions. The state file is written from
//! offset 0 and truncated lazily by the store's sync timer, which keeps
//! the hot update path to a single write.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use chrono::Utc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

use streamvault_core::record::RecordHasher;
use streamvault_core::varint;

use crate::block::check_header;
use crate::config::{
    ConsumerConfig, FileConsumerInfo, CONSUMER_DIR, CONSUMER_STATE_FILE, FILE_HDR_LEN, MAGIC,
    META_FILE, META_SUM_FILE, VERSION,
};
use crate::error::{Error, Result};
use crate::state::ConsumerState;
use crate::store::FileStore;

const NANOS_PER_SEC: i64 = 1_000_000_000;

struct ConsumerInner {
    cfg: FileConsumerInfo,
    ifd: Option<File>,
    /// Last written state size; the sync timer truncates to this.
    lwsz: u64,
    closed: bool,
}

/// Durable cursor state for one consumer of a stream.
pub struct ConsumerFileStore {
    name: String,
    odir: PathBuf,
    ifn: PathBuf,
    hh: RecordHasher,
    fs: Weak<FileStore>,
    inner: Mutex<ConsumerInner>,
}

impl FileStore {
    /// Create (or reattach to) the durable store for a named consumer.
    pub async fn consumer_store(
        self: &Arc<Self>,
        name: &str,
        cfg: ConsumerConfig,
    ) -> Result<Arc<ConsumerFileStore>> {
        if self.is_closed().await {
            return Err(Error::Closed);
        }
        if name.is_empty() {
            return Err(Error::Config("consumer name required".to_string()));
        }

        let store_dir = self.file_store_config().store_dir.clone();
        let odir = store_dir.join(CONSUMER_DIR).join(name);
        tokio::fs::create_dir_all(&odir).await.map_err(|err| {
            Error::Config(format!("could not create consumer directory - {}", err))
        })?;

        let stream_name = self.stream_config().await.name;
        let o = Arc::new(ConsumerFileStore {
            name: name.to_string(),
            ifn: odir.join(CONSUMER_STATE_FILE),
            odir,
            hh: RecordHasher::new(format!("{}/{}", stream_name, name).as_bytes()),
            fs: Arc::downgrade(self),
            inner: Mutex::new(ConsumerInner {
                cfg: FileConsumerInfo {
                    created: Utc::now(),
                    name: name.to_string(),
                    config: cfg,
                },
                ifd: None,
                lwsz: 0,
                closed: false,
            }),
        });

        // Write metadata iff it does not exist yet.
        {
            let inner = o.inner.lock().await;
            o.write_consumer_meta(&inner.cfg).await?;
        }

        let mut inner = self.inner.write().await;
        inner.cfs.push(Arc::clone(&o));
        info!(consumer = name, "consumer store opened");

        Ok(o)
    }
}

impl ConsumerFileStore {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn dir(&self) -> &PathBuf {
        &self.odir
    }

    /// Persist the cursor state. Validates the cursor invariants before
    /// writing: delivery must have started, the ack floor cannot pass it,
    /// and every pending sequence must sit between the two.
    pub async fn update(&self, state: &ConsumerState) -> Result<()> {
        if state.delivered.consumer_seq < 1 || state.delivered.stream_seq < 1 {
            return Err(Error::BadConsumerState(
                "bad delivered sequences".to_string(),
            ));
        }
        if state.ack_floor.consumer_seq > state.delivered.consumer_seq {
            return Err(Error::BadConsumerState(
                "bad ack floor for consumer".to_string(),
            ));
        }
        if state.ack_floor.stream_seq > state.delivered.stream_seq {
            return Err(Error::BadConsumerState(
                "bad ack floor for stream".to_string(),
            ));
        }

        let mut buf = Vec::with_capacity(
            64 + state.pending.len() * 12 + state.redelivered.len() * 12,
        );
        buf.push(MAGIC);
        buf.push(VERSION);

        let aflr = state.ack_floor.stream_seq;
        let maxd = state.delivered.stream_seq;

        varint::encode_varint_u64(&mut buf, state.ack_floor.consumer_seq);
        varint::encode_varint_u64(&mut buf, state.ack_floor.stream_seq);
        varint::encode_varint_u64(
            &mut buf,
            state.delivered.consumer_seq - state.ack_floor.consumer_seq,
        );
        varint::encode_varint_u64(&mut buf, maxd - aflr);
        varint::encode_varint_u64(&mut buf, state.pending.len() as u64);

        if !state.pending.is_empty() {
            // To save space, timestamps are seconds relative to the
            // smallest one present.
            let mut mints = i64::MAX;
            for (&seq, &ts) in &state.pending {
                if seq <= aflr || seq > maxd {
                    return Err(Error::BadConsumerState(format!(
                        "bad pending entry, sequence [{}] out of range",
                        seq
                    )));
                }
                if ts < mints {
                    mints = ts;
                }
            }
            let mints = mints / NANOS_PER_SEC;
            varint::encode_varint(&mut buf, mints);
            for (&seq, &ts) in &state.pending {
                varint::encode_varint_u64(&mut buf, seq - aflr);
                varint::encode_varint(&mut buf, ts / NANOS_PER_SEC - mints);
            }
        }

        varint::encode_varint_u64(&mut buf, state.redelivered.len() as u64);
        for (&seq, &count) in &state.redelivered {
            varint::encode_varint_u64(&mut buf, seq);
            varint::encode_varint_u64(&mut buf, count);
        }

        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(Error::Closed);
        }
        self.ensure_state_file_open(&mut inner).await?;
        let ifd = inner.ifd.as_mut().unwrap();
        ifd.seek(SeekFrom::Start(0)).await?;
        ifd.write_all(&buf).await?;
        inner.lwsz = buf.len() as u64;

        Ok(())
    }

    /// Read the cursor state back. `None` when nothing has been written.
    /// Only expected at startup, so this reads the whole file.
    pub async fn state(&self) -> Result<Option<ConsumerState>> {
        let _guard = self.inner.lock().await;

        let buf = match tokio::fs::read(&self.ifn).await {
            Ok(buf) => buf,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if buf.is_empty() {
            return Ok(None);
        }
        check_header(&buf)?;

        let mut bi = FILE_HDR_LEN;
        let read_u64 = |buf: &[u8], bi: &mut usize| -> Result<u64> {
            let (v, n) =
                varint::try_decode_varint_u64(&buf[*bi..]).ok_or(Error::CorruptState)?;
            *bi += n;
            Ok(v)
        };
        let read_i64 = |buf: &[u8], bi: &mut usize| -> Result<i64> {
            let (v, n) = varint::try_decode_varint(&buf[*bi..]).ok_or(Error::CorruptState)?;
            *bi += n;
            Ok(v)
        };

        let mut state = ConsumerState::default();
        state.ack_floor.consumer_seq = read_u64(&buf, &mut bi)?;
        state.ack_floor.stream_seq = read_u64(&buf, &mut bi)?;
        state.delivered.consumer_seq =
            read_u64(&buf, &mut bi)? + state.ack_floor.consumer_seq;
        state.delivered.stream_seq = read_u64(&buf, &mut bi)? + state.ack_floor.stream_seq;

        let num_pending = read_u64(&buf, &mut bi)?;
        if num_pending > 0 {
            let mints = read_i64(&buf, &mut bi)?;
            state.pending.reserve(num_pending as usize);
            for _ in 0..num_pending {
                let seq = read_u64(&buf, &mut bi)?;
                let ts = read_i64(&buf, &mut bi)?;
                if seq == 0 {
                    return Err(Error::CorruptState);
                }
                state
                    .pending
                    .insert(seq + state.ack_floor.stream_seq, (ts + mints) * NANOS_PER_SEC);
            }
        }

        let num_redelivered = read_u64(&buf, &mut bi)?;
        if num_redelivered > 0 {
            state.redelivered.reserve(num_redelivered as usize);
            for _ in 0..num_redelivered {
                let seq = read_u64(&buf, &mut bi)?;
                let count = read_u64(&buf, &mut bi)?;
                if seq == 0 || count == 0 {
                    return Err(Error::CorruptState);
                }
                state.redelivered.insert(seq, count);
            }
        }

        Ok(Some(state))
    }

    /// Replace the cached config and rewrite the metadata files. Used when
    /// recovering ephemeral consumers.
    pub async fn update_cached_config(&self, cfg: ConsumerConfig) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.cfg.config = cfg;
        // Force a rewrite: the iff-missing rule is for creation only.
        let _ = tokio::fs::remove_file(self.odir.join(META_FILE)).await;
        let _ = tokio::fs::remove_file(self.odir.join(META_SUM_FILE)).await;
        self.write_consumer_meta(&inner.cfg).await
    }

    /// Write `meta.inf` + `meta.sum` iff they do not exist yet.
    async fn write_consumer_meta(&self, cfg: &FileConsumerInfo) -> Result<()> {
        let meta = self.odir.join(META_FILE);
        if tokio::fs::metadata(&meta).await.is_ok() {
            return Ok(());
        }
        let bytes = serde_json::to_vec_pretty(cfg)
            .map_err(|err| Error::Config(format!("could not encode consumer meta: {}", err)))?;
        tokio::fs::write(&meta, &bytes).await?;

        let checksum = self.hh.hex_checksum(&bytes);
        tokio::fs::write(self.odir.join(META_SUM_FILE), checksum.as_bytes()).await?;
        Ok(())
    }

    /// fsync the state file and truncate it to the last written size.
    /// Called from the store's sync timer.
    pub(crate) async fn sync_state_file(&self) {
        let inner = self.inner.lock().await;
        if let Some(ifd) = &inner.ifd {
            let _ = ifd.sync_all().await;
            let _ = ifd.set_len(inner.lwsz).await;
        }
    }

    async fn ensure_state_file_open(&self, inner: &mut ConsumerInner) -> Result<()> {
        if inner.ifd.is_none() {
            let ifd = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&self.ifn)
                .await?;
            inner.ifd = Some(ifd);
        }
        Ok(())
    }

    /// Stop processing: sync and close the state file and unregister from
    /// the stream store.
    pub async fn stop(self: &Arc<Self>) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return Ok(());
            }
            inner.closed = true;
            if let Some(ifd) = inner.ifd.take() {
                let _ = ifd.sync_all().await;
            }
        }
        if let Some(fs) = self.fs.upgrade() {
            fs.remove_consumer(self).await;
        }
        debug!(consumer = %self.name, "consumer store stopped");
        Ok(())
    }

    /// Stop and remove the consumer's directory.
    pub async fn delete(self: &Arc<Self>) -> Result<()> {
        // OK if already stopped.
        let _ = self.stop().await;
        tokio::fs::remove_dir_all(&self.odir).await?;
        Ok(())
    }
}
