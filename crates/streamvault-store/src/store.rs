//! Stream Store
//!
//! The file store proper: an ordered set of message blocks, the aggregate
//! stream state, and the machinery around them.
//!
//! ## Write Flow
//!
//! ```text
//! store_msg(subj, hdr, msg)
//!     ↓
//! tail block cache        ← encoded record + slot index
//!     ↓ kick
//! coalescing flusher      ← drains pending bytes to <index>.blk
//!     ↓
//! sync timer              ← fsync + index truncate on an interval
//! ```
//!
//! Reads locate the owning block by sequence (the block's last sequence is
//! published atomically so selection runs under the read lock), then go
//! through the block cache. Removals hit the cache-aware path in the block:
//! the FIFO case advances the first sequence, interior deletes land in the
//! delete map and are persisted by the block's index writer.
//!
//! Retention is enforced after every accepted write: count and byte limits
//! drop the oldest message in a loop, and an age timer expires messages
//! once they outlive `max_age`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use streamvault_core::record::{check_record_size, message_record_size, RecordHasher};

use crate::block::{slot_info, MsgBlock, MsgId};
use crate::config::{
    dyn_block_size, FileStoreConfig, FileStreamInfo, StorageType, StreamConfig, CONSUMER_DIR,
    DEFAULT_CACHE_BUFFER_EXPIRATION, DEFAULT_SYNC_INTERVAL, COALESCE_MINIMUM, MAX_BLOCK_SIZE,
    MAX_FLUSH_WAIT, META_FILE, META_SUM_FILE, MSG_DIR, PURGE_DIR,
};
use crate::consumer::ConsumerFileStore;
use crate::error::{Error, Result};
use crate::now_nanos;
use crate::state::{StoredMsg, StreamState};

/// Storage update callback: `(msg_delta, byte_delta, seq)`. Invoked after
/// every accepted write and every removal, never under a lock.
pub type StorageUpdateFn = Arc<dyn Fn(i64, i64, u64) + Send + Sync>;

pub(crate) struct StoreInner {
    pub(crate) cfg: FileStreamInfo,
    pub(crate) state: StreamState,
    pub(crate) blks: Vec<Arc<MsgBlock>>,
    pub(crate) lmb: Option<Arc<MsgBlock>>,
    pub(crate) scb: Option<StorageUpdateFn>,
    pub(crate) cfs: Vec<Arc<ConsumerFileStore>>,
    pub(crate) closed: bool,
    expiring: bool,
    pub(crate) sips: u32,
    age_chk: Option<JoinHandle<()>>,
    sync_task: Option<JoinHandle<()>>,
}

/// A file-backed message store for one stream.
pub struct FileStore {
    fcfg: FileStoreConfig,
    /// Stream-level hasher, used for the metadata checksum.
    pub(crate) hh: RecordHasher,
    fch: mpsc::Sender<()>,
    qtx: watch::Sender<bool>,
    pub(crate) inner: RwLock<StoreInner>,
}

impl FileStore {
    /// Open (or create) a store in `fcfg.store_dir` for the given stream.
    pub async fn open(fcfg: FileStoreConfig, cfg: StreamConfig) -> Result<Arc<FileStore>> {
        Self::open_with_created(fcfg, cfg, Utc::now()).await
    }

    /// Open with an explicit creation time, used when recovering a stream
    /// whose metadata predates this process.
    pub async fn open_with_created(
        mut fcfg: FileStoreConfig,
        cfg: StreamConfig,
        created: DateTime<Utc>,
    ) -> Result<Arc<FileStore>> {
        if cfg.name.is_empty() {
            return Err(Error::Config("name required".to_string()));
        }
        if cfg.storage != StorageType::File {
            return Err(Error::Config(
                "file store requires file storage type in config".to_string(),
            ));
        }

        // Default values.
        if fcfg.block_size == 0 {
            fcfg.block_size = dyn_block_size(cfg.retention, cfg.max_bytes);
        }
        if fcfg.block_size > MAX_BLOCK_SIZE {
            return Err(Error::Config(format!(
                "block size {} exceeds maximum {}",
                fcfg.block_size, MAX_BLOCK_SIZE
            )));
        }
        if fcfg.cache_expire.is_zero() {
            fcfg.cache_expire = DEFAULT_CACHE_BUFFER_EXPIRATION;
        }
        if fcfg.sync_interval.is_zero() {
            fcfg.sync_interval = DEFAULT_SYNC_INTERVAL;
        }

        // Check the directory.
        match tokio::fs::metadata(&fcfg.store_dir).await {
            Ok(stat) if !stat.is_dir() => {
                return Err(Error::Config(
                    "store directory is not a directory".to_string(),
                ));
            }
            Ok(_) => {}
            Err(_) => {
                tokio::fs::create_dir_all(&fcfg.store_dir).await.map_err(|err| {
                    Error::Config(format!("could not create storage directory - {}", err))
                })?;
            }
        }
        // Prove the directory is writable before going any further.
        let probe = fcfg.store_dir.join("_probe_");
        tokio::fs::write(&probe, b"")
            .await
            .map_err(|_| Error::Config("storage directory is not writable".to_string()))?;
        let _ = tokio::fs::remove_file(&probe).await;

        tokio::fs::create_dir_all(fcfg.store_dir.join(MSG_DIR))
            .await
            .map_err(|err| {
                Error::Config(format!("could not create message storage directory - {}", err))
            })?;
        tokio::fs::create_dir_all(fcfg.store_dir.join(CONSUMER_DIR))
            .await
            .map_err(|err| {
                Error::Config(format!("could not create consumer storage directory - {}", err))
            })?;

        let hh = RecordHasher::new(cfg.name.as_bytes());
        let (fch, frx) = mpsc::channel(1);
        let (qtx, qrx) = watch::channel(false);

        let fs = Arc::new(FileStore {
            fcfg,
            hh,
            fch,
            qtx,
            inner: RwLock::new(StoreInner {
                cfg: FileStreamInfo {
                    created,
                    config: cfg,
                },
                state: StreamState::default(),
                blks: Vec::new(),
                lmb: None,
                scb: None,
                cfs: Vec::new(),
                closed: false,
                expiring: false,
                sips: 0,
                age_chk: None,
                sync_task: None,
            }),
        });

        // Recover our state.
        let recovered_age_check = fs.recover_msgs().await?;

        // Write our metadata iff it does not exist yet.
        let meta = fs.fcfg.store_dir.join(META_FILE);
        if tokio::fs::metadata(&meta).await.is_err() {
            let inner = fs.inner.read().await;
            fs.write_stream_meta(&inner).await?;
        }

        // Recovered limits may already be exceeded.
        fs.enforce_limits().await;
        if recovered_age_check {
            fs.expire_msgs().await;
        }

        // Background flusher and sync timer.
        let weak = Arc::downgrade(&fs);
        tokio::spawn(flush_loop(weak, frx, qrx.clone()));

        let weak = Arc::downgrade(&fs);
        let interval = fs.fcfg.sync_interval;
        let sync_task = tokio::spawn(sync_loop(weak, interval, qrx));
        fs.inner.write().await.sync_task = Some(sync_task);

        let stream = fs.inner.read().await.cfg.config.name.clone();
        info!(
            stream = %stream,
            dir = %fs.fcfg.store_dir.display(),
            block_size = fs.fcfg.block_size,
            "file store opened"
        );

        Ok(fs)
    }

    pub fn file_store_config(&self) -> &FileStoreConfig {
        &self.fcfg
    }

    pub async fn stream_config(&self) -> StreamConfig {
        self.inner.read().await.cfg.config.clone()
    }

    pub(crate) async fn is_closed(&self) -> bool {
        self.inner.read().await.closed
    }

    fn msg_dir(&self) -> PathBuf {
        self.fcfg.store_dir.join(MSG_DIR)
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    /// Reconstruct the block set and aggregate state from disk. Returns
    /// whether an age-expiration pass should run.
    async fn recover_msgs(self: &Arc<Self>) -> Result<bool> {
        let mut inner = self.inner.write().await;

        // Clean up an interrupted purge.
        let pdir = self.fcfg.store_dir.join(PURGE_DIR);
        if tokio::fs::metadata(&pdir).await.is_ok() {
            let _ = tokio::fs::remove_dir_all(&pdir).await;
        }

        let mdir = self.msg_dir();
        let mut rd = tokio::fs::read_dir(&mdir)
            .await
            .map_err(|_| Error::NotReadable)?;

        let mut indices = Vec::new();
        while let Ok(Some(entry)) = rd.next_entry().await {
            if let Some(index) =
                crate::config::parse_blk_file_name(&entry.file_name().to_string_lossy())
            {
                indices.push(index);
            }
        }
        // Directory order is arbitrary; selection needs ascending blocks.
        indices.sort_unstable();

        let stream_name = inner.cfg.config.name.clone();
        for index in indices {
            if let Some(mb) =
                MsgBlock::recover(index, &mdir, self.fcfg.cache_expire, &stream_name).await
            {
                let bi = mb.inner.read().await;
                if inner.state.first_seq == 0 || bi.first.seq < inner.state.first_seq {
                    inner.state.first_seq = bi.first.seq;
                    inner.state.first_ts = bi.first.ts;
                }
                if bi.last.seq > inner.state.last_seq {
                    inner.state.last_seq = bi.last.seq;
                    inner.state.last_ts = bi.last.ts;
                }
                inner.state.msgs += bi.msgs;
                inner.state.bytes += bi.bytes;
                drop(bi);
                inner.blks.push(mb);
            }
        }

        if let Some(last) = inner.blks.last().cloned() {
            last.enable_for_writing().await?;
            inner.lmb = Some(last);
            debug!(
                blocks = inner.blks.len(),
                msgs = inner.state.msgs,
                first_seq = inner.state.first_seq,
                last_seq = inner.state.last_seq,
                "recovered stream state"
            );
        } else {
            self.new_msg_block_for_write(&mut inner).await?;
        }

        let run_age_check =
            !inner.cfg.config.max_age.is_zero() && inner.state.msgs > 0;
        if run_age_check {
            let max_age = inner.cfg.config.max_age;
            self.start_age_check(&mut inner, max_age);
        }
        Ok(run_age_check)
    }

    // ------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------

    /// Write `meta.inf` and its checksum. Caller holds the store lock.
    pub(crate) async fn write_stream_meta(&self, inner: &StoreInner) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&inner.cfg)
            .map_err(|err| Error::Config(format!("could not encode stream meta: {}", err)))?;
        tokio::fs::write(self.fcfg.store_dir.join(META_FILE), &bytes).await?;

        let checksum = self.hh.hex_checksum(&bytes);
        tokio::fs::write(self.fcfg.store_dir.join(META_SUM_FILE), checksum.as_bytes()).await?;
        Ok(())
    }

    /// Persist a new stream config. Transactional: a failed write restores
    /// the old config in memory. Re-enforces limits and re-arms or cancels
    /// the age timer as needed.
    pub async fn update_config(self: &Arc<Self>, cfg: StreamConfig) -> Result<()> {
        if self.is_closed().await {
            return Err(Error::Closed);
        }
        if cfg.name.is_empty() {
            return Err(Error::Config("name required".to_string()));
        }
        if cfg.storage != StorageType::File {
            return Err(Error::Config(
                "file store requires file storage type in config".to_string(),
            ));
        }

        let run_expire = {
            let mut inner = self.inner.write().await;
            let old_cfg = inner.cfg.clone();
            inner.cfg = FileStreamInfo {
                created: old_cfg.created,
                config: cfg.clone(),
            };
            if let Err(err) = self.write_stream_meta(&inner).await {
                inner.cfg = old_cfg;
                return Err(err);
            }

            if inner.age_chk.is_none() && !cfg.max_age.is_zero() {
                let max_age = cfg.max_age;
                self.start_age_check(&mut inner, max_age);
            }
            if cfg.max_age.is_zero() {
                if let Some(tmr) = inner.age_chk.take() {
                    tmr.abort();
                }
            }
            !cfg.max_age.is_zero()
        };

        self.enforce_limits().await;
        if run_expire {
            self.expire_msgs().await;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Store a message, returning its sequence and timestamp.
    pub async fn store_msg(
        self: &Arc<Self>,
        subj: &str,
        hdr: &[u8],
        msg: &[u8],
    ) -> Result<(u64, i64)> {
        let (seq, ts, rl, cb) = {
            let mut inner = self.inner.write().await;
            if inner.closed {
                return Err(Error::Closed);
            }

            // Check if we are discarding new messages when at the limit.
            let cfg = &inner.cfg.config;
            if cfg.discard == crate::config::DiscardPolicy::New {
                if cfg.max_msgs > 0 && inner.state.msgs >= cfg.max_msgs as u64 {
                    return Err(Error::MaxMsgs);
                }
                if cfg.max_bytes > 0
                    && inner.state.bytes + (hdr.len() + msg.len()) as u64
                        >= cfg.max_bytes as u64
                {
                    return Err(Error::MaxBytes);
                }
            }

            let seq = inner.state.last_seq + 1;
            let (rl, ts) = self.write_msg_record(&mut inner, seq, subj, hdr, msg).await?;
            self.kick_flusher();

            if inner.state.msgs == 0 {
                inner.state.first_seq = seq;
                inner.state.first_ts = ts;
            }
            inner.state.msgs += 1;
            inner.state.bytes += rl;
            inner.state.last_seq = seq;
            inner.state.last_ts = ts;

            if inner.age_chk.is_none() && !inner.cfg.config.max_age.is_zero() {
                let max_age = inner.cfg.config.max_age;
                self.start_age_check(&mut inner, max_age);
            }

            (seq, ts, rl, inner.scb.clone())
        };

        // Limits checks and enforcement. Deletions update the counts on
        // their own, so no need to compensate here.
        self.enforce_limits().await;

        if let Some(cb) = cb {
            cb(1, rl as i64, seq);
        }

        Ok((seq, ts))
    }

    /// Encode and hand the record to the tail block, rolling over first if
    /// it would not fit. Caller holds the store lock.
    async fn write_msg_record(
        self: &Arc<Self>,
        inner: &mut StoreInner,
        seq: u64,
        subj: &str,
        hdr: &[u8],
        msg: &[u8],
    ) -> Result<(u64, i64)> {
        let rl = message_record_size(subj, hdr, msg);
        let rl32 = check_record_size(rl)?;

        let needs_roll = match &inner.lmb {
            None => true,
            Some(mb) => mb.inner.read().await.bytes + rl > self.fcfg.block_size,
        };
        if needs_roll {
            self.new_msg_block_for_write(inner).await?;
        }

        let ts = now_nanos();
        let mb = inner.lmb.as_ref().cloned().ok_or(Error::NoPending)?;
        mb.write_msg_record(rl32, seq, subj, hdr, msg, ts).await;

        Ok((rl, ts))
    }

    /// Reserve the next sequence without storing a payload.
    pub async fn skip_msg(&self) -> Result<u64> {
        let now = now_nanos();
        let mut inner = self.inner.write().await;
        if inner.closed {
            return Err(Error::Closed);
        }

        let seq = inner.state.last_seq + 1;
        inner.state.last_seq = seq;
        inner.state.last_ts = now;
        if inner.state.msgs == 0 {
            inner.state.first_seq = seq;
            inner.state.first_ts = now;
        }
        if seq == inner.state.first_seq {
            inner.state.first_seq = seq + 1;
            inner.state.first_ts = now;
        }

        if let Some(lmb) = inner.lmb.as_ref().cloned() {
            lmb.skip_msg(seq, now).await;
        }
        self.kick_flusher();
        Ok(seq)
    }

    /// Roll to a new tail block: flush and close the outgoing tail's write
    /// handle (its cache stays for readers) and open `<index+1>.blk`.
    async fn new_msg_block_for_write(&self, inner: &mut StoreInner) -> Result<()> {
        let mut index = 1;
        if let Some(lmb) = inner.lmb.as_ref().cloned() {
            index = lmb.index + 1;
            match lmb.flush_pending_writes().await {
                Ok(())
                | Err(Error::NoPending)
                | Err(Error::NoCache)
                | Err(Error::FlushRunning) => {}
                Err(err) => return Err(err),
            }
            lmb.write_index_info().await?;
            lmb.close_write_handles().await;
        }
        self.add_msg_block_for_write(inner, index).await?;
        Ok(())
    }

    async fn add_msg_block_for_write(
        &self,
        inner: &mut StoreInner,
        index: u64,
    ) -> Result<Arc<MsgBlock>> {
        let mb = MsgBlock::create_for_write(
            index,
            &self.msg_dir(),
            self.fcfg.cache_expire,
            &inner.cfg.config.name,
        )
        .await?;
        inner.blks.push(Arc::clone(&mb));
        inner.lmb = Some(Arc::clone(&mb));
        Ok(mb)
    }

    fn kick_flusher(&self) {
        let _ = self.fch.try_send(());
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    /// Load a message by sequence. `seq = 0` means the first live message.
    pub async fn load_msg(&self, seq: u64) -> Result<StoredMsg> {
        match self.msg_for_seq(seq).await {
            Err(Error::DeletedMsg) => Err(Error::MsgNotFound),
            other => other,
        }
    }

    pub(crate) async fn msg_for_seq(&self, mut seq: u64) -> Result<StoredMsg> {
        let mb = {
            let inner = self.inner.read().await;
            if inner.closed {
                return Err(Error::Closed);
            }
            if seq == 0 {
                seq = inner.state.first_seq;
            }
            match select_msg_block(&inner, seq) {
                Some(mb) => mb,
                None => {
                    return Err(if seq <= inner.state.last_seq {
                        Error::MsgNotFound
                    } else {
                        Error::Eof
                    });
                }
            }
        };
        mb.fetch_msg(seq).await
    }

    /// First sequence with a timestamp at or past `t`, or `last_seq + 1`
    /// when every message is older. Returns 0 on a closed store.
    pub async fn get_seq_from_time(&self, t: DateTime<Utc>) -> u64 {
        let (closed, last_seq) = {
            let inner = self.inner.read().await;
            (inner.closed, inner.state.last_seq)
        };
        if closed {
            return 0;
        }

        let ts = t.timestamp_nanos_opt().unwrap_or(i64::MAX);
        let mb = match self.select_msg_block_for_start(ts).await {
            Some(mb) => mb,
            None => return last_seq + 1,
        };

        let (fseq, lseq) = {
            let bi = mb.inner.read().await;
            (bi.first.seq, bi.last.seq)
        };

        // Linear scan inside the block.
        for seq in fseq..=lseq {
            if let Ok(sm) = mb.fetch_msg(seq).await {
                if sm.ts >= ts {
                    return sm.seq;
                }
            }
        }
        0
    }

    /// First block whose last timestamp is at or past `ts`. When that is
    /// the tail, pending writes are flushed first since the target may
    /// still be sitting in the write buffer.
    async fn select_msg_block_for_start(&self, ts: i64) -> Option<Arc<MsgBlock>> {
        let (blks, lmb) = {
            let inner = self.inner.read().await;
            (inner.blks.clone(), inner.lmb.clone())
        };

        for mb in blks {
            let found = mb.inner.read().await.last.ts >= ts;
            if found {
                if let Some(lmb) = &lmb {
                    if Arc::ptr_eq(&mb, lmb) {
                        let _ = self.flush_pending_writes_unlocked().await;
                    }
                }
                return Some(mb);
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------

    /// Remove a message. Returns whether a live message was removed.
    pub async fn remove_msg(self: &Arc<Self>, seq: u64) -> Result<bool> {
        self.remove_msg_inner(seq, false).await
    }

    /// Remove a message, overwriting its record in place with random bytes
    /// and a tombstone checksum.
    pub async fn erase_msg(self: &Arc<Self>, seq: u64) -> Result<bool> {
        self.remove_msg_inner(seq, true).await
    }

    async fn remove_msg_inner(self: &Arc<Self>, seq: u64, secure: bool) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if inner.closed {
            return Err(Error::Closed);
        }
        if inner.sips > 0 {
            return Err(Error::SnapshotInProgress);
        }

        let mb = match select_msg_block(&inner, seq) {
            Some(mb) => mb,
            None => {
                return Err(if seq <= inner.state.last_seq {
                    Error::MsgNotFound
                } else {
                    Error::Eof
                });
            }
        };

        if secure {
            // Settle the record onto disk first: an in-flight flush holds a
            // pre-erase copy of the pending range and must not be able to
            // rewrite the bytes after we overwrite them.
            loop {
                match mb.flush_pending_writes().await {
                    Err(Error::FlushRunning) => tokio::task::yield_now().await,
                    _ => break,
                }
            }
        }

        let mut bi = mb.inner.write().await;

        // Make sure the slot index is available. This is rare.
        if bi.cache.as_ref().map_or(true, |c| c.idx.is_empty()) {
            drop(bi);
            mb.load_msgs().await?;
            bi = mb.inner.write().await;
        }

        // See if the sequence is still relevant here.
        let (fseq, nidx) = match &bi.cache {
            Some(cache) => (cache.fseq, cache.idx.len() as u64),
            None => return Ok(false),
        };
        if seq < bi.first.seq || seq < fseq || seq - fseq >= nidx {
            return Ok(false);
        }
        if bi.dmap.contains(&seq) {
            return Ok(false);
        }

        let (ri, rl, _) = slot_info(bi.cache.as_ref().ok_or(Error::NoCache)?, (seq - fseq) as usize)?;
        let msz = rl as u64;

        // Global and block accounting.
        inner.state.msgs -= 1;
        inner.state.bytes -= msz;
        bi.msgs -= 1;
        bi.bytes -= msz;
        bi.lrts = now_nanos();

        if secure {
            mb.erase_msg(&mut bi, seq, ri as usize, rl as usize).await?;
        }

        let mut first_seq_needs_update = false;

        // Optimize for the FIFO case.
        if seq == bi.first.seq {
            MsgBlock::advance_first(&mut bi);
            if MsgBlock::is_empty(&bi) {
                let (old_first, old_last) = (bi.first, bi.last);
                drop(bi);
                self.remove_msg_block(&mut inner, &mb, old_first, old_last).await?;
                first_seq_needs_update = seq == inner.state.first_seq;
            } else {
                // Resolve the new first timestamp, loading if needed.
                let nf = bi.first.seq;
                match mb.cache_lookup(&mut bi, nf) {
                    Ok(sm) => bi.first.ts = sm.ts,
                    Err(_) => {
                        drop(bi);
                        let ts = mb.fetch_msg(nf).await.map(|sm| sm.ts).unwrap_or(0);
                        bi = mb.inner.write().await;
                        bi.first.ts = ts;
                    }
                }
                if seq == inner.state.first_seq {
                    inner.state.first_seq = bi.first.seq;
                    inner.state.first_ts = bi.first.ts;
                }
                mb.ensure_idx_writer(&mut bi).await;
                mb.kick_idx_writer(&bi);
                drop(bi);
            }
        } else {
            // Out of order delete.
            bi.dmap.insert(seq);
            mb.ensure_idx_writer(&mut bi).await;
            mb.kick_idx_writer(&bi);
            drop(bi);
        }

        // Emptying the block that held the stream's first sequence means
        // the aggregate first jumps blocks.
        if first_seq_needs_update {
            self.select_next_first(&mut inner).await;
        }

        let cb = inner.scb.clone();
        drop(inner);

        if let Some(cb) = cb {
            cb(-1, -(msz as i64), 0);
        }

        Ok(true)
    }

    /// Splice an emptied block out of the set and delete its files. When it
    /// was the tail, a fresh tail inherits its sequence range.
    async fn remove_msg_block(
        &self,
        inner: &mut StoreInner,
        mb: &Arc<MsgBlock>,
        old_first: MsgId,
        old_last: MsgId,
    ) -> Result<()> {
        mb.close(false).await;
        mb.remove_files().await;
        inner.blks.retain(|b| !Arc::ptr_eq(b, mb));

        let was_tail = inner
            .lmb
            .as_ref()
            .map_or(false, |lmb| Arc::ptr_eq(lmb, mb));
        if was_tail {
            inner.lmb = None;
            let nmb = self.add_msg_block_for_write(inner, mb.index + 1).await?;
            {
                let mut ni = nmb.inner.write().await;
                ni.first = old_first;
                ni.last = old_last;
                nmb.set_last_seq(old_last.seq);
                nmb.write_index_info_locked(&mut ni).await?;
            }
        }
        Ok(())
    }

    /// Recompute the aggregate first sequence from the first block.
    async fn select_next_first(&self, inner: &mut StoreInner) {
        if let Some(mb) = inner.blks.first().cloned() {
            let bi = mb.inner.read().await;
            inner.state.first_seq = bi.first.seq;
            inner.state.first_ts = bi.first.ts;
        } else {
            // Could not find anything, so treat like a purge.
            inner.state.first_seq = inner.state.last_seq + 1;
            inner.state.first_ts = 0;
        }
    }

    // ------------------------------------------------------------------
    // Retention
    // ------------------------------------------------------------------

    /// Drop oldest messages until the count and byte limits hold. Takes
    /// and releases the store lock per removal.
    async fn enforce_limits(self: &Arc<Self>) {
        loop {
            let (first_seq, over) = {
                let inner = self.inner.read().await;
                let cfg = &inner.cfg.config;
                let over_msgs =
                    cfg.max_msgs > 0 && inner.state.msgs > cfg.max_msgs as u64;
                let over_bytes =
                    cfg.max_bytes > 0 && inner.state.bytes > cfg.max_bytes as u64;
                (inner.state.first_seq, over_msgs || over_bytes)
            };
            if !over {
                return;
            }
            match self.remove_msg_inner(first_seq, false).await {
                Ok(true) => {}
                // A refused or failed removal cannot make progress.
                Ok(false) | Err(_) => return,
            }
        }
    }

    fn start_age_check(self: &Arc<Self>, inner: &mut StoreInner, fire_in: Duration) {
        if let Some(tmr) = inner.age_chk.take() {
            tmr.abort();
        }
        let weak = Arc::downgrade(self);
        inner.age_chk = Some(tokio::spawn(async move {
            tokio::time::sleep(fire_in).await;
            if let Some(fs) = weak.upgrade() {
                fs.expire_msgs().await;
            }
        }));
    }

    /// Expire messages older than `max_age`, then re-arm the age timer for
    /// the next message due. Single-flight.
    pub(crate) async fn expire_msgs(self: &Arc<Self>) {
        {
            let mut inner = self.inner.write().await;
            if inner.expiring {
                return;
            }
            inner.expiring = true;
        }

        let (now, max_age) = {
            let inner = self.inner.read().await;
            (now_nanos(), inner.cfg.config.max_age)
        };
        let min_age = now - max_age.as_nanos() as i64;

        loop {
            let sm = self.msg_for_seq(0).await.ok();
            match sm {
                Some(sm) if sm.ts <= min_age => {
                    let first_seq = self.inner.read().await.state.first_seq;
                    match self.remove_msg_inner(first_seq, false).await {
                        Ok(true) => continue,
                        // Blocked (e.g. a snapshot); try again next cycle.
                        Ok(false) | Err(_) => {
                            let mut inner = self.inner.write().await;
                            self.start_age_check(&mut inner, max_age);
                            break;
                        }
                    }
                }
                Some(sm) => {
                    let fire_in =
                        Duration::from_nanos((sm.ts - min_age).max(0) as u64);
                    let mut inner = self.inner.write().await;
                    self.start_age_check(&mut inner, fire_in);
                    break;
                }
                None => {
                    let mut inner = self.inner.write().await;
                    if let Some(tmr) = inner.age_chk.take() {
                        tmr.abort();
                    }
                    break;
                }
            }
        }

        self.inner.write().await.expiring = false;
    }

    // ------------------------------------------------------------------
    // Flushing
    // ------------------------------------------------------------------

    /// Bytes pending flush on the tail block.
    pub async fn pending_write_size(&self) -> usize {
        let lmb = self.inner.read().await.lmb.clone();
        match lmb {
            Some(mb) => mb.write_pending_size().await,
            None => 0,
        }
    }

    pub(crate) async fn flush_pending_writes_unlocked(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        self.flush_pending_writes_locked(&mut inner).await
    }

    /// Flush the tail's pending bytes and persist its index.
    async fn flush_pending_writes_locked(&self, inner: &mut StoreInner) -> Result<()> {
        let mb = inner.lmb.as_ref().cloned().ok_or(Error::NoPending)?;
        match mb.flush_pending_writes().await {
            Ok(())
            | Err(Error::NoCache)
            | Err(Error::NoPending)
            | Err(Error::FlushRunning) => {}
            Err(err) => return Err(err),
        }
        mb.write_index_info().await
    }

    // ------------------------------------------------------------------
    // Purge
    // ------------------------------------------------------------------

    /// Drop all messages. The messages directory is renamed aside and
    /// removed out of band; a fresh tail block preserves the last
    /// sequence. Returns the number of messages purged.
    pub async fn purge(self: &Arc<Self>) -> u64 {
        let mut inner = self.inner.write().await;
        if inner.closed {
            return 0;
        }

        let purged = inner.state.msgs;
        let rbytes = inner.state.bytes;

        inner.state.first_seq = inner.state.last_seq + 1;
        inner.state.first_ts = 0;
        inner.state.bytes = 0;
        inner.state.msgs = 0;

        for mb in std::mem::take(&mut inner.blks) {
            mb.dirty_close().await;
        }
        inner.lmb = None;

        // Move the msgs directory out of the way; delete out of band.
        let mdir = self.msg_dir();
        let pdir = self.fcfg.store_dir.join(PURGE_DIR);
        if tokio::fs::metadata(&pdir).await.is_ok() {
            let _ = tokio::fs::remove_dir_all(&pdir).await;
        }
        let _ = tokio::fs::rename(&mdir, &pdir).await;
        tokio::spawn(async move {
            let _ = tokio::fs::remove_dir_all(&pdir).await;
        });
        let _ = tokio::fs::create_dir_all(&mdir).await;

        // Make sure we have a tail to write to, carrying the range.
        let first_seq = inner.state.first_seq;
        let last_seq = inner.state.last_seq;
        if let Ok(nmb) = self.add_msg_block_for_write(&mut inner, 1).await {
            let mut ni = nmb.inner.write().await;
            ni.first.seq = first_seq;
            ni.last.seq = last_seq;
            nmb.set_last_seq(last_seq);
            if let Err(err) = nmb.write_index_info_locked(&mut ni).await {
                warn!(%err, "failed to write index after purge");
            }
        }

        let cb = inner.scb.clone();
        drop(inner);

        info!(purged, bytes = rbytes, "stream purged");
        if let Some(cb) = cb {
            cb(-(purged as i64), -(rbytes as i64), 0);
        }

        purged
    }

    // ------------------------------------------------------------------
    // State and callbacks
    // ------------------------------------------------------------------

    /// Snapshot copy of the aggregate stream state.
    pub async fn state(&self) -> StreamState {
        let inner = self.inner.read().await;
        let mut state = inner.state;
        state.consumers = inner.cfs.len();
        state
    }

    /// Register the storage update callback. Replays current usage so the
    /// accountant starts from the right number.
    pub async fn register_storage_updates(&self, cb: StorageUpdateFn) {
        let bytes = {
            let mut inner = self.inner.write().await;
            inner.scb = Some(Arc::clone(&cb));
            inner.state.bytes
        };
        if bytes > 0 {
            cb(0, bytes as i64, 0);
        }
    }

    // ------------------------------------------------------------------
    // Introspection (used by tests and operators)
    // ------------------------------------------------------------------

    /// Number of message blocks.
    pub async fn num_msg_blocks(&self) -> usize {
        self.inner.read().await.blks.len()
    }

    /// Total number of cache loads across all blocks.
    pub async fn cache_loads(&self) -> u64 {
        let blks = self.inner.read().await.blks.clone();
        let mut total = 0;
        for mb in blks {
            total += mb.inner.read().await.cloads;
        }
        total
    }

    /// Total resident cache bytes across all blocks.
    pub async fn cache_size(&self) -> usize {
        let blks = self.inner.read().await.blks.clone();
        let mut total = 0;
        for mb in blks {
            if let Some(cache) = &mb.inner.read().await.cache {
                total += cache.buf.len();
            }
        }
        total
    }

    /// Total delete map entries across all blocks.
    pub async fn dmap_entries(&self) -> usize {
        let blks = self.inner.read().await.blks.clone();
        let mut total = 0;
        for mb in blks {
            total += mb.inner.read().await.dmap.len();
        }
        total
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Stop the store: flush, sync and close every block, stop the
    /// background tasks and all consumer stores. Every public operation
    /// afterwards returns [`Error::Closed`].
    pub async fn stop(&self) -> Result<()> {
        let (blks, cfs, flush_res) = {
            let mut inner = self.inner.write().await;
            if inner.closed {
                return Err(Error::Closed);
            }
            inner.closed = true;
            let _ = self.qtx.send(true);

            let flush_res = match self.flush_pending_writes_locked(&mut inner).await {
                Ok(()) | Err(Error::NoPending) | Err(Error::NoCache) => Ok(()),
                Err(err) => Err(err),
            };
            inner.lmb = None;

            if let Some(tmr) = inner.sync_task.take() {
                tmr.abort();
            }
            if let Some(tmr) = inner.age_chk.take() {
                tmr.abort();
            }

            (
                inner.blks.clone(),
                std::mem::take(&mut inner.cfs),
                flush_res,
            )
        };

        for mb in &blks {
            // Persist accounting (notably delete maps) before closing so a
            // reopen does not depend on the per-block index writers having
            // caught up.
            if let Err(err) = mb.write_index_info().await {
                warn!(index = mb.index, %err, "index write during stop failed");
            }
            mb.close(true).await;
        }
        for o in cfs {
            let _ = o.stop().await;
        }

        info!("file store stopped");
        flush_res
    }

    /// Purge, stop, and remove the store directory recursively.
    pub async fn delete(self: &Arc<Self>) -> Result<()> {
        if self.is_closed().await {
            return Err(Error::Closed);
        }
        self.purge().await;
        self.stop().await?;
        // Purge removes its rename target out of band; a racing removal of
        // the same subtree can surface a spurious error, so try again.
        if tokio::fs::remove_dir_all(&self.fcfg.store_dir).await.is_err() {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if tokio::fs::metadata(&self.fcfg.store_dir).await.is_ok() {
                tokio::fs::remove_dir_all(&self.fcfg.store_dir).await?;
            }
        }
        Ok(())
    }

    pub(crate) async fn remove_consumer(&self, target: &Arc<ConsumerFileStore>) {
        let mut inner = self.inner.write().await;
        inner.cfs.retain(|o| !Arc::ptr_eq(o, target));
    }

    /// Sync all block and consumer files; called from the sync timer.
    async fn sync_blocks(&self) {
        let (closed, blks, cfs) = {
            let inner = self.inner.read().await;
            (inner.closed, inner.blks.clone(), inner.cfs.clone())
        };
        if closed {
            return;
        }
        for mb in blks {
            mb.sync_files().await;
        }
        for o in cfs {
            o.sync_state_file().await;
        }
    }
}

/// Select the block that should hold `seq`. Blocks are sorted ascending by
/// index; the per-block last sequence is read through its atomic so this
/// is safe under the store read lock. Linear, which is cache friendly for
/// small to medium block counts.
pub(crate) fn select_msg_block(inner: &StoreInner, seq: u64) -> Option<Arc<MsgBlock>> {
    if seq < inner.state.first_seq || seq > inner.state.last_seq {
        return None;
    }
    inner
        .blks
        .iter()
        .find(|mb| seq <= mb.last_seq())
        .cloned()
}

/// Long-lived flusher: waits for a kick, coalesces briefly while pending
/// bytes keep growing, then flushes the tail block.
async fn flush_loop(
    fs: std::sync::Weak<FileStore>,
    mut fch: mpsc::Receiver<()>,
    mut qch: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = qch.changed() => {
                if changed.is_err() || *qch.borrow() {
                    return;
                }
            }
            kicked = fch.recv() => {
                if kicked.is_none() {
                    return;
                }
                let fs = match fs.upgrade() {
                    Some(fs) => fs,
                    None => return,
                };

                let mut waiting = fs.pending_write_size().await;
                if waiting == 0 {
                    continue;
                }
                let mut ts = Duration::from_millis(1);
                let mut waited = Duration::ZERO;

                while waiting < COALESCE_MINIMUM {
                    tokio::time::sleep(ts).await;
                    let now_waiting = fs.pending_write_size().await;
                    if now_waiting <= waiting {
                        break;
                    }
                    waited += ts;
                    if waited > MAX_FLUSH_WAIT {
                        break;
                    }
                    if *qch.borrow() {
                        return;
                    }
                    waiting = now_waiting;
                    ts *= 2;
                }

                match fs.flush_pending_writes_unlocked().await {
                    Ok(()) | Err(Error::NoPending) | Err(Error::NoCache) => {}
                    Err(err) => warn!(%err, "flush of pending writes failed"),
                }
            }
        }
    }
}

/// Self-rescheduling sync timer.
async fn sync_loop(
    fs: std::sync::Weak<FileStore>,
    interval: Duration,
    qch: watch::Receiver<bool>,
) {
    loop {
        tokio::time::sleep(interval).await;
        if *qch.borrow() {
            return;
        }
        let fs = match fs.upgrade() {
            Some(fs) => fs,
            None => return,
        };
        fs.sync_blocks().await;
    }
}
