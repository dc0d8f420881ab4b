//! Message Blocks
//!
//! A message block is one segment of the stream: a `<index>.blk` data file
//! holding encoded records back to back, and a `<index>.idx` file holding
//! the block's accounting (counts, sequence range, delete map, last record
//! checksum) so recovery can avoid rescanning the data.
//!
//! Each block owns a write-through cache:
//!
//! ```text
//!            file offset of buf[0]
//!                  │
//!   .blk file ─────┼──────────────────────────────►
//!                  ▼
//!         cache.buf [ flushed bytes | pending bytes ]
//!                    ▲              ▲
//!                    off            off + wp
//! ```
//!
//! Writes append encoded records to `buf` and a slot to `idx` (one `u32`
//! file offset per sequence, high bit doubling as the "checksum verified"
//! flag). The background flusher drains `buf[wp..]` to the file. Reads hit
//! the cache first; a miss loads the whole block back in and re-indexes it.
//! A per-block timer drops the buffer after `cache_expire` of inactivity
//! and the slot index after five minutes without removals.

use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use streamvault_core::record::{
    self, RecordHasher, CHECKSUM_LEN, EBIT, EMPTY_RECORD_LEN, HBIT, MSG_HDR_LEN,
};
use streamvault_core::varint;

use crate::config::{
    blk_file_name, idx_file_name, FILE_HDR_LEN, DEFAULT_CACHE_IDX_EXPIRATION, MAGIC,
    MAX_BUF_REUSE, VERSION,
};
use crate::error::{Error, Result};
use crate::now_nanos;
use crate::state::StoredMsg;

/// Sequence number and timestamp of one edge of a block's live range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct MsgId {
    pub(crate) seq: u64,
    pub(crate) ts: i64,
}

/// Write-through caching layer, also used when loading messages back in.
#[derive(Debug, Default)]
pub(crate) struct Cache {
    /// Suffix of the block file currently resident in memory.
    pub(crate) buf: Vec<u8>,
    /// File offset at which `buf[0]` begins.
    pub(crate) off: usize,
    /// Write pointer within `buf`; bytes `[wp..]` are pending flush.
    pub(crate) wp: usize,
    /// Slot table: `idx[k]` is the file offset of the record for sequence
    /// `fseq + k`. The high bit marks "checksum already verified".
    pub(crate) idx: Vec<u32>,
    /// Record length of the last record (sizes the final slot).
    pub(crate) lrl: u32,
    /// Sequence of `idx[0]`.
    pub(crate) fseq: u64,
    /// A flush currently owns the pending byte range.
    pub(crate) flush: bool,
}

impl Cache {
    fn pending(&self) -> usize {
        self.buf.len() - self.wp
    }
}

#[derive(Debug, Default)]
pub(crate) struct BlockInner {
    pub(crate) mfd: Option<File>,
    pub(crate) ifd: Option<File>,
    /// Last written index size; the sync timer truncates the file to this.
    pub(crate) liwsz: u64,
    pub(crate) msgs: u64,
    pub(crate) bytes: u64,
    pub(crate) first: MsgId,
    pub(crate) last: MsgId,
    /// Last write / load / remove activity, unix nanos.
    pub(crate) lwts: i64,
    pub(crate) llts: i64,
    pub(crate) lrts: i64,
    pub(crate) cache: Option<Cache>,
    pub(crate) cloads: u64,
    loading: bool,
    pub(crate) dmap: HashSet<u64>,
    dch: Option<mpsc::Sender<()>>,
    idx_task: Option<JoinHandle<()>>,
    ctmr: Option<JoinHandle<()>>,
    /// Checksum of the most recently written record (last 8 bytes of the
    /// data file). Stored in the index file to detect divergence.
    pub(crate) lchk: [u8; CHECKSUM_LEN],
}

/// One message block and its data.
#[derive(Debug)]
pub(crate) struct MsgBlock {
    pub(crate) index: u64,
    pub(crate) mfn: PathBuf,
    pub(crate) ifn: PathBuf,
    cexp: Duration,
    pub(crate) hh: RecordHasher,
    /// Mirror of `inner.last.seq`, published with release ordering so block
    /// selection can run under the store's read lock.
    last_seq: AtomicU64,
    pub(crate) inner: RwLock<BlockInner>,
}

/// Check the two-byte magic/version prefix of an index or state file.
pub(crate) fn check_header(buf: &[u8]) -> Result<()> {
    if buf.len() < FILE_HDR_LEN || buf[0] != MAGIC || buf[1] != VERSION {
        return Err(Error::CorruptState);
    }
    Ok(())
}

/// Hash key material for a specific block of a stream.
pub(crate) fn hash_key_for_block(stream_name: &str, index: u64) -> String {
    format!("{}-{}", stream_name, index)
}

impl MsgBlock {
    fn new(index: u64, mdir: &Path, cexp: Duration, stream_name: &str) -> MsgBlock {
        MsgBlock {
            index,
            mfn: mdir.join(blk_file_name(index)),
            ifn: mdir.join(idx_file_name(index)),
            cexp,
            hh: RecordHasher::new(hash_key_for_block(stream_name, index).as_bytes()),
            last_seq: AtomicU64::new(0),
            inner: RwLock::new(BlockInner::default()),
        }
    }

    /// Create a fresh block with open data and index handles, ready to be
    /// the write target.
    pub(crate) async fn create_for_write(
        index: u64,
        mdir: &Path,
        cexp: Duration,
        stream_name: &str,
    ) -> Result<Arc<MsgBlock>> {
        let mb = MsgBlock::new(index, mdir, cexp, stream_name);

        let mfd = OpenOptions::new()
            .append(true)
            .create(true)
            .read(true)
            .open(&mb.mfn)
            .await?;
        let ifd = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&mb.ifn)
            .await?;

        {
            let mut inner = mb.inner.try_write().expect("new block is unshared");
            inner.mfd = Some(mfd);
            inner.ifd = Some(ifd);
        }

        Ok(Arc::new(mb))
    }

    /// Recover a block from its on-disk files.
    ///
    /// The index file is trusted when its recorded last-checksum matches
    /// the trailing bytes of the data file; otherwise counters and the
    /// sequence range are rebuilt by scanning the data file, keeping any
    /// recovered delete map (deletions are independently authoritative).
    /// Returns `None` when the data file is unreadable or a record with a
    /// zero length is found.
    pub(crate) async fn recover(
        index: u64,
        mdir: &Path,
        cexp: Duration,
        stream_name: &str,
    ) -> Option<Arc<MsgBlock>> {
        let mb = MsgBlock::new(index, mdir, cexp, stream_name);

        let buf = match tokio::fs::read(&mb.mfn).await {
            Ok(buf) => buf,
            Err(_) => return None,
        };

        let mut actual_lchk = [0u8; CHECKSUM_LEN];
        if buf.len() >= CHECKSUM_LEN {
            actual_lchk.copy_from_slice(&buf[buf.len() - CHECKSUM_LEN..]);
        }

        let mut inner = mb.inner.try_write().expect("new block is unshared");

        let idx_ok = mb.read_index_info(&mut inner).await.is_ok();
        if idx_ok && inner.lchk == actual_lchk {
            // The index is current; no need to touch the data.
            let last_seq = inner.last.seq;
            drop(inner);
            mb.last_seq.store(last_seq, Ordering::Release);
            return Some(Arc::new(mb));
        }

        // Fall back on the data file itself, keeping a recovered dmap.
        inner.msgs = 0;
        inner.bytes = 0;
        inner.first = MsgId::default();

        let mut offset = 0usize;
        while offset + MSG_HDR_LEN <= buf.len() {
            let hdr = &buf[offset..offset + MSG_HDR_LEN];
            let rl = u32::from_le_bytes(hdr[0..4].try_into().unwrap()) & !HBIT;
            let seq = u64::from_le_bytes(hdr[4..12].try_into().unwrap());

            // Can't recover with a zero record length.
            if rl == 0 {
                return None;
            }
            if offset + rl as usize > buf.len() {
                // Truncated tail from a torn write; stop here.
                break;
            }

            // An erased message, or a skip tombstone we track as deleted.
            if seq == 0 || seq & EBIT != 0 {
                let seq = seq & !EBIT;
                if seq != 0 {
                    inner.dmap.insert(seq);
                }
                offset += rl as usize;
                continue;
            }

            let ts = i64::from_le_bytes(hdr[12..20].try_into().unwrap());
            if inner.first.seq == 0 {
                inner.first = MsgId { seq, ts };
            }
            inner.last = MsgId { seq, ts };
            inner.msgs += 1;
            inner.bytes += rl as u64;
            offset += rl as usize;
        }

        debug!(
            index,
            msgs = inner.msgs,
            first_seq = inner.first.seq,
            last_seq = inner.last.seq,
            "rebuilt block state from data file"
        );

        // Rewrite the index so we are in sync again.
        if let Err(err) = mb.write_index_info_locked(&mut inner).await {
            warn!(index, %err, "failed to rewrite block index during recovery");
        }

        let last_seq = inner.last.seq;
        drop(inner);
        mb.last_seq.store(last_seq, Ordering::Release);
        Some(Arc::new(mb))
    }

    /// Re-open the data file handle for appending (used for the recovered
    /// tail block).
    pub(crate) async fn enable_for_writing(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.mfd.is_some() {
            return Ok(());
        }
        let mfd = OpenOptions::new()
            .append(true)
            .create(true)
            .read(true)
            .open(&self.mfn)
            .await?;
        inner.mfd = Some(mfd);
        Ok(())
    }

    pub(crate) fn last_seq(&self) -> u64 {
        self.last_seq.load(Ordering::Acquire)
    }

    pub(crate) fn set_last_seq(&self, seq: u64) {
        self.last_seq.store(seq, Ordering::Release);
    }

    pub(crate) fn is_empty(inner: &BlockInner) -> bool {
        inner.first.seq > inner.last.seq
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Append an encoded record to the write-through cache. The caller
    /// (the store) holds the stream lock, which serializes writers.
    pub(crate) async fn write_msg_record(
        self: &Arc<Self>,
        rl: u32,
        seq: u64,
        subj: &str,
        hdr: &[u8],
        msg: &[u8],
        ts: i64,
    ) {
        let mut inner = self.inner.write().await;

        if inner.cache.is_none() {
            inner.cache = Some(Cache::default());
            self.arm_cache_expire_timer(&mut inner, self.cexp);
        }

        let checksum = {
            let cache = inner.cache.as_mut().unwrap();
            let index = cache.off + cache.buf.len();
            let checksum =
                record::append_record(&mut cache.buf, rl, seq, ts, subj, hdr, msg, &self.hh);
            cache.idx.push(index as u32 | HBIT);
            cache.lrl = rl;
            if cache.fseq == 0 {
                cache.fseq = seq & !EBIT;
            }
            checksum
        };
        inner.lchk = checksum;
        inner.lwts = ts;

        self.update_accounting(&mut inner, seq, ts, rl as u64);
    }

    /// Update accounting on a stored message. Caller holds the block lock.
    fn update_accounting(&self, inner: &mut BlockInner, seq: u64, ts: i64, rl: u64) {
        if inner.first.seq == 0 {
            inner.first = MsgId { seq, ts };
        }
        inner.last = MsgId { seq, ts };
        self.set_last_seq(seq);
        inner.bytes += rl;
        inner.msgs += 1;
    }

    /// Record a skipped sequence. An empty block just advances its range;
    /// otherwise an empty tombstone record keeps the file self-describing
    /// and the sequence lands in the delete map.
    pub(crate) async fn skip_msg(self: &Arc<Self>, seq: u64, ts: i64) {
        let mut inner = self.inner.write().await;

        if inner.msgs == 0 {
            inner.last = MsgId { seq, ts };
            inner.first = MsgId { seq: seq + 1, ts };
            self.set_last_seq(seq);
            return;
        }

        if inner.cache.is_none() {
            inner.cache = Some(Cache::default());
            self.arm_cache_expire_timer(&mut inner, self.cexp);
        }
        let checksum = {
            let cache = inner.cache.as_mut().unwrap();
            let index = cache.off + cache.buf.len();
            let checksum = record::append_record(
                &mut cache.buf,
                EMPTY_RECORD_LEN as u32,
                seq | EBIT,
                ts,
                "",
                &[],
                &[],
                &self.hh,
            );
            cache.idx.push(index as u32 | HBIT);
            cache.lrl = EMPTY_RECORD_LEN as u32;
            if cache.fseq == 0 {
                cache.fseq = seq;
            }
            checksum
        };
        inner.lchk = checksum;
        inner.lwts = ts;
        inner.last = MsgId { seq, ts };
        self.set_last_seq(seq);
        inner.dmap.insert(seq);

        self.kick_idx_writer(&inner);
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    /// Fetch a message, loading the block back into the cache on a miss.
    /// The block is assumed to have been selected for this sequence.
    pub(crate) async fn fetch_msg(self: &Arc<Self>, seq: u64) -> Result<StoredMsg> {
        {
            let mut inner = self.inner.write().await;
            match self.cache_lookup(&mut inner, seq) {
                Err(Error::NoCache) | Err(Error::PartialCache) => {}
                other => return other,
            }
        }

        // Cache miss: pull the whole block in and retry once.
        self.load_msgs().await?;
        let mut inner = self.inner.write().await;
        self.cache_lookup(&mut inner, seq)
    }

    /// Look a sequence up in the cache. Verifies the record checksum on
    /// the first touch of each slot, then marks the slot verified.
    pub(crate) fn cache_lookup(&self, inner: &mut BlockInner, seq: u64) -> Result<StoredMsg> {
        let first_seq = inner.first.seq;
        let cache = inner.cache.as_ref().ok_or(Error::NoCache)?;
        if cache.idx.is_empty() && cache.buf.is_empty() && inner.msgs > 0 {
            return Err(Error::NoCache);
        }

        if seq < first_seq
            || seq < cache.fseq
            || (seq - cache.fseq) >= cache.idx.len() as u64
        {
            return Err(Error::MsgNotFound);
        }

        if inner.dmap.contains(&seq) {
            return Err(Error::DeletedMsg);
        }

        inner.llts = now_nanos();

        let cache = inner.cache.as_mut().unwrap();
        let slot = (seq - cache.fseq) as usize;
        let (bi, rl, hash_checked) = slot_info(cache, slot)?;
        let (bi, rl) = (bi as usize, rl as usize);

        // Bytes not resident: the caller must reload the block.
        if bi < cache.off || bi - cache.off + rl > cache.buf.len() {
            return Err(Error::PartialCache);
        }
        let li = bi - cache.off;

        let verify = if hash_checked { None } else { Some(&self.hh) };
        let rec = record::decode_record(&cache.buf[li..li + rl], verify)?;
        if rec.seq != seq {
            return Err(Error::BadMsg);
        }
        if !hash_checked {
            cache.idx[slot] |= HBIT;
        }

        Ok(StoredMsg {
            subject: rec.subject,
            headers: rec.headers,
            payload: rec.payload,
            seq,
            ts: rec.ts,
        })
    }

    /// Load the whole block file into the cache and index it. Idempotent
    /// under concurrent callers; flushes pending writes first so the file
    /// is complete.
    pub(crate) async fn load_msgs(self: &Arc<Self>) -> Result<()> {
        {
            let mut inner = self.inner.write().await;
            if inner.loading {
                return Ok(());
            }
            // Fully resident already?
            if let Some(cache) = &inner.cache {
                if cache.idx.len() as u64 >= inner.msgs + inner.dmap.len() as u64
                    && cache.off == 0
                    && !cache.buf.is_empty()
                {
                    return Ok(());
                }
            }
            inner.loading = true;
            inner.llts = now_nanos();
        }

        if self.write_pending_size().await > 0 {
            if let Err(err) = self.flush_pending_writes().await {
                match err {
                    Error::NoPending | Error::NoCache | Error::FlushRunning => {}
                    err => {
                        self.inner.write().await.loading = false;
                        return Err(err);
                    }
                }
            }
        }

        let read = tokio::fs::read(&self.mfn).await;

        let mut inner = self.inner.write().await;
        inner.loading = false;
        let buf = read?;

        // Make sure a partial cache is gone before re-indexing.
        self.clear_cache(&mut inner);

        let loaded = !buf.is_empty();
        index_cache_buf(&mut inner, buf)?;

        if loaded {
            inner.cloads += 1;
            self.arm_cache_expire_timer(&mut inner, self.cexp);
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Flushing
    // ------------------------------------------------------------------

    /// Bytes pending flush for this block.
    pub(crate) async fn write_pending_size(&self) -> usize {
        let inner = self.inner.read().await;
        match (&inner.mfd, &inner.cache) {
            (Some(_), Some(cache)) => cache.pending(),
            _ => 0,
        }
    }

    /// Write the cache's pending byte range to the data file.
    ///
    /// While the flush owns the range, writers may still append beyond it;
    /// those bytes stay pending for the next flush. On a write error the
    /// index file is deleted since it can no longer be trusted.
    pub(crate) async fn flush_pending_writes(self: &Arc<Self>) -> Result<()> {
        let (buf, mut mfd) = {
            let mut inner = self.inner.write().await;
            if inner.mfd.is_none() {
                return Err(Error::NoPending);
            }
            let cache = inner.cache.as_mut().ok_or(Error::NoCache)?;
            if cache.flush {
                return Err(Error::FlushRunning);
            }
            if cache.pending() == 0 {
                return Err(Error::NoPending);
            }
            cache.flush = true;
            let pending = cache.buf[cache.wp..].to_vec();
            (pending, inner.mfd.take().unwrap())
        };

        let write_res = mfd.write_all(&buf).await;

        let mut inner = self.inner.write().await;
        inner.mfd = Some(mfd);

        if let Err(err) = write_res {
            // The index no longer reflects what is on disk.
            self.remove_index(&mut inner).await;
            if let Some(cache) = inner.cache.as_mut() {
                cache.flush = false;
            }
            return Err(err.into());
        }

        let tn = buf.len();
        let now = now_nanos();
        let llts = inner.llts;
        let cexp = self.cexp.as_nanos() as i64;

        if let Some(cache) = inner.cache.as_mut() {
            cache.flush = false;
            if now.saturating_sub(llts) <= cexp {
                // Recent reads: keep the flushed bytes resident.
                cache.wp += tn;
            } else {
                // Drop what we flushed; keep any bytes appended since.
                let flushed_end = cache.wp + tn;
                cache.buf.drain(..flushed_end);
                cache.off += flushed_end;
                cache.wp = 0;
                if cache.buf.is_empty() && cache.buf.capacity() > MAX_BUF_REUSE {
                    cache.buf = Vec::new();
                }
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Removal helpers
    // ------------------------------------------------------------------

    /// Overwrite a record in place with a tombstone filled with random
    /// bytes and a fresh checksum, in the cache if resident and on disk if
    /// the byte range was already flushed.
    pub(crate) async fn erase_msg(
        &self,
        inner: &mut BlockInner,
        seq: u64,
        ri: usize,
        rl: usize,
    ) -> Result<()> {
        let mut data = vec![0u8; rl - EMPTY_RECORD_LEN];
        rand::thread_rng().fill_bytes(&mut data);

        let mut nbytes = Vec::with_capacity(rl);
        record::append_record(
            &mut nbytes,
            rl as u32,
            seq | EBIT,
            0,
            "",
            &[],
            &data,
            &self.hh,
        );

        let cache = match inner.cache.as_mut() {
            Some(cache) => cache,
            None => return Ok(()),
        };

        // Cache copy, when the record is resident.
        if ri >= cache.off && ri - cache.off + rl <= cache.buf.len() {
            let li = ri - cache.off;
            cache.buf[li..li + rl].copy_from_slice(&nbytes);
        }

        // Disk copy, when the record was already flushed.
        if cache.off + cache.wp > ri {
            let mut mfd = OpenOptions::new().read(true).write(true).open(&self.mfn).await?;
            mfd.seek(SeekFrom::Start(ri as u64)).await?;
            mfd.write_all(&nbytes).await?;
            mfd.sync_all().await?;
        }

        Ok(())
    }

    /// Advance `first` past the removed sequence and any contiguous delete
    /// map entries, pruning them as we go. The caller resolves the new
    /// first timestamp afterwards (it may need a cache load).
    pub(crate) fn advance_first(inner: &mut BlockInner) {
        let mut seq = inner.first.seq + 1;
        while seq <= inner.last.seq {
            if inner.dmap.remove(&seq) {
                seq += 1;
            } else {
                break;
            }
        }
        inner.first.seq = seq;
        if MsgBlock::is_empty(inner) {
            inner.first.ts = 0;
        }
    }

    // ------------------------------------------------------------------
    // Index file
    // ------------------------------------------------------------------

    pub(crate) async fn write_index_info(self: &Arc<Self>) -> Result<()> {
        let mut inner = self.inner.write().await;
        self.write_index_info_locked(&mut inner).await
    }

    /// Serialize the block accounting to the index file at offset 0. The
    /// sync timer later truncates the file to the written size.
    pub(crate) async fn write_index_info_locked(&self, inner: &mut BlockInner) -> Result<()> {
        let first_seq = inner.first.seq;
        // Stale delete map entries are purged at serialization time.
        inner.dmap.retain(|&seq| seq > first_seq);

        let mut buf = Vec::with_capacity(64 + inner.dmap.len() * 4);
        buf.push(MAGIC);
        buf.push(VERSION);
        varint::encode_varint_u64(&mut buf, inner.msgs);
        varint::encode_varint_u64(&mut buf, inner.bytes);
        varint::encode_varint_u64(&mut buf, inner.first.seq);
        varint::encode_varint(&mut buf, inner.first.ts);
        varint::encode_varint_u64(&mut buf, inner.last.seq);
        varint::encode_varint(&mut buf, inner.last.ts);
        varint::encode_varint_u64(&mut buf, inner.dmap.len() as u64);
        buf.extend_from_slice(&inner.lchk);

        // Delta-compress against the first sequence.
        for &seq in &inner.dmap {
            varint::encode_varint_u64(&mut buf, seq - first_seq);
        }

        if inner.ifd.is_none() {
            let ifd = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&self.ifn)
                .await?;
            inner.ifd = Some(ifd);
        }

        let ifd = inner.ifd.as_mut().unwrap();
        ifd.seek(SeekFrom::Start(0)).await?;
        ifd.write_all(&buf).await?;
        inner.liwsz = buf.len() as u64;

        Ok(())
    }

    /// Parse the index file into the block state. A bad header deletes the
    /// file so recovery falls back to the data scan.
    pub(crate) async fn read_index_info(&self, inner: &mut BlockInner) -> Result<()> {
        let buf = tokio::fs::read(&self.ifn).await?;

        if check_header(&buf).is_err() {
            let _ = tokio::fs::remove_file(&self.ifn).await;
            return Err(Error::CorruptState);
        }

        let mut bi = FILE_HDR_LEN;
        let read_u64 = |buf: &[u8], bi: &mut usize| -> Result<u64> {
            let (v, n) = varint::try_decode_varint_u64(&buf[*bi..]).ok_or(Error::CorruptState)?;
            *bi += n;
            Ok(v)
        };
        let read_i64 = |buf: &[u8], bi: &mut usize| -> Result<i64> {
            let (v, n) = varint::try_decode_varint(&buf[*bi..]).ok_or(Error::CorruptState)?;
            *bi += n;
            Ok(v)
        };

        inner.msgs = read_u64(&buf, &mut bi)?;
        inner.bytes = read_u64(&buf, &mut bi)?;
        inner.first.seq = read_u64(&buf, &mut bi)?;
        inner.first.ts = read_i64(&buf, &mut bi)?;
        inner.last.seq = read_u64(&buf, &mut bi)?;
        inner.last.ts = read_i64(&buf, &mut bi)?;
        let dmap_len = read_u64(&buf, &mut bi)?;

        if bi + CHECKSUM_LEN > buf.len() {
            return Err(Error::CorruptState);
        }
        inner.lchk.copy_from_slice(&buf[bi..bi + CHECKSUM_LEN]);
        bi += CHECKSUM_LEN;

        inner.dmap.clear();
        for _ in 0..dmap_len {
            let delta = match varint::try_decode_varint_u64(&buf[bi..]) {
                Some((0, _)) | None => break,
                Some((v, n)) => {
                    bi += n;
                    v
                }
            };
            inner.dmap.insert(delta + inner.first.seq);
        }

        Ok(())
    }

    /// Close and delete the index file after a failed flush.
    async fn remove_index(&self, inner: &mut BlockInner) {
        inner.ifd = None;
        inner.liwsz = 0;
        let _ = tokio::fs::remove_file(&self.ifn).await;
    }

    // ------------------------------------------------------------------
    // Index writer task
    // ------------------------------------------------------------------

    /// Lazily start the per-block index writer; bursts of deletes coalesce
    /// on its one-slot dirty channel.
    pub(crate) async fn ensure_idx_writer(self: &Arc<Self>, inner: &mut BlockInner) {
        if inner.dch.is_some() {
            return;
        }
        let (tx, mut rx) = mpsc::channel::<()>(1);
        inner.dch = Some(tx);
        let mb = Arc::clone(self);
        inner.idx_task = Some(tokio::spawn(async move {
            while rx.recv().await.is_some() {
                if let Err(err) = mb.write_index_info().await {
                    warn!(index = mb.index, %err, "block index write failed");
                }
            }
        }));
    }

    pub(crate) fn kick_idx_writer(&self, inner: &BlockInner) {
        if let Some(dch) = &inner.dch {
            let _ = dch.try_send(());
        }
    }

    // ------------------------------------------------------------------
    // Cache expiration
    // ------------------------------------------------------------------

    fn arm_cache_expire_timer(self: &Arc<Self>, inner: &mut BlockInner, td: Duration) {
        if let Some(tmr) = inner.ctmr.take() {
            tmr.abort();
        }
        let mb = Arc::downgrade(self);
        inner.ctmr = Some(tokio::spawn(async move {
            tokio::time::sleep(td).await;
            if let Some(mb) = mb.upgrade() {
                mb.expire_cache().await;
            }
        }));
    }

    /// Timer callback: drop the cache buffer once it has been idle past
    /// the expiration window, and the slot index after a longer window
    /// without removals. Flushes in progress or pending bytes defer.
    async fn expire_cache(self: Arc<Self>) {
        let mut inner = self.inner.write().await;
        inner.ctmr = None;

        let (flushing, pending) = match &inner.cache {
            Some(cache) => (cache.flush, cache.pending()),
            None => return,
        };
        if flushing || pending > 0 {
            self.arm_cache_expire_timer(&mut inner, self.cexp);
            return;
        }

        let now = now_nanos();
        let cexp = self.cexp.as_nanos() as i64;

        // The buffer cares about reads and writes, but not removes.
        let bufts = inner.llts.max(inner.lwts);
        if now - bufts <= cexp {
            let remain = (cexp - (now - bufts)) as u64;
            self.arm_cache_expire_timer(&mut inner, Duration::from_nanos(remain));
            return;
        }

        // Expire the message buffer.
        let lrts = inner.lrts;
        {
            let cache = inner.cache.as_mut().unwrap();
            cache.off += cache.buf.len();
            cache.buf = Vec::new();
            cache.wp = 0;
        }

        // The slot index is used by removes and lives longer.
        if now - lrts > DEFAULT_CACHE_IDX_EXPIRATION.as_nanos() as i64 {
            self.clear_cache(&mut inner);
        } else {
            self.arm_cache_expire_timer(&mut inner, self.cexp);
        }
    }

    pub(crate) fn clear_cache(&self, inner: &mut BlockInner) {
        if let Some(tmr) = inner.ctmr.take() {
            tmr.abort();
        }
        inner.cache = None;
    }

    // ------------------------------------------------------------------
    // Sync / close
    // ------------------------------------------------------------------

    /// fsync the data file and the index file, truncating the index to its
    /// last written size to drop trailing garbage from older longer
    /// writes.
    pub(crate) async fn sync_files(&self) {
        let inner = self.inner.read().await;
        if let Some(mfd) = &inner.mfd {
            let _ = mfd.sync_all().await;
        }
        if let Some(ifd) = &inner.ifd {
            let _ = ifd.sync_all().await;
            let _ = ifd.set_len(inner.liwsz).await;
        }
    }

    /// Close the block, optionally syncing file contents first.
    pub(crate) async fn close(&self, sync: bool) {
        let (mfd, ifd) = {
            let mut inner = self.inner.write().await;
            self.clear_cache(&mut inner);
            // Dropping the dirty channel stops the index writer loop.
            inner.dch = None;
            inner.idx_task = None;
            (inner.mfd.take(), inner.ifd.take())
        };
        if sync {
            sync_and_close(mfd, ifd).await;
        } else {
            tokio::spawn(sync_and_close(mfd, ifd));
        }
    }

    /// Close the file handles after a roll-over. The cache, delete map and
    /// index writer stay: the block still serves reads and removals, and
    /// the index file is reopened on demand.
    pub(crate) async fn close_write_handles(&self) {
        let (mfd, ifd) = {
            let mut inner = self.inner.write().await;
            (inner.mfd.take(), inner.ifd.take())
        };
        tokio::spawn(sync_and_close(mfd, ifd));
    }

    /// Close without syncing; used by purge where the files are about to
    /// be removed anyway.
    pub(crate) async fn dirty_close(&self) {
        let mut inner = self.inner.write().await;
        self.clear_cache(&mut inner);
        inner.dch = None;
        inner.idx_task = None;
        inner.mfd = None;
        inner.ifd = None;
    }

    /// Delete the block's files from disk.
    pub(crate) async fn remove_files(&self) {
        let _ = tokio::fs::remove_file(&self.ifn).await;
        let _ = tokio::fs::remove_file(&self.mfn).await;
    }
}

async fn sync_and_close(mfd: Option<File>, ifd: Option<File>) {
    if let Some(mfd) = mfd {
        let _ = mfd.sync_all().await;
    }
    if let Some(ifd) = ifd {
        let _ = ifd.sync_all().await;
    }
}

/// Grab offset, record length and the verified flag for a slot.
pub(crate) fn slot_info(cache: &Cache, slot: usize) -> Result<(u32, u32, bool)> {
    if slot >= cache.idx.len() {
        return Err(Error::PartialCache);
    }
    let bi = cache.idx[slot];
    let ri = bi & !HBIT;
    let hash_checked = bi & HBIT != 0;
    let rl = if cache.idx.len() > slot + 1 {
        (cache.idx[slot + 1] & !HBIT) - ri
    } else {
        cache.lrl
    };
    if rl < MSG_HDR_LEN as u32 {
        return Err(Error::BadMsg);
    }
    Ok((ri, rl, hash_checked))
}

/// Index a raw block buffer into a fresh cache. Every record contributes a
/// slot; checksum checks are deferred to individual lookups to keep the
/// first message from a newly loaded block fast.
pub(crate) fn index_cache_buf(inner: &mut BlockInner, buf: Vec<u8>) -> Result<()> {
    let mut fseq = inner.first.seq;
    let mut idx = Vec::with_capacity(inner.msgs as usize + inner.dmap.len());
    let mut lrl = 0u32;
    let mut index = 0usize;
    let lbuf = buf.len();

    while index < lbuf {
        if index + MSG_HDR_LEN > lbuf {
            return Err(Error::BadMsg);
        }
        let hdr = &buf[index..index + MSG_HDR_LEN];
        let rl = u32::from_le_bytes(hdr[0..4].try_into().unwrap()) & !HBIT;
        let seq = u64::from_le_bytes(hdr[4..12].try_into().unwrap());
        let slen = u16::from_le_bytes(hdr[20..22].try_into().unwrap()) as usize;

        if (rl as usize) < MSG_HDR_LEN + CHECKSUM_LEN
            || slen > rl as usize - MSG_HDR_LEN
            || index + rl as usize > lbuf
        {
            return Err(Error::BadMsg);
        }

        // Adjust if the approximation from accounting was wrong.
        let live_seq = seq & !EBIT;
        if live_seq != 0 && (fseq == 0 || live_seq < fseq) {
            fseq = live_seq;
        }

        idx.push(index as u32);
        lrl = rl;
        index += rl as usize;
    }

    let wp = buf.len();
    inner.cache = Some(Cache {
        buf,
        off: 0,
        wp,
        idx,
        lrl,
        fseq,
        flush: false,
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamvault_core::record::message_record_size;
    use tempfile::TempDir;

    fn encode_into(buf: &mut Vec<u8>, seq: u64, ts: i64, subj: &str, msg: &[u8], hh: &RecordHasher) {
        let rl = message_record_size(subj, &[], msg) as u32;
        record::append_record(buf, rl, seq, ts, subj, &[], msg, hh);
    }

    async fn write_block(mb: &Arc<MsgBlock>, seqs: std::ops::RangeInclusive<u64>) {
        for seq in seqs {
            let msg = format!("payload-{}", seq);
            let rl = message_record_size("t", &[], msg.as_bytes()) as u32;
            mb.write_msg_record(rl, seq, "t", &[], msg.as_bytes(), seq as i64 * 10)
                .await;
        }
    }

    #[tokio::test]
    async fn test_write_and_cache_lookup() {
        let dir = TempDir::new().unwrap();
        let mb = MsgBlock::create_for_write(1, dir.path(), Duration::from_secs(5), "s")
            .await
            .unwrap();

        write_block(&mb, 1..=5).await;

        for seq in 1..=5u64 {
            let sm = mb.fetch_msg(seq).await.unwrap();
            assert_eq!(sm.seq, seq);
            assert_eq!(sm.subject, "t");
            assert_eq!(&sm.payload[..], format!("payload-{}", seq).as_bytes());
        }

        let inner = mb.inner.read().await;
        assert_eq!(inner.msgs, 5);
        assert_eq!(inner.first.seq, 1);
        assert_eq!(inner.last.seq, 5);
        assert_eq!(mb.last_seq(), 5);
    }

    #[tokio::test]
    async fn test_lookup_out_of_range() {
        let dir = TempDir::new().unwrap();
        let mb = MsgBlock::create_for_write(1, dir.path(), Duration::from_secs(5), "s")
            .await
            .unwrap();
        write_block(&mb, 1..=3).await;

        let mut inner = mb.inner.write().await;
        assert!(matches!(
            mb.cache_lookup(&mut inner, 9),
            Err(Error::MsgNotFound)
        ));
    }

    #[tokio::test]
    async fn test_flush_then_reload() {
        let dir = TempDir::new().unwrap();
        let mb = MsgBlock::create_for_write(1, dir.path(), Duration::from_secs(5), "s")
            .await
            .unwrap();
        write_block(&mb, 1..=10).await;

        assert!(mb.write_pending_size().await > 0);
        mb.flush_pending_writes().await.unwrap();
        assert_eq!(mb.write_pending_size().await, 0);

        // Drop the cache entirely and fetch through a cold load.
        {
            let mut inner = mb.inner.write().await;
            mb.clear_cache(&mut inner);
        }
        let sm = mb.fetch_msg(7).await.unwrap();
        assert_eq!(sm.seq, 7);
        assert_eq!(&sm.payload[..], b"payload-7");

        let inner = mb.inner.read().await;
        assert_eq!(inner.cloads, 1);
    }

    #[tokio::test]
    async fn test_flush_without_pending_is_no_pending() {
        let dir = TempDir::new().unwrap();
        let mb = MsgBlock::create_for_write(1, dir.path(), Duration::from_secs(5), "s")
            .await
            .unwrap();
        assert!(matches!(
            mb.flush_pending_writes().await,
            Err(Error::NoCache) | Err(Error::NoPending)
        ));
    }

    #[tokio::test]
    async fn test_checksum_verified_once_per_slot() {
        let dir = TempDir::new().unwrap();
        let mb = MsgBlock::create_for_write(1, dir.path(), Duration::from_secs(5), "s")
            .await
            .unwrap();
        write_block(&mb, 1..=3).await;
        mb.flush_pending_writes().await.unwrap();
        {
            let mut inner = mb.inner.write().await;
            mb.clear_cache(&mut inner);
        }
        mb.load_msgs().await.unwrap();

        // Freshly indexed slots are unverified.
        {
            let inner = mb.inner.read().await;
            let cache = inner.cache.as_ref().unwrap();
            assert!(cache.idx.iter().all(|slot| slot & HBIT == 0));
        }

        mb.fetch_msg(2).await.unwrap();

        let inner = mb.inner.read().await;
        let cache = inner.cache.as_ref().unwrap();
        assert!(cache.idx[1] & HBIT != 0);
        assert!(cache.idx[0] & HBIT == 0);
    }

    #[tokio::test]
    async fn test_index_info_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mb = MsgBlock::create_for_write(3, dir.path(), Duration::from_secs(5), "s")
            .await
            .unwrap();
        write_block(&mb, 10..=20).await;
        {
            let mut inner = mb.inner.write().await;
            inner.dmap.insert(12);
            inner.dmap.insert(15);
        }
        mb.write_index_info().await.unwrap();

        let mb2 = MsgBlock::new(3, dir.path(), Duration::from_secs(5), "s");
        let mut inner2 = mb2.inner.try_write().unwrap();
        mb2.read_index_info(&mut inner2).await.unwrap();

        let inner = mb.inner.read().await;
        assert_eq!(inner2.msgs, inner.msgs);
        assert_eq!(inner2.bytes, inner.bytes);
        assert_eq!(inner2.first.seq, 10);
        assert_eq!(inner2.last.seq, 20);
        assert_eq!(inner2.lchk, inner.lchk);
        assert!(inner2.dmap.contains(&12));
        assert!(inner2.dmap.contains(&15));
        assert_eq!(inner2.dmap.len(), 2);
    }

    #[tokio::test]
    async fn test_recover_trusts_current_index() {
        let dir = TempDir::new().unwrap();
        {
            let mb = MsgBlock::create_for_write(1, dir.path(), Duration::from_secs(5), "s")
                .await
                .unwrap();
            write_block(&mb, 1..=4).await;
            mb.flush_pending_writes().await.unwrap();
            mb.write_index_info().await.unwrap();
            mb.close(true).await;
        }

        let mb = MsgBlock::recover(1, dir.path(), Duration::from_secs(5), "s")
            .await
            .unwrap();
        let inner = mb.inner.read().await;
        assert_eq!(inner.msgs, 4);
        assert_eq!(inner.first.seq, 1);
        assert_eq!(inner.last.seq, 4);
    }

    #[tokio::test]
    async fn test_recover_rescans_when_index_is_stale() {
        let dir = TempDir::new().unwrap();
        {
            let mb = MsgBlock::create_for_write(1, dir.path(), Duration::from_secs(5), "s")
                .await
                .unwrap();
            write_block(&mb, 1..=2).await;
            mb.flush_pending_writes().await.unwrap();
            mb.write_index_info().await.unwrap();
            // More writes after the index snapshot, then a crash (no idx).
            write_block(&mb, 3..=6).await;
            mb.flush_pending_writes().await.unwrap();
            mb.close(true).await;
        }

        let mb = MsgBlock::recover(1, dir.path(), Duration::from_secs(5), "s")
            .await
            .unwrap();
        let inner = mb.inner.read().await;
        assert_eq!(inner.msgs, 6);
        assert_eq!(inner.last.seq, 6);
    }

    #[tokio::test]
    async fn test_recover_missing_data_file() {
        let dir = TempDir::new().unwrap();
        assert!(
            MsgBlock::recover(9, dir.path(), Duration::from_secs(5), "s")
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_skip_on_empty_block_moves_range() {
        let dir = TempDir::new().unwrap();
        let mb = MsgBlock::create_for_write(1, dir.path(), Duration::from_secs(5), "s")
            .await
            .unwrap();
        mb.skip_msg(1, 100).await;

        let inner = mb.inner.read().await;
        assert_eq!(inner.last.seq, 1);
        assert_eq!(inner.first.seq, 2);
        assert_eq!(inner.msgs, 0);
        assert!(MsgBlock::is_empty(&inner));
    }

    #[tokio::test]
    async fn test_skip_on_nonempty_block_writes_tombstone() {
        let dir = TempDir::new().unwrap();
        let mb = MsgBlock::create_for_write(1, dir.path(), Duration::from_secs(5), "s")
            .await
            .unwrap();
        write_block(&mb, 1..=2).await;
        mb.skip_msg(3, 100).await;

        {
            let inner = mb.inner.read().await;
            assert_eq!(inner.msgs, 2);
            assert_eq!(inner.last.seq, 3);
            assert!(inner.dmap.contains(&3));
        }

        // The tombstone still occupies a slot so later sequences line up.
        mb.flush_pending_writes().await.unwrap();
        let err = mb.fetch_msg(3).await.unwrap_err();
        assert!(matches!(err, Error::DeletedMsg));
    }

    #[tokio::test]
    async fn test_advance_first_walks_dmap() {
        let mut inner = BlockInner {
            first: MsgId { seq: 1, ts: 10 },
            last: MsgId { seq: 5, ts: 50 },
            ..Default::default()
        };
        inner.dmap.insert(2);
        inner.dmap.insert(3);

        MsgBlock::advance_first(&mut inner);
        assert_eq!(inner.first.seq, 4);
        assert!(inner.dmap.is_empty());
    }

    #[tokio::test]
    async fn test_advance_first_to_empty() {
        let mut inner = BlockInner {
            first: MsgId { seq: 5, ts: 10 },
            last: MsgId { seq: 5, ts: 10 },
            ..Default::default()
        };
        MsgBlock::advance_first(&mut inner);
        assert_eq!(inner.first.seq, 6);
        assert!(MsgBlock::is_empty(&inner));
        assert_eq!(inner.first.ts, 0);
    }

    #[tokio::test]
    async fn test_erase_msg_overwrites_on_disk() {
        let dir = TempDir::new().unwrap();
        let mb = MsgBlock::create_for_write(1, dir.path(), Duration::from_secs(5), "s")
            .await
            .unwrap();
        let msg = b"super-secret-payload";
        let rl = message_record_size("sec", &[], msg) as u32;
        mb.write_msg_record(rl, 1, "sec", &[], msg, 42).await;
        mb.flush_pending_writes().await.unwrap();

        {
            let mut inner = mb.inner.write().await;
            mb.erase_msg(&mut inner, 1, 0, rl as usize).await.unwrap();
        }

        let raw = tokio::fs::read(&mb.mfn).await.unwrap();
        assert_eq!(raw.len(), rl as usize);
        let seq_field = u64::from_le_bytes(raw[4..12].try_into().unwrap());
        assert_eq!(seq_field, 1 | EBIT);
        // Old payload bytes are gone.
        assert!(!raw.windows(msg.len()).any(|w| w == msg));
        // And the tombstone carries a valid checksum.
        let rec = record::decode_record(&raw, Some(&mb.hh)).unwrap();
        assert_eq!(rec.seq, 0);
    }

    #[tokio::test]
    async fn test_index_cache_buf_rejects_garbage() {
        let mut inner = BlockInner::default();
        let res = index_cache_buf(&mut inner, vec![0xFF; 40]);
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_index_cache_buf_indexes_records() {
        let hh = RecordHasher::new(b"s-1");
        let mut buf = Vec::new();
        encode_into(&mut buf, 1, 10, "a", b"one", &hh);
        encode_into(&mut buf, 2, 20, "b", b"two", &hh);

        let mut inner = BlockInner::default();
        inner.first.seq = 1;
        index_cache_buf(&mut inner, buf).unwrap();

        let cache = inner.cache.as_ref().unwrap();
        assert_eq!(cache.idx.len(), 2);
        assert_eq!(cache.fseq, 1);
        assert_eq!(cache.off, 0);
        assert_eq!(cache.wp, cache.buf.len());
    }
}
