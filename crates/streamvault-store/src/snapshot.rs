//! Consistent Snapshots
//!
//! Streams the store's files (stream meta, every block's index and data
//! file, optionally every consumer's files) as a gzip'd tar archive
//! through an in-process pipe, so a caller can ship or persist a
//! consistent copy while the stream keeps accepting writes.
//!
//! Consistency model: the block list is captured under the store lock and
//! the snapshots-in-progress counter (`sips`) refuses removals until the
//! archive is finished. Writes may continue; they land in blocks created
//! after the capture or past the flushed tail and are not part of the
//! archive.
//!
//! The archive is produced by a blocking task writing through a
//! `SyncIoBridge` into one end of a duplex pipe; file contents are fed to
//! it one at a time so memory stays bounded by the largest single file.
//! Failures while gathering are reported as an `errors.txt` entry in the
//! archive rather than tearing the pipe down abruptly.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_util::io::SyncIoBridge;
use tracing::{info, warn};

use streamvault_core::record::{self, RecordHasher, EBIT, HBIT, MSG_HDR_LEN};

use crate::block::{hash_key_for_block, MsgBlock};
use crate::config::{
    blk_file_name, idx_file_name, parse_blk_file_name, CONSUMER_DIR, META_FILE, META_SUM_FILE,
    MSG_DIR,
};
use crate::error::{Error, Result};
use crate::store::FileStore;

/// Archive member used to report gather errors.
const ERR_FILE: &str = "errors.txt";

/// A started snapshot: a reader over the gzip'd tar stream plus the shape
/// of the store at capture time.
pub struct SnapshotResult {
    /// Reader end of the snapshot pipe.
    pub reader: DuplexStream,
    /// Block size the store was configured with.
    pub block_size: u64,
    /// Number of blocks captured.
    pub num_blocks: usize,
}

impl FileStore {
    /// Walk every block file and report the sequences whose records fail
    /// checksum validation. A structurally broken record ends that block's
    /// scan; everything behind it is unreachable.
    pub async fn check_msgs(self: &Arc<Self>) -> Vec<u64> {
        let _ = self.flush_pending_writes_unlocked().await;

        let stream_name = self.stream_config().await.name;
        let mdir = self.file_store_config().store_dir.join(MSG_DIR);
        let mut rd = match tokio::fs::read_dir(&mdir).await {
            Ok(rd) => rd,
            Err(_) => return Vec::new(),
        };

        let mut indices = Vec::new();
        while let Ok(Some(entry)) = rd.next_entry().await {
            if let Some(index) = parse_blk_file_name(&entry.file_name().to_string_lossy()) {
                indices.push(index);
            }
        }
        indices.sort_unstable();

        let mut bad = Vec::new();
        for index in indices {
            let buf = match tokio::fs::read(mdir.join(blk_file_name(index))).await {
                Ok(buf) => buf,
                Err(_) => continue,
            };
            let hh = RecordHasher::new(hash_key_for_block(&stream_name, index).as_bytes());
            check_msg_block_buf(&buf, &hh, &mut bad);
        }
        bad
    }

    /// Start a snapshot. Refused while another snapshot is running; while
    /// this one runs, removals are refused. With `check_msgs` set, every
    /// record checksum is validated first and a corrupt store refuses to
    /// snapshot. The archive is written in the background, bounded by
    /// `deadline` when non-zero.
    pub async fn snapshot(
        self: &Arc<Self>,
        deadline: Duration,
        check_msgs: bool,
        include_consumers: bool,
    ) -> Result<SnapshotResult> {
        let blks = {
            let mut inner = self.inner.write().await;
            if inner.closed {
                return Err(Error::Closed);
            }
            // Only allow one at a time.
            if inner.sips > 0 {
                return Err(Error::SnapshotInProgress);
            }
            inner.sips += 1;
            inner.blks.clone()
        };

        if check_msgs {
            let bad = self.check_msgs().await;
            if !bad.is_empty() {
                self.inner.write().await.sips -= 1;
                return Err(Error::SnapshotCheck(bad.len()));
            }
        }

        let num_blocks = blks.len();
        let block_size = self.file_store_config().block_size;
        let (writer, reader) = tokio::io::duplex(64 * 1024);

        let fs = Arc::clone(self);
        tokio::spawn(async move {
            let run = fs.stream_snapshot(writer, blks, include_consumers);
            let res = if deadline > Duration::ZERO {
                match tokio::time::timeout(deadline, run).await {
                    Ok(res) => res,
                    Err(_) => {
                        warn!("snapshot deadline exceeded, closing pipe");
                        Ok(())
                    }
                }
            } else {
                run.await
            };
            if let Err(err) = res {
                warn!(%err, "snapshot stream failed");
            }
            fs.inner.write().await.sips -= 1;
        });

        info!(num_blocks, "snapshot started");
        Ok(SnapshotResult {
            reader,
            block_size,
            num_blocks,
        })
    }

    async fn stream_snapshot(
        self: &Arc<Self>,
        writer: DuplexStream,
        blks: Vec<Arc<MsgBlock>>,
        include_consumers: bool,
    ) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<(String, Vec<u8>)>(2);

        // The tar/gzip writers are blocking; bridge them to the pipe.
        let tar_task = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let bridge = SyncIoBridge::new(writer);
            let gz = GzEncoder::new(bridge, Compression::fast());
            let mut tw = tar::Builder::new(gz);
            let mtime = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();

            while let Some((name, data)) = rx.blocking_recv() {
                let mut header = tar::Header::new_gnu();
                header.set_size(data.len() as u64);
                header.set_mode(0o600);
                header.set_mtime(mtime);
                header.set_cksum();
                tw.append_data(&mut header, name, data.as_slice())?;
            }

            let gz = tw.into_inner()?;
            let mut bridge = gz.finish()?;
            bridge.shutdown()?;
            Ok(())
        });

        let gather = self.gather_snapshot_files(&tx, blks, include_consumers).await;
        if let Err(err) = &gather {
            // Report the failure inside the archive itself.
            let _ = tx
                .send((ERR_FILE.to_string(), err.to_string().into_bytes()))
                .await;
        }
        drop(tx);

        match tar_task.await {
            Ok(Ok(())) => gather,
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(Error::Config("snapshot writer panicked".to_string())),
        }
    }

    async fn gather_snapshot_files(
        self: &Arc<Self>,
        tx: &mpsc::Sender<(String, Vec<u8>)>,
        blks: Vec<Arc<MsgBlock>>,
        include_consumers: bool,
    ) -> Result<()> {
        let store_dir = self.file_store_config().store_dir.clone();

        // General metadata first.
        {
            let inner = self.inner.read().await;
            self.write_stream_meta(&inner).await?;
        }
        let meta = tokio::fs::read(store_dir.join(META_FILE)).await?;
        let sum = tokio::fs::read(store_dir.join(META_SUM_FILE)).await?;
        send_entry(tx, META_FILE.to_string(), meta).await?;
        send_entry(tx, META_SUM_FILE.to_string(), sum).await?;

        // Now the messages themselves.
        let lmb = self.inner.read().await.lmb.clone();
        for mb in &blks {
            if let Some(lmb) = &lmb {
                if Arc::ptr_eq(mb, lmb) {
                    // The write buffer may hold part of the tail.
                    let _ = self.flush_pending_writes_unlocked().await;
                }
            }
            let idx = tokio::fs::read(&mb.ifn).await?;
            send_entry(tx, format!("{}/{}", MSG_DIR, idx_file_name(mb.index)), idx).await?;
            let blk = tokio::fs::read(&mb.mfn).await?;
            send_entry(tx, format!("{}/{}", MSG_DIR, blk_file_name(mb.index)), blk).await?;
        }

        if !include_consumers {
            return Ok(());
        }

        // Consumers' state last.
        let cfs = self.inner.read().await.cfs.clone();
        for o in cfs {
            o.sync_state_file().await;
            let odir = o.dir().clone();
            let prefix = format!("{}/{}", CONSUMER_DIR, o.name());
            for file in [META_FILE, META_SUM_FILE, crate::config::CONSUMER_STATE_FILE] {
                match tokio::fs::read(odir.join(file)).await {
                    Ok(data) => {
                        send_entry(tx, format!("{}/{}", prefix, file), data).await?;
                    }
                    // A consumer that never persisted state has no o.dat.
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }

        Ok(())
    }
}

async fn send_entry(
    tx: &mpsc::Sender<(String, Vec<u8>)>,
    name: String,
    data: Vec<u8>,
) -> Result<()> {
    tx.send((name, data))
        .await
        .map_err(|_| Error::Config("snapshot pipe closed".to_string()))
}

/// Scan one block buffer, appending bad sequences. Checksum failures keep
/// scanning; structural damage stops at the broken record.
fn check_msg_block_buf(buf: &[u8], hh: &RecordHasher, bad: &mut Vec<u64>) {
    let mut offset = 0usize;
    while offset + MSG_HDR_LEN <= buf.len() {
        let hdr = &buf[offset..offset + MSG_HDR_LEN];
        let rl = (u32::from_le_bytes(hdr[0..4].try_into().unwrap()) & !HBIT) as usize;
        let seq = u64::from_le_bytes(hdr[4..12].try_into().unwrap()) & !EBIT;

        if rl < MSG_HDR_LEN || offset + rl > buf.len() {
            bad.push(seq);
            return;
        }
        if record::decode_record(&buf[offset..offset + rl], Some(hh)).is_err() {
            bad.push(seq);
        }
        offset += rl;
    }
}
