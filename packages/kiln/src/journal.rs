//! Append-only, fixed-width journals that make incremental state durable
//! across runs.
//!
//! Both the file journal and the command journal share this machinery: a
//! sequence of 16-byte `{ key: u64, value_nanos: i64 }` records, no framing,
//! so the record count is just `file_size / 16`. A single writer task per
//! journal receives records over a bounded channel and batches appends;
//! duplicate keys are resolved last-writer-wins on load, which is exactly
//! why ordered, serialized writes matter (§4.5).

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use color_eyre::{Result, eyre::Context};
use tokio::{io::AsyncWriteExt, sync::oneshot};
use tracing::{instrument, warn};

pub mod command_journal;
pub mod file_journal;

/// The on-disk shape of one journal record: a 64-bit key and a signed
/// 64-bit nanosecond value, little-endian, 16 bytes total.
pub trait JournalRecord: Copy + Send + Sync + 'static {
    fn key(&self) -> u64;
    fn value_nanos(&self) -> i64;
    fn from_parts(key: u64, value_nanos: i64) -> Self;
}

const RECORD_SIZE: usize = 16;

fn encode<R: JournalRecord>(record: &R) -> [u8; RECORD_SIZE] {
    let mut buf = [0u8; RECORD_SIZE];
    buf[0..8].copy_from_slice(&record.key().to_le_bytes());
    buf[8..16].copy_from_slice(&record.value_nanos().to_le_bytes());
    buf
}

fn decode<R: JournalRecord>(buf: &[u8; RECORD_SIZE]) -> R {
    let key = u64::from_le_bytes(buf[0..8].try_into().expect("8 bytes"));
    let value_nanos = i64::from_le_bytes(buf[8..16].try_into().expect("8 bytes"));
    R::from_parts(key, value_nanos)
}

/// Read every whole record in `path`, discarding a truncated tail (fewer
/// than 16 bytes left over) with a warning rather than failing the load.
/// Returns an empty vec if the file doesn't exist yet.
#[instrument(skip(path), fields(path = %path.display()))]
pub async fn load_raw<R: JournalRecord>(path: &Path) -> Result<Vec<R>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("read journal {path:?}")),
    };

    let whole_records = bytes.len() / RECORD_SIZE;
    let tail = bytes.len() % RECORD_SIZE;
    if tail != 0 {
        warn!(
            path = %path.display(),
            tail_bytes = tail,
            "discarding truncated tail record in journal"
        );
    }

    let mut records = Vec::with_capacity(whole_records);
    for chunk in bytes[..whole_records * RECORD_SIZE].chunks_exact(RECORD_SIZE) {
        let buf: [u8; RECORD_SIZE] = chunk.try_into().expect("chunks_exact yields RECORD_SIZE");
        records.push(decode(&buf));
    }
    Ok(records)
}

/// Fold loaded records into a last-writer-wins map, matching §4.5's load
/// discipline: later entries for the same key overwrite earlier ones, which
/// is correct because the records are appended in write order.
pub fn fold_last_writer_wins<R: JournalRecord>(records: &[R]) -> HashMap<u64, i64> {
    let mut map = HashMap::with_capacity(records.len());
    for record in records {
        map.insert(record.key(), record.value_nanos());
    }
    map
}

/// Atomically rewrite `path` to contain exactly one record per key in
/// `live`, via write-temp-then-rename — the same discipline every atomic
/// write in this crate uses.
#[instrument(skip(live, path), fields(path = %path.display(), entries = live.len()))]
pub async fn compact<R: JournalRecord>(path: &Path, live: &HashMap<u64, i64>) -> Result<()> {
    let tmp_path = tmp_path_for(path);
    let mut buf = Vec::with_capacity(live.len() * RECORD_SIZE);
    for (&key, &value_nanos) in live {
        buf.extend_from_slice(&encode(&R::from_parts(key, value_nanos)));
    }
    tokio::fs::write(&tmp_path, &buf)
        .await
        .with_context(|| format!("write compacted journal tmp {tmp_path:?}"))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("rename compacted journal into place: {path:?}"))
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// A threshold on (file size in records) / (live keys) past which a journal
/// is considered worth compacting. `4` means: don't bother compacting until
/// the file holds roughly 4x as many records as there are live keys.
pub const COMPACTION_GROWTH_FACTOR: usize = 4;

/// Whether a journal with `total_records` on disk and `live_keys` distinct
/// keys has grown enough to justify compaction.
pub fn should_compact(total_records: usize, live_keys: usize) -> bool {
    live_keys > 0 && total_records > live_keys.saturating_mul(COMPACTION_GROWTH_FACTOR)
}

/// One record queued for the background writer, plus an optional
/// acknowledgement channel used by callers (the executor, at a durability
/// barrier) that need to know the append has landed on disk before they
/// proceed — see the happens-before ordering guarantee in §5.
pub struct PendingWrite<R> {
    pub record: R,
    pub ack: Option<oneshot::Sender<()>>,
}

/// A single-writer append task for one journal file.
///
/// Records arrive over a bounded channel (the bound is the journal's
/// backpressure point, §4.5/§5) and are flushed in batches of up to
/// `batch_size` or every `flush_interval`, whichever comes first.
pub struct JournalWriter<R: JournalRecord> {
    tx: flume::Sender<PendingWrite<R>>,
    handle: tokio::task::JoinHandle<Result<()>>,
}

impl<R: JournalRecord> JournalWriter<R> {
    pub fn spawn(
        path: PathBuf,
        queue_bound: usize,
        batch_size: usize,
        flush_interval: std::time::Duration,
    ) -> Self {
        let (tx, rx) = flume::bounded(queue_bound);
        let handle = tokio::spawn(Self::run(path, rx, batch_size, flush_interval));
        Self { tx, handle }
    }

    /// Queue `record` for append. Blocks (asynchronously) if the queue is at
    /// its bound, which is the journal's half of the executor's
    /// backpressure contract.
    pub async fn append(&self, record: R) -> Result<()> {
        self.tx
            .send_async(PendingWrite { record, ack: None })
            .await
            .context("send journal record: writer task gone")
    }

    /// Queue `record` and wait until it has been durably appended. Used
    /// wherever a successor's `Running` transition must happen-after a
    /// predecessor's journal record (§5 Ordering guarantees).
    pub async fn append_durable(&self, record: R) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send_async(PendingWrite {
                record,
                ack: Some(ack_tx),
            })
            .await
            .context("send journal record: writer task gone")?;
        ack_rx.await.context("writer task dropped ack")
    }

    /// Drain the queue and stop the writer task, waiting for every queued
    /// record to be flushed. Call this during build teardown.
    pub async fn shutdown(self) -> Result<()> {
        drop(self.tx);
        self.handle.await.context("join journal writer task")?
    }

    async fn run(
        path: PathBuf,
        rx: flume::Receiver<PendingWrite<R>>,
        batch_size: usize,
        flush_interval: std::time::Duration,
    ) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("open journal for append: {path:?}"))?;

        let mut batch: Vec<PendingWrite<R>> = Vec::with_capacity(batch_size);
        let mut ticker = tokio::time::interval(flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                item = rx.recv_async() => {
                    match item {
                        Ok(item) => {
                            batch.push(item);
                            if batch.len() >= batch_size {
                                Self::flush(&mut file, &mut batch, &path).await?;
                            }
                        }
                        Err(_) => {
                            // Sender dropped: flush whatever remains and exit.
                            Self::flush(&mut file, &mut batch, &path).await?;
                            return Ok(());
                        }
                    }
                }
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        Self::flush(&mut file, &mut batch, &path).await?;
                    }
                }
            }
        }
    }

    async fn flush(
        file: &mut tokio::fs::File,
        batch: &mut Vec<PendingWrite<R>>,
        path: &Path,
    ) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::with_capacity(batch.len() * RECORD_SIZE);
        for pending in batch.iter() {
            buf.extend_from_slice(&encode(&pending.record));
        }
        file.write_all(&buf)
            .await
            .with_context(|| format!("append to journal {path:?}"))?;
        file.flush().await.context("flush journal file")?;

        for pending in batch.drain(..) {
            if let Some(ack) = pending.ack {
                let _ = ack.send(());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    struct TestRecord {
        key: u64,
        value_nanos: i64,
    }

    impl JournalRecord for TestRecord {
        fn key(&self) -> u64 {
            self.key
        }
        fn value_nanos(&self) -> i64 {
            self.value_nanos
        }
        fn from_parts(key: u64, value_nanos: i64) -> Self {
            Self { key, value_nanos }
        }
    }

    #[tokio::test]
    async fn writer_appends_and_loader_reads_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.journal");
        let writer = JournalWriter::<TestRecord>::spawn(
            path.clone(),
            16,
            4,
            std::time::Duration::from_millis(10),
        );
        writer
            .append_durable(TestRecord {
                key: 1,
                value_nanos: 100,
            })
            .await
            .unwrap();
        writer
            .append_durable(TestRecord {
                key: 2,
                value_nanos: 200,
            })
            .await
            .unwrap();
        writer.shutdown().await.unwrap();

        let records: Vec<TestRecord> = load_raw(&path).await.unwrap();
        assert_eq!(records.len(), 2);
        let map = fold_last_writer_wins(&records);
        assert_eq!(map.get(&1), Some(&100));
        assert_eq!(map.get(&2), Some(&200));
    }

    #[tokio::test]
    async fn last_writer_wins_on_duplicate_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.journal");
        let writer =
            JournalWriter::<TestRecord>::spawn(path.clone(), 16, 1, std::time::Duration::from_millis(5));
        writer
            .append_durable(TestRecord {
                key: 1,
                value_nanos: 100,
            })
            .await
            .unwrap();
        writer
            .append_durable(TestRecord {
                key: 1,
                value_nanos: 999,
            })
            .await
            .unwrap();
        writer.shutdown().await.unwrap();

        let records: Vec<TestRecord> = load_raw(&path).await.unwrap();
        let map = fold_last_writer_wins(&records);
        assert_eq!(map.get(&1), Some(&999));
    }

    #[tokio::test]
    async fn truncated_tail_is_discarded_not_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.journal");
        let mut buf = encode(&TestRecord {
            key: 1,
            value_nanos: 42,
        })
        .to_vec();
        buf.extend_from_slice(&[0xAB, 0xCD, 0xEF]); // 3 stray bytes
        tokio::fs::write(&path, &buf).await.unwrap();

        let records: Vec<TestRecord> = load_raw(&path).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, 1);
    }

    #[tokio::test]
    async fn compact_preserves_live_entries_and_drops_overwritten_ones() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.journal");
        let writer =
            JournalWriter::<TestRecord>::spawn(path.clone(), 16, 1, std::time::Duration::from_millis(5));
        for i in 0..5 {
            writer
                .append_durable(TestRecord {
                    key: 1,
                    value_nanos: i,
                })
                .await
                .unwrap();
        }
        writer
            .append_durable(TestRecord {
                key: 2,
                value_nanos: 7,
            })
            .await
            .unwrap();
        writer.shutdown().await.unwrap();

        let before: Vec<TestRecord> = load_raw(&path).await.unwrap();
        assert_eq!(before.len(), 6);

        let live = fold_last_writer_wins(&before);
        compact::<TestRecord>(&path, &live).await.unwrap();

        let after: Vec<TestRecord> = load_raw(&path).await.unwrap();
        assert_eq!(after.len(), 2);
        assert_eq!(fold_last_writer_wins(&after), live);
    }

    #[test]
    fn should_compact_respects_growth_factor() {
        assert!(!should_compact(10, 0));
        assert!(!should_compact(40, 10));
        assert!(should_compact(41, 10));
    }
}
