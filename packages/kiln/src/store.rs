//! The FileRecord store: per-file identity shared across the whole build.
//!
//! Backed by a [`dashmap::DashMap`] — itself a lock-striped hash map — keyed
//! by [`AbsFilePath::normalized`](crate::path::TypedPath::normalized), sized
//! to keep per-shard contention sublinear under concurrent registration from
//! every worker in the executor's pool.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{instrument, trace, warn};

use crate::{error::Error, fs, hash::ContentHash, inputdb::InputDb, path::AbsFilePath};

/// Per-file identity: path, last-write-time, and the lazily-computed content
/// and implicit-dependency hashes.
///
/// Content and implicit-deps hashes are behind their own async mutex (rather
/// than a single lock over the whole record) so that a reader blocked
/// computing a hash for one purpose doesn't stall a concurrent `refresh`.
pub struct FileRecord {
    pub path: AbsFilePath,
    lwt_nanos: AsyncMutex<Option<i64>>,
    content_hash: AsyncMutex<Option<ContentHash>>,
    implicit_deps_hash: AsyncMutex<Option<ContentHash>>,
}

impl FileRecord {
    fn new(path: AbsFilePath) -> Self {
        Self {
            path,
            lwt_nanos: AsyncMutex::new(None),
            content_hash: AsyncMutex::new(None),
            implicit_deps_hash: AsyncMutex::new(None),
        }
    }

    /// The last-write-time observed at the most recent `refresh`, in
    /// nanoseconds since the Unix epoch, if the file has been stat'd yet.
    pub async fn lwt_nanos(&self) -> Option<i64> {
        *self.lwt_nanos.lock().await
    }
}

fn system_time_to_nanos(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i64,
        // A file with an mtime before the epoch is a degenerate case some
        // filesystems allow; treat it as "very old" rather than panicking.
        Err(_) => i64::MIN,
    }
}

/// The shared, concurrent store of [`FileRecord`]s for one build invocation.
///
/// Threaded explicitly through the executor's constructor rather than
/// exposed as a process-wide singleton (§9 Design Notes — "Globally
/// accessible file storage").
pub struct FileStore {
    records: DashMap<AbsFilePath, Arc<FileRecord>>,
    input_db: Option<Arc<InputDb>>,
}

impl FileStore {
    /// Build a store sized for `concurrency` concurrent workers. Shard count
    /// is rounded up to a power of two, kept at or above `concurrency * 16`
    /// so contention stays sublinear as the worker pool grows.
    pub fn new(concurrency: usize) -> Self {
        let shards = (concurrency.max(1) * 16).next_power_of_two();
        Self {
            records: DashMap::with_shard_amount(shards),
            input_db: None,
        }
    }

    /// Build a store backed by a persistent `(path, lwt) -> content_hash`
    /// cache, so a header thousands of commands declare as an input is only
    /// ever hashed once per `(path, mtime)` pair across runs, not just within
    /// one (§6 External interfaces).
    pub fn with_input_db(concurrency: usize, input_db: Arc<InputDb>) -> Self {
        let mut store = Self::new(concurrency);
        store.input_db = Some(input_db);
        store
    }

    /// Register `path`, returning the (possibly already-existing) record.
    /// Idempotent: concurrent callers registering paths that normalize
    /// (§4.2) to the same key observe the same `Arc<FileRecord>`, even if the
    /// two textual spellings differ (a symlink vs. its target, or different
    /// case on a case-insensitive filesystem).
    #[instrument(skip(self))]
    pub fn register(&self, path: AbsFilePath) -> Arc<FileRecord> {
        let key = path.normalized();
        Arc::clone(
            self.records
                .entry(key)
                .or_insert_with(|| Arc::new(FileRecord::new(path))),
        )
    }

    /// Look up an already-registered record without creating one.
    pub fn get(&self, path: &AbsFilePath) -> Option<Arc<FileRecord>> {
        self.records.get(&path.normalized()).map(|r| Arc::clone(r.value()))
    }

    /// Stat `record.path`; if its mtime differs from the last observed
    /// value, invalidate the cached content and implicit-deps hashes so the
    /// next call to [`FileStore::content_hash`] recomputes them.
    #[instrument(skip(self, record), fields(path = %record.path))]
    pub async fn refresh(&self, record: &FileRecord) -> Result<(), Error> {
        let metadata = fs::metadata(record.path.as_std_path())
            .await
            .map_err(|e| Error::InputUnreadable {
                path: record.path.as_std_path().to_path_buf(),
                source: std::io::Error::other(e.to_string()),
            })?;
        let Some(metadata) = metadata else {
            return Err(Error::InputMissing {
                path: record.path.as_std_path().to_path_buf(),
            });
        };
        let mtime = metadata
            .modified()
            .map_err(|e| Error::InputUnreadable {
                path: record.path.as_std_path().to_path_buf(),
                source: e,
            })?;
        let nanos = system_time_to_nanos(mtime);

        let mut stored = record.lwt_nanos.lock().await;
        if *stored != Some(nanos) {
            trace!(old = ?*stored, new = nanos, "lwt changed, invalidating hashes");
            *record.content_hash.lock().await = None;
            *record.implicit_deps_hash.lock().await = None;
            *stored = Some(nanos);
        }
        Ok(())
    }

    /// The strong content hash of `record`, computed on demand under the
    /// record's own lock so concurrent requests for the same file don't
    /// redundantly hash it.
    #[instrument(skip(self, record), fields(path = %record.path))]
    pub async fn content_hash(&self, record: &FileRecord) -> Result<ContentHash, Error> {
        let mut cached = record.content_hash.lock().await;
        if let Some(hash) = *cached {
            return Ok(hash);
        }

        let lwt = record.lwt_nanos().await;
        let path_key = record.path.as_std_path().to_string_lossy().into_owned();

        if let (Some(db), Some(lwt)) = (self.input_db.clone(), lwt) {
            let key = path_key.clone();
            let hit = tokio::task::spawn_blocking(move || db.lookup(&key, lwt))
                .await
                .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))??;
            if let Some(hash) = hit {
                *cached = Some(hash);
                return Ok(hash);
            }
        }

        let hash = fs::hash_file(&record.path).await.map_err(|report| {
            match report.downcast_ref::<std::io::Error>() {
                Some(io) if io.kind() == std::io::ErrorKind::NotFound => Error::InputMissing {
                    path: record.path.as_std_path().to_path_buf(),
                },
                _ => Error::InputUnreadable {
                    path: record.path.as_std_path().to_path_buf(),
                    source: std::io::Error::other(report.to_string()),
                },
            }
        })?;

        if let (Some(db), Some(lwt)) = (self.input_db.clone(), lwt) {
            let key = path_key;
            tokio::task::spawn_blocking(move || db.store(&key, lwt, hash))
                .await
                .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))??;
        }

        *cached = Some(hash);
        Ok(hash)
    }

    /// Fold the content hashes of `closure` (sorted by path first, so the
    /// result doesn't depend on discovery order) into one digest, memoized on
    /// `record` for the lifetime of this process.
    #[instrument(skip(self, record, closure), fields(path = %record.path, closure_len = closure.len()))]
    pub async fn implicit_deps_hash(
        &self,
        record: &FileRecord,
        closure: &[AbsFilePath],
    ) -> Result<ContentHash, Error> {
        {
            let cached = record.implicit_deps_hash.lock().await;
            if let Some(hash) = *cached {
                return Ok(hash);
            }
        }

        let hash = self.hash_closure(closure).await?;
        *record.implicit_deps_hash.lock().await = Some(hash);
        Ok(hash)
    }

    /// Hash `closure`'s content, sorted by path first so discovery order
    /// doesn't matter. The unmemoized core of [`FileStore::implicit_deps_hash`]
    /// — used by the rebuild decider to recheck a previously-discovered
    /// closure without an output [`FileRecord`] to cache the result on.
    #[instrument(skip(self, closure), fields(closure_len = closure.len()))]
    pub async fn hash_closure(&self, closure: &[AbsFilePath]) -> Result<ContentHash, Error> {
        let mut sorted: Vec<&AbsFilePath> = closure.iter().collect();
        sorted.sort_by(|a, b| a.as_std_path().cmp(b.as_std_path()));

        let mut fields = Vec::with_capacity(sorted.len());
        for dep_path in sorted {
            let dep_record = self.register(dep_path.clone());
            self.refresh(&dep_record).await?;
            let hash = self.content_hash(&dep_record).await?;
            fields.push(hash);
        }
        let byte_fields: Vec<[u8; 32]> = fields.iter().map(|h| *h.as_bytes()).collect();
        Ok(ContentHash::from_fields(byte_fields.iter().map(|b| b.as_slice())))
    }

    /// Persist the implicit-dependency closure discovered for a command's
    /// fingerprint, so the next build's decider can recheck it without
    /// re-running the command — the compiler only reveals this closure after
    /// it already ran, so it can't enter the fingerprint computed beforehand.
    /// A no-op if this store has no persistent backing.
    #[instrument(skip(self, closure, hash), fields(fingerprint = %format_args!("{fingerprint:016x}"), closure_len = closure.len()))]
    pub async fn record_implicit_deps(
        &self,
        fingerprint: u64,
        closure: &[AbsFilePath],
        hash: ContentHash,
    ) -> Result<(), Error> {
        let Some(db) = self.input_db.clone() else { return Ok(()) };
        let paths: Vec<String> = closure.iter().map(|p| p.as_std_path().to_string_lossy().into_owned()).collect();
        tokio::task::spawn_blocking(move || db.store_implicit_deps(fingerprint, &paths, hash))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))??;
        Ok(())
    }

    /// Look up the implicit-dependency closure recorded for `fingerprint` on
    /// a previous run, and the hash it produced. `None` if this store has no
    /// persistent backing, or nothing was recorded yet for this fingerprint.
    #[instrument(skip(self), fields(fingerprint = %format_args!("{fingerprint:016x}")))]
    pub async fn lookup_implicit_deps(
        &self,
        fingerprint: u64,
    ) -> Result<Option<(Vec<AbsFilePath>, ContentHash)>, Error> {
        let Some(db) = self.input_db.clone() else { return Ok(None) };
        let hit = tokio::task::spawn_blocking(move || db.lookup_implicit_deps(fingerprint))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))??;
        let Some((paths, hash)) = hit else { return Ok(None) };
        let resolved = paths
            .into_iter()
            .filter_map(|p| AbsFilePath::try_from(std::path::PathBuf::from(p)).ok())
            .collect();
        Ok(Some((resolved, hash)))
    }

    /// Iterate every currently-registered record. Used by the journal writer
    /// to flush updates and by the executor's shutdown path.
    pub fn iter(&self) -> impl Iterator<Item = Arc<FileRecord>> + '_ {
        self.records.iter().map(|r| Arc::clone(r.value()))
    }

    /// Number of records currently registered.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Log-and-report a refresh failure the way the executor expects: missing
/// or unreadable inputs are never silently ignored, they become a typed
/// error the caller attaches to the dependent command's failure.
pub fn warn_on_stale(path: &AbsFilePath, err: &Error) {
    warn!(%path, error = %err, "file store refresh failed");
}
