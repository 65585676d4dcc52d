//! The input database: `<workspace>/.cache/inputs.db`.
//!
//! A persistent `(path, lwt) -> content_hash` mapping backed by a small
//! embedded SQL store, so hashing a header that thousands of compile
//! commands read only happens once per (path, mtime) pair rather than once
//! per command that declares it as an input.

use rusqlite::{Connection, OptionalExtension, params};
use tracing::instrument;

use crate::{error::Error, hash::ContentHash};

/// One row: a file's path, the last-write-time it was hashed at, and the
/// resulting content hash.
pub struct InputDb {
    conn: Connection,
}

impl InputDb {
    /// Open (creating if necessary) the database at `path`.
    #[instrument]
    pub fn open(path: &std::path::Path) -> Result<Self, Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(Error::Io)?;
        }
        let conn = Connection::open(path).map_err(rusqlite_err)?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    /// An in-memory database, for tests.
    #[cfg(test)]
    pub fn in_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory().map_err(rusqlite_err)?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<(), Error> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS File (
                    path TEXT PRIMARY KEY,
                    hash BLOB NOT NULL,
                    lastWriteTime BLOB NOT NULL
                );
                CREATE TABLE IF NOT EXISTS ImplicitDeps (
                    fingerprint INTEGER PRIMARY KEY,
                    paths TEXT NOT NULL,
                    hash BLOB NOT NULL
                );",
            )
            .map_err(rusqlite_err)
    }

    /// Look up the cached hash for `path`, but only if it was cached against
    /// exactly `lwt_nanos` — a stale entry (different mtime) is treated as a
    /// miss, the same rule the rebuild decider's slow path depends on.
    #[instrument(skip(self))]
    pub fn lookup(&self, path: &str, lwt_nanos: i64) -> Result<Option<ContentHash>, Error> {
        let row: Option<(Vec<u8>, i64)> = self
            .conn
            .query_row(
                "SELECT hash, lastWriteTime FROM File WHERE path = ?1",
                params![path],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(rusqlite_err)?;

        match row {
            Some((hash_bytes, stored_lwt)) if stored_lwt == lwt_nanos => {
                let bytes: [u8; 32] = hash_bytes
                    .try_into()
                    .map_err(|_| Error::Config("corrupt input database row".into()))?;
                Ok(Some(ContentHash::from_digest(bytes)))
            }
            _ => Ok(None),
        }
    }

    /// Insert or update the cached hash for `path` at `lwt_nanos`.
    #[instrument(skip(self, hash))]
    pub fn store(&self, path: &str, lwt_nanos: i64, hash: ContentHash) -> Result<(), Error> {
        self.conn
            .execute(
                "INSERT INTO File (path, hash, lastWriteTime) VALUES (?1, ?2, ?3)
                 ON CONFLICT(path) DO UPDATE SET hash = excluded.hash, lastWriteTime = excluded.lastWriteTime",
                params![path, hash.as_bytes().as_slice(), lwt_nanos],
            )
            .map_err(rusqlite_err)?;
        Ok(())
    }

    /// Look up the implicit-dependency closure discovered for `fingerprint`
    /// on a previous run (newline-joined paths) and the hash that closure
    /// produced, so the decider can recheck it without re-running the
    /// command.
    #[instrument(skip(self))]
    pub fn lookup_implicit_deps(&self, fingerprint: u64) -> Result<Option<(Vec<String>, ContentHash)>, Error> {
        let row: Option<(String, Vec<u8>)> = self
            .conn
            .query_row(
                "SELECT paths, hash FROM ImplicitDeps WHERE fingerprint = ?1",
                params![fingerprint as i64],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(rusqlite_err)?;

        match row {
            Some((paths, hash_bytes)) => {
                let bytes: [u8; 32] = hash_bytes
                    .try_into()
                    .map_err(|_| Error::Config("corrupt input database row".into()))?;
                let paths = paths.lines().map(String::from).collect();
                Ok(Some((paths, ContentHash::from_digest(bytes))))
            }
            None => Ok(None),
        }
    }

    /// Record the implicit-dependency closure discovered for `fingerprint`,
    /// overwriting whatever was recorded for it before.
    #[instrument(skip(self, paths, hash))]
    pub fn store_implicit_deps(&self, fingerprint: u64, paths: &[String], hash: ContentHash) -> Result<(), Error> {
        let joined = paths.join("\n");
        self.conn
            .execute(
                "INSERT INTO ImplicitDeps (fingerprint, paths, hash) VALUES (?1, ?2, ?3)
                 ON CONFLICT(fingerprint) DO UPDATE SET paths = excluded.paths, hash = excluded.hash",
                params![fingerprint as i64, joined, hash.as_bytes().as_slice()],
            )
            .map_err(rusqlite_err)?;
        Ok(())
    }

    /// Drop every row whose path is not in `keep`. Called during journal
    /// compaction to evict entries older than the retention horizon (§4.7).
    #[instrument(skip(self, keep))]
    pub fn evict_except<'a>(&self, keep: impl IntoIterator<Item = &'a str>) -> Result<usize, Error> {
        let keep: std::collections::HashSet<&str> = keep.into_iter().collect();
        let mut stmt = self
            .conn
            .prepare("SELECT path FROM File")
            .map_err(rusqlite_err)?;
        let all_paths: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .map_err(rusqlite_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(rusqlite_err)?;
        drop(stmt);

        let mut evicted = 0;
        for path in all_paths {
            if !keep.contains(path.as_str()) {
                self.conn
                    .execute("DELETE FROM File WHERE path = ?1", params![path])
                    .map_err(rusqlite_err)?;
                evicted += 1;
            }
        }
        Ok(evicted)
    }

    /// Number of rows currently stored.
    pub fn count(&self) -> Result<usize, Error> {
        self.conn
            .query_row("SELECT COUNT(*) FROM File", [], |row| row.get::<_, i64>(0))
            .map(|n| n as usize)
            .map_err(rusqlite_err)
    }
}

fn rusqlite_err(err: rusqlite::Error) -> Error {
    Error::Io(std::io::Error::other(err.to_string()))
}
