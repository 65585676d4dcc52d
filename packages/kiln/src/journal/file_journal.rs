//! The file journal: `<workspace>/.cache/files.journal`.
//!
//! One record per `FileRecord` update: `{ path_hash: u64, lwt_nanos: i64 }`.
//! `path_hash` is [`crate::hash::hash_u64`] of the normalized path — the full
//! path is not stored here, it's reconstructed via the input database
//! (§6 External interfaces).

use super::JournalRecord;
use crate::{hash::hash_u64, path::AbsFilePath};

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct FileJournalRecord {
    pub path_hash: u64,
    pub lwt_nanos: i64,
}

impl FileJournalRecord {
    pub fn for_path(path: &AbsFilePath, lwt_nanos: i64) -> Self {
        Self {
            path_hash: hash_u64(path.normalized().as_std_path()),
            lwt_nanos,
        }
    }
}

impl JournalRecord for FileJournalRecord {
    fn key(&self) -> u64 {
        self.path_hash
    }

    fn value_nanos(&self) -> i64 {
        self.lwt_nanos
    }

    fn from_parts(key: u64, value_nanos: i64) -> Self {
        Self {
            path_hash: key,
            lwt_nanos: value_nanos,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_hash_is_stable() {
        let path = AbsFilePath::try_from(std::env::temp_dir().join("a.c")).unwrap();
        let a = FileJournalRecord::for_path(&path, 1);
        let b = FileJournalRecord::for_path(&path, 2);
        assert_eq!(a.path_hash, b.path_hash);
    }
}
