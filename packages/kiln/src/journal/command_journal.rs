//! The command journal: `<workspace>/.cache/commands.journal`.
//!
//! One record per successful command: `{ fingerprint: u64, max_input_lwt:
//! i64 }`. `fingerprint` is the low 64 bits of the command's full 256-bit
//! [`crate::command::Fingerprint`] — enough entropy for a journal key, with
//! the full digest available from the command descriptor itself if a
//! collision ever needs to be told apart.

use super::JournalRecord;
use crate::command::Fingerprint;

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct CommandJournalRecord {
    pub fingerprint: u64,
    pub max_input_lwt_nanos: i64,
}

impl CommandJournalRecord {
    pub fn new(fingerprint: &Fingerprint, max_input_lwt_nanos: i64) -> Self {
        Self {
            fingerprint: fingerprint.hash.low_u64(),
            max_input_lwt_nanos,
        }
    }
}

impl JournalRecord for CommandJournalRecord {
    fn key(&self) -> u64 {
        self.fingerprint
    }

    fn value_nanos(&self) -> i64 {
        self.max_input_lwt_nanos
    }

    fn from_parts(key: u64, value_nanos: i64) -> Self {
        Self {
            fingerprint: key,
            max_input_lwt_nanos: value_nanos,
        }
    }
}
