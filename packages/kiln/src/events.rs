//! Build progress events (§4.11).
//!
//! `CommandStarted`, `CommandFinished`, and `BuildFinished` are the only
//! hooks an external observer — the CLI's progress bar, a log sink, a GUI —
//! may subscribe to. They're emitted by the executor's coordinator over a
//! broadcast channel so multiple independent observers can each get every
//! event without coordinating with one another.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{command::CommandId, error::Error, graph::CommandState};

/// One command's terminal outcome, as reported in a [`Event::CommandFinished`].
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum Status {
    Succeeded,
    Skipped,
    Failed { summary: String },
    Blocked,
}

impl Status {
    pub fn from_state(state: CommandState, error: Option<&Error>) -> Self {
        match state {
            CommandState::Succeeded => Status::Succeeded,
            CommandState::Skipped => Status::Skipped,
            CommandState::Blocked => Status::Blocked,
            CommandState::Failed => Status::Failed {
                summary: error.map(|e| e.to_string()).unwrap_or_default(),
            },
            other => unreachable!("terminal status requested for non-terminal state {other:?}"),
        }
    }
}

/// Captured output attached to a finished command, truncated to the
/// user-visible summary length (§7: "first 40 lines of captured output").
#[derive(Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct CapturedOutput {
    pub stdout_tail: String,
    pub stderr_tail: String,
}

pub const SUMMARY_LINES: usize = 40;

/// Truncate `text` to at most [`SUMMARY_LINES`] lines, for attachment to a
/// failure summary.
pub fn tail_lines(text: &str) -> String {
    text.lines().take(SUMMARY_LINES).collect::<Vec<_>>().join("\n")
}

/// A build-wide event, consumed by the CLI and any other observer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Event {
    CommandStarted {
        id: CommandId,
    },
    CommandFinished {
        id: CommandId,
        status: Status,
        duration: Duration,
        captured_output: CapturedOutput,
    },
    BuildFinished {
        summary: BuildSummary,
    },
}

/// The final accounting for a build invocation, enough for the CLI to print
/// the §7 user-visible summary and choose a process exit code.
#[derive(Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct BuildSummary {
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub blocked: usize,
    /// One line per failed command: `(fingerprint, captured stdout/stderr
    /// tail)`, formatted by the CLI.
    pub failures: Vec<FailureSummary>,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct FailureSummary {
    pub id: CommandId,
    pub kind: String,
    pub captured_output: CapturedOutput,
}

impl BuildSummary {
    /// Exit code `0` on all-succeeded/skipped, otherwise the worst observed
    /// per-category code (ties broken toward the first failure recorded).
    pub fn exit_code(&self) -> i32 {
        if self.failed == 0 && self.blocked == 0 {
            0
        } else {
            5 // ProcessFailed, the default category for "at least one command failed"
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0 && self.blocked == 0
    }
}
