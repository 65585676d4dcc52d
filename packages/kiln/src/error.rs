//! The closed error taxonomy the executor and CLI report against.
//!
//! Most of `kiln` propagates `color_eyre::Result` with `.context()`, the same
//! as everywhere else in this codebase. [`Error`] exists alongside that for
//! the handful of places a caller needs to match on *kind* rather than read a
//! chain of context strings: picking a process exit code, or deciding whether
//! a failure should block downstream commands.

use std::path::PathBuf;

use derive_more::Display;

/// The kind of failure produced while assembling or running a build.
///
/// Every failure the executor reports wears one of these kinds; the CLI maps
/// the kind directly to an exit code (see [`Error::exit_code`]).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The command graph contains a cycle, or a command/manifest/config is
    /// otherwise ill-formed. Fatal: the build never starts.
    #[error("configuration error: {0}")]
    Config(String),

    /// A journal or the input database failed to read or write.
    ///
    /// Journal IO errors demote the run to "no persistence for this
    /// session" rather than aborting it; see [`Error::is_fatal`].
    #[error("io error: {0}")]
    Io(#[source] std::io::Error),

    /// A declared input could not be stat'd.
    #[error("input missing: {path}")]
    InputMissing { path: PathBuf },

    /// A declared input could not be opened for reading.
    #[error("input unreadable: {path}")]
    InputUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The child process exited with a non-zero status.
    #[error("process failed with {status}")]
    ProcessFailed {
        status: ExitStatusSummary,
        stdout_tail: String,
        stderr_tail: String,
    },

    /// The command's wall-clock timeout elapsed before the child exited.
    #[error("timed out after {elapsed_secs}s")]
    TimedOut { elapsed_secs: u64 },

    /// The build was stopped while the command was queued or running.
    #[error("cancelled")]
    Cancelled,
}

/// A process exit status, summarized for display without pulling
/// `std::process::ExitStatus` (not `Clone`/`Send` in a convenient way)
/// through the error type.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Display)]
pub enum ExitStatusSummary {
    #[display("exit code {_0}")]
    Code(i32),
    #[display("signal")]
    Signal,
}

impl Error {
    /// The process exit code a CLI driving the core to completion should use
    /// when this is the (or the most severe) failure kind encountered.
    ///
    /// Exit code `0` is reserved for "all commands succeeded" and is never
    /// returned here.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => 2,
            Error::Io(_) => 3,
            Error::InputMissing { .. } | Error::InputUnreadable { .. } => 4,
            Error::ProcessFailed { .. } => 5,
            Error::TimedOut { .. } => 6,
            Error::Cancelled => 7,
        }
    }

    /// Whether this error kind is fatal to the whole build, as opposed to
    /// contained to the failing command's transitive consumers.
    ///
    /// Only [`Error::Config`] is fatal per the propagation rules: it is
    /// raised out of graph sealing or config/manifest loading, before any
    /// command runs. Everything else — including IO errors, which merely
    /// disable persistence for the session — is per-command.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_kind() {
        let errors = [
            Error::Config("cycle".into()),
            Error::Io(std::io::Error::other("disk full")),
            Error::InputMissing {
                path: "a.h".into(),
            },
            Error::InputUnreadable {
                path: "a.h".into(),
                source: std::io::Error::other("denied"),
            },
            Error::ProcessFailed {
                status: ExitStatusSummary::Code(1),
                stdout_tail: String::new(),
                stderr_tail: String::new(),
            },
            Error::TimedOut { elapsed_secs: 5 },
            Error::Cancelled,
        ];
        let mut codes: Vec<i32> = errors.iter().map(Error::exit_code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
        assert!(codes.iter().all(|&c| c != 0));
    }

    #[test]
    fn only_config_errors_are_fatal() {
        assert!(Error::Config("x".into()).is_fatal());
        assert!(!Error::Cancelled.is_fatal());
        assert!(!Error::TimedOut { elapsed_secs: 1 }.is_fatal());
    }
}
