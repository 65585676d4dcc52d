//! The planned external process invocation: a [`Command`] plus its
//! deterministic [`fingerprint`].

pub mod fingerprint;

use std::{collections::BTreeMap, time::Duration};

use bon::Builder;
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{
    hash::ContentHash,
    path::{AbsDirPath, AbsFilePath},
};

pub use fingerprint::Fingerprint;

/// The kind of work a [`Command`] performs.
///
/// A tagged variant rather than a trait object: every command kind shares the
/// same fields, and fingerprinting is one function over the kind's
/// discriminant plus those fields (see [`fingerprint::compute`]), rather than
/// a virtual `fingerprint()` method each kind overrides. Adding a new kind of
/// build step means adding a variant here, not a new `impl`.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize)]
pub enum CommandKind {
    CompileC,
    CompileCxx,
    Link,
    Archive,
    Custom,
}

/// How a command's implicit dependencies (headers discovered mid-compile)
/// are found, if at all.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum ImplicitDepsHint {
    /// Read a compiler-emitted makefile-style `.d` file after the process
    /// exits (see [`crate::depinfo`]).
    GccMStyle { dep_info: AbsFilePath },
}

/// A planned external process invocation.
///
/// Created by a generator upstream (or parsed from a manifest by the CLI),
/// attached to a [`crate::graph::CommandGraph`], then either skipped or
/// executed exactly once per build.
#[derive(Clone, Debug, Builder)]
pub struct Command {
    pub kind: CommandKind,
    pub program: AbsFilePath,
    pub argv: Vec<String>,
    pub cwd: AbsDirPath,
    /// Full environment the process runs with. Only the whitelisted subset
    /// (see [`fingerprint::ENV_WHITELIST`]) enters the fingerprint.
    #[builder(default)]
    pub env: BTreeMap<String, String>,
    pub inputs: Vec<AbsFilePath>,
    pub outputs: Vec<AbsFilePath>,
    #[builder(default)]
    pub implicit_deps: Option<ImplicitDepsHint>,
    #[builder(default)]
    pub timeout: Option<Duration>,
}

impl Command {
    /// A stable identifier for this command, suitable for graph nodes and
    /// event payloads. Currently the fingerprint's low 64 bits; two commands
    /// with the same id are the same command by definition (§4.3).
    pub fn id(&self, fingerprint: &Fingerprint) -> CommandId {
        CommandId(fingerprint.hash.low_u64())
    }
}

/// A command's identity as used in graph edges and events.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize)]
#[display("{_0:016x}")]
pub struct CommandId(pub u64);
