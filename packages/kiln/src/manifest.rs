//! Declarative build manifests: a TOML file listing commands and the edges
//! between them, consumed by the CLI front-end (§4.12).
//!
//! A manifest names commands by a short human-readable string rather than a
//! fingerprint — fingerprints aren't known until inputs are hashed, which
//! hasn't happened yet at parse time. The CLI resolves manifest names to
//! [`CommandId`]s once it has computed each command's fingerprint.

use std::{collections::BTreeMap, path::Path, time::Duration};

use serde::Deserialize;
use tracing::instrument;

use crate::{
    command::{Command, CommandKind, ImplicitDepsHint},
    error::Error,
    graph::EdgeKind,
    path::{AbsDirPath, AbsFilePath, TryJoinWith},
};

/// The raw TOML shape of a manifest file.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(rename = "command", default)]
    pub commands: Vec<ManifestCommand>,
    #[serde(rename = "edge", default)]
    pub edges: Vec<ManifestEdge>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestCommand {
    pub name: String,
    pub kind: CommandKind,
    pub program: String,
    #[serde(default)]
    pub argv: Vec<String>,
    /// Working directory, relative to the workspace root if not absolute.
    /// Defaults to the workspace root itself.
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    /// A gcc/clang/rustc `-M`-style dep-info file this command emits.
    pub dep_info: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestEdge {
    pub producer: String,
    pub consumer: String,
    #[serde(default)]
    pub kind: ManifestEdgeKind,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestEdgeKind {
    #[default]
    File,
    OrderOnly,
}

impl From<ManifestEdgeKind> for EdgeKind {
    fn from(kind: ManifestEdgeKind) -> Self {
        match kind {
            ManifestEdgeKind::File => EdgeKind::File,
            ManifestEdgeKind::OrderOnly => EdgeKind::OrderOnly,
        }
    }
}

/// One manifest command resolved to a runnable [`Command`], still keyed by
/// its manifest name so the caller can assign a [`crate::command::CommandId`]
/// once the fingerprint is known and translate [`ManifestEdge`]s by name.
pub struct ResolvedCommand {
    pub name: String,
    pub command: Command,
}

impl Manifest {
    /// Parse a manifest from TOML text. A malformed manifest is a fatal
    /// [`Error::Config`] (§7) — the build never starts.
    pub fn parse(toml_text: &str) -> Result<Self, Error> {
        toml::from_str(toml_text).map_err(|e| Error::Config(format!("parse manifest: {e}")))
    }

    /// Resolve every command's paths against `workspace_root`, and check that
    /// every edge references a declared command name.
    #[instrument(skip(self, workspace_root))]
    pub fn resolve(&self, workspace_root: &AbsDirPath) -> Result<Vec<ResolvedCommand>, Error> {
        let mut names = std::collections::HashSet::new();
        let mut resolved = Vec::with_capacity(self.commands.len());

        for def in &self.commands {
            if !names.insert(def.name.clone()) {
                return Err(Error::Config(format!("duplicate command name {:?}", def.name)));
            }
            resolved.push(ResolvedCommand {
                name: def.name.clone(),
                command: resolve_command(def, workspace_root)?,
            });
        }

        for edge in &self.edges {
            if !names.contains(&edge.producer) {
                return Err(Error::Config(format!("edge references unknown producer {:?}", edge.producer)));
            }
            if !names.contains(&edge.consumer) {
                return Err(Error::Config(format!("edge references unknown consumer {:?}", edge.consumer)));
            }
        }

        Ok(resolved)
    }
}

fn resolve_path_file(root: &AbsDirPath, raw: &str) -> Result<AbsFilePath, Error> {
    if Path::new(raw).is_absolute() {
        AbsFilePath::try_from(std::path::PathBuf::from(raw)).map_err(|e| Error::Config(e.to_string()))
    } else {
        root.try_join_file(raw).map_err(|e| Error::Config(e.to_string()))
    }
}

fn resolve_path_dir(root: &AbsDirPath, raw: &str) -> Result<AbsDirPath, Error> {
    if Path::new(raw).is_absolute() {
        AbsDirPath::try_from(std::path::PathBuf::from(raw)).map_err(|e| Error::Config(e.to_string()))
    } else {
        root.try_join_dir(raw).map_err(|e| Error::Config(e.to_string()))
    }
}

fn resolve_command(def: &ManifestCommand, workspace_root: &AbsDirPath) -> Result<Command, Error> {
    let program = resolve_path_file(workspace_root, &def.program)?;
    let cwd = match &def.cwd {
        Some(raw) => resolve_path_dir(workspace_root, raw)?,
        None => workspace_root.clone(),
    };
    let inputs = def
        .inputs
        .iter()
        .map(|raw| resolve_path_file(workspace_root, raw))
        .collect::<Result<Vec<_>, _>>()?;
    let outputs = def
        .outputs
        .iter()
        .map(|raw| resolve_path_file(workspace_root, raw))
        .collect::<Result<Vec<_>, _>>()?;
    let implicit_deps = def
        .dep_info
        .as_deref()
        .map(|raw| resolve_path_file(workspace_root, raw))
        .transpose()?
        .map(|dep_info| ImplicitDepsHint::GccMStyle { dep_info });

    Ok(Command::builder()
        .kind(def.kind)
        .program(program)
        .argv(def.argv.clone())
        .cwd(cwd)
        .env(def.env.clone())
        .inputs(inputs)
        .outputs(outputs)
        .maybe_implicit_deps(implicit_deps)
        .maybe_timeout(def.timeout_secs.map(Duration::from_secs))
        .build())
}
