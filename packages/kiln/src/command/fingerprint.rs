//! Deterministic command fingerprinting.
//!
//! A command's fingerprint is `H(program ‖ argv ‖ env_subset ‖ cwd ‖
//! input_paths ‖ input_hashes)`, folded over a 256-bit content hash so it is
//! stable across machines and runs: every path is normalized to
//! workspace-relative form first, and no timestamp ever enters the hash (the
//! mtime-based pre-check lives entirely in the rebuild decider, §4.8).

use std::collections::BTreeMap;

use color_eyre::{Result, eyre::Context};
use derive_more::Display;
use serde::{Deserialize, Serialize};

use super::{Command, CommandKind};
use crate::{
    hash::ContentHash,
    path::{AbsDirPath, RelativeTo},
};

/// Environment variables that are allowed to affect a command's fingerprint.
///
/// Anything not in this list is invisible to caching: a developer's shell
/// prompt, terminal color settings, or unrelated `FOO=bar` exports must never
/// force a rebuild. This list covers the variables that commonly steer a
/// C/C++ toolchain's behavior.
pub const ENV_WHITELIST: &[&str] = &[
    "INCLUDE",
    "LIB",
    "LIBPATH",
    "PATH",
    "CC",
    "CXX",
    "CFLAGS",
    "CXXFLAGS",
    "LDFLAGS",
    "SDKROOT",
    "MACOSX_DEPLOYMENT_TARGET",
];

/// A command's content-addressable fingerprint.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, Display, Serialize, Deserialize)]
#[display("{hash}")]
pub struct Fingerprint {
    pub hash: ContentHash,
}

/// Compute `command`'s fingerprint.
///
/// `workspace_root` is used to normalize every path (program, cwd, inputs)
/// to a workspace-relative form before it enters the hash, which is what
/// makes the fingerprint portable across machines with the workspace checked
/// out at different absolute locations.
///
/// `input_hashes` must be the content hash of each of `command.inputs`, in
/// the same order; the caller (the rebuild decider or the executor, which
/// both already hold the file store) computes these since hashing here would
/// require async IO this function deliberately avoids.
///
/// `env_whitelist` is the set of environment variable names allowed to enter
/// the fingerprint (§4.3); callers normally pass `Config::env_whitelist`,
/// which defaults to [`ENV_WHITELIST`] but can be overridden by `kiln.toml`.
#[tracing::instrument(skip(command, input_hashes, env_whitelist))]
pub fn compute(
    command: &Command,
    workspace_root: &AbsDirPath,
    input_hashes: &[ContentHash],
    env_whitelist: &[String],
) -> Result<Fingerprint> {
    assert_eq!(
        command.inputs.len(),
        input_hashes.len(),
        "one content hash per declared input"
    );

    let program_rel = command
        .program
        .relative_to(workspace_root)
        .context("normalize program path")?;
    let cwd_rel = command
        .cwd
        .relative_to(workspace_root)
        .context("normalize cwd")?;

    // Inputs are sorted by their normalized path so that the fingerprint
    // does not depend on the order the caller happened to declare them in.
    let mut inputs_rel = Vec::with_capacity(command.inputs.len());
    for (input, hash) in command.inputs.iter().zip(input_hashes) {
        let rel = input
            .relative_to(workspace_root)
            .with_context(|| format!("normalize input path {input:?}"))?;
        inputs_rel.push((rel.to_string(), *hash));
    }
    inputs_rel.sort_by(|(a, _), (b, _)| a.cmp(b));

    let env_subset: BTreeMap<&str, &str> = command
        .env
        .iter()
        .filter(|(k, _)| env_whitelist.iter().any(|allowed| allowed == k.as_str()))
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();

    let mut fields: Vec<Vec<u8>> = Vec::new();
    fields.push(vec![command.kind as u8]);
    fields.push(program_rel.to_string().into_bytes());
    for arg in &command.argv {
        fields.push(arg.clone().into_bytes());
    }
    for (k, v) in &env_subset {
        fields.push(k.as_bytes().to_vec());
        fields.push(v.as_bytes().to_vec());
    }
    fields.push(cwd_rel.to_string().into_bytes());
    for (path, hash) in &inputs_rel {
        fields.push(path.clone().into_bytes());
        fields.push(hash.as_bytes().to_vec());
    }

    let hash = ContentHash::from_fields(fields.iter().map(Vec::as_slice));
    Ok(Fingerprint { hash })
}
