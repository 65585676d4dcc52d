//! The rebuild decider: given a command and the stores, decides whether it
//! must run again or can be skipped (§4.8).
//!
//! The algorithm below follows the fingerprint lookup with an mtime fast path
//! and a content-hash slow path. The slow path also fires when an input's
//! `lwt` lands exactly on the recorded bound — a clock rollback or a
//! filesystem that sets mtimes backwards must never be read as "nothing
//! changed" just because the fast path's `>` comparison didn't trip. A
//! separate check against any implicit (compiler-discovered) dependency
//! closure recorded on a previous run follows, since those never enter the
//! declared `inputs` the steps above walk.

use std::collections::HashMap;

use tracing::{instrument, trace};

use crate::{
    command::{Command, Fingerprint},
    error::Error,
    path::AbsDirPath,
    store::FileStore,
};

/// The decider's verdict for one command.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum Decision {
    Skip,
    MustRun,
}

/// What the decider needs to know about a command's last successful run,
/// loaded from the command journal (§4.5/§6).
#[derive(Clone, Copy, Debug)]
pub struct CommandRecord {
    pub max_input_lwt_nanos: i64,
}

/// Decide whether `command`, whose fingerprint is `fingerprint`, needs to run
/// again.
///
/// `records` is the in-memory view of the command journal (fingerprint's low
/// 64 bits -> last-recorded bound); `store` provides per-input mtime and
/// content hash, refreshed by the caller before this is invoked.
/// `workspace_root` is used to recompute the fingerprint on the slow path,
/// the same way [`crate::command::fingerprint::compute`] was originally
/// called.
#[instrument(skip(command, fingerprint, records, store, env_whitelist))]
pub async fn decide(
    command: &Command,
    fingerprint: &Fingerprint,
    workspace_root: &AbsDirPath,
    records: &HashMap<u64, CommandRecord>,
    store: &FileStore,
    env_whitelist: &[String],
) -> Result<Decision, Error> {
    // Step 1: no record at all means this exact fingerprint has never
    // succeeded before.
    let Some(record) = records.get(&fingerprint.hash.low_u64()) else {
        trace!("no command record, must run");
        return Ok(Decision::MustRun);
    };

    // Step 2: fast path. Any input newer than the recorded bound forces a
    // slow-path content comparison; an input landing exactly on the bound
    // also falls through rather than being trusted (the tie-break).
    let mut suspects = Vec::new();
    for input in &command.inputs {
        let Some(file_record) = store.get(input) else {
            // Not yet registered with the store by the caller: treat as
            // suspect so the slow path stats/hashes it directly.
            suspects.push(input.clone());
            continue;
        };
        match file_record.lwt_nanos().await {
            Some(lwt) if lwt > record.max_input_lwt_nanos => suspects.push(input.clone()),
            Some(lwt) if lwt == record.max_input_lwt_nanos => suspects.push(input.clone()),
            Some(_) => {}
            None => suspects.push(input.clone()),
        }
    }

    if suspects.is_empty() {
        trace!("fast path: no input lwt exceeds or meets the recorded bound");
    } else {
        // Step 3: slow path. Hash every suspect input; any mismatch against
        // the fingerprint's recorded view means something changed.
        //
        // The fingerprint was computed from the content hashes at the time
        // of the last successful run, folded into `fingerprint.hash` itself
        // (§4.3) — so recomputing the fingerprint from current content and
        // comparing against the stored one *is* the content-hash check.
        let mut current_hashes = Vec::with_capacity(command.inputs.len());
        for input in &command.inputs {
            let file_record = store.register(input.clone());
            store.refresh(&file_record).await?;
            let hash = store.content_hash(&file_record).await?;
            current_hashes.push(hash);
        }
        let current_fingerprint = crate::command::fingerprint::compute(
            command,
            workspace_root,
            &current_hashes,
            env_whitelist,
        )
        .map_err(|e| Error::Config(e.to_string()))?;

        if current_fingerprint.hash != fingerprint.hash {
            trace!("slow path: content hash changed, must run");
            return Ok(Decision::MustRun);
        }
    }

    // Step 3b: a previous run may have discovered implicit dependencies
    // (headers, say) that this command's own `inputs` never declare. The
    // compiler only reveals that closure after the command already ran, so
    // it can't enter the fingerprint computed before running — it's tracked
    // separately, keyed by this same fingerprint, and rechecked here even
    // when the declared inputs above came back clean.
    if let Some((closure, recorded_hash)) = store.lookup_implicit_deps(fingerprint.hash.low_u64()).await? {
        let current_hash = store.hash_closure(&closure).await?;
        if current_hash != recorded_hash {
            trace!("implicit dependency changed, must run");
            return Ok(Decision::MustRun);
        }
    }

    // Step 4: verify every declared output still exists and is not older
    // than the newest input.
    let mut newest_input_lwt = i64::MIN;
    for input in &command.inputs {
        if let Some(file_record) = store.get(input)
            && let Some(lwt) = file_record.lwt_nanos().await
        {
            newest_input_lwt = newest_input_lwt.max(lwt);
        }
    }

    for output in &command.outputs {
        let metadata = crate::fs::metadata(output.as_std_path())
            .await
            .map_err(|e| Error::InputUnreadable {
                path: output.as_std_path().to_path_buf(),
                source: std::io::Error::other(e.to_string()),
            })?;
        let Some(metadata) = metadata else {
            trace!(output = %output, "declared output missing, must run");
            return Ok(Decision::MustRun);
        };
        let modified = metadata.modified().map_err(|e| Error::InputUnreadable {
            path: output.as_std_path().to_path_buf(),
            source: e,
        })?;
        let output_lwt = modified
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(i64::MIN);
        if output_lwt < newest_input_lwt {
            trace!(output = %output, "output older than newest input, must run");
            return Ok(Decision::MustRun);
        }
    }

    // Step 5.
    Ok(Decision::Skip)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::tempdir;

    use super::*;
    use crate::{
        command::{Command, CommandKind},
        path::{AbsDirPath, AbsFilePath},
    };

    fn env_whitelist() -> Vec<String> {
        crate::command::fingerprint::ENV_WHITELIST.iter().map(|s| s.to_string()).collect()
    }

    fn command(ws: &AbsDirPath, inputs: Vec<AbsFilePath>, outputs: Vec<AbsFilePath>) -> Command {
        Command::builder()
            .kind(CommandKind::CompileC)
            .program(AbsFilePath::try_from(ws.as_std_path().join("bin/cc")).unwrap())
            .argv(vec!["-c".into()])
            .cwd(ws.clone())
            .inputs(inputs)
            .outputs(outputs)
            .build()
    }

    #[tokio::test]
    async fn no_record_means_must_run() {
        let dir = tempdir().unwrap();
        let ws = AbsDirPath::try_from(dir.path().to_path_buf()).unwrap();
        let store = FileStore::new(2);
        let src = AbsFilePath::try_from(dir.path().join("a.c")).unwrap();
        tokio::fs::write(src.as_std_path(), b"int main(){}").await.unwrap();
        let cmd = command(&ws, vec![src.clone()], vec![]);

        let file_record = store.register(src.clone());
        store.refresh(&file_record).await.unwrap();
        let hash = store.content_hash(&file_record).await.unwrap();
        let fp = crate::command::fingerprint::compute(&cmd, &ws, &[hash], &env_whitelist()).unwrap();

        let decision = decide(&cmd, &fp, &ws, &HashMap::new(), &store, &env_whitelist()).await.unwrap();
        assert_eq!(decision, Decision::MustRun);
    }

    #[tokio::test]
    async fn unchanged_input_and_fresh_output_skips() {
        let dir = tempdir().unwrap();
        let ws = AbsDirPath::try_from(dir.path().to_path_buf()).unwrap();
        let store = FileStore::new(2);
        let src = AbsFilePath::try_from(dir.path().join("a.c")).unwrap();
        let out = AbsFilePath::try_from(dir.path().join("a.o")).unwrap();
        tokio::fs::write(src.as_std_path(), b"int main(){}").await.unwrap();

        let cmd = command(&ws, vec![src.clone()], vec![out.clone()]);
        let file_record = store.register(src.clone());
        store.refresh(&file_record).await.unwrap();
        let hash = store.content_hash(&file_record).await.unwrap();
        let fp = crate::command::fingerprint::compute(&cmd, &ws, &[hash], &env_whitelist()).unwrap();

        let input_lwt = file_record.lwt_nanos().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        tokio::fs::write(out.as_std_path(), b"object").await.unwrap();

        let mut records = HashMap::new();
        records.insert(fp.hash.low_u64(), CommandRecord { max_input_lwt_nanos: input_lwt });

        let decision = decide(&cmd, &fp, &ws, &records, &store, &env_whitelist()).await.unwrap();
        assert_eq!(decision, Decision::Skip);
    }

    #[tokio::test]
    async fn missing_output_forces_rerun() {
        let dir = tempdir().unwrap();
        let ws = AbsDirPath::try_from(dir.path().to_path_buf()).unwrap();
        let store = FileStore::new(2);
        let src = AbsFilePath::try_from(dir.path().join("a.c")).unwrap();
        let out = AbsFilePath::try_from(dir.path().join("a.o")).unwrap();
        tokio::fs::write(src.as_std_path(), b"int main(){}").await.unwrap();

        let cmd = command(&ws, vec![src.clone()], vec![out.clone()]);
        let file_record = store.register(src.clone());
        store.refresh(&file_record).await.unwrap();
        let hash = store.content_hash(&file_record).await.unwrap();
        let fp = crate::command::fingerprint::compute(&cmd, &ws, &[hash], &env_whitelist()).unwrap();
        let input_lwt = file_record.lwt_nanos().await.unwrap();

        let mut records = HashMap::new();
        records.insert(fp.hash.low_u64(), CommandRecord { max_input_lwt_nanos: input_lwt });

        // Output was never written.
        let decision = decide(&cmd, &fp, &ws, &records, &store, &env_whitelist()).await.unwrap();
        assert_eq!(decision, Decision::MustRun);
    }

    #[tokio::test]
    async fn lwt_exactly_at_bound_falls_through_to_content_check() {
        let dir = tempdir().unwrap();
        let ws = AbsDirPath::try_from(dir.path().to_path_buf()).unwrap();
        let store = FileStore::new(2);
        let src = AbsFilePath::try_from(dir.path().join("a.c")).unwrap();
        let out = AbsFilePath::try_from(dir.path().join("a.o")).unwrap();
        tokio::fs::write(src.as_std_path(), b"int main(){}").await.unwrap();
        tokio::fs::write(out.as_std_path(), b"object").await.unwrap();

        let cmd = command(&ws, vec![src.clone()], vec![out.clone()]);
        let file_record = store.register(src.clone());
        store.refresh(&file_record).await.unwrap();
        let hash = store.content_hash(&file_record).await.unwrap();
        let fp = crate::command::fingerprint::compute(&cmd, &ws, &[hash], &env_whitelist()).unwrap();
        let input_lwt = file_record.lwt_nanos().await.unwrap();

        // Record the bound exactly equal to the input's current lwt: the
        // fast path must not short-circuit to Skip on this alone.
        let mut records = HashMap::new();
        records.insert(fp.hash.low_u64(), CommandRecord { max_input_lwt_nanos: input_lwt });

        // Content is unchanged, so the slow path confirms the same
        // fingerprint and the output is fresh enough: skip.
        let decision = decide(&cmd, &fp, &ws, &records, &store, &env_whitelist()).await.unwrap();
        assert_eq!(decision, Decision::Skip);
    }

    #[tokio::test]
    async fn changed_implicit_dependency_forces_rerun_even_with_unchanged_inputs() {
        let dir = tempdir().unwrap();
        let ws = AbsDirPath::try_from(dir.path().to_path_buf()).unwrap();
        let input_db = std::sync::Arc::new(crate::inputdb::InputDb::in_memory().unwrap());
        let store = FileStore::with_input_db(2, input_db);

        let src = AbsFilePath::try_from(dir.path().join("a.c")).unwrap();
        let out = AbsFilePath::try_from(dir.path().join("a.o")).unwrap();
        let header = AbsFilePath::try_from(dir.path().join("a.h")).unwrap();
        tokio::fs::write(src.as_std_path(), b"int main(){}").await.unwrap();
        tokio::fs::write(out.as_std_path(), b"object").await.unwrap();
        tokio::fs::write(header.as_std_path(), b"v1").await.unwrap();

        let cmd = command(&ws, vec![src.clone()], vec![out.clone()]);
        let file_record = store.register(src.clone());
        store.refresh(&file_record).await.unwrap();
        let hash = store.content_hash(&file_record).await.unwrap();
        let fp = crate::command::fingerprint::compute(&cmd, &ws, &[hash], &env_whitelist()).unwrap();
        let input_lwt = file_record.lwt_nanos().await.unwrap();

        let mut records = HashMap::new();
        records.insert(fp.hash.low_u64(), CommandRecord { max_input_lwt_nanos: input_lwt });

        let closure = vec![header.clone()];
        let closure_hash = store.hash_closure(&closure).await.unwrap();
        store.record_implicit_deps(fp.hash.low_u64(), &closure, closure_hash).await.unwrap();

        // Nothing declared as an input changed, and the recorded implicit
        // closure still matches: skip.
        let decision = decide(&cmd, &fp, &ws, &records, &store, &env_whitelist()).await.unwrap();
        assert_eq!(decision, Decision::Skip);

        // Edit the header the declared inputs never mention.
        tokio::time::sleep(Duration::from_millis(5)).await;
        tokio::fs::write(header.as_std_path(), b"v2").await.unwrap();

        let decision = decide(&cmd, &fp, &ws, &records, &store, &env_whitelist()).await.unwrap();
        assert_eq!(decision, Decision::MustRun);
    }
}
