//! S1-S6 from the testable-properties list (§8), each run against a real
//! temporary workspace with real child processes (`cp`, `sh`), asserting on
//! the build summary and, where it matters, on the on-disk journals.

use std::time::Duration;

use color_eyre::Result;
use kiln::{
    command::{Command, CommandKind, ImplicitDepsHint},
    graph::EdgeKind,
    path::{AbsDirPath, AbsFilePath},
};
use pretty_assertions::assert_eq;

use crate::{build, tempworkspace};

fn write(root: &AbsDirPath, name: &str, contents: &[u8]) -> AbsFilePath {
    let path = root.as_std_path().join(name);
    std::fs::write(&path, contents).unwrap();
    AbsFilePath::try_from(path).unwrap()
}

/// `cp <input> <output>`: a real process, simple enough to be
/// deterministic, that actually produces its declared output from its
/// declared input — close enough to a compiler's input-to-output relation
/// for these scenarios without depending on a real toolchain being present.
fn copy_command(root: &AbsDirPath, input: AbsFilePath, output: AbsFilePath) -> Command {
    Command::builder()
        .kind(CommandKind::Custom)
        .program(AbsFilePath::try_from(std::path::PathBuf::from("/bin/cp")).unwrap())
        .argv(vec![input.as_std_path().display().to_string(), output.as_std_path().display().to_string()])
        .cwd(root.clone())
        .inputs(vec![input])
        .outputs(vec![output])
        .maybe_timeout(Some(Duration::from_secs(5)))
        .build()
}

fn copy_command_with_env(
    root: &AbsDirPath,
    input: AbsFilePath,
    output: AbsFilePath,
    env: std::collections::BTreeMap<String, String>,
) -> Command {
    Command::builder()
        .kind(CommandKind::Custom)
        .program(AbsFilePath::try_from(std::path::PathBuf::from("/bin/cp")).unwrap())
        .argv(vec![input.as_std_path().display().to_string(), output.as_std_path().display().to_string()])
        .cwd(root.clone())
        .env(env)
        .inputs(vec![input])
        .outputs(vec![output])
        .maybe_timeout(Some(Duration::from_secs(5)))
        .build()
}

/// `cp <input> <output>`, with a pre-written dep-info file declaring
/// `header` as an implicit input — standing in for a compiler's `.d` file,
/// which `cp` itself never produces.
fn copy_command_with_dep_info(
    root: &AbsDirPath,
    input: AbsFilePath,
    output: AbsFilePath,
    dep_info: AbsFilePath,
    header: &AbsFilePath,
) -> Command {
    std::fs::write(
        dep_info.as_std_path(),
        format!("{}: {} {}\n", output.as_std_path().display(), input.as_std_path().display(), header.as_std_path().display()),
    )
    .unwrap();

    Command::builder()
        .kind(CommandKind::CompileC)
        .program(AbsFilePath::try_from(std::path::PathBuf::from("/bin/cp")).unwrap())
        .argv(vec![input.as_std_path().display().to_string(), output.as_std_path().display().to_string()])
        .cwd(root.clone())
        .inputs(vec![input])
        .outputs(vec![output])
        .implicit_deps(ImplicitDepsHint::GccMStyle { dep_info })
        .maybe_timeout(Some(Duration::from_secs(5)))
        .build()
}

fn failing_command(root: &AbsDirPath, input: AbsFilePath) -> Command {
    Command::builder()
        .kind(CommandKind::Custom)
        .program(AbsFilePath::try_from(std::path::PathBuf::from("/bin/sh")).unwrap())
        .argv(vec!["-c".to_string(), "exit 1".to_string()])
        .cwd(root.clone())
        .inputs(vec![input])
        .outputs(vec![])
        .maybe_timeout(Some(Duration::from_secs(5)))
        .build()
}

/// S1: a fresh three-command chain builds everything once, then a second
/// invocation against the same workspace with no changes runs nothing.
#[tokio::test]
async fn s1_fresh_build_then_idempotent_rerun() -> Result<()> {
    let (_dir, root) = tempworkspace();
    let a_src = write(&root, "a.c", b"int a(){return 1;}");
    let a_out = AbsFilePath::try_from(root.as_std_path().join("a.o")).unwrap();
    let b_out = AbsFilePath::try_from(root.as_std_path().join("b.o")).unwrap();
    let c_out = AbsFilePath::try_from(root.as_std_path().join("c.o")).unwrap();

    let a = copy_command(&root, a_src, a_out.clone());
    let b = copy_command(&root, a_out.clone(), b_out.clone());
    let c = copy_command(&root, b_out.clone(), c_out.clone());

    let commands = vec![("a", a), ("b", b), ("c", c)];
    let edges = vec![("a", "b", EdgeKind::File), ("b", "c", EdgeKind::File)];

    let first = build(&root, commands.clone(), edges.clone()).await?;
    assert_eq!(first.succeeded, 3);
    assert_eq!(first.skipped, 0);
    assert!(first.all_succeeded());

    let second = build(&root, commands, edges).await?;
    assert_eq!(second.succeeded, 0);
    assert_eq!(second.skipped, 3);
    assert!(second.all_succeeded());

    Ok(())
}

/// S3: touching a source file without changing its contents still gets
/// content-hashed (the mtime fast path can't trust a newer lwt alone) and,
/// because the content is unchanged, the command is skipped on rebuild.
#[tokio::test]
async fn s3_benign_touch_is_skipped() -> Result<()> {
    let (_dir, root) = tempworkspace();
    let src = write(&root, "a.c", b"int a(){return 1;}");
    let out = AbsFilePath::try_from(root.as_std_path().join("a.o")).unwrap();
    let cmd = copy_command(&root, src.clone(), out);

    let first = build(&root, vec![("a", cmd.clone())], vec![]).await?;
    assert_eq!(first.succeeded, 1);

    // Re-write identical content: this bumps mtime without changing bytes.
    tokio::time::sleep(Duration::from_millis(5)).await;
    std::fs::write(src.as_std_path(), b"int a(){return 1;}").unwrap();

    let second = build(&root, vec![("a", cmd)], vec![]).await?;
    assert_eq!(second.succeeded, 0);
    assert_eq!(second.skipped, 1);

    Ok(())
}

/// S2: editing a header discovered only through a dep-info file (never a
/// declared input) forces the consuming command to rebuild, even though its
/// declared inputs are untouched.
#[tokio::test]
async fn s2_header_edit_via_implicit_deps_forces_rebuild() -> Result<()> {
    let (_dir, root) = tempworkspace();
    let src = write(&root, "b.c", b"int b(){return 1;}");
    let header = write(&root, "a.h", b"#define V 1");
    let out = AbsFilePath::try_from(root.as_std_path().join("b.o")).unwrap();
    let dep_info = AbsFilePath::try_from(root.as_std_path().join("b.d")).unwrap();

    let cmd = copy_command_with_dep_info(&root, src, out, dep_info, &header);

    let first = build(&root, vec![("b", cmd.clone())], vec![]).await?;
    assert_eq!(first.succeeded, 1);

    let second = build(&root, vec![("b", cmd.clone())], vec![]).await?;
    assert_eq!(second.succeeded, 0);
    assert_eq!(second.skipped, 1, "nothing changed, including the implicit header");

    tokio::time::sleep(Duration::from_millis(5)).await;
    std::fs::write(header.as_std_path(), b"#define V 2").unwrap();

    let third = build(&root, vec![("b", cmd)], vec![]).await?;
    assert_eq!(third.succeeded, 1, "the header isn't a declared input, but its edit must still force a rerun");
    assert_eq!(third.skipped, 0);

    Ok(())
}

/// S5: changing a non-whitelisted environment variable must not trigger a
/// rebuild; the fingerprint only folds the whitelisted subset in.
#[tokio::test]
async fn s5_non_whitelisted_env_change_is_skipped() -> Result<()> {
    let (_dir, root) = tempworkspace();
    let src = write(&root, "a.c", b"int a(){return 1;}");
    let out = AbsFilePath::try_from(root.as_std_path().join("a.o")).unwrap();

    let mut env_a = std::collections::BTreeMap::new();
    env_a.insert("UNRELATED_VAR".to_string(), "one".to_string());
    let cmd_a = copy_command_with_env(&root, src.clone(), out.clone(), env_a);

    let first = build(&root, vec![("a", cmd_a)], vec![]).await?;
    assert_eq!(first.succeeded, 1);

    let mut env_b = std::collections::BTreeMap::new();
    env_b.insert("UNRELATED_VAR".to_string(), "two".to_string());
    let cmd_b = copy_command_with_env(&root, src, out, env_b);

    let second = build(&root, vec![("a", cmd_b)], vec![]).await?;
    assert_eq!(second.succeeded, 0);
    assert_eq!(second.skipped, 1);

    Ok(())
}

/// S4 / S6's failure-containment half: a middle failure in a diamond graph
/// blocks only its downstream consumer, leaving the sibling branch to
/// succeed.
#[tokio::test]
async fn s4_middle_failure_blocks_only_downstream() -> Result<()> {
    let (_dir, root) = tempworkspace();
    let src_a = write(&root, "a.c", b"a");
    let a_out = AbsFilePath::try_from(root.as_std_path().join("a.o")).unwrap();
    let c_out = AbsFilePath::try_from(root.as_std_path().join("c.o")).unwrap();

    let a = copy_command(&root, src_a.clone(), a_out.clone());
    let b = failing_command(&root, a_out.clone());
    let c = copy_command(&root, a_out.clone(), c_out.clone());
    let d = copy_command(&root, c_out.clone(), AbsFilePath::try_from(root.as_std_path().join("d.o")).unwrap());

    let commands = vec![("a", a), ("b", b), ("c", c), ("d", d)];
    let edges = vec![
        ("a", "b", EdgeKind::File),
        ("a", "c", EdgeKind::File),
        ("b", "d", EdgeKind::File),
        ("c", "d", EdgeKind::File),
    ];

    let summary = build(&root, commands, edges).await?;
    assert_eq!(summary.succeeded, 2); // a, c
    assert_eq!(summary.failed, 1); // b
    assert_eq!(summary.blocked, 1); // d, downstream of b
    assert!(!summary.all_succeeded());
    assert_eq!(summary.exit_code(), 5);

    Ok(())
}

/// S6: a graph with a cycle is rejected before any process is spawned.
#[tokio::test]
async fn s6_cycle_is_rejected_before_any_command_runs() {
    let (_dir, root) = tempworkspace();
    let src = write(&root, "a.c", b"a");
    let a_out = AbsFilePath::try_from(root.as_std_path().join("a.o")).unwrap();
    let b_out = AbsFilePath::try_from(root.as_std_path().join("b.o")).unwrap();

    let a = copy_command(&root, src, a_out.clone());
    let b = copy_command(&root, a_out.clone(), b_out.clone());

    let commands = vec![("a", a), ("b", b)];
    // a -> b, and b -> a: a cycle.
    let edges = vec![("a", "b", EdgeKind::File), ("b", "a", EdgeKind::File)];

    let err = build(&root, commands, edges).await.unwrap_err();
    assert!(err.to_string().contains("cycle"));
    assert!(!a_out.as_std_path().exists(), "seal() must reject the graph before any command runs");
    assert!(!b_out.as_std_path().exists(), "seal() must reject the graph before any command runs");
}
