//! The binary entrypoint for `kiln`: a thin CLI that loads a workspace's
//! configuration and build manifest, constructs a command graph, and runs
//! the executor to completion.
//!
//! This is intentionally not a full build-system front-end — toolchain
//! discovery and package resolution are a caller's job, not this crate's
//! (see [`kiln::manifest`]). It exists so the core can be exercised and
//! demonstrated the way a real caller would drive it.

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, bail, eyre},
};
use humansize::{DECIMAL, format_size};
use indicatif::{ProgressBar, ProgressStyle};
use kiln::{
    command::{Command, CommandId, fingerprint},
    config::{CliOverrides, Config},
    decider::CommandRecord,
    events::{BuildSummary, Event},
    executor::{Executor, ExecutorConfig},
    graph::{CommandGraph, EdgeKind},
    inputdb::InputDb,
    journal::{self, JournalWriter, command_journal::CommandJournalRecord, file_journal::FileJournalRecord},
    manifest::Manifest,
    path::{AbsDirPath, TryJoinWith},
    store::FileStore,
    workspace::Workspace,
};
use tracing::{info, instrument};
use tracing_subscriber::util::SubscriberInitExt;

mod log;

#[derive(Clone, Debug, Parser)]
#[command(name = "kiln", about = "Incremental build core for a C/C++ build system")]
struct Cli {
    /// Workspace root directory. Defaults to the current directory.
    #[arg(default_value = ".")]
    workspace: PathBuf,

    /// Build manifest path, relative to the workspace root if not absolute.
    #[arg(long, short = 'f', default_value = "manifest.toml")]
    manifest: PathBuf,

    /// Override the worker count from `kiln.toml`.
    #[arg(long, short = 'j')]
    jobs: Option<usize>,

    /// Override the default per-command timeout, in seconds.
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// When to colorize output.
    #[arg(long, value_enum, default_value_t = log::WhenColor::Auto)]
    color: log::WhenColor,

    /// Increase log verbosity. Repeatable.
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[instrument]
#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    log::make_logger(std::io::stderr, cli.color, cli.verbose)?.init();

    let summary = match run(cli).await {
        Ok(summary) => summary,
        Err(err) => {
            if let Some(kiln_err) = err.downcast_ref::<kiln::error::Error>() {
                eprintln!("error: {kiln_err}");
                std::process::exit(kiln_err.exit_code());
            }
            return Err(err);
        }
    };

    print_summary(&summary);
    std::process::exit(summary.exit_code());
}

#[instrument(skip(cli))]
async fn run(cli: Cli) -> Result<BuildSummary> {
    let root = tokio::fs::canonicalize(&cli.workspace)
        .await
        .with_context(|| format!("resolve workspace root {:?}", cli.workspace))?;
    let root = AbsDirPath::try_from(root).context("workspace root is not a valid path")?;
    let workspace = Workspace::open(root).await.context("open workspace")?;

    let cli_overrides = CliOverrides {
        worker_count: cli.jobs,
        default_command_timeout: cli.timeout_secs.map(Duration::from_secs),
    };
    let config = Config::load(&workspace, cli_overrides)
        .await
        .map_err(|e| eyre!("load configuration: {e}"))?;

    let manifest_path = workspace.root().try_join_file(
        cli.manifest
            .to_str()
            .context("manifest path must be valid UTF-8")?,
    )?;
    let manifest_text = tokio::fs::read_to_string(manifest_path.as_std_path())
        .await
        .with_context(|| format!("read manifest {:?}", manifest_path))?;
    let manifest = Manifest::parse(&manifest_text).map_err(|e| eyre!("parse manifest: {e}"))?;
    let resolved = manifest
        .resolve(workspace.root())
        .map_err(|e| eyre!("resolve manifest: {e}"))?;

    let input_db = Arc::new(
        InputDb::open(&workspace.input_db_path()).map_err(|e| eyre!("open input database: {e}"))?,
    );
    let store = Arc::new(FileStore::with_input_db(config.worker_count, input_db));

    let mut commands: HashMap<CommandId, Command> = HashMap::with_capacity(resolved.len());
    let mut name_to_id: HashMap<String, CommandId> = HashMap::with_capacity(resolved.len());
    let mut graph = CommandGraph::new();

    for entry in resolved.iter() {
        let mut hashes = Vec::with_capacity(entry.command.inputs.len());
        for input in &entry.command.inputs {
            let record = store.register(input.clone());
            store.refresh(&record).await.map_err(|e| eyre!(e))?;
            hashes.push(store.content_hash(&record).await.map_err(|e| eyre!(e))?);
        }
        let fp = fingerprint::compute(&entry.command, workspace.root(), &hashes, &config.env_whitelist)
            .context("compute command fingerprint")?;
        let id = entry.command.id(&fp);

        graph
            .add_command(id, entry.command.outputs.clone())
            .map_err(|e| eyre!(e.to_string()))?;
        commands.insert(id, entry.command.clone());
        name_to_id.insert(entry.name.clone(), id);
    }

    for edge in &manifest.edges {
        let producer = *name_to_id
            .get(&edge.producer)
            .expect("resolve() already validated edge endpoints");
        let consumer = *name_to_id
            .get(&edge.consumer)
            .expect("resolve() already validated edge endpoints");
        graph
            .add_edge(producer, consumer, EdgeKind::from(edge.kind))
            .map_err(|e| eyre!(e.to_string()))?;
    }

    let command_journal_path = workspace.command_journal_path();
    let command_records = load_command_records(&command_journal_path, config.compaction_growth_factor).await?;

    maybe_compact_file_journal(&workspace.file_journal_path(), config.compaction_growth_factor).await?;

    let file_journal = JournalWriter::<FileJournalRecord>::spawn(
        workspace.file_journal_path(),
        config.journal_queue_bound,
        config.journal_batch_size,
        config.journal_flush_interval,
    );
    let command_journal = JournalWriter::<CommandJournalRecord>::spawn(
        command_journal_path,
        config.journal_queue_bound,
        config.journal_batch_size,
        config.journal_flush_interval,
    );

    let total = commands.len() as u64;
    let executor = Executor::new(
        graph,
        commands,
        command_records,
        store,
        workspace.root().clone(),
        file_journal,
        command_journal,
        ExecutorConfig {
            concurrency: config.worker_count,
            default_timeout: config.default_command_timeout,
            ready_queue_bound: config.ready_queue_bound,
            env_whitelist: config.env_whitelist.clone(),
        },
    );

    let progress = build_progress_bar(total)?;
    let mut events = executor.subscribe();
    let progress_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                Event::CommandStarted { id } => info!(%id, "command started"),
                Event::CommandFinished { id, .. } => {
                    progress.inc(1);
                    progress.set_message(format!("last: {id}"));
                }
                Event::BuildFinished { summary } => {
                    progress.finish_with_message(format!(
                        "{} succeeded, {} skipped, {} failed, {} blocked",
                        summary.succeeded, summary.skipped, summary.failed, summary.blocked
                    ));
                    break;
                }
            }
        }
    });

    let summary = executor.run().await.map_err(|e| eyre!("run build: {e}"))?;
    let _ = progress_task.await;

    let cache_size = describe_journal_size(&workspace.file_journal_path()).await?;
    info!(cache_size, "file journal on disk");

    Ok(summary)
}

fn build_progress_bar(total: u64) -> Result<ProgressBar> {
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .context("configure progress bar")?
        .progress_chars("=> ");
    let progress = ProgressBar::new(total);
    progress.set_style(style);
    Ok(progress)
}

/// Load the command journal and fold it into the in-memory view the decider
/// consults, compacting first if it has grown past `growth_factor` dead
/// entries per live key.
async fn load_command_records(
    path: &std::path::Path,
    growth_factor: usize,
) -> Result<HashMap<u64, CommandRecord>> {
    let raw: Vec<CommandJournalRecord> = journal::load_raw(path).await.context("load command journal")?;
    let live = journal::fold_last_writer_wins(&raw);

    if !live.is_empty() && raw.len() > live.len().saturating_mul(growth_factor) {
        journal::compact::<CommandJournalRecord>(path, &live)
            .await
            .context("compact command journal")?;
    }

    Ok(live
        .into_iter()
        .map(|(fingerprint, max_input_lwt_nanos)| (fingerprint, CommandRecord { max_input_lwt_nanos }))
        .collect())
}

async fn maybe_compact_file_journal(path: &std::path::Path, growth_factor: usize) -> Result<()> {
    let raw: Vec<FileJournalRecord> = journal::load_raw(path).await.context("load file journal")?;
    let live = journal::fold_last_writer_wins(&raw);
    if !live.is_empty() && raw.len() > live.len().saturating_mul(growth_factor) {
        journal::compact::<FileJournalRecord>(path, &live)
            .await
            .context("compact file journal")?;
    }
    Ok(())
}

fn print_summary(summary: &BuildSummary) {
    println!(
        "build finished: {} succeeded, {} skipped, {} failed, {} blocked",
        summary.succeeded, summary.skipped, summary.failed, summary.blocked
    );
    for failure in &summary.failures {
        println!("--- {} failed: {}", failure.id, failure.kind);
        if !failure.captured_output.stdout_tail.is_empty() {
            println!("stdout:\n{}", failure.captured_output.stdout_tail);
        }
        if !failure.captured_output.stderr_tail.is_empty() {
            println!("stderr:\n{}", failure.captured_output.stderr_tail);
        }
    }
}

async fn describe_journal_size(path: &std::path::Path) -> Result<String> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => Ok(format_size(metadata.len(), DECIMAL)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(format_size(0u64, DECIMAL)),
        Err(err) => bail!("stat journal {path:?}: {err}"),
    }
}
