//! End-to-end scenarios against a real temporary workspace: S1-S6 from the
//! testable-properties list, each exercising the full core (store, graph,
//! decider, executor, journals) the way a caller actually drives it, without
//! going through the CLI binary's argument parsing.

use std::{collections::HashMap, time::Duration};

use color_eyre::Result;
use kiln::{
    command::{Command, CommandId, fingerprint},
    config::Config,
    decider::CommandRecord,
    events::BuildSummary,
    executor::{Executor, ExecutorConfig},
    graph::{CommandGraph, EdgeKind},
    inputdb::InputDb,
    journal::{self, JournalWriter, command_journal::CommandJournalRecord, file_journal::FileJournalRecord},
    path::AbsDirPath,
    store::FileStore,
    workspace::Workspace,
};
use tempfile::TempDir;

mod scenarios;

pub fn tempworkspace() -> (TempDir, AbsDirPath) {
    let dir = TempDir::new().expect("create temp dir");
    let root = AbsDirPath::try_from(dir.path().to_path_buf()).expect("temp dir is a valid abs dir");
    (dir, root)
}

/// Build `commands` (each named, for edge resolution) against `root`,
/// exactly the sequence `bin/kiln/main.rs::run` performs: hash inputs,
/// fingerprint, assign ids, seal the graph, load/compact journals, run the
/// executor. Call this twice against the same `root` to exercise
/// incremental behavior.
pub async fn build(
    root: &AbsDirPath,
    commands: Vec<(&str, Command)>,
    edges: Vec<(&str, &str, EdgeKind)>,
) -> Result<BuildSummary> {
    let workspace = Workspace::open(root.clone()).await?;
    let config = Config::default();
    let input_db = std::sync::Arc::new(InputDb::open(&workspace.input_db_path())?);
    let store = FileStore::with_input_db(config.worker_count, input_db);

    let mut graph = CommandGraph::new();
    let mut built: HashMap<CommandId, Command> = HashMap::new();
    let mut name_to_id: HashMap<&str, CommandId> = HashMap::new();

    for (name, command) in commands {
        let mut hashes = Vec::with_capacity(command.inputs.len());
        for input in &command.inputs {
            let record = store.register(input.clone());
            store.refresh(&record).await?;
            hashes.push(store.content_hash(&record).await?);
        }
        let fp = fingerprint::compute(&command, workspace.root(), &hashes, &config.env_whitelist)?;
        let id = command.id(&fp);

        graph.add_command(id, command.outputs.clone()).map_err(|e| color_eyre::eyre::eyre!(e.to_string()))?;
        name_to_id.insert(name, id);
        built.insert(id, command);
    }

    for (producer, consumer, kind) in edges {
        let producer_id = *name_to_id.get(producer).expect("edge references a declared command");
        let consumer_id = *name_to_id.get(consumer).expect("edge references a declared command");
        graph
            .add_edge(producer_id, consumer_id, kind)
            .map_err(|e| color_eyre::eyre::eyre!(e.to_string()))?;
    }

    let command_journal_path = workspace.command_journal_path();
    let raw: Vec<CommandJournalRecord> = journal::load_raw(&command_journal_path).await?;
    let live = journal::fold_last_writer_wins(&raw);
    let command_records: HashMap<u64, CommandRecord> = live
        .into_iter()
        .map(|(fingerprint, max_input_lwt_nanos)| (fingerprint, CommandRecord { max_input_lwt_nanos }))
        .collect();

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

    let executor = Executor::new(
        graph,
        built,
        command_records,
        std::sync::Arc::new(store),
        workspace.root().clone(),
        file_journal,
        command_journal,
        ExecutorConfig {
            concurrency: 4,
            default_timeout: Some(Duration::from_secs(10)),
            ready_queue_bound: 64,
            env_whitelist: config.env_whitelist,
        },
    );

    Ok(executor.run().await?)
}
