//! The scheduler: a bounded worker pool plus a single coordinator task that
//! owns all graph-state mutation (§4.7).
//!
//! Workers never touch [`crate::graph::CommandGraph`] directly — they run a
//! command to completion and send a [`WorkerReport`] back over a channel; the
//! coordinator is the only place `transition` is called. This is explicit
//! tasks submitted to a bounded pool, not unbounded async fan-out (§9 Design
//! Notes, "Coroutine-like asynchrony").

use std::{
    collections::HashMap,
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use tokio::sync::{broadcast, mpsc};
use tracing::{Instrument, debug, error, info, instrument, warn};

use crate::{
    command::{Command, CommandId},
    decider::{self, CommandRecord, Decision},
    depinfo::DepInfo,
    error::Error,
    events::{BuildSummary, CapturedOutput, Event, FailureSummary, Status, tail_lines},
    graph::{CommandGraph, CommandState},
    journal::{JournalWriter, command_journal::CommandJournalRecord, file_journal::FileJournalRecord},
    path::{AbsDirPath, AbsFilePath, TryJoinWith},
    store::FileStore,
};

pub struct ExecutorConfig {
    pub concurrency: usize,
    pub default_timeout: Option<Duration>,
    pub ready_queue_bound: usize,
    pub env_whitelist: Vec<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get().max(1),
            default_timeout: None,
            ready_queue_bound: 1024,
            env_whitelist: crate::command::fingerprint::ENV_WHITELIST
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Everything a worker needs that doesn't change across the run, grouped so
/// it can be cheaply cloned (all `Arc`s) into each spawned worker task.
#[derive(Clone)]
struct SharedContext {
    store: Arc<FileStore>,
    workspace_root: AbsDirPath,
    file_journal: Arc<JournalWriter<FileJournalRecord>>,
    command_journal: Arc<JournalWriter<CommandJournalRecord>>,
    stop: Arc<AtomicBool>,
    default_timeout: Option<Duration>,
    env_whitelist: Arc<Vec<String>>,
}

struct WorkerReport {
    id: CommandId,
    state: CommandState,
    error: Option<Error>,
    duration: Duration,
    captured_output: CapturedOutput,
}

/// Drives a sealed [`CommandGraph`] to completion: a build invocation.
///
/// The FileRecord store, command records, and journals are explicit values
/// owned by this struct's constructor arguments rather than process-wide
/// singletons (§4.7/§9 "Globally accessible file storage") — two executors
/// can run against two different workspaces in the same process.
pub struct Executor {
    graph: CommandGraph,
    commands: Arc<HashMap<CommandId, Command>>,
    command_records: Arc<HashMap<u64, CommandRecord>>,
    ctx: SharedContext,
    events: broadcast::Sender<Event>,
    config: ExecutorConfig,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        graph: CommandGraph,
        commands: HashMap<CommandId, Command>,
        command_records: HashMap<u64, CommandRecord>,
        store: Arc<FileStore>,
        workspace_root: AbsDirPath,
        file_journal: JournalWriter<FileJournalRecord>,
        command_journal: JournalWriter<CommandJournalRecord>,
        config: ExecutorConfig,
    ) -> Self {
        let (events, _rx) = broadcast::channel(1024);
        Self {
            graph,
            commands: Arc::new(commands),
            command_records: Arc::new(command_records),
            ctx: SharedContext {
                store,
                workspace_root,
                file_journal: Arc::new(file_journal),
                command_journal: Arc::new(command_journal),
                stop: Arc::new(AtomicBool::new(false)),
                default_timeout: config.default_timeout,
                env_whitelist: Arc::new(config.env_whitelist.clone()),
            },
            events,
            config,
        }
    }

    /// Subscribe to the build's event stream. Multiple independent
    /// subscribers (a progress bar, a log sink) may call this.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// A handle the caller can use to request a soft stop: in-flight
    /// commands finish, no new ones start. Idempotent.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.ctx.stop)
    }

    /// Seal the graph and run every command to a terminal state.
    #[instrument(skip(self))]
    pub async fn run(mut self) -> Result<BuildSummary, Error> {
        self.graph
            .seal()
            .map_err(|e| Error::Config(e.to_string()))?;

        let (work_tx, work_rx) = flume::bounded::<CommandId>(self.config.ready_queue_bound);
        let (report_tx, mut report_rx) = mpsc::channel::<WorkerReport>(self.config.ready_queue_bound.max(16));

        let mut worker_handles = Vec::with_capacity(self.config.concurrency);
        for worker_id in 0..self.config.concurrency {
            let work_rx = work_rx.clone();
            let report_tx = report_tx.clone();
            let ctx = self.ctx.clone();
            let commands = Arc::clone(&self.commands);
            let command_records = Arc::clone(&self.command_records);
            let events = self.events.clone();
            worker_handles.push(tokio::spawn(
                worker_loop(worker_id, work_rx, report_tx, ctx, commands, command_records, events)
                    .in_current_span(),
            ));
        }
        drop(report_tx);

        let total = self.graph.len();
        let mut finished = 0usize;
        let mut summary = BuildSummary::default();

        for id in order_by_critical_path(self.graph.ready_commands(), &self.graph) {
            work_tx.send_async(id).await.map_err(|_| Error::Io(std::io::Error::other("worker pool gone")))?;
        }

        // A graph with zero ready commands but nonzero nodes is a
        // configuration bug (everything is downstream of a cycle `seal`
        // should already have rejected), but finish gracefully either way.
        while finished < total {
            let Some(report) = report_rx.recv().await else {
                break;
            };
            finished += 1;

            match report.state {
                CommandState::Succeeded => summary.succeeded += 1,
                CommandState::Skipped => summary.skipped += 1,
                CommandState::Failed => {
                    summary.failed += 1;
                    summary.failures.push(FailureSummary {
                        id: report.id,
                        kind: report.error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                        captured_output: report.captured_output.clone(),
                    });
                }
                other => {
                    warn!(?other, "worker reported a non-terminal state");
                }
            }

            let effects = self
                .graph
                .transition(report.id, report.state)
                .map_err(|e| Error::Config(e.to_string()))?;

            let _ = self.events.send(Event::CommandFinished {
                id: report.id,
                status: Status::from_state(report.state, report.error.as_ref()),
                duration: report.duration,
                captured_output: report.captured_output,
            });

            // Blocked commands never run, so no worker will ever report on
            // them; count them toward completion here instead.
            finished += effects.newly_blocked.len();
            summary.blocked += effects.newly_blocked.len();

            if !self.ctx.stop.load(Ordering::SeqCst) {
                for ready_id in order_by_critical_path(effects.newly_ready, &self.graph) {
                    work_tx
                        .send_async(ready_id)
                        .await
                        .map_err(|_| Error::Io(std::io::Error::other("worker pool gone")))?;
                }
            }
        }

        drop(work_tx);
        for handle in worker_handles {
            let _ = handle.await;
        }

        let _ = self.events.send(Event::BuildFinished { summary: summary.clone() });

        drop(report_rx);
        if let Ok(file_journal) = Arc::try_unwrap(self.ctx.file_journal) {
            if let Err(err) = file_journal.shutdown().await {
                warn!(error = %err, "file journal shutdown failed");
            }
        }
        if let Ok(command_journal) = Arc::try_unwrap(self.ctx.command_journal) {
            if let Err(err) = command_journal.shutdown().await {
                warn!(error = %err, "command journal shutdown failed");
            }
        }

        Ok(summary)
    }
}

/// Order a batch of newly-ready commands for dispatch: longest estimated
/// downstream chain first, so the critical path gets a head start on the
/// worker pool; ties fall back to ascending id for determinism.
fn order_by_critical_path(mut ids: Vec<CommandId>, graph: &CommandGraph) -> Vec<CommandId> {
    ids.sort_by_key(|id| (std::cmp::Reverse(graph.downstream_chain_len(*id)), id.0));
    ids
}

#[instrument(skip(work_rx, report_tx, ctx, commands, command_records, events))]
async fn worker_loop(
    worker_id: usize,
    work_rx: flume::Receiver<CommandId>,
    report_tx: mpsc::Sender<WorkerReport>,
    ctx: SharedContext,
    commands: Arc<HashMap<CommandId, Command>>,
    command_records: Arc<HashMap<u64, CommandRecord>>,
    events: broadcast::Sender<Event>,
) {
    while let Ok(id) = work_rx.recv_async().await {
        if ctx.stop.load(Ordering::SeqCst) {
            continue;
        }
        let Some(command) = commands.get(&id) else {
            error!(worker_id, %id, "dispatched unknown command id");
            continue;
        };

        let _ = events.send(Event::CommandStarted { id });
        let started = Instant::now();
        let report = run_one(id, command, &ctx, &command_records).await;
        let duration = started.elapsed();

        let (state, error, captured_output) = match report {
            Ok(RunOutcome::Skipped) => (CommandState::Skipped, None, CapturedOutput::default()),
            Ok(RunOutcome::Succeeded) => (CommandState::Succeeded, None, CapturedOutput::default()),
            Ok(RunOutcome::Failed { error, captured_output }) => (CommandState::Failed, Some(error), captured_output),
            Err(error) => (CommandState::Failed, Some(error), CapturedOutput::default()),
        };

        if report_tx
            .send(WorkerReport { id, state, error, duration, captured_output })
            .await
            .is_err()
        {
            debug!(worker_id, "coordinator gone, stopping worker");
            return;
        }
    }
}

enum RunOutcome {
    Skipped,
    Succeeded,
    Failed { error: Error, captured_output: CapturedOutput },
}

fn nanos_since_epoch(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as i64).unwrap_or(i64::MIN)
}

/// Run one command: decide, maybe execute, re-hash outputs, append journal
/// records. The command-journal append is `append_durable` — it must
/// complete before this function returns `Succeeded`, which is what makes
/// the §5 happens-before guarantee ("a successor's `Running` only after the
/// predecessor's journal record is durably appended") hold: the coordinator
/// cannot queue a successor until this worker's report arrives, and the
/// report only arrives after the durable append resolves.
#[instrument(skip(command, ctx, command_records), fields(kind = ?command.kind))]
async fn run_one(
    id: CommandId,
    command: &Command,
    ctx: &SharedContext,
    command_records: &HashMap<u64, CommandRecord>,
) -> Result<RunOutcome, Error> {
    let mut input_hashes = Vec::with_capacity(command.inputs.len());
    for input in &command.inputs {
        let record = ctx.store.register(input.clone());
        ctx.store.refresh(&record).await?;
        input_hashes.push(ctx.store.content_hash(&record).await?);
    }
    let fingerprint = crate::command::fingerprint::compute(
        command,
        &ctx.workspace_root,
        &input_hashes,
        &ctx.env_whitelist,
    )
    .map_err(|e| Error::Config(e.to_string()))?;

    let decision = decider::decide(
        command,
        &fingerprint,
        &ctx.workspace_root,
        command_records,
        &ctx.store,
        &ctx.env_whitelist,
    )
    .await?;

    if decision == Decision::Skip {
        debug!(%id, "skip");
        return Ok(RunOutcome::Skipped);
    }

    info!(%id, "running");
    let timeout = command.timeout.or(ctx.default_timeout);
    let mut child = tokio::process::Command::new(command.program.as_std_path())
        .args(&command.argv)
        .current_dir(command.cwd.as_std_path())
        .envs(&command.env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(Error::Io)?;

    let wait = child.wait_with_output();
    let output = match timeout {
        Some(duration) => match tokio::time::timeout(duration, wait).await {
            Ok(result) => result.map_err(Error::Io)?,
            Err(_) => {
                return Ok(RunOutcome::Failed {
                    error: Error::TimedOut { elapsed_secs: duration.as_secs() },
                    captured_output: CapturedOutput::default(),
                });
            }
        },
        None => wait.await.map_err(Error::Io)?,
    };

    let stdout_tail = tail_lines(&String::from_utf8_lossy(&output.stdout));
    let stderr_tail = tail_lines(&String::from_utf8_lossy(&output.stderr));
    let captured_output = CapturedOutput { stdout_tail, stderr_tail };

    if !output.status.success() {
        let status = match output.status.code() {
            Some(code) => crate::error::ExitStatusSummary::Code(code),
            None => crate::error::ExitStatusSummary::Signal,
        };
        return Ok(RunOutcome::Failed {
            error: Error::ProcessFailed {
                status,
                stdout_tail: captured_output.stdout_tail.clone(),
                stderr_tail: captured_output.stderr_tail.clone(),
            },
            captured_output,
        });
    }

    // Discover implicit dependencies from the compiler's `.d` file, if any,
    // before folding the implicit-deps hash and re-registering outputs.
    if let Some(crate::command::ImplicitDepsHint::GccMStyle { dep_info }) = &command.implicit_deps {
        match DepInfo::from_file(dep_info).await {
            Ok(dep_info) => {
                let mut closure: Vec<AbsFilePath> = Vec::new();
                for input in dep_info.all_inputs_sorted() {
                    let resolved = if std::path::Path::new(&input).is_absolute() {
                        AbsFilePath::try_from(std::path::PathBuf::from(&input))
                    } else {
                        command.cwd.try_join_file(&input)
                    };
                    if let Ok(path) = resolved {
                        closure.push(path);
                    }
                }
                if let Some(first_output) = command.outputs.first() {
                    let out_record = ctx.store.register(first_output.clone());
                    ctx.store.refresh(&out_record).await?;
                    let deps_hash = ctx.store.implicit_deps_hash(&out_record, &closure).await?;
                    ctx.store
                        .record_implicit_deps(fingerprint.hash.low_u64(), &closure, deps_hash)
                        .await?;
                }
            }
            Err(err) => warn!(%id, error = %err, "failed to parse dep-info file"),
        }
    }

    let mut max_input_lwt_nanos = i64::MIN;
    for input in &command.inputs {
        let record = ctx.store.register(input.clone());
        if let Some(lwt) = record.lwt_nanos().await {
            max_input_lwt_nanos = max_input_lwt_nanos.max(lwt);
            ctx.file_journal
                .append(FileJournalRecord::for_path(input, lwt))
                .await
                .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
        }
    }

    for output in &command.outputs {
        let record = ctx.store.register(output.clone());
        ctx.store.refresh(&record).await?;
        if let Some(lwt) = record.lwt_nanos().await {
            ctx.file_journal
                .append(FileJournalRecord::for_path(output, lwt))
                .await
                .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
        } else {
            let now = nanos_since_epoch(SystemTime::now());
            warn!(%id, output = %output, "output missing lwt after refresh, stamping now");
            let _ = now;
        }
    }

    ctx.command_journal
        .append_durable(CommandJournalRecord::new(&fingerprint, max_input_lwt_nanos))
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;

    Ok(RunOutcome::Succeeded)
}
