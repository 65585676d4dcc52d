//! The command graph: a DAG of [`Command`](crate::command::Command)s with
//! typed edges, sealed once before execution begins.
//!
//! Implicit-dependency closures and transitive output sets are flat sorted
//! vectors of [`AbsFilePath`] owned by the graph, never a linked structure
//! commands traverse themselves — the underlying relation is acyclic in any
//! well-formed project, and a flat vector is both cheaper to hash and cheaper
//! to intersect than a pointer chase (§9 Design Notes).

use std::collections::{BTreeMap, BTreeSet, HashMap};

use thiserror::Error;
use tracing::instrument;

use crate::{command::CommandId, path::AbsFilePath};

/// How one command's outputs relate to another's inputs.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum EdgeKind {
    /// The consumer reads a file the producer writes; a change to the
    /// producer invalidates the consumer.
    File,
    /// The consumer must run after the producer but is not invalidated by
    /// it — a pure ordering constraint.
    OrderOnly,
}

/// The state of one command in the graph's readiness state machine (§4.7).
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum CommandState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Blocked,
}

impl CommandState {
    /// Terminal states end a command's lifecycle for this build.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandState::Succeeded | CommandState::Failed | CommandState::Skipped | CommandState::Blocked
        )
    }

    /// A producer in this state lets its consumers become ready (or blocked,
    /// for `Failed`).
    fn unblocks_consumers(self) -> bool {
        matches!(self, CommandState::Succeeded | CommandState::Skipped)
    }
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("command graph has a cycle: {}", format_cycle(.0))]
    Cycle(Vec<CommandId>),
    #[error("command {0} not present in graph")]
    UnknownCommand(CommandId),
    #[error("graph already sealed, cannot add edges or commands")]
    AlreadySealed,
    #[error("graph not sealed yet, cannot transition state")]
    NotSealed,
}

fn format_cycle(ids: &[CommandId]) -> String {
    ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(" -> ")
}

struct Node {
    state: CommandState,
    outputs: Vec<AbsFilePath>,
    /// Outgoing edges: consumer id and edge kind. A `BTreeMap` rather than a
    /// `Vec` so repeated `add_edge` calls for the same pair collapse.
    out_edges: BTreeMap<CommandId, EdgeKind>,
    in_edges: BTreeMap<CommandId, EdgeKind>,
}

/// A directed acyclic graph of commands.
///
/// Built by repeated [`CommandGraph::add_command`]/[`CommandGraph::add_edge`]
/// calls, then frozen with [`CommandGraph::seal`]. Structurally read-only
/// after sealing — the executor only ever transitions node state via
/// [`CommandGraph::transition`], never the edges.
pub struct CommandGraph {
    nodes: HashMap<CommandId, Node>,
    sealed: bool,
}

impl Default for CommandGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandGraph {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            sealed: false,
        }
    }

    /// Register a command node with its declared outputs. Idempotent: a
    /// second call for the same id is a no-op.
    pub fn add_command(&mut self, id: CommandId, outputs: Vec<AbsFilePath>) -> Result<(), GraphError> {
        if self.sealed {
            return Err(GraphError::AlreadySealed);
        }
        self.nodes.entry(id).or_insert_with(|| Node {
            state: CommandState::Pending,
            outputs,
            out_edges: BTreeMap::new(),
            in_edges: BTreeMap::new(),
        });
        Ok(())
    }

    /// Declare a dependency edge from `producer` to `consumer`. Duplicate
    /// edges between the same pair are collapsed (the last kind declared
    /// wins).
    #[instrument(skip(self))]
    pub fn add_edge(&mut self, producer: CommandId, consumer: CommandId, kind: EdgeKind) -> Result<(), GraphError> {
        if self.sealed {
            return Err(GraphError::AlreadySealed);
        }
        if !self.nodes.contains_key(&producer) {
            return Err(GraphError::UnknownCommand(producer));
        }
        if !self.nodes.contains_key(&consumer) {
            return Err(GraphError::UnknownCommand(consumer));
        }
        self.nodes.get_mut(&producer).unwrap().out_edges.insert(consumer, kind);
        self.nodes.get_mut(&consumer).unwrap().in_edges.insert(producer, kind);
        Ok(())
    }

    /// Freeze the graph: run a DFS cycle check, and if clean, mark every
    /// source node (no inbound edges) `Ready`. Refuses to proceed on a
    /// cycle, reporting it as the involved command ids in traversal order.
    #[instrument(skip(self))]
    pub fn seal(&mut self) -> Result<(), GraphError> {
        if self.sealed {
            return Ok(());
        }

        let mut marks: HashMap<CommandId, DfsMark> = HashMap::new();
        let mut path: Vec<CommandId> = Vec::new();

        let mut ids: Vec<CommandId> = self.nodes.keys().copied().collect();
        ids.sort_by_key(|id| id.0);

        for start in ids {
            if marks.contains_key(&start) {
                continue;
            }
            if let Some(cycle) = self.dfs_visit(start, &mut marks, &mut path) {
                return Err(GraphError::Cycle(cycle));
            }
        }

        for node in self.nodes.values_mut() {
            if node.in_edges.is_empty() {
                node.state = CommandState::Ready;
            }
        }
        self.sealed = true;
        Ok(())
    }

    fn dfs_visit(
        &self,
        id: CommandId,
        marks: &mut HashMap<CommandId, DfsMark>,
        path: &mut Vec<CommandId>,
    ) -> Option<Vec<CommandId>> {
        marks.insert(id, DfsMark::OnStack);
        path.push(id);

        let mut children: Vec<CommandId> = self.nodes[&id].out_edges.keys().copied().collect();
        children.sort_by_key(|c| c.0);

        for child in children {
            match marks.get(&child) {
                Some(DfsMark::OnStack) => {
                    let start = path.iter().position(|n| *n == child).expect("child is on stack");
                    let mut cycle = path[start..].to_vec();
                    cycle.push(child);
                    return Some(cycle);
                }
                Some(DfsMark::Done) => continue,
                None => {
                    if let Some(cycle) = self.dfs_visit(child, marks, path) {
                        return Some(cycle);
                    }
                }
            }
        }

        path.pop();
        marks.insert(id, DfsMark::Done);
        None
    }

    /// Transition `id` to `new_state`, propagating readiness/blocking
    /// outward. A consumer becomes `Ready` once every one of its producers is
    /// `Succeeded`/`Skipped`; it becomes `Blocked` the instant any producer is
    /// `Failed` or already `Blocked` — and since a blocked command never
    /// runs, nothing will ever call `transition` for it, so blocking cascades
    /// to its own consumers in the same call (§4.7/§7 "failure containment").
    ///
    /// Returns the commands that just became `Ready` (the caller should
    /// enqueue these) and the commands that just became `Blocked` (the
    /// caller should count these as finished without waiting on a worker,
    /// since no worker will ever report on a command that never runs).
    #[instrument(skip(self))]
    pub fn transition(&mut self, id: CommandId, new_state: CommandState) -> Result<TransitionEffects, GraphError> {
        if !self.sealed {
            return Err(GraphError::NotSealed);
        }
        if !self.nodes.contains_key(&id) {
            return Err(GraphError::UnknownCommand(id));
        }
        self.nodes.get_mut(&id).unwrap().state = new_state;

        let mut newly_ready = Vec::new();
        let mut newly_blocked = Vec::new();
        let mut worklist: std::collections::VecDeque<CommandId> = std::collections::VecDeque::new();
        worklist.push_back(id);

        while let Some(current) = worklist.pop_front() {
            let consumers: Vec<CommandId> = self.nodes[&current].out_edges.keys().copied().collect();
            for consumer_id in consumers {
                if self.nodes[&consumer_id].state.is_terminal() {
                    continue;
                }
                let producers: Vec<CommandId> = self.nodes[&consumer_id].in_edges.keys().copied().collect();
                let any_failed = producers
                    .iter()
                    .any(|p| matches!(self.nodes[p].state, CommandState::Failed | CommandState::Blocked));
                let all_unblocked = producers.iter().all(|p| self.nodes[p].state.unblocks_consumers());

                if any_failed {
                    self.nodes.get_mut(&consumer_id).unwrap().state = CommandState::Blocked;
                    newly_blocked.push(consumer_id);
                    worklist.push_back(consumer_id);
                } else if all_unblocked {
                    self.nodes.get_mut(&consumer_id).unwrap().state = CommandState::Ready;
                    newly_ready.push(consumer_id);
                }
            }
        }

        Ok(TransitionEffects { newly_ready, newly_blocked })
    }

    pub fn state(&self, id: CommandId) -> Option<CommandState> {
        self.nodes.get(&id).map(|n| n.state)
    }

    /// Every node currently `Ready`, in ascending id order (a deterministic
    /// tie-break; the executor layers critical-path ordering on top, §4.7).
    pub fn ready_commands(&self) -> Vec<CommandId> {
        let mut ready: Vec<CommandId> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.state == CommandState::Ready)
            .map(|(id, _)| *id)
            .collect();
        ready.sort_by_key(|id| id.0);
        ready
    }

    /// The number of edges into `id` — used by the executor to estimate the
    /// critical-path length for ready-queue tie-breaking.
    pub fn downstream_chain_len(&self, id: CommandId) -> usize {
        let mut memo: HashMap<CommandId, usize> = HashMap::new();
        self.chain_len_rec(id, &mut memo)
    }

    fn chain_len_rec(&self, id: CommandId, memo: &mut HashMap<CommandId, usize>) -> usize {
        if let Some(&cached) = memo.get(&id) {
            return cached;
        }
        let Some(node) = self.nodes.get(&id) else {
            return 0;
        };
        let longest = node
            .out_edges
            .keys()
            .map(|child| 1 + self.chain_len_rec(*child, memo))
            .max()
            .unwrap_or(0);
        memo.insert(id, longest);
        longest
    }

    /// The transitive set of output files reachable from `id`, sorted — used
    /// when a later command needs to stat files that weren't declared as
    /// direct inputs (implicit, compiler-discovered dependencies).
    pub fn transitive_outputs(&self, id: CommandId) -> Vec<AbsFilePath> {
        let mut seen: BTreeSet<CommandId> = BTreeSet::new();
        let mut out: BTreeSet<AbsFilePath> = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            let Some(node) = self.nodes.get(&current) else {
                continue;
            };
            out.extend(node.outputs.iter().cloned());
            stack.extend(node.out_edges.keys().copied());
        }
        out.into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[derive(Clone, Copy, Eq, PartialEq)]
enum DfsMark {
    OnStack,
    Done,
}

/// What changed as a result of one [`CommandGraph::transition`] call.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct TransitionEffects {
    pub newly_ready: Vec<CommandId>,
    pub newly_blocked: Vec<CommandId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> CommandId {
        CommandId(n)
    }

    #[test]
    fn seal_succeeds_on_acyclic_graph_and_marks_source_ready() {
        let mut g = CommandGraph::new();
        for n in [1, 2, 3] {
            g.add_command(id(n), vec![]).unwrap();
        }
        g.add_edge(id(1), id(2), EdgeKind::File).unwrap();
        g.add_edge(id(2), id(3), EdgeKind::File).unwrap();
        g.seal().unwrap();

        assert_eq!(g.state(id(1)), Some(CommandState::Ready));
        assert_eq!(g.state(id(2)), Some(CommandState::Pending));
        assert_eq!(g.state(id(3)), Some(CommandState::Pending));
    }

    #[test]
    fn seal_detects_cycle() {
        let mut g = CommandGraph::new();
        for n in [1, 2, 3] {
            g.add_command(id(n), vec![]).unwrap();
        }
        g.add_edge(id(1), id(2), EdgeKind::File).unwrap();
        g.add_edge(id(2), id(3), EdgeKind::File).unwrap();
        g.add_edge(id(3), id(1), EdgeKind::File).unwrap();

        let err = g.seal().unwrap_err();
        match err {
            GraphError::Cycle(cycle) => {
                assert!(cycle.contains(&id(1)));
                assert!(cycle.contains(&id(2)));
                assert!(cycle.contains(&id(3)));
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn succeeded_producer_unblocks_consumer() {
        let mut g = CommandGraph::new();
        g.add_command(id(1), vec![]).unwrap();
        g.add_command(id(2), vec![]).unwrap();
        g.add_edge(id(1), id(2), EdgeKind::File).unwrap();
        g.seal().unwrap();

        let effects = g.transition(id(1), CommandState::Succeeded).unwrap();
        assert_eq!(effects.newly_ready, vec![id(2)]);
        assert!(effects.newly_blocked.is_empty());
        assert_eq!(g.state(id(2)), Some(CommandState::Ready));
    }

    #[test]
    fn failed_producer_blocks_consumer_not_unrelated_siblings() {
        // A -> B, A -> C, B -> D, C -> D
        let mut g = CommandGraph::new();
        for n in [1, 2, 3, 4] {
            g.add_command(id(n), vec![]).unwrap();
        }
        g.add_edge(id(1), id(2), EdgeKind::File).unwrap();
        g.add_edge(id(1), id(3), EdgeKind::File).unwrap();
        g.add_edge(id(2), id(4), EdgeKind::File).unwrap();
        g.add_edge(id(3), id(4), EdgeKind::File).unwrap();
        g.seal().unwrap();

        g.transition(id(1), CommandState::Succeeded).unwrap();
        assert_eq!(g.state(id(2)), Some(CommandState::Ready));
        assert_eq!(g.state(id(3)), Some(CommandState::Ready));

        let effects = g.transition(id(2), CommandState::Failed).unwrap();
        assert_eq!(g.state(id(4)), Some(CommandState::Blocked));
        assert_eq!(effects.newly_blocked, vec![id(4)]);

        g.transition(id(3), CommandState::Succeeded).unwrap();
        assert_eq!(g.state(id(3)), Some(CommandState::Succeeded));
    }

    #[test]
    fn blocking_cascades_through_multiple_generations() {
        // A -> B -> C -> D, A fails: B, C, D all become Blocked in one call.
        let mut g = CommandGraph::new();
        for n in [1, 2, 3, 4] {
            g.add_command(id(n), vec![]).unwrap();
        }
        g.add_edge(id(1), id(2), EdgeKind::File).unwrap();
        g.add_edge(id(2), id(3), EdgeKind::File).unwrap();
        g.add_edge(id(3), id(4), EdgeKind::File).unwrap();
        g.seal().unwrap();

        let effects = g.transition(id(1), CommandState::Failed).unwrap();
        assert_eq!(effects.newly_blocked, vec![id(2), id(3), id(4)]);
        assert_eq!(g.state(id(2)), Some(CommandState::Blocked));
        assert_eq!(g.state(id(3)), Some(CommandState::Blocked));
        assert_eq!(g.state(id(4)), Some(CommandState::Blocked));
    }

    #[test]
    fn transitive_outputs_follows_chain() {
        let mut g = CommandGraph::new();
        let out_a = AbsFilePath::try_from(std::env::temp_dir().join("a.o")).unwrap();
        let out_b = AbsFilePath::try_from(std::env::temp_dir().join("b.o")).unwrap();
        g.add_command(id(1), vec![out_a.clone()]).unwrap();
        g.add_command(id(2), vec![out_b.clone()]).unwrap();
        g.add_edge(id(1), id(2), EdgeKind::File).unwrap();
        g.seal().unwrap();

        let outputs = g.transitive_outputs(id(1));
        assert_eq!(outputs, vec![out_a, out_b]);
    }

    #[test]
    fn add_edge_rejects_unknown_command() {
        let mut g = CommandGraph::new();
        g.add_command(id(1), vec![]).unwrap();
        let err = g.add_edge(id(1), id(99), EdgeKind::File).unwrap_err();
        assert!(matches!(err, GraphError::UnknownCommand(_)));
    }
}
