//! The build graph: all scheduled tasks of one invocation, wired with
//! strong (`dependsOn`) and weak (`before`/`after`) edges.
//!
//! Tasks and edges live in a petgraph arena; everything else refers to
//! tasks by `TaskId` or node index, which keeps the otherwise cyclic
//! task / package / graph references non-owning.

mod builder;
mod dot;
mod execute;

use std::collections::{HashMap, HashSet};

pub use builder::{BuilderError, EngineBuilder};
pub use dot::write_dot;
pub use execute::{ExecuteError, ExecutionOptions, Message, StopExecution};
use petgraph::{graph::NodeIndex, visit::EdgeRef, Direction, Graph};
use sail_task_id::TaskId;

use crate::task::TaskSpec;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskNode {
    Root,
    Task(TaskId<'static>),
}

impl std::fmt::Display for TaskNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskNode::Root => f.write_str("___ROOT___"),
            TaskNode::Task(id) => id.fmt(f),
        }
    }
}

/// Edge kinds: strong edges schedule their target and propagate failure;
/// weak edges (`after`) only hold a task until an already-scheduled
/// predecessor is terminal. `before` hints are not edges at all, they
/// bias dispatch order only and live in the engine's start-hint table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepKind {
    Strong,
    Weak,
}

/// Scheduling priority, precomputed at seal time. Ready-set ties break by
/// lower level, then larger strong-dependent fan-out, then name; the
/// ordering must be stable so identical inputs schedule identically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPriority {
    pub level: u32,
    pub strong_fanout: usize,
}

#[derive(Debug, Default)]
pub struct Building;
#[derive(Debug, Default)]
pub struct Built;

/// The sealed build graph handed to the scheduler. `Engine<Building>` is
/// only reachable through [`EngineBuilder`].
#[derive(Debug)]
pub struct Engine<S = Built> {
    marker: std::marker::PhantomData<S>,
    task_graph: Graph<TaskNode, DepKind>,
    root_index: NodeIndex,
    task_lookup: HashMap<TaskId<'static>, NodeIndex>,
    task_specs: HashMap<TaskId<'static>, TaskSpec>,
    priorities: HashMap<NodeIndex, TaskPriority>,
    /// `before` hints, keyed by the task that should start later; the
    /// value is the set of tasks that should start first.
    start_hints: HashMap<NodeIndex, HashSet<NodeIndex>>,
}

impl Engine<Building> {
    pub(crate) fn new() -> Self {
        let mut task_graph = Graph::default();
        let root_index = task_graph.add_node(TaskNode::Root);
        Self {
            marker: std::marker::PhantomData,
            task_graph,
            root_index,
            task_lookup: HashMap::default(),
            task_specs: HashMap::default(),
            priorities: HashMap::default(),
            start_hints: HashMap::default(),
        }
    }

    pub(crate) fn get_index(&mut self, task_id: &TaskId<'static>) -> NodeIndex {
        self.task_lookup.get(task_id).copied().unwrap_or_else(|| {
            let index = self.task_graph.add_node(TaskNode::Task(task_id.clone()));
            self.task_lookup.insert(task_id.clone(), index);
            index
        })
    }

    pub(crate) fn connect_to_root(&mut self, task_id: &TaskId<'static>) {
        let source = self.get_index(task_id);
        self.task_graph.add_edge(source, self.root_index, DepKind::Strong);
    }

    pub(crate) fn add_edge(&mut self, from: NodeIndex, to: NodeIndex, kind: DepKind) {
        if from == to {
            return;
        }
        let exists = self
            .task_graph
            .edges_connecting(from, to)
            .any(|edge| *edge.weight() == kind || kind == DepKind::Weak);
        if !exists {
            self.task_graph.add_edge(from, to, kind);
        }
    }

    pub(crate) fn add_spec(&mut self, spec: TaskSpec) {
        self.task_specs.insert(spec.id.clone(), spec);
    }

    /// Records a `before` hint: `predecessor` should be dispatched ahead
    /// of `successor` when both are ready at the same time. Hints never
    /// gate readiness and never schedule anything, so they cannot
    /// introduce cycles.
    pub(crate) fn add_start_hint(&mut self, predecessor: NodeIndex, successor: NodeIndex) {
        if predecessor == successor {
            return;
        }
        self.start_hints
            .entry(successor)
            .or_default()
            .insert(predecessor);
    }

    /// Validates acyclicity and seals the graph, precomputing scheduling
    /// priorities.
    pub(crate) fn seal(self) -> Result<Engine<Built>, sail_graph_utils::Error> {
        sail_graph_utils::validate_graph(&self.task_graph)?;

        let levels = sail_graph_utils::levels(&self.task_graph);
        let strong_only = self.strong_subgraph();
        let priorities = self
            .task_graph
            .node_indices()
            .map(|index| {
                // Count transitive strong dependents, excluding the node
                // itself.
                let fanout = sail_graph_utils::transitive_closure(
                    &strong_only,
                    [index],
                    Direction::Incoming,
                )
                .len()
                    - 1;
                (
                    index,
                    TaskPriority {
                        level: levels[&index],
                        strong_fanout: fanout,
                    },
                )
            })
            .collect();

        let Engine {
            task_graph,
            root_index,
            task_lookup,
            task_specs,
            start_hints,
            ..
        } = self;
        Ok(Engine {
            marker: std::marker::PhantomData,
            task_graph,
            root_index,
            task_lookup,
            task_specs,
            priorities,
            start_hints,
        })
    }

    fn strong_subgraph(&self) -> Graph<TaskNode, DepKind> {
        self.task_graph.filter_map(
            |_, node| Some(node.clone()),
            |_, kind| (*kind == DepKind::Strong).then_some(*kind),
        )
    }
}

impl Engine<Built> {
    pub fn len(&self) -> usize {
        self.task_lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.task_lookup.is_empty()
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId<'static>> {
        self.task_lookup.keys()
    }

    pub fn spec(&self, task_id: &TaskId<'static>) -> Option<&TaskSpec> {
        self.task_specs.get(task_id)
    }

    pub fn priority(&self, index: NodeIndex) -> &TaskPriority {
        &self.priorities[&index]
    }

    /// Tasks hinted to start before `index`, if any.
    pub(crate) fn start_hint_predecessors(&self, index: NodeIndex) -> Option<&HashSet<NodeIndex>> {
        self.start_hints.get(&index)
    }

    /// True when a `before` hint orders `predecessor` ahead of
    /// `successor`.
    pub fn starts_before(
        &self,
        predecessor: &TaskId<'static>,
        successor: &TaskId<'static>,
    ) -> bool {
        let (Some(pred_index), Some(succ_index)) = (
            self.task_lookup.get(predecessor),
            self.task_lookup.get(successor),
        ) else {
            return false;
        };
        self.start_hints
            .get(succ_index)
            .is_some_and(|preds| preds.contains(pred_index))
    }

    pub fn node(&self, index: NodeIndex) -> &TaskNode {
        self.task_graph
            .node_weight(index)
            .expect("index came from this graph")
    }

    pub fn level(&self, task_id: &TaskId<'static>) -> Option<u32> {
        let index = self.task_lookup.get(task_id)?;
        Some(self.priorities[index].level)
    }

    /// Direct dependencies of a task, filtered by edge kind.
    pub fn dependencies(
        &self,
        task_id: &TaskId<'static>,
        kind: DepKind,
    ) -> Option<HashSet<&TaskNode>> {
        self.neighbors(task_id, Direction::Outgoing, kind)
    }

    pub fn dependents(
        &self,
        task_id: &TaskId<'static>,
        kind: DepKind,
    ) -> Option<HashSet<&TaskNode>> {
        self.neighbors(task_id, Direction::Incoming, kind)
    }

    /// Strong-dependency task ids of a task (the root node filtered out).
    pub fn strong_dep_ids(&self, task_id: &TaskId<'static>) -> Vec<TaskId<'static>> {
        self.dependencies(task_id, DepKind::Strong)
            .map(|nodes| {
                nodes
                    .into_iter()
                    .filter_map(|node| match node {
                        TaskNode::Task(id) => Some(id.clone()),
                        TaskNode::Root => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn neighbors(
        &self,
        task_id: &TaskId<'static>,
        direction: Direction,
        kind: DepKind,
    ) -> Option<HashSet<&TaskNode>> {
        let index = self.task_lookup.get(task_id)?;
        Some(
            self.task_graph
                .edges_directed(*index, direction)
                .filter(|edge| *edge.weight() == kind)
                .map(|edge| {
                    let target = match direction {
                        Direction::Outgoing => edge.target(),
                        Direction::Incoming => edge.source(),
                    };
                    self.task_graph
                        .node_weight(target)
                        .expect("edge endpoints exist")
                })
                .collect(),
        )
    }

    pub(crate) fn task_graph(&self) -> &Graph<TaskNode, DepKind> {
        &self.task_graph
    }
}
