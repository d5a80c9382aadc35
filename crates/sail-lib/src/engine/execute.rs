use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashSet},
    sync::Arc,
};

use futures::{stream::FuturesUnordered, StreamExt};
use petgraph::graph::NodeIndex;
use sail_graph_utils::Walker;
use sail_task_id::TaskId;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::{Built, Engine, TaskNode};

/// A unit of work handed to the visitor, with the callback it must answer
/// once the task reaches a terminal state.
pub struct Message<T, U> {
    pub info: T,
    pub callback: oneshot::Sender<U>,
}

impl<T, U> Message<T, U> {
    pub fn new(info: T) -> (Self, oneshot::Receiver<U>) {
        let (callback, receiver) = oneshot::channel();
        (Self { info, callback }, receiver)
    }
}

/// Returned by the visitor to stop scheduling new tasks (bail mode).
/// Running tasks are left to finish.
#[derive(Debug, Clone, Copy)]
pub struct StopExecution;

pub type VisitorMessage = Message<TaskId<'static>, Result<(), StopExecution>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOptions {
    pub concurrency: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("visitor closed its channel before the walk finished")]
    Visitor,
}

/// A ready task waiting for a concurrency slot. Max-heap ordering puts
/// the preferred task on top: lower level first, then larger strong
/// fan-out, then lexicographic `package#task`. The stable order keeps
/// identical inputs producing identical schedules.
struct ReadyTask {
    level: u32,
    strong_fanout: usize,
    name: String,
    index: NodeIndex,
    id: TaskId<'static>,
    done: oneshot::Sender<()>,
}

impl PartialEq for ReadyTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for ReadyTask {}
impl PartialOrd for ReadyTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ReadyTask {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .level
            .cmp(&self.level)
            .then(self.strong_fanout.cmp(&other.strong_fanout))
            .then_with(|| other.name.cmp(&self.name))
    }
}

impl Engine<Built> {
    /// Drives the graph walk, dispatching ready tasks to the visitor with
    /// at most `concurrency` in flight. The visitor owns all task-level
    /// error handling; returning `StopExecution` through the callback
    /// stops new dispatches while running tasks drain.
    pub async fn execute(
        self: Arc<Self>,
        options: ExecutionOptions,
        visitor: mpsc::Sender<VisitorMessage>,
    ) -> Result<(), ExecuteError> {
        let (mut walk_handle, mut nodes) = Walker::new(self.task_graph()).walk();
        let mut ready: BinaryHeap<ReadyTask> = BinaryHeap::new();
        let mut ready_set: HashSet<NodeIndex> = HashSet::new();
        let mut running: FuturesUnordered<tokio::task::JoinHandle<Result<bool, ExecuteError>>> =
            FuturesUnordered::new();
        let mut available = options.concurrency.max(1);
        let mut walker_done = false;

        loop {
            while available > 0 {
                let Some(task) = pop_ready(&self, &mut ready, &ready_set) else {
                    break;
                };
                ready_set.remove(&task.index);
                available -= 1;
                let visitor = visitor.clone();
                running.push(tokio::spawn(dispatch(task, visitor)));
            }

            tokio::select! {
                message = nodes.recv(), if !walker_done => match message {
                    Some((index, done)) => match self.node(index) {
                        TaskNode::Root => {
                            // Nothing to do for the root sentinel.
                            done.send(()).ok();
                        }
                        TaskNode::Task(id) => {
                            let priority = self.priority(index);
                            ready_set.insert(index);
                            ready.push(ReadyTask {
                                level: priority.level,
                                strong_fanout: priority.strong_fanout,
                                name: id.to_string(),
                                index,
                                id: id.clone(),
                                done,
                            });
                        }
                    },
                    None => walker_done = true,
                },
                Some(result) = running.next() => {
                    available += 1;
                    let stop = result.expect("task dispatch panicked")?;
                    if stop && walk_handle.cancel().is_err() {
                        debug!("walker already finished when cancel was requested");
                    }
                },
                else => break,
            }
        }

        walk_handle.wait().await.expect("walker task panicked");
        Ok(())
    }
}

/// Pops the preferred ready task, honoring `before` hints: a task whose
/// hinted predecessor is itself ready and waiting is deferred so the
/// predecessor starts first. The hint gates nothing else; a predecessor
/// that is not ready (still running its dependencies, unscheduled, or
/// already dispatched) is simply not waited for, and contradictory hints
/// fall back to plain priority order instead of deadlocking.
fn pop_ready(
    engine: &Engine<Built>,
    ready: &mut BinaryHeap<ReadyTask>,
    ready_set: &HashSet<NodeIndex>,
) -> Option<ReadyTask> {
    let mut deferred = Vec::new();
    let mut picked = None;
    while let Some(task) = ready.pop() {
        let wait_for_predecessor = engine
            .start_hint_predecessors(task.index)
            .is_some_and(|preds| {
                preds
                    .iter()
                    .any(|pred| *pred != task.index && ready_set.contains(pred))
            });
        if wait_for_predecessor {
            deferred.push(task);
        } else {
            picked = Some(task);
            break;
        }
    }
    ready.extend(deferred);
    picked.or_else(|| ready.pop())
}

async fn dispatch(
    task: ReadyTask,
    visitor: mpsc::Sender<VisitorMessage>,
) -> Result<bool, ExecuteError> {
    let ReadyTask { id, done, .. } = task;
    let (message, callback) = Message::new(id);
    visitor.send(message).await.map_err(|_| ExecuteError::Visitor)?;
    let result = callback.await.unwrap_or_else(|_| {
        // A dropped callback counts as completed so one sloppy visitor
        // iteration cannot hang the build.
        debug!("visitor dropped callback without sending a result");
        Ok(())
    });
    // Only now are this task's dependents released.
    if done.send(()).is_err() {
        debug!("walker stopped before task completion was observed");
    }
    Ok(result.is_err())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_ready_ordering() {
        let (done_a, _rx_a) = oneshot::channel();
        let (done_b, _rx_b) = oneshot::channel();
        let (done_c, _rx_c) = oneshot::channel();
        let mut heap = BinaryHeap::new();
        heap.push(ReadyTask {
            level: 2,
            strong_fanout: 10,
            name: "zzz#build".into(),
            index: NodeIndex::new(0),
            id: TaskId::new("zzz", "build").into_owned(),
            done: done_a,
        });
        heap.push(ReadyTask {
            level: 1,
            strong_fanout: 0,
            name: "mmm#build".into(),
            index: NodeIndex::new(1),
            id: TaskId::new("mmm", "build").into_owned(),
            done: done_b,
        });
        heap.push(ReadyTask {
            level: 1,
            strong_fanout: 3,
            name: "aaa#build".into(),
            index: NodeIndex::new(2),
            id: TaskId::new("aaa", "build").into_owned(),
            done: done_c,
        });

        // Lowest level wins; within a level, larger fan-out wins.
        assert_eq!(heap.pop().unwrap().name, "aaa#build");
        assert_eq!(heap.pop().unwrap().name, "mmm#build");
        assert_eq!(heap.pop().unwrap().name, "zzz#build");
    }

    #[test]
    fn test_name_breaks_exact_ties() {
        let mut heap = BinaryHeap::new();
        for (i, name) in ["b#t", "a#t", "c#t"].into_iter().enumerate() {
            let (done, _rx) = oneshot::channel();
            heap.push(ReadyTask {
                level: 0,
                strong_fanout: 0,
                name: name.into(),
                index: NodeIndex::new(i),
                id: TaskId::try_from(name).unwrap(),
                done,
            });
        }
        assert_eq!(heap.pop().unwrap().name, "a#t");
        assert_eq!(heap.pop().unwrap().name, "b#t");
        assert_eq!(heap.pop().unwrap().name, "c#t");
    }

    use crate::engine::Building;

    fn hint_fixture(
        hints: &[(usize, usize)],
    ) -> (Engine<Built>, Vec<TaskId<'static>>, Vec<NodeIndex>) {
        let mut engine = Engine::<Building>::new();
        let ids = vec![
            TaskId::new("web", "codegen").into_owned(),
            TaskId::new("web", "build").into_owned(),
        ];
        let indices: Vec<NodeIndex> = ids.iter().map(|id| engine.get_index(id)).collect();
        for id in &ids {
            engine.connect_to_root(id);
        }
        for (pred, succ) in hints {
            engine.add_start_hint(indices[*pred], indices[*succ]);
        }
        (engine.seal().unwrap(), ids, indices)
    }

    fn ready_heap(
        engine: &Engine<Built>,
        ids: &[TaskId<'static>],
        indices: &[NodeIndex],
    ) -> (BinaryHeap<ReadyTask>, HashSet<NodeIndex>) {
        let mut heap = BinaryHeap::new();
        for (id, index) in ids.iter().zip(indices) {
            let (done, _rx) = oneshot::channel();
            let priority = engine.priority(*index);
            heap.push(ReadyTask {
                level: priority.level,
                strong_fanout: priority.strong_fanout,
                name: id.to_string(),
                index: *index,
                id: id.clone(),
                done,
            });
        }
        (heap, indices.iter().copied().collect())
    }

    #[test]
    fn test_before_hint_defers_ready_successor() {
        // codegen before build: without the hint, "web#build" wins the
        // lexicographic tie-break.
        let (engine, ids, indices) = hint_fixture(&[(0, 1)]);
        let (mut heap, mut ready_set) = ready_heap(&engine, &ids, &indices);

        let first = pop_ready(&engine, &mut heap, &ready_set).unwrap();
        assert_eq!(first.name, "web#codegen");
        ready_set.remove(&first.index);
        let second = pop_ready(&engine, &mut heap, &ready_set).unwrap();
        assert_eq!(second.name, "web#build");
    }

    #[test]
    fn test_hint_ignored_when_predecessor_not_ready() {
        let (engine, ids, indices) = hint_fixture(&[(0, 1)]);
        let (mut heap, mut ready_set) = ready_heap(&engine, &ids, &indices);
        // The predecessor is not in the ready set (e.g. still blocked on
        // its own dependencies); the successor must not wait for it.
        ready_set.remove(&indices[0]);
        heap.retain(|task| task.index != indices[0]);

        let first = pop_ready(&engine, &mut heap, &ready_set).unwrap();
        assert_eq!(first.name, "web#build");
    }

    #[test]
    fn test_contradictory_hints_do_not_deadlock() {
        let (engine, ids, indices) = hint_fixture(&[(0, 1), (1, 0)]);
        let (mut heap, mut ready_set) = ready_heap(&engine, &ids, &indices);

        // Both defer on each other; plain priority order wins.
        let first = pop_ready(&engine, &mut heap, &ready_set).unwrap();
        assert_eq!(first.name, "web#build");
        ready_set.remove(&first.index);
        assert!(pop_ready(&engine, &mut heap, &ready_set).is_some());
    }
}
