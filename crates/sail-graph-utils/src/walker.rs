use std::{collections::HashMap, hash::Hash};

use futures::{future::join_all, stream::FuturesUnordered, StreamExt};
use petgraph::{
    visit::{IntoNeighborsDirected, IntoNodeIdentifiers},
    Direction,
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::trace;

/// A node emitted by the walker together with the callback that marks it as
/// processed. Dependents are not released until the callback fires.
pub type WalkMessage<N> = (N, oneshot::Sender<()>);

/// Walks a DAG, emitting each node only after every node it depends on
/// (outgoing edges) has been marked done by the caller.
///
/// The graph must not be mutated while a walk is in progress; node ids are
/// captured at construction time.
pub struct Walker<N> {
    node_events: mpsc::Receiver<WalkMessage<N>>,
    handle: WalkHandle,
}

/// Control handle for an in-progress walk.
pub struct WalkHandle {
    cancel: watch::Sender<bool>,
    join_handles: FuturesUnordered<JoinHandle<()>>,
}

impl<N: Eq + Hash + Copy + Send + 'static> Walker<N> {
    pub fn new<G: IntoNodeIdentifiers<NodeId = N> + IntoNeighborsDirected>(graph: G) -> Self {
        let (cancel, cancel_rx) = watch::channel(false);

        // One single-shot broadcast channel per node announces its completion
        // to every dependent.
        let mut finish_txs = HashMap::new();
        let mut finish_rxs = HashMap::new();
        for node in graph.node_identifiers() {
            let (tx, rx) = broadcast::channel::<()>(1);
            finish_txs.insert(node, tx);
            finish_rxs.insert(node, rx);
        }

        // Every node is emitted at most once, so a buffer of node-count can
        // never block. The channel constructor requires capacity >= 1.
        let (node_tx, node_rx) = mpsc::channel(std::cmp::max(finish_txs.len(), 1));
        let join_handles = FuturesUnordered::new();

        for node in graph.node_identifiers() {
            let finish_tx = finish_txs
                .remove(&node)
                .expect("every node has a finish channel");
            let mut cancel_rx = cancel_rx.clone();
            let node_tx = node_tx.clone();
            let mut dep_rxs = graph
                .neighbors_directed(node, Direction::Outgoing)
                .map(|dep| {
                    finish_rxs
                        .get(&dep)
                        .expect("every node has a finish channel")
                        .resubscribe()
                })
                .collect::<Vec<_>>();

            join_handles.push(tokio::spawn(async move {
                let deps_done = join_all(dep_rxs.iter_mut().map(|rx| rx.recv()));

                tokio::select! {
                    // Prefer cancellation over emitting one more node when
                    // both futures are ready.
                    biased;
                    _ = cancel_rx.changed() => {
                        // Either cancel() was called or the handle was
                        // dropped; both mean stop.
                    }
                    results = deps_done => {
                        for result in results {
                            match result {
                                Ok(()) => (),
                                // A dependency task exited without announcing
                                // completion, which only happens on a racing
                                // cancel. Treat it as a cancel.
                                Err(broadcast::error::RecvError::Closed) => return,
                                Err(broadcast::error::RecvError::Lagged(n)) => {
                                    // Nodes finish exactly once; the message
                                    // is unit so it is safe to continue.
                                    trace!("node finished {n} more times than expected");
                                }
                            }
                        }

                        let (done_tx, done_rx) = oneshot::channel::<()>();
                        if node_tx.send((node, done_tx)).await.is_err() {
                            trace!("walk receiver dropped before walk finished");
                            return;
                        }
                        if done_rx.await.is_err() {
                            // A dropped callback counts as done so a sloppy
                            // caller cannot wedge the walk.
                            trace!("done callback dropped without a signal");
                        }
                        // A send error just means this node has no dependents
                        // subscribed.
                        finish_tx.send(()).ok();
                    }
                }
            }));
        }
        debug_assert!(finish_txs.is_empty());

        Self {
            node_events: node_rx,
            handle: WalkHandle {
                cancel,
                join_handles,
            },
        }
    }

    /// Starts the walk, returning the control handle and the stream of ready
    /// nodes.
    pub fn walk(self) -> (WalkHandle, mpsc::Receiver<WalkMessage<N>>) {
        (self.handle, self.node_events)
    }
}

impl WalkHandle {
    /// Stops emitting new nodes. Nodes already queued may still be
    /// delivered.
    pub fn cancel(&mut self) -> Result<(), watch::error::SendError<bool>> {
        self.cancel.send(true)
    }

    /// Waits for every per-node task to wind down. Mostly useful after
    /// cancellation.
    pub async fn wait(self) -> Result<(), tokio::task::JoinError> {
        let Self {
            mut join_handles, ..
        } = self;
        while let Some(result) = join_handles.next().await {
            result?;
        }
        Ok(())
    }
}
