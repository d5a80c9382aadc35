//! Utilities layered on top of `petgraph` for dependency graphs where an
//! edge `A -> B` means "A depends on B".
//!
//! Provides cycle detection with a readable cycle path, dependency level
//! assignment, transitive closure, and an async [`Walker`] that emits nodes
//! once their dependencies have completed.

mod walker;

use std::{
    collections::{HashMap, HashSet},
    fmt::Display,
    hash::Hash,
};

use itertools::Itertools;
use petgraph::{
    graph::NodeIndex,
    prelude::*,
    visit::{depth_first_search, DfsEvent, Reversed},
    Direction,
};
use thiserror::Error;
pub use walker::{WalkHandle, WalkMessage, Walker};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Cyclic dependency detected: {cycle_path}")]
    CyclicDependencies { cycle_path: String },
    #[error("{0} depends on itself")]
    SelfDependency(String),
}

/// Checks a dependency graph for cycles (including self edges). The error
/// names one path through each cycle so the user can see what to break.
pub fn validate_graph<N: Display, E>(graph: &Graph<N, E>) -> Result<(), Error> {
    for edge in graph.edge_references() {
        if edge.source() == edge.target() {
            let node = graph
                .node_weight(edge.source())
                .expect("edge endpoints exist in graph");
            return Err(Error::SelfDependency(node.to_string()));
        }
    }

    let cycles: Vec<Vec<NodeIndex>> = petgraph::algo::tarjan_scc(graph)
        .into_iter()
        .filter(|scc| scc.len() > 1)
        .collect();
    if cycles.is_empty() {
        return Ok(());
    }

    let cycle_path = cycles
        .into_iter()
        .map(|nodes| {
            let first = nodes[0];
            nodes
                .into_iter()
                .chain(std::iter::once(first))
                .map(|idx| graph.node_weight(idx).unwrap().to_string())
                .join(" -> ")
        })
        .join("; ");
    Err(Error::CyclicDependencies { cycle_path })
}

/// Assigns each node its dependency level: 0 for nodes with no outgoing
/// edges, otherwise `1 + max(level of dependencies)`.
///
/// The graph must be acyclic; call [`validate_graph`] first.
pub fn levels<N, E>(graph: &Graph<N, E>) -> HashMap<NodeIndex, u32> {
    let order = petgraph::algo::toposort(graph, None)
        .expect("levels called on graph containing a cycle");

    let mut levels = HashMap::with_capacity(order.len());
    // Topological order puts dependents before dependencies, so walk it
    // backwards to have every dependency's level available.
    for index in order.into_iter().rev() {
        let level = graph
            .neighbors_directed(index, Direction::Outgoing)
            .map(|dep| levels[&dep] + 1)
            .max()
            .unwrap_or(0);
        levels.insert(index, level);
    }
    levels
}

/// Collects all nodes reachable from `indices` in the given direction,
/// including the starting nodes themselves.
pub fn transitive_closure<N: Hash + Eq, E, I: IntoIterator<Item = NodeIndex>>(
    graph: &Graph<N, E>,
    indices: I,
    direction: Direction,
) -> HashSet<NodeIndex> {
    let mut visited = HashSet::new();
    let visitor = |event| {
        if let DfsEvent::Discover(n, _) = event {
            visited.insert(n);
        }
    };

    match direction {
        Direction::Outgoing => depth_first_search(graph, indices, visitor),
        Direction::Incoming => depth_first_search(Reversed(graph), indices, visitor),
    }

    visited
}

#[cfg(test)]
mod test {
    use super::*;

    fn diamond() -> (Graph<&'static str, ()>, [NodeIndex; 4]) {
        // top depends on left and right, both depend on base
        let mut g = Graph::new();
        let base = g.add_node("base");
        let left = g.add_node("left");
        let right = g.add_node("right");
        let top = g.add_node("top");
        g.add_edge(left, base, ());
        g.add_edge(right, base, ());
        g.add_edge(top, left, ());
        g.add_edge(top, right, ());
        (g, [base, left, right, top])
    }

    #[test]
    fn test_cycle_error_names_path() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());
        g.add_edge(c, a, ());

        let err = validate_graph(&g).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Cyclic dependency detected"), "{message}");
        for node in ["a", "b", "c"] {
            assert!(message.contains(node), "{message}");
        }
    }

    #[test]
    fn test_self_dependency() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        g.add_edge(a, a, ());
        assert!(matches!(
            validate_graph(&g),
            Err(Error::SelfDependency(node)) if node == "a"
        ));
    }

    #[test]
    fn test_acyclic_ok() {
        let (g, _) = diamond();
        assert!(validate_graph(&g).is_ok());
    }

    #[test]
    fn test_levels_diamond() {
        let (g, [base, left, right, top]) = diamond();
        let levels = levels(&g);
        assert_eq!(levels[&base], 0);
        assert_eq!(levels[&left], 1);
        assert_eq!(levels[&right], 1);
        assert_eq!(levels[&top], 2);
    }

    #[test]
    fn test_transitive_closure_directions() {
        let (g, [base, left, _right, top]) = diamond();
        let deps = transitive_closure(&g, [left], Direction::Outgoing);
        assert_eq!(deps, HashSet::from([left, base]));

        let dependents = transitive_closure(&g, [left], Direction::Incoming);
        assert_eq!(dependents, HashSet::from([left, top]));
    }
}
