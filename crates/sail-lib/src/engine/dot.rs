use std::io::Write;

use petgraph::visit::EdgeRef;

use super::{Built, DepKind, Engine, TaskNode};

/// Writes the task graph in DOT format. Weak edges render dashed so the
/// ordering-only hints are visually distinct from hard dependencies.
pub fn write_dot(engine: &Engine<Built>, out: &mut impl Write) -> std::io::Result<()> {
    writeln!(out, "digraph sail {{")?;
    writeln!(out, "\trankdir = BT")?;
    let graph = engine.task_graph();
    for index in graph.node_indices() {
        if let TaskNode::Task(id) = &graph[index] {
            writeln!(out, "\t\"{id}\"")?;
        }
    }
    for edge in graph.edge_references() {
        let (source, target) = (&graph[edge.source()], &graph[edge.target()]);
        if matches!(source, TaskNode::Root) || matches!(target, TaskNode::Root) {
            continue;
        }
        let style = match edge.weight() {
            DepKind::Strong => "",
            DepKind::Weak => " [style=dashed]",
        };
        writeln!(out, "\t\"{source}\" -> \"{target}\"{style}")?;
    }
    writeln!(out, "}}")
}
