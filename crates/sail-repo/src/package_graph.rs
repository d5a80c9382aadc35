use std::collections::{BTreeMap, HashMap};

use petgraph::{graph::NodeIndex, visit::EdgeRef, Direction, Graph};
use tracing::warn;

use crate::{DependencyStrength, Error, Package};

/// One package in the resolved graph: its dependency edges split by
/// strength and its dependency level (0 for leaves).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageNode {
    pub name: String,
    pub strong_deps: Vec<String>,
    pub weak_deps: Vec<String>,
    pub level: u32,
}

/// The resolved inter-package dependency graph.
///
/// Edges point from a package to the packages it depends on. External
/// dependencies (names absent from the workspace) are skipped; an `accept`
/// predicate can drop individual edges, but packages reached transitively
/// stay in the graph since they are still build-required.
#[derive(Debug)]
pub struct PackageGraph {
    graph: Graph<String, DependencyStrength>,
    nodes: BTreeMap<String, NodeIndex>,
    levels: HashMap<NodeIndex, u32>,
}

impl PackageGraph {
    pub fn build(
        packages: &BTreeMap<String, Package>,
        accept: impl Fn(&Package, &Package) -> bool,
    ) -> Result<Self, Error> {
        let mut graph = Graph::new();
        let mut nodes = BTreeMap::new();
        for name in packages.keys() {
            nodes.insert(name.clone(), graph.add_node(name.clone()));
        }

        for (name, package) in packages {
            let from = nodes[name];
            for (dep_name, range, strength) in package.declared_dependencies() {
                let Some(dep) = packages.get(dep_name) else {
                    // External dependency, resolved by the package manager.
                    continue;
                };
                if !accept(package, dep) {
                    continue;
                }
                check_version_range(package, dep, range);
                graph.add_edge(from, nodes[dep_name], strength);
            }
        }

        sail_graph_utils::validate_graph(&graph)?;
        let levels = sail_graph_utils::levels(&graph);

        Ok(PackageGraph {
            graph,
            nodes,
            levels,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn package_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn level(&self, name: &str) -> Option<u32> {
        let index = self.nodes.get(name)?;
        self.levels.get(index).copied()
    }

    pub fn node(&self, name: &str) -> Option<PackageNode> {
        let index = *self.nodes.get(name)?;
        Some(PackageNode {
            name: name.to_string(),
            strong_deps: self.deps_of(index, DependencyStrength::Strong),
            weak_deps: self.deps_of(index, DependencyStrength::Weak),
            level: self.levels[&index],
        })
    }

    /// Names of packages `name` strongly depends on (prod + peer).
    pub fn strong_dependencies(&self, name: &str) -> Vec<String> {
        self.nodes
            .get(name)
            .map(|index| self.deps_of(*index, DependencyStrength::Strong))
            .unwrap_or_default()
    }

    /// Names of packages `name` weakly depends on (dev).
    pub fn weak_dependencies(&self, name: &str) -> Vec<String> {
        self.nodes
            .get(name)
            .map(|index| self.deps_of(*index, DependencyStrength::Weak))
            .unwrap_or_default()
    }

    fn deps_of(&self, index: NodeIndex, strength: DependencyStrength) -> Vec<String> {
        let mut deps: Vec<String> = self
            .graph
            .edges_directed(index, Direction::Outgoing)
            .filter(|edge| *edge.weight() == strength)
            .map(|edge| self.graph[edge.target()].clone())
            .collect();
        deps.sort();
        deps.dedup();
        deps
    }
}

/// The declared range must admit the workspace copy of the dependency.
/// `workspace:` protocol ranges and ranges semver cannot parse are accepted
/// as-is; a resolvable mismatch is reported as a warning.
fn check_version_range(package: &Package, dep: &Package, range: &str) {
    if range.starts_with("workspace:") {
        return;
    }
    let (Ok(req), Ok(version)) = (
        semver::VersionReq::parse(range),
        semver::Version::parse(&dep.version),
    ) else {
        return;
    };
    if !req.matches(&version) {
        warn!(
            "{} depends on {}@{range} but the workspace contains {}@{}",
            package.name, dep.name, dep.name, dep.version
        );
    }
}
