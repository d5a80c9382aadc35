//! Workspace loading and the package dependency graph.
//!
//! A workspace is a set of packages discovered from the root
//! `package.json`'s `workspaces` globs. [`PackageGraph`] resolves the
//! inter-package dependency edges, assigns dependency levels, and rejects
//! cycles.

mod discovery;
mod package_graph;
mod package_json;

use camino::Utf8PathBuf;
pub use discovery::{discover_workspace, Workspace};
pub use package_graph::{PackageGraph, PackageNode};
pub use package_json::PackageJson;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to read {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
    #[error("unable to parse {path}: {source}")]
    InvalidPackageJson {
        path: Utf8PathBuf,
        source: serde_json::Error,
    },
    #[error("package.json at {path} has no name")]
    MissingName { path: Utf8PathBuf },
    #[error("duplicate package name {name} ({first} and {second})")]
    DuplicatePackage {
        name: String,
        first: Utf8PathBuf,
        second: Utf8PathBuf,
    },
    #[error("workspace path is not valid UTF-8: {0}")]
    NonUtf8Path(String),
    #[error(transparent)]
    Graph(#[from] sail_graph_utils::Error),
}

/// Dependencies either force scheduling of the upstream package's tasks
/// (prod and peer dependencies) or merely order against them when both are
/// scheduled (dev dependencies).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyStrength {
    Strong,
    Weak,
}

/// A compilation unit: one package directory with its scripts and declared
/// dependencies. Immutable for the duration of a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub name: String,
    pub version: String,
    /// Directory of the package, relative to the workspace root.
    pub dir: Utf8PathBuf,
    pub scripts: std::collections::BTreeMap<String, String>,
    pub dependencies: std::collections::BTreeMap<String, String>,
    pub dev_dependencies: std::collections::BTreeMap<String, String>,
    pub peer_dependencies: std::collections::BTreeMap<String, String>,
}

impl Package {
    pub fn from_package_json(dir: Utf8PathBuf, json: PackageJson) -> Result<Self, Error> {
        let name = json.name.ok_or(Error::MissingName {
            path: dir.join("package.json"),
        })?;
        Ok(Package {
            name,
            version: json.version.unwrap_or_else(|| "0.0.0".to_string()),
            dir,
            scripts: json.scripts,
            dependencies: json.dependencies,
            dev_dependencies: json.dev_dependencies,
            peer_dependencies: json.peer_dependencies,
        })
    }

    pub fn script(&self, name: &str) -> Option<&str> {
        self.scripts.get(name).map(String::as_str)
    }

    /// All declared dependencies with their strength. Prod and peer
    /// dependencies are strong; dev dependencies are weak. A name declared
    /// in both buckets resolves to strong.
    pub fn declared_dependencies(
        &self,
    ) -> impl Iterator<Item = (&str, &str, DependencyStrength)> + '_ {
        let strong = self
            .dependencies
            .iter()
            .chain(self.peer_dependencies.iter())
            .map(|(name, range)| (name.as_str(), range.as_str(), DependencyStrength::Strong));
        let weak = self
            .dev_dependencies
            .iter()
            .filter(|(name, _)| {
                !self.dependencies.contains_key(*name) && !self.peer_dependencies.contains_key(*name)
            })
            .map(|(name, range)| (name.as_str(), range.as_str(), DependencyStrength::Weak));
        strong.chain(weak)
    }
}
