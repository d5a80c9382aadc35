//! The task model: leaf tasks that run a command and group tasks that fan
//! out to children. Input and output sets come from declared globs when
//! present, otherwise from tool knowledge.

pub mod simple_glob;
mod tool;

use camino::{Utf8Path, Utf8PathBuf};
use sail_task_id::TaskId;
pub use tool::Tool;

use crate::run::done_file;

/// A task state as driven by the scheduler. Only the owning task's
/// execution logic and the scheduler transition edge mutate this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    /// Donefile matched; outputs on disk are already current.
    UpToDateLocal,
    /// Outputs restored from the shared cache.
    RestoredFromShared,
    Success,
    Failed,
    Skipped,
}

impl TaskState {
    /// States that satisfy a strong dependency.
    pub fn is_success_like(&self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::UpToDateLocal | TaskState::RestoredFromShared
        )
    }

    pub fn is_terminal(&self) -> bool {
        self.is_success_like() || matches!(self, TaskState::Failed | TaskState::Skipped)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeafSpec {
    pub command: String,
    pub tool: Tool,
    pub declared_inputs: Vec<String>,
    pub declared_outputs: Vec<String>,
    /// The `declarativeTasks` block for this task name, opaque to the
    /// core; its hash participates in the cache key.
    pub declarative: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskVariant {
    Leaf(LeafSpec),
    Group { children: Vec<TaskId<'static>> },
}

/// A task instantiated for one package.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub id: TaskId<'static>,
    /// Package directory relative to the repo root.
    pub package_dir: Utf8PathBuf,
    pub variant: TaskVariant,
}

impl TaskSpec {
    pub fn leaf(&self) -> Option<&LeafSpec> {
        match &self.variant {
            TaskVariant::Leaf(leaf) => Some(leaf),
            TaskVariant::Group { .. } => None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.variant, TaskVariant::Leaf(_))
    }

    fn output_globs(&self, leaf: &LeafSpec) -> Vec<String> {
        if !leaf.declared_outputs.is_empty() {
            return leaf.declared_outputs.clone();
        }
        leaf.tool
            .default_output_globs()
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    /// Whether this task is expected to leave output files behind. Tasks
    /// with no output globs (linters, formatters) legitimately produce
    /// nothing.
    pub fn expects_outputs(&self) -> bool {
        self.leaf()
            .map(|leaf| !self.output_globs(leaf).is_empty())
            .unwrap_or(false)
    }

    /// Enumerates this task's input files, as paths relative to the
    /// package directory. Output locations, node_modules, VCS metadata and
    /// donefiles are never inputs.
    pub fn compute_input_files(&self, repo_root: &Utf8Path) -> Vec<Utf8PathBuf> {
        let Some(leaf) = self.leaf() else {
            return Vec::new();
        };
        let output_globs = self.output_globs(leaf);
        self.walk_package(repo_root, |rel| {
            if simple_glob::any_match(&output_globs, rel.as_str()) {
                return false;
            }
            if leaf.declared_inputs.is_empty() {
                leaf.tool.default_input_filter(rel)
            } else {
                simple_glob::any_match(&leaf.declared_inputs, rel.as_str())
                    || rel.as_str() == "package.json"
            }
        })
    }

    /// Enumerates this task's output files after execution, as paths
    /// relative to the package directory.
    pub fn compute_output_files(&self, repo_root: &Utf8Path) -> Vec<Utf8PathBuf> {
        let Some(leaf) = self.leaf() else {
            return Vec::new();
        };
        let output_globs = self.output_globs(leaf);
        if output_globs.is_empty() {
            return Vec::new();
        }
        self.walk_package(repo_root, |rel| {
            simple_glob::any_match(&output_globs, rel.as_str())
        })
    }

    fn walk_package(
        &self,
        repo_root: &Utf8Path,
        keep: impl Fn(&Utf8Path) -> bool,
    ) -> Vec<Utf8PathBuf> {
        let package_root = repo_root.join(&self.package_dir);
        let mut files = Vec::new();
        let walk = walkdir::WalkDir::new(&package_root)
            .into_iter()
            .filter_entry(|entry| {
                let name = entry.file_name().to_string_lossy();
                name != "node_modules" && name != ".git"
            });
        for entry in walk.filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(path) = Utf8PathBuf::from_path_buf(entry.into_path()) else {
                continue;
            };
            let Ok(rel) = path.strip_prefix(&package_root) else {
                continue;
            };
            if done_file::is_done_file(rel.as_str()) {
                continue;
            }
            if keep(rel) {
                files.push(rel.to_owned());
            }
        }
        files.sort();
        files
    }
}
