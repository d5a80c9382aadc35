use std::collections::{HashMap, HashSet, VecDeque};

use sail_config::{SailConfig, TaskConfig, TaskTable, WeakRef};
use sail_repo::{Package, PackageGraph, Workspace};
use sail_task_id::{TaskId, TaskName};
use tracing::debug;

use crate::{
    engine::{Building, Built, DepKind, Engine},
    task::{LeafSpec, TaskSpec, TaskVariant, Tool},
};

#[derive(Debug, thiserror::Error)]
pub enum BuilderError {
    #[error(transparent)]
    Config(#[from] sail_config::Error),
    #[error("task \"{task}\" depends on unknown package \"{package}\"")]
    MissingPackage { package: String, task: String },
    #[error("could not find task \"{task}\" in any package")]
    MissingTaskDefinition { task: String },
    #[error(transparent)]
    Graph(#[from] sail_graph_utils::Error),
}

/// Builds the scheduled task graph for one invocation: the requested
/// tasks of the entry packages plus the transitive strong closure, with
/// weak edges bound afterwards restricted to the scheduled set.
pub struct EngineBuilder<'a> {
    config: &'a SailConfig,
    workspace: &'a Workspace,
    package_graph: &'a PackageGraph,
    tasks: Vec<TaskName<'static>>,
    packages: Vec<String>,
}

impl<'a> EngineBuilder<'a> {
    pub fn new(
        config: &'a SailConfig,
        workspace: &'a Workspace,
        package_graph: &'a PackageGraph,
    ) -> Self {
        Self {
            config,
            workspace,
            package_graph,
            tasks: Vec::new(),
            packages: Vec::new(),
        }
    }

    pub fn with_tasks<I: IntoIterator<Item = TaskName<'static>>>(mut self, tasks: I) -> Self {
        self.tasks = tasks.into_iter().collect();
        self
    }

    /// Entry packages; tasks of other packages are only scheduled when
    /// reached through dependencies.
    pub fn with_packages(mut self, packages: Vec<String>) -> Self {
        self.packages = packages;
        self
    }

    pub fn build(self) -> Result<Engine<Built>, BuilderError> {
        let mut engine = Engine::<Building>::new();
        if self.tasks.is_empty() || self.packages.is_empty() {
            return Ok(engine.seal()?);
        }

        // The effective task table per package: global table + overlay.
        let mut tables: HashMap<String, TaskTable> = HashMap::new();
        for (name, package) in &self.workspace.packages {
            let overlay =
                SailConfig::load_package_overlay(&self.workspace.root.join(&package.dir))?;
            tables.insert(name.clone(), self.config.tasks_for_package(overlay.as_ref()));
        }

        self.check_requested_tasks(&tables)?;

        let mut queue: VecDeque<TaskId<'static>> = VecDeque::new();
        for task in &self.tasks {
            match task.package() {
                Some(package) => {
                    // Explicitly qualified requests bypass the package
                    // filter.
                    let Some(pkg) = self.workspace.package(package) else {
                        return Err(BuilderError::MissingPackage {
                            package: package.to_string(),
                            task: task.to_string(),
                        });
                    };
                    if task_exists(pkg, &tables[package], task.task()) {
                        queue.push_back(TaskId::new(package, task.task()).into_owned());
                    }
                }
                None => {
                    for package in &self.packages {
                        let pkg = self
                            .workspace
                            .package(package)
                            .expect("entry packages come from the workspace");
                        if task_exists(pkg, &tables[package], task.task()) {
                            queue.push_back(TaskId::new(package, task.task()).into_owned());
                        }
                    }
                }
            }
        }

        let mut visited: HashSet<TaskId<'static>> = HashSet::new();
        while let Some(task_id) = queue.pop_front() {
            if !visited.insert(task_id.clone()) {
                continue;
            }
            let package = self
                .workspace
                .package(task_id.package())
                .expect("queued tasks belong to workspace packages");
            let table = &tables[task_id.package()];
            let entry = table
                .get(task_id.task())
                .expect("queued tasks have table entries");

            let declarative = self.config.declarative_tasks.get(task_id.task()).cloned();
            engine.add_spec(make_spec(package, table, &task_id, entry, declarative));
            let to_index = engine.get_index(&task_id);
            let mut has_deps = false;

            // Group children run as strong dependencies of the group node.
            for child in &entry.children {
                if task_exists(package, table, child) {
                    let child_id = TaskId::new(task_id.package(), child).into_owned();
                    let child_index = engine.get_index(&child_id);
                    engine.add_edge(to_index, child_index, DepKind::Strong);
                    queue.push_back(child_id);
                    has_deps = true;
                }
            }

            // `^name`: the task in every strong upstream package.
            for dep_package in self.package_graph.strong_dependencies(task_id.package()) {
                let dep_pkg = self
                    .workspace
                    .package(&dep_package)
                    .expect("package graph only contains workspace packages");
                for dep_task in &entry.topological_dependencies {
                    if task_exists(dep_pkg, &tables[&dep_package], dep_task.task()) {
                        let dep_id = TaskId::new(&dep_package, dep_task.task()).into_owned();
                        let dep_index = engine.get_index(&dep_id);
                        engine.add_edge(to_index, dep_index, DepKind::Strong);
                        queue.push_back(dep_id);
                        has_deps = true;
                    }
                }
            }

            for dep_task in &entry.task_dependencies {
                if dep_task.is_wildcard() {
                    // `*`: every other task of this package.
                    for other in table.task_names() {
                        if other != task_id.task() && task_exists(package, table, other) {
                            let dep_id = TaskId::new(task_id.package(), other).into_owned();
                            let dep_index = engine.get_index(&dep_id);
                            engine.add_edge(to_index, dep_index, DepKind::Strong);
                            queue.push_back(dep_id);
                            has_deps = true;
                        }
                    }
                    continue;
                }
                let dep_package = dep_task.package().unwrap_or(task_id.package());
                let Some(dep_pkg) = self.workspace.package(dep_package) else {
                    return Err(BuilderError::MissingPackage {
                        package: dep_package.to_string(),
                        task: task_id.to_string(),
                    });
                };
                if task_exists(dep_pkg, &tables[dep_package], dep_task.task()) {
                    let dep_id = TaskId::new(dep_package, dep_task.task()).into_owned();
                    let dep_index = engine.get_index(&dep_id);
                    engine.add_edge(to_index, dep_index, DepKind::Strong);
                    queue.push_back(dep_id);
                    has_deps = true;
                }
            }

            if !has_deps {
                engine.connect_to_root(&task_id);
            }
        }

        // Weak references bind only between tasks that made it into the
        // scheduled set; they never schedule. `after` holds the task
        // until the predecessor is terminal, so it becomes a graph edge.
        // `before` only promises start-before-start, so it becomes a
        // dispatch-order hint rather than an edge; an edge would make
        // the target wait for the predecessor to finish and could even
        // manufacture a cycle out of two hints.
        for task_id in &visited {
            let entry = tables[task_id.package()]
                .get(task_id.task())
                .expect("scheduled tasks have table entries");
            let from_index = engine.get_index(task_id);
            for weak in &entry.after {
                for target in self.resolve_weak(task_id, weak, &visited) {
                    let target_index = engine.get_index(&target);
                    engine.add_edge(from_index, target_index, DepKind::Weak);
                }
            }
            for weak in &entry.before {
                for target in self.resolve_weak(task_id, weak, &visited) {
                    let target_index = engine.get_index(&target);
                    engine.add_start_hint(from_index, target_index);
                }
            }
        }

        debug!(tasks = visited.len(), "built task graph");
        Ok(engine.seal()?)
    }

    /// Weak references resolve to scheduled tasks only.
    fn resolve_weak(
        &self,
        task_id: &TaskId<'static>,
        weak: &WeakRef,
        scheduled: &HashSet<TaskId<'static>>,
    ) -> Vec<TaskId<'static>> {
        let mut targets = Vec::new();
        if weak.topological {
            for dep_package in self.package_graph.strong_dependencies(task_id.package()) {
                if weak.name.is_wildcard() || weak.name.task() == "*" {
                    targets.extend(
                        scheduled
                            .iter()
                            .filter(|id| id.package() == dep_package)
                            .cloned(),
                    );
                } else {
                    let candidate = TaskId::new(&dep_package, weak.name.task()).into_owned();
                    if scheduled.contains(&candidate) {
                        targets.push(candidate);
                    }
                }
            }
        } else if weak.name.is_wildcard() {
            targets.extend(
                scheduled
                    .iter()
                    .filter(|id| id.package() == task_id.package() && *id != task_id)
                    .cloned(),
            );
        } else {
            let package = weak.name.package().unwrap_or(task_id.package());
            let candidate = TaskId::new(package, weak.name.task()).into_owned();
            if scheduled.contains(&candidate) && candidate != *task_id {
                targets.push(candidate);
            }
        }
        targets
    }

    /// Every requested task name must be defined somewhere, otherwise the
    /// request is a typo and the build refuses to silently do nothing.
    fn check_requested_tasks(
        &self,
        tables: &HashMap<String, TaskTable>,
    ) -> Result<(), BuilderError> {
        for task in &self.tasks {
            let defined = match task.package() {
                Some(package) => tables
                    .get(package)
                    .is_some_and(|table| table.contains(task.task())),
                None => tables.values().any(|table| table.contains(task.task())),
            };
            if !defined {
                return Err(BuilderError::MissingTaskDefinition {
                    task: task.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// A task exists for a package when its config entry is present and it
/// either is a grouping node or has a matching package.json script. A
/// scriptful entry with no script is silently dropped for that package.
fn task_exists(package: &Package, table: &TaskTable, name: &str) -> bool {
    let Some(entry) = table.get(name) else {
        return false;
    };
    if !entry.children.is_empty() {
        return true;
    }
    entry.script && package.script(name).is_some()
}

fn make_spec(
    package: &Package,
    table: &TaskTable,
    task_id: &TaskId<'static>,
    entry: &TaskConfig,
    declarative: Option<serde_json::Value>,
) -> TaskSpec {
    let variant = if !entry.children.is_empty() {
        TaskVariant::Group {
            children: entry
                .children
                .iter()
                .filter(|child| task_exists(package, table, child))
                .map(|child| TaskId::new(task_id.package(), child).into_owned())
                .collect(),
        }
    } else {
        let command = package
            .script(task_id.task())
            .expect("leaf tasks exist only with a script")
            .to_string();
        let tool = Tool::infer(&command);
        TaskVariant::Leaf(LeafSpec {
            command,
            tool,
            declared_inputs: entry.inputs.clone(),
            declared_outputs: entry.outputs.clone(),
            declarative,
        })
    };
    TaskSpec {
        id: task_id.clone(),
        package_dir: package.dir.clone(),
        variant,
    }
}
