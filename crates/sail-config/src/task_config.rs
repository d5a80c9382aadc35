use std::collections::BTreeMap;

use sail_task_id::TaskName;

use crate::{Error, RawTaskConfig};

/// Prefix marking a dependency on the named task in every strong upstream
/// package (`^build`), rather than in the same package.
pub const TOPOLOGICAL_PREFIX: &str = "^";

/// A weak ordering reference from `before`/`after`. Unlike `dependsOn`
/// entries these never cause scheduling; `^*` is permitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeakRef {
    /// True for `^name`/`^*`: resolve against strong upstream packages.
    pub topological: bool,
    pub name: TaskName<'static>,
}

impl WeakRef {
    fn parse(entry: &str) -> Self {
        match entry.strip_prefix(TOPOLOGICAL_PREFIX) {
            Some(rest) => WeakRef {
                topological: true,
                name: TaskName::from(rest).into_owned(),
            },
            None => WeakRef {
                topological: false,
                name: TaskName::from(entry).into_owned(),
            },
        }
    }
}

/// The validated rule governing one named task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskConfig {
    /// Same-package or `pkg#task` dependencies, plus the `*` wildcard.
    pub task_dependencies: Vec<TaskName<'static>>,
    /// `^task` dependencies, resolved against strong upstream packages.
    pub topological_dependencies: Vec<TaskName<'static>>,
    pub before: Vec<WeakRef>,
    pub after: Vec<WeakRef>,
    /// Member task names for group tasks.
    pub children: Vec<String>,
    /// Whether this task runs a package.json script (true) or is purely a
    /// grouping node (false).
    pub script: bool,
    /// Declared input globs relative to the package directory.
    pub inputs: Vec<String>,
    /// Declared output globs relative to the package directory.
    pub outputs: Vec<String>,
    raw: RawTaskConfig,
}

impl TaskConfig {
    pub fn from_raw(name: &str, raw: RawTaskConfig) -> Result<Self, Error> {
        let script = raw.script.unwrap_or(true);
        let children = raw.children.clone().unwrap_or_default();
        if !script && children.is_empty() {
            return Err(Error::DegenerateTask {
                task: name.to_string(),
            });
        }

        let mut task_dependencies = Vec::new();
        let mut topological_dependencies = Vec::new();
        for entry in raw.depends_on.iter().flatten() {
            match entry.strip_prefix(TOPOLOGICAL_PREFIX) {
                Some("*") => {
                    return Err(Error::TopologicalWildcardDependsOn {
                        task: name.to_string(),
                    })
                }
                Some(rest) => {
                    topological_dependencies.push(TaskName::from(rest).into_owned());
                }
                None => task_dependencies.push(TaskName::from(entry.as_str()).into_owned()),
            }
        }
        task_dependencies.sort();
        topological_dependencies.sort();

        let before = raw
            .before
            .iter()
            .flatten()
            .map(|entry| WeakRef::parse(entry))
            .collect();
        let after = raw
            .after
            .iter()
            .flatten()
            .map(|entry| WeakRef::parse(entry))
            .collect();

        Ok(TaskConfig {
            task_dependencies,
            topological_dependencies,
            before,
            after,
            children,
            script,
            inputs: raw.inputs.clone().unwrap_or_default(),
            outputs: raw.outputs.clone().unwrap_or_default(),
            raw,
        })
    }

    /// Applies an overlay entry on top of this one. Overlays may override
    /// the dependency fields only; `script`, `children`, and the declared
    /// input/output globs always come from the base definition.
    fn overlaid_with(&self, name: &str, overlay: &TaskConfig) -> TaskConfig {
        let merged = RawTaskConfig {
            depends_on: overlay
                .raw
                .depends_on
                .clone()
                .or_else(|| self.raw.depends_on.clone()),
            before: overlay.raw.before.clone().or_else(|| self.raw.before.clone()),
            after: overlay.raw.after.clone().or_else(|| self.raw.after.clone()),
            children: self.raw.children.clone(),
            script: self.raw.script,
            inputs: self.raw.inputs.clone(),
            outputs: self.raw.outputs.clone(),
        };
        TaskConfig::from_raw(name, merged)
            .expect("overlay fields were validated when the overlay was loaded")
    }
}

/// A task table: the global `sail.json` table, or the result of applying a
/// package overlay to it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskTable {
    tasks: BTreeMap<String, TaskConfig>,
}

impl TaskTable {
    pub fn from_raw(raw: BTreeMap<String, RawTaskConfig>) -> Result<Self, Error> {
        let mut tasks = BTreeMap::new();
        for (name, raw_task) in raw {
            let config = TaskConfig::from_raw(&name, raw_task)?;
            tasks.insert(name, config);
        }
        Ok(TaskTable { tasks })
    }

    pub fn get(&self, name: &str) -> Option<&TaskConfig> {
        self.tasks.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TaskConfig)> {
        self.tasks.iter().map(|(name, config)| (name.as_str(), config))
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// The overlay may add tasks or override `dependsOn`/`before`/`after`
    /// of existing ones.
    pub fn with_overlay(&self, overlay: &TaskTable) -> TaskTable {
        let mut tasks = self.tasks.clone();
        for (name, overlay_task) in &overlay.tasks {
            let merged = match self.tasks.get(name) {
                Some(base) => base.overlaid_with(name, overlay_task),
                None => overlay_task.clone(),
            };
            tasks.insert(name.clone(), merged);
        }
        TaskTable { tasks }
    }
}
