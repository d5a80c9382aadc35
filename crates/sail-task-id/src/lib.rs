//! Task identifier types.
//!
//! A `TaskId` pins a task to a package (`pkg#build`), while a `TaskName` is a
//! reference appearing in configuration which may or may not carry a package
//! qualifier (`build`, `pkg#build`, `*`).

use std::{borrow::Cow, fmt};

use serde::{Deserialize, Serialize};

pub const TASK_DELIMITER: &str = "#";

/// A task name as it appears in `sail.json`: either a bare task
/// (`"build"`), a package-qualified task (`"pkg#build"`), or the wildcard
/// (`"*"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskName<'a> {
    package: Option<Cow<'a, str>>,
    task: Cow<'a, str>,
}

/// A task instantiated for a concrete package.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId<'a> {
    package: Cow<'a, str>,
    task: Cow<'a, str>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
#[error("'{input}' is not a package task (package#task)")]
pub struct ParseError {
    input: String,
}

impl<'a> TaskId<'a> {
    pub fn new(package: &'a str, task: &'a str) -> Self {
        TaskId {
            package: package.into(),
            task: task.split_once(TASK_DELIMITER).map_or(task, |(_, t)| t).into(),
        }
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn into_owned(self) -> TaskId<'static> {
        let TaskId { package, task } = self;
        TaskId {
            package: package.into_owned().into(),
            task: task.into_owned().into(),
        }
    }

    pub fn as_task_name(&self) -> TaskName<'_> {
        TaskName {
            package: Some(self.package.as_ref().into()),
            task: self.task.as_ref().into(),
        }
    }

    /// Task name without the package qualifier, used to look up definitions
    /// in the task table.
    pub fn as_non_workspace_task_name(&self) -> TaskName<'_> {
        TaskName {
            package: None,
            task: self.task.as_ref().into(),
        }
    }
}

impl TryFrom<&str> for TaskId<'static> {
    type Error = ParseError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.split_once(TASK_DELIMITER) {
            Some((package, task)) if !package.is_empty() && !task.is_empty() => Ok(TaskId {
                package: package.to_string().into(),
                task: task.to_string().into(),
            }),
            _ => Err(ParseError {
                input: value.to_string(),
            }),
        }
    }
}

impl<'a> TaskName<'a> {
    pub fn package(&self) -> Option<&str> {
        self.package.as_deref()
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn is_package_task(&self) -> bool {
        self.package.is_some()
    }

    /// The wildcard `*` refers to every other task of the same package.
    pub fn is_wildcard(&self) -> bool {
        self.package.is_none() && self.task == "*"
    }

    /// Returns the concrete `TaskId` if this name is package-qualified.
    pub fn task_id(&self) -> Option<TaskId<'static>> {
        let package = self.package.as_deref()?;
        Some(TaskId {
            package: package.to_string().into(),
            task: self.task.to_string().into(),
        })
    }

    pub fn into_owned(self) -> TaskName<'static> {
        let TaskName { package, task } = self;
        TaskName {
            package: package.map(|p| Cow::from(p.into_owned())),
            task: task.into_owned().into(),
        }
    }

    pub fn into_non_workspace_task(self) -> TaskName<'a> {
        TaskName {
            package: None,
            task: self.task,
        }
    }
}

impl<'a> From<&'a str> for TaskName<'a> {
    fn from(value: &'a str) -> Self {
        match value.split_once(TASK_DELIMITER) {
            Some((package, task)) if !package.is_empty() => TaskName {
                package: Some(package.into()),
                task: task.into(),
            },
            _ => TaskName {
                package: None,
                task: value.into(),
            },
        }
    }
}

impl From<String> for TaskName<'static> {
    fn from(value: String) -> Self {
        TaskName::from(value.as_str()).into_owned()
    }
}

impl fmt::Display for TaskId<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{TASK_DELIMITER}{}", self.package, self.task)
    }
}

impl fmt::Display for TaskName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.package {
            Some(package) => write!(f, "{package}{TASK_DELIMITER}{}", self.task),
            None => f.write_str(&self.task),
        }
    }
}

impl Serialize for TaskId<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TaskId<'static> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        TaskId::try_from(value.as_str()).map_err(serde::de::Error::custom)
    }
}
