//! `sail.json` configuration.
//!
//! The raw serde model ([`RawSailJson`]) mirrors the on-disk format; the
//! validated model ([`SailConfig`]) is what the rest of the engine
//! consumes. The repo-root file carries the global task table plus engine
//! options; per-package `sail.json` files may overlay the task table.

mod raw;
mod task_config;

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
pub use raw::{RawSailJson, RawSharedCacheOptions, RawTaskConfig, RawWorkerOptions};
pub use task_config::{TaskConfig, TaskTable, WeakRef, TOPOLOGICAL_PREFIX};

/// The only on-disk schema version currently understood.
pub const CONFIG_VERSION: u32 = 1;

pub const CONFIG_FILE: &str = "sail.json";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to read {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
    #[error("unable to parse {path}: {source}")]
    InvalidJson {
        path: Utf8PathBuf,
        source: serde_json::Error,
    },
    #[error("{path}: \"version\" is required")]
    MissingVersion { path: Utf8PathBuf },
    #[error("{path}: unsupported config version {found} (expected {CONFIG_VERSION})")]
    UnsupportedVersion { path: Utf8PathBuf, found: u32 },
    #[error("task \"{task}\" has script: false but no children; nothing would run")]
    DegenerateTask { task: String },
    #[error("task \"{task}\": \"^*\" is only valid in before/after, not dependsOn")]
    TopologicalWildcardDependsOn { task: String },
}

/// Shared-cache options with defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedCacheConfig {
    pub enabled: bool,
    pub directory: Option<Utf8PathBuf>,
    pub high_water_mark_bytes: u64,
    pub low_water_mark_bytes: u64,
}

impl Default for SharedCacheConfig {
    fn default() -> Self {
        SharedCacheConfig {
            enabled: true,
            directory: None,
            // 10 GiB / 8 GiB, matching a comfortably sized local artifact
            // cache.
            high_water_mark_bytes: 10 * 1024 * 1024 * 1024,
            low_water_mark_bytes: 8 * 1024 * 1024 * 1024,
        }
    }
}

/// Worker-pool options with defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub use_threads: bool,
    pub memory_limit_bytes: Option<u64>,
    pub max_count: Option<usize>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            use_threads: true,
            memory_limit_bytes: None,
            max_count: None,
        }
    }
}

/// Validated configuration for one build invocation.
#[derive(Debug, Clone, Default)]
pub struct SailConfig {
    pub tasks: TaskTable,
    /// Tool-specific blocks forwarded opaquely to the matching task type.
    pub declarative_tasks: BTreeMap<String, serde_json::Value>,
    pub shared_cache: SharedCacheConfig,
    pub worker: WorkerConfig,
    pub concurrency: Option<usize>,
    pub bail_on_failure: bool,
}

impl SailConfig {
    /// Loads and validates the repo-root `sail.json`.
    pub fn load(repo_root: &Utf8Path) -> Result<Self, Error> {
        let path = repo_root.join(CONFIG_FILE);
        let raw = RawSailJson::load(&path)?;

        let version = raw.version.ok_or_else(|| Error::MissingVersion {
            path: path.clone(),
        })?;
        if version != CONFIG_VERSION {
            return Err(Error::UnsupportedVersion {
                path,
                found: version,
            });
        }

        let tasks = TaskTable::from_raw(raw.tasks)?;
        let shared_defaults = SharedCacheConfig::default();
        let shared_cache = SharedCacheConfig {
            enabled: raw.shared_cache.enabled.unwrap_or(shared_defaults.enabled),
            directory: raw.shared_cache.directory,
            high_water_mark_bytes: raw
                .shared_cache
                .high_water_mark_bytes
                .unwrap_or(shared_defaults.high_water_mark_bytes),
            low_water_mark_bytes: raw
                .shared_cache
                .low_water_mark_bytes
                .unwrap_or(shared_defaults.low_water_mark_bytes),
        };
        let worker_defaults = WorkerConfig::default();
        let worker = WorkerConfig {
            use_threads: raw.worker.use_threads.unwrap_or(worker_defaults.use_threads),
            memory_limit_bytes: raw.worker.memory_limit_mb.map(|mb| mb * 1024 * 1024),
            max_count: raw.worker.max_count,
        };

        Ok(SailConfig {
            tasks,
            declarative_tasks: raw.declarative_tasks,
            shared_cache,
            worker,
            concurrency: raw.concurrency,
            bail_on_failure: raw.bail_on_failure.unwrap_or(false),
        })
    }

    /// Loads the optional per-package overlay (`<pkgDir>/sail.json`). Only
    /// the task table is honored there; engine options are root-only.
    pub fn load_package_overlay(package_dir: &Utf8Path) -> Result<Option<TaskTable>, Error> {
        let path = package_dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = RawSailJson::load(&path)?;
        Ok(Some(TaskTable::from_raw(raw.tasks)?))
    }

    /// The effective task table for one package: the global table with the
    /// package overlay applied on top.
    pub fn tasks_for_package(&self, overlay: Option<&TaskTable>) -> TaskTable {
        match overlay {
            Some(overlay) => self.tasks.with_overlay(overlay),
            None => self.tasks.clone(),
        }
    }
}
