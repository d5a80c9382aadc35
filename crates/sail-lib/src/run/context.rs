use std::{collections::BTreeMap, sync::Arc};

use camino::{Utf8Path, Utf8PathBuf};
use sail_cache::{FsCache, FsCacheOptions};
use sail_config::SailConfig;
use sail_hash::FileHashCache;
use sail_repo::Workspace;
use sail_workers::{WorkerPool, WorkerPoolConfig};
use tracing::{debug, warn};

use crate::run::{progress::ProgressReporter, summary::ExecutionTracker, RunOpts};

/// Run-wide state shared by every task: the file hash cache, the shared
/// cache handle, the worker pool, the profiler, and the environment
/// snapshot baked into cache keys. Passed explicitly so tests stay
/// hermetic.
pub struct BuildContext {
    pub repo_root: Utf8PathBuf,
    pub file_hashes: FileHashCache,
    pub shared_cache: Option<FsCache>,
    pub workers: Arc<WorkerPool>,
    pub lockfile_hash: String,
    pub node_version: String,
    pub cache_bust_vars: BTreeMap<String, String>,
    pub node_env: Option<String>,
    pub tracker: ExecutionTracker,
    pub progress: ProgressReporter,
}

impl BuildContext {
    pub fn new(
        repo_root: &Utf8Path,
        workspace: &Workspace,
        config: &SailConfig,
        opts: &RunOpts,
    ) -> Self {
        let shared_cache = if config.shared_cache.enabled && !opts.no_cache {
            let dir = shared_cache_dir(repo_root, config);
            match FsCache::new(
                &dir,
                FsCacheOptions {
                    high_water_mark_bytes: config.shared_cache.high_water_mark_bytes,
                    low_water_mark_bytes: config.shared_cache.low_water_mark_bytes,
                    ..FsCacheOptions::default()
                },
            ) {
                Ok(cache) => Some(cache),
                Err(e) => {
                    // Advisory: a broken cache dir means building without
                    // a shared cache, not a failed build.
                    warn!("shared cache unavailable at {dir}: {e}");
                    None
                }
            }
        } else {
            None
        };

        let worker_config = WorkerPoolConfig {
            use_threads: config.worker.use_threads,
            memory_limit_bytes: config.worker.memory_limit_bytes,
            max_count: config.worker.max_count,
            host_command: opts
                .worker_host_command
                .clone()
                .unwrap_or_else(|| vec!["sail-worker-host".to_string()]),
        };

        let lockfile_hash = workspace
            .lockfile
            .as_deref()
            .and_then(|path| match sail_hash::hash_file(path) {
                Ok(hash) => Some(hash),
                Err(e) => {
                    warn!("unable to hash lockfile: {e}");
                    None
                }
            })
            .unwrap_or_default();

        let node_version = detect_node_version();
        debug!(node_version, lockfile_hash, "build context ready");

        BuildContext {
            repo_root: repo_root.to_owned(),
            file_hashes: FileHashCache::new(),
            shared_cache,
            workers: Arc::new(WorkerPool::new(worker_config)),
            lockfile_hash,
            node_version,
            cache_bust_vars: cache_bust_vars(),
            node_env: std::env::var("NODE_ENV").ok(),
            tracker: ExecutionTracker::new(),
            progress: ProgressReporter::new(!opts.quiet),
        }
    }
}

fn shared_cache_dir(repo_root: &Utf8Path, config: &SailConfig) -> Utf8PathBuf {
    if let Ok(dir) = std::env::var("SAIL_CACHE_DIR") {
        if !dir.trim().is_empty() {
            return Utf8PathBuf::from(dir);
        }
    }
    match &config.shared_cache.directory {
        Some(dir) if dir.is_absolute() => dir.clone(),
        Some(dir) => repo_root.join(dir),
        None => repo_root.join(".sail").join("cache"),
    }
}

/// Values of the env vars named in `CACHE_BUST_VARS`, mixed into every
/// cache key.
fn cache_bust_vars() -> BTreeMap<String, String> {
    let Ok(names) = std::env::var("CACHE_BUST_VARS") else {
        return BTreeMap::new();
    };
    names
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| (name.to_string(), std::env::var(name).unwrap_or_default()))
        .collect()
}

/// Node version for the cache key: explicit override, then a probe of the
/// `node` on PATH, then empty. The policy is identical on store and
/// lookup, so the key stays a pure function of its inputs.
fn detect_node_version() -> String {
    if let Ok(version) = std::env::var("SAIL_NODE_VERSION") {
        return version;
    }
    std::process::Command::new("node")
        .arg("--version")
        .output()
        .ok()
        .filter(|output| output.status.success())
        .map(|output| String::from_utf8_lossy(&output.stdout).trim().to_string())
        .unwrap_or_default()
}
