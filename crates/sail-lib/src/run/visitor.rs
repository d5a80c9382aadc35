use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use camino::Utf8PathBuf;
use futures::{stream::FuturesUnordered, StreamExt};
use sail_cache::{CacheKey, CacheKeyInputs, InputHash};
use sail_task_id::TaskId;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    engine::{Built, Engine, ExecuteError, ExecutionOptions, StopExecution},
    run::{
        context::BuildContext,
        done_file,
        progress::symbol,
        summary::{TaskFailure, TaskResultKind},
    },
    task::{LeafSpec, TaskSpec, TaskState, TaskVariant},
};

const OUTPUT_TAIL_LINES: usize = 20;

/// Drives every scheduled task through the two-tier cache flow. Holds
/// the whole world for one run.
pub struct Visitor {
    ctx: Arc<BuildContext>,
    engine: Arc<Engine<Built>>,
    states: Mutex<HashMap<TaskId<'static>, TaskState>>,
    bail: bool,
    force: bool,
    /// Root tasks the user asked to re-run even when caches are warm.
    execute_roots: HashSet<TaskId<'static>>,
    task_timeout: Option<Duration>,
    cancelled: Arc<AtomicBool>,
}

impl Visitor {
    pub fn new(
        ctx: Arc<BuildContext>,
        engine: Arc<Engine<Built>>,
        bail: bool,
        force: bool,
        execute_roots: HashSet<TaskId<'static>>,
        task_timeout: Option<Duration>,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        let states = engine
            .task_ids()
            .map(|id| (id.clone(), TaskState::Pending))
            .collect();
        Visitor {
            ctx,
            engine,
            states: Mutex::new(states),
            bail,
            force,
            execute_roots,
            task_timeout,
            cancelled,
        }
    }

    pub fn state(&self, id: &TaskId<'static>) -> Option<TaskState> {
        self.states.lock().expect("states poisoned").get(id).copied()
    }

    fn set_state(&self, id: &TaskId<'static>, state: TaskState) {
        self.states
            .lock()
            .expect("states poisoned")
            .insert(id.clone(), state);
    }

    /// Runs the whole graph. Task-level failures are recorded in the
    /// tracker, not returned; the error case is infrastructure only.
    pub async fn visit(self: &Arc<Self>, concurrency: usize) -> Result<(), ExecuteError> {
        let (node_sender, mut node_stream) = mpsc::channel(concurrency.max(1));
        let engine_handle = tokio::spawn(
            self.engine
                .clone()
                .execute(ExecutionOptions { concurrency }, node_sender),
        );

        let mut tasks = FuturesUnordered::new();
        while let Some(message) = node_stream.recv().await {
            let crate::engine::Message { info, callback } = message;
            let this = self.clone();
            tasks.push(tokio::spawn(async move {
                let result = this.process(info).await;
                // An unreceivable callback means execution is over;
                // nothing left to notify.
                callback.send(result).ok();
            }));
        }

        engine_handle.await.expect("engine execution panicked")?;
        while let Some(result) = tasks.next().await {
            result.expect("task future panicked");
        }
        Ok(())
    }

    async fn process(&self, id: TaskId<'static>) -> Result<(), StopExecution> {
        let Some(spec) = self.engine.spec(&id) else {
            // Only the root sentinel lacks a spec, and it is filtered out
            // before dispatch.
            return Ok(());
        };
        // Only leaf tasks show up in timings and progress; groups are
        // bookkeeping nodes.
        if spec.is_leaf() {
            self.ctx.tracker.enqueued(&id);
        }

        if self.cancelled.load(Ordering::SeqCst) {
            self.set_state(&id, TaskState::Skipped);
            self.ctx.tracker.finished(&id, TaskResultKind::Skipped, 0, 0);
            return Err(StopExecution);
        }

        // A failed or skipped strong dependency skips this task. Weak
        // dependencies only order, they never propagate failure.
        let failed_dep = self
            .engine
            .strong_dep_ids(&id)
            .iter()
            .any(|dep| !self.state(dep).is_some_and(|s| s.is_success_like()));
        if failed_dep {
            self.set_state(&id, TaskState::Skipped);
            if spec.is_leaf() {
                self.ctx.tracker.finished(&id, TaskResultKind::Skipped, 0, 0);
                self.ctx.progress.report(symbol::SKIPPED, &id, "skipped");
            }
            return Ok(());
        }

        match &spec.variant {
            TaskVariant::Group { .. } => {
                // Group tasks fan out only; completion of the children is
                // completion of the group.
                self.set_state(&id, TaskState::Success);
                Ok(())
            }
            TaskVariant::Leaf(leaf) => {
                let leaf = leaf.clone();
                let spec = spec.clone();
                self.run_leaf(id, spec, leaf).await
            }
        }
    }

    async fn run_leaf(
        &self,
        id: TaskId<'static>,
        spec: TaskSpec,
        leaf: LeafSpec,
    ) -> Result<(), StopExecution> {
        self.set_state(&id, TaskState::Running);
        self.ctx.tracker.started(&id);
        let started = Instant::now();

        let done_path = done_file::done_file_path(&self.ctx.repo_root, &spec);
        let input_hashes = self.hash_inputs(&spec).await;
        let upstream_done = self.upstream_done_contents(&id);
        let expected_hash = match done_file::expected_hash(input_hashes.clone(), upstream_done.clone())
        {
            Ok(hash) => Some(hash),
            Err(e) => {
                warn!("unable to compute donefile hash for {id}: {e}");
                None
            }
        };

        let use_caches = !self.force && !self.execute_roots.contains(&id);

        // Tier one: the donefile. A matching donefile only counts when
        // the outputs it vouches for are still on disk; outputs deleted
        // out from under a donefile fall through to the shared cache.
        if use_caches {
            if let Some(expected) = &expected_hash {
                if done_file::read(&done_path).as_deref() == Some(expected.as_str()) {
                    let outputs_present = !spec.expects_outputs()
                        || !spec.compute_output_files(&self.ctx.repo_root).is_empty();
                    if outputs_present {
                        self.set_state(&id, TaskState::UpToDateLocal);
                        self.ctx
                            .tracker
                            .finished(&id, TaskResultKind::UpToDateLocal, 0, 0);
                        self.ctx.progress.report(symbol::UP_TO_DATE, &id, "");
                        return Ok(());
                    }
                }
            }
        }

        // Tier two: the shared cache. Key computation happens even when
        // lookups are disabled so a forced rebuild still refreshes the
        // cache afterwards.
        let cache_key = self.cache_key(&spec, &leaf, input_hashes, upstream_done);
        if use_caches {
            if let (Some(cache), Some(key)) = (&self.ctx.shared_cache, &cache_key) {
                match cache.lookup(key) {
                    Ok(Some(manifest)) => match cache.restore(&self.ctx.repo_root, &manifest) {
                        Ok(restored) => {
                            if let Some(expected) = &expected_hash {
                                if let Err(e) = done_file::write(&done_path, expected) {
                                    warn!("unable to write donefile for {id}: {e}");
                                }
                            }
                            let bytes: u64 = restored.iter().map(|f| f.bytes).sum();
                            self.set_state(&id, TaskState::RestoredFromShared);
                            self.ctx.tracker.finished(
                                &id,
                                TaskResultKind::RestoredFromShared,
                                bytes,
                                restored.len(),
                            );
                            self.ctx.progress.report(symbol::SHARED_HIT, &id, "");
                            return Ok(());
                        }
                        Err(e) => warn!("shared cache restore failed for {id}: {e}"),
                    },
                    Ok(None) => (),
                    Err(e) => warn!("shared cache lookup failed for {id}: {e}"),
                }
            }
        }

        // Execute.
        let cwd = self.ctx.repo_root.join(&spec.package_dir);
        let worker_name = leaf.tool.worker_name().unwrap_or("shell");
        let job = self
            .ctx
            .workers
            .run_on_worker(worker_name, &leaf.command, cwd.as_str());
        let outcome = match self.task_timeout {
            Some(deadline) => match tokio::time::timeout(deadline, job).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return self.fail(
                        &id,
                        &leaf,
                        &cwd,
                        -1,
                        format!("task exceeded its {}s deadline", deadline.as_secs()),
                    );
                }
            },
            None => job.await,
        };

        let output = match outcome {
            Ok(output) => output,
            Err(e) => {
                // Worker crashes convert to task failures; the pool has
                // already discarded the worker.
                return self.fail(&id, &leaf, &cwd, -1, format!("worker error: {e}"));
            }
        };
        if !output.success() {
            let mut tail = tail_lines(&output.stdout, &output.stderr);
            if tail.is_empty() {
                tail = format!("exited with code {}", output.code);
            }
            return self.fail(&id, &leaf, &cwd, output.code, tail);
        }

        // Success: enumerate outputs, write the donefile, refresh the
        // shared cache.
        let outputs = spec.compute_output_files(&self.ctx.repo_root);
        let final_hash = self.final_done_hash(&id, &spec);
        if let Some(hash) = &final_hash {
            if let Err(e) = done_file::write(&done_path, hash) {
                warn!("unable to write donefile for {id}: {e}");
            }
        }

        let mut bytes_stored = 0;
        if let (Some(cache), Some(key)) = (&self.ctx.shared_cache, &cache_key) {
            if !outputs.is_empty() {
                let repo_relative: Vec<Utf8PathBuf> = outputs
                    .iter()
                    .map(|rel| spec.package_dir.join(rel))
                    .collect();
                let duration_ms = started.elapsed().as_millis() as u64;
                match cache.store(&self.ctx.repo_root, key, &repo_relative, duration_ms) {
                    Ok(bytes) => {
                        bytes_stored = bytes;
                        self.ctx.progress.report(symbol::SHARED_STORE, &id, "");
                    }
                    Err(e) => warn!("shared cache store failed for {id}: {e}"),
                }
            }
        }

        self.set_state(&id, TaskState::Success);
        self.ctx
            .tracker
            .finished(&id, TaskResultKind::Built, bytes_stored, outputs.len());
        self.ctx.progress.report(symbol::BUILT, &id, "");
        Ok(())
    }

    fn fail(
        &self,
        id: &TaskId<'static>,
        leaf: &LeafSpec,
        cwd: &Utf8PathBuf,
        exit_code: i32,
        output_tail: String,
    ) -> Result<(), StopExecution> {
        self.set_state(id, TaskState::Failed);
        self.ctx.tracker.record_failure(TaskFailure {
            id: id.to_string(),
            command: leaf.command.clone(),
            cwd: cwd.to_string(),
            exit_code,
            output_tail,
        });
        self.ctx.tracker.finished(id, TaskResultKind::Failed, 0, 0);
        self.ctx
            .progress
            .report(symbol::FAILED, id, &format!("(exit {exit_code})"));
        if self.bail {
            Err(StopExecution)
        } else {
            Ok(())
        }
    }

    /// Hashes the task's input files. Inputs that vanish between the walk
    /// and the hash are skipped; the next build re-walks anyway.
    async fn hash_inputs(&self, spec: &TaskSpec) -> Vec<InputHash> {
        let inputs = {
            let spec = spec.clone();
            let repo_root = self.ctx.repo_root.clone();
            tokio::task::spawn_blocking(move || spec.compute_input_files(&repo_root))
                .await
                .expect("input walk panicked")
        };
        self.hash_rel_paths(spec, inputs)
    }

    fn hash_rel_paths(&self, spec: &TaskSpec, inputs: Vec<Utf8PathBuf>) -> Vec<InputHash> {
        let mut hashes = Vec::with_capacity(inputs.len());
        for rel in inputs {
            let abs = self.ctx.repo_root.join(&spec.package_dir).join(&rel);
            match self.ctx.file_hashes.hash(&abs) {
                Ok(sha256) => hashes.push(InputHash {
                    repo_relative_path: spec.package_dir.join(&rel).to_string(),
                    sha256,
                }),
                Err(e) => debug!("skipping unhashable input {abs}: {e}"),
            }
        }
        hashes
    }

    /// Donefile contents of the leaf tasks this task strongly depends on,
    /// looking through group nodes to their members.
    fn upstream_done_contents(&self, id: &TaskId<'static>) -> Vec<String> {
        let mut contents = Vec::new();
        let mut stack = self.engine.strong_dep_ids(id);
        let mut seen: HashSet<TaskId<'static>> = stack.iter().cloned().collect();
        while let Some(dep) = stack.pop() {
            let Some(spec) = self.engine.spec(&dep) else {
                continue;
            };
            match &spec.variant {
                TaskVariant::Leaf(_) => {
                    let path = done_file::done_file_path(&self.ctx.repo_root, spec);
                    if let Some(hash) = done_file::read(&path) {
                        contents.push(hash);
                    }
                }
                TaskVariant::Group { .. } => {
                    for child in self.engine.strong_dep_ids(&dep) {
                        if seen.insert(child.clone()) {
                            stack.push(child);
                        }
                    }
                }
            }
        }
        contents
    }

    /// Recomputes the donefile hash after execution: the stat-validated
    /// file hash cache makes this cheap, and it catches inputs the task
    /// itself rewrote while running.
    fn final_done_hash(&self, id: &TaskId<'static>, spec: &TaskSpec) -> Option<String> {
        let inputs = spec.compute_input_files(&self.ctx.repo_root);
        let hashes = self.hash_rel_paths(spec, inputs);
        match done_file::expected_hash(hashes, self.upstream_done_contents(id)) {
            Ok(hash) => Some(hash),
            Err(e) => {
                warn!("unable to compute donefile hash for {id}: {e}");
                None
            }
        }
    }

    fn cache_key(
        &self,
        spec: &TaskSpec,
        leaf: &LeafSpec,
        input_hashes: Vec<InputHash>,
        dependency_hashes: Vec<String>,
    ) -> Option<CacheKey> {
        let config_hashes = leaf
            .declarative
            .iter()
            .filter_map(|value| sail_hash::hash_canonical(value).ok())
            .collect();
        let inputs = CacheKeyInputs::new(
            spec.id.package(),
            spec.id.task(),
            leaf.tool.name(),
            &leaf.command,
            input_hashes,
            self.ctx.lockfile_hash.clone(),
            dependency_hashes,
            self.ctx.node_version.clone(),
        )
        .with_config_hashes(config_hashes)
        .with_environment(self.ctx.cache_bust_vars.clone(), self.ctx.node_env.clone());
        match inputs.key() {
            Ok(key) => Some(key),
            Err(e) => {
                warn!("unable to compute cache key for {}: {e}", spec.id);
                None
            }
        }
    }
}

fn tail_lines(stdout: &str, stderr: &str) -> String {
    let combined: Vec<&str> = stdout
        .lines()
        .chain(stderr.lines())
        .filter(|line| !line.trim().is_empty())
        .collect();
    let start = combined.len().saturating_sub(OUTPUT_TAIL_LINES);
    combined[start..].join("\n")
}
