//! Per-task timing records and the end-of-build summary: totals by
//! category, cache hit ratios, and the critical path through strong
//! dependencies.

use std::{
    collections::HashMap,
    fmt::Write as _,
    sync::Mutex,
    time::Instant,
};

use sail_task_id::TaskId;
use serde::Serialize;

use crate::engine::{Built, Engine};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskResultKind {
    Built,
    UpToDateLocal,
    RestoredFromShared,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskTiming {
    pub id: String,
    pub enqueue_ms: u64,
    pub start_ms: u64,
    pub end_ms: u64,
    pub result: TaskResultKind,
    pub bytes_cached: u64,
    pub output_file_count: usize,
}

impl TaskTiming {
    fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }
}

/// One failed task, kept for the end-of-build report.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub id: String,
    pub command: String,
    pub cwd: String,
    pub exit_code: i32,
    pub output_tail: String,
}

/// Collects task transitions during a build. Interior mutability because
/// many task futures report concurrently.
pub struct ExecutionTracker {
    origin: Instant,
    records: Mutex<HashMap<String, TaskTiming>>,
    failures: Mutex<Vec<TaskFailure>>,
}

impl Default for ExecutionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionTracker {
    pub fn new() -> Self {
        ExecutionTracker {
            origin: Instant::now(),
            records: Mutex::new(HashMap::new()),
            failures: Mutex::new(Vec::new()),
        }
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    pub fn enqueued(&self, id: &TaskId<'_>) {
        let now = self.now_ms();
        let mut records = self.records.lock().expect("tracker poisoned");
        records.insert(
            id.to_string(),
            TaskTiming {
                id: id.to_string(),
                enqueue_ms: now,
                start_ms: now,
                end_ms: now,
                result: TaskResultKind::Skipped,
                bytes_cached: 0,
                output_file_count: 0,
            },
        );
    }

    pub fn started(&self, id: &TaskId<'_>) {
        let now = self.now_ms();
        let mut records = self.records.lock().expect("tracker poisoned");
        if let Some(record) = records.get_mut(&id.to_string()) {
            record.start_ms = now;
        }
    }

    pub fn finished(
        &self,
        id: &TaskId<'_>,
        result: TaskResultKind,
        bytes_cached: u64,
        output_file_count: usize,
    ) {
        let now = self.now_ms();
        let mut records = self.records.lock().expect("tracker poisoned");
        if let Some(record) = records.get_mut(&id.to_string()) {
            record.end_ms = now;
            record.result = result;
            record.bytes_cached = bytes_cached;
            record.output_file_count = output_file_count;
        }
    }

    pub fn record_failure(&self, failure: TaskFailure) {
        self.failures.lock().expect("tracker poisoned").push(failure);
    }

    pub fn failures(&self) -> Vec<TaskFailure> {
        self.failures.lock().expect("tracker poisoned").clone()
    }

    pub fn summarize(&self, engine: &Engine<Built>) -> ExecutionSummary {
        let records = self.records.lock().expect("tracker poisoned").clone();
        let wall_ms = self.now_ms();

        let mut counts = Counts::default();
        let mut cpu_ms = 0u64;
        for record in records.values() {
            match record.result {
                TaskResultKind::Built => counts.built += 1,
                TaskResultKind::UpToDateLocal => counts.up_to_date += 1,
                TaskResultKind::RestoredFromShared => counts.restored += 1,
                TaskResultKind::Failed => counts.failed += 1,
                TaskResultKind::Skipped => counts.skipped += 1,
            }
            cpu_ms += record.duration_ms();
        }

        let (critical_path, critical_path_ms) = critical_path(engine, &records);
        ExecutionSummary {
            counts,
            wall_ms,
            cpu_ms,
            critical_path,
            critical_path_ms,
            timings: {
                let mut timings: Vec<TaskTiming> = records.into_values().collect();
                timings.sort_by(|a, b| a.id.cmp(&b.id));
                timings
            },
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub built: usize,
    pub up_to_date: usize,
    pub restored: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl Counts {
    pub fn total(&self) -> usize {
        self.built + self.up_to_date + self.restored + self.failed + self.skipped
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub counts: Counts,
    pub wall_ms: u64,
    pub cpu_ms: u64,
    pub critical_path: Vec<String>,
    pub critical_path_ms: u64,
    pub timings: Vec<TaskTiming>,
}

impl ExecutionSummary {
    pub fn render(&self) -> String {
        let c = self.counts;
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Tasks: {} total ({} built, {} up to date, {} restored from shared cache, {} skipped, {} failed)",
            c.total(),
            c.built,
            c.up_to_date,
            c.restored,
            c.skipped,
            c.failed
        );
        let _ = writeln!(
            out,
            "Time:  {} wall, {} task time",
            format_ms(self.wall_ms),
            format_ms(self.cpu_ms)
        );
        let executed_and_hits = c.built + c.up_to_date + c.restored;
        if executed_and_hits > 0 {
            let _ = writeln!(
                out,
                "Cache: {}/{executed_and_hits} donefile hits, {}/{executed_and_hits} shared hits, {} executed",
                c.up_to_date, c.restored, c.built
            );
        }
        if !self.critical_path.is_empty() {
            let _ = writeln!(
                out,
                "Critical path ({}): {}",
                format_ms(self.critical_path_ms),
                self.critical_path.join(" -> ")
            );
        }
        out
    }
}

fn format_ms(ms: u64) -> String {
    if ms >= 1000 {
        format!("{:.2}s", ms as f64 / 1000.0)
    } else {
        format!("{ms}ms")
    }
}

/// Longest successful chain through strong dependencies, weighted by task
/// duration.
fn critical_path(
    engine: &Engine<Built>,
    records: &HashMap<String, TaskTiming>,
) -> (Vec<String>, u64) {
    fn visit(
        engine: &Engine<Built>,
        records: &HashMap<String, TaskTiming>,
        id: &TaskId<'static>,
        memo: &mut HashMap<String, (Vec<String>, u64)>,
    ) -> (Vec<String>, u64) {
        let name = id.to_string();
        if let Some(result) = memo.get(&name) {
            return result.clone();
        }
        let own = records
            .get(&name)
            .filter(|r| {
                matches!(
                    r.result,
                    TaskResultKind::Built
                        | TaskResultKind::UpToDateLocal
                        | TaskResultKind::RestoredFromShared
                )
            })
            .map(|r| r.duration_ms())
            .unwrap_or(0);
        let best_dep = engine
            .strong_dep_ids(id)
            .into_iter()
            .map(|dep| visit(engine, records, &dep, memo))
            .max_by_key(|(_, ms)| *ms)
            .unwrap_or((Vec::new(), 0));
        let mut path = best_dep.0;
        path.push(name.clone());
        let result = (path, own + best_dep.1);
        memo.insert(name, result.clone());
        result
    }

    let mut memo = HashMap::new();
    engine
        .task_ids()
        .map(|id| visit(engine, records, id, &mut memo))
        .max_by_key(|(_, ms)| *ms)
        .unwrap_or((Vec::new(), 0))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_render_contains_totals() {
        let summary = ExecutionSummary {
            counts: Counts {
                built: 2,
                up_to_date: 3,
                restored: 1,
                failed: 1,
                skipped: 1,
            },
            wall_ms: 1500,
            cpu_ms: 2750,
            critical_path: vec!["lib#build".into(), "app#build".into()],
            critical_path_ms: 1100,
            timings: vec![],
        };
        let text = summary.render();
        assert!(text.contains("8 total"), "{text}");
        assert!(text.contains("2 built"), "{text}");
        assert!(text.contains("1.50s wall"), "{text}");
        assert!(text.contains("lib#build -> app#build"), "{text}");
    }

    #[test]
    fn test_tracker_lifecycle() {
        let tracker = ExecutionTracker::new();
        let id = TaskId::new("pkg", "build");
        tracker.enqueued(&id);
        tracker.started(&id);
        tracker.finished(&id, TaskResultKind::Built, 10, 2);

        let records = tracker.records.lock().unwrap();
        let record = records.get("pkg#build").unwrap();
        assert_eq!(record.result, TaskResultKind::Built);
        assert_eq!(record.bytes_cached, 10);
        assert_eq!(record.output_file_count, 2);
        assert!(record.end_ms >= record.start_ms);
    }
}
