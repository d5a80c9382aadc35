use std::sync::atomic::{AtomicUsize, Ordering};

use sail_task_id::TaskId;

/// Symbols for per-task transition lines.
pub mod symbol {
    /// Restored from the shared cache.
    pub const SHARED_HIT: char = '⇩';
    /// Stored into the shared cache.
    pub const SHARED_STORE: char = '⇧';
    /// Donefile matched, outputs already current.
    pub const UP_TO_DATE: char = '■';
    /// Executed successfully.
    pub const BUILT: char = '✓';
    /// Execution failed.
    pub const FAILED: char = '✗';
    /// Not run because an upstream dependency failed.
    pub const SKIPPED: char = '○';
}

/// Emits one monotonically numbered line per task transition.
pub struct ProgressReporter {
    counter: AtomicUsize,
    total: AtomicUsize,
    enabled: bool,
}

impl ProgressReporter {
    pub fn new(enabled: bool) -> Self {
        ProgressReporter {
            counter: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
            enabled,
        }
    }

    /// Total leaf tasks, known once the graph is built.
    pub fn set_total(&self, total: usize) {
        self.total.store(total, Ordering::SeqCst);
    }

    pub fn report(&self, symbol: char, task_id: &TaskId<'_>, detail: &str) {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.enabled {
            return;
        }
        let total = self.total.load(Ordering::SeqCst);
        if detail.is_empty() {
            println!("[{n}/{total}] {symbol} {task_id}");
        } else {
            println!("[{n}/{total}] {symbol} {task_id} {detail}");
        }
    }
}
