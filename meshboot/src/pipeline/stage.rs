//! Stage definition for table-driven pipeline execution.

/// Execution mode for a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Fan tasks out concurrently (bounded by the executor's pool width).
    Parallel,
    /// One task at a time, in order. Task i+1 starts only after task i
    /// returned (the rolling-restart availability guarantee).
    Sequential,
}

/// A named stage: tasks, execution mode, failure policy, guard tag.
///
/// Stages are executed strictly in order. A stage marked
/// `any_errors_fatal` aborts the whole run on its first failure; other
/// stages collect per-task failures and let the run continue.
pub struct Stage<T> {
    pub name: String,
    /// Guard tag enabling selective re-runs (`--tags pki`, ...).
    pub tag: String,
    pub tasks: Vec<T>,
    pub execution: ExecutionMode,
    pub any_errors_fatal: bool,
}

impl<T> Stage<T> {
    pub fn parallel(name: impl Into<String>, tag: impl Into<String>, tasks: Vec<T>) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
            tasks,
            execution: ExecutionMode::Parallel,
            any_errors_fatal: false,
        }
    }

    pub fn sequential(name: impl Into<String>, tag: impl Into<String>, tasks: Vec<T>) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
            tasks,
            execution: ExecutionMode::Sequential,
            any_errors_fatal: false,
        }
    }

    /// Mark the stage as any-errors-fatal.
    pub fn fatal(mut self) -> Self {
        self.any_errors_fatal = true;
        self
    }
}
