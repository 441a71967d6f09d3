//! Run reporting: per-task outcomes rolled up into a run summary.

use std::fmt::Write as _;

use crate::pipeline::ExecutionMode;
use crate::runner::Outcome;

#[derive(Debug, Clone)]
pub struct TaskReport {
    pub name: String,
    pub host: String,
    pub outcome: Option<Outcome>,
    pub error: Option<String>,
    pub duration_ms: u128,
}

impl TaskReport {
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct StageReport {
    pub name: String,
    pub execution: ExecutionMode,
    pub duration_ms: u128,
    pub tasks: Vec<TaskReport>,
    /// Stage filtered out by guard tags.
    pub skipped: bool,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub total_duration_ms: u128,
    pub stages: Vec<StageReport>,
    /// Set when an any-errors-fatal stage failed and later stages never ran.
    pub aborted: bool,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        !self.aborted
            && self
                .stages
                .iter()
                .flat_map(|s| s.tasks.iter())
                .all(|t| !t.failed())
    }

    /// Every failed task: (stage, host, task, reason).
    pub fn failures(&self) -> Vec<(String, String, String, String)> {
        self.stages
            .iter()
            .flat_map(|stage| {
                stage.tasks.iter().filter(|t| t.failed()).map(|t| {
                    (
                        stage.name.clone(),
                        t.host.clone(),
                        t.name.clone(),
                        t.error.clone().unwrap_or_default(),
                    )
                })
            })
            .collect()
    }

    fn count(&self, outcome: Outcome) -> usize {
        self.stages
            .iter()
            .flat_map(|s| s.tasks.iter())
            .filter(|t| t.outcome == Some(outcome))
            .count()
    }

    /// Human-readable end-of-run summary with enough context to re-run
    /// after remediation.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "run {} in {}ms: {} applied, {} already satisfied, {} failed",
            if self.is_success() {
                "succeeded"
            } else if self.aborted {
                "aborted"
            } else {
                "completed with failures"
            },
            self.total_duration_ms,
            self.count(Outcome::Applied),
            self.count(Outcome::AlreadySatisfied),
            self.failures().len(),
        );
        for stage in &self.stages {
            if stage.skipped {
                let _ = writeln!(out, "  stage {}: skipped (tag filter)", stage.name);
                continue;
            }
            let _ = writeln!(
                out,
                "  stage {}: {} task(s), {}ms",
                stage.name,
                stage.tasks.len(),
                stage.duration_ms
            );
        }
        for (stage, host, task, reason) in self.failures() {
            let _ = writeln!(out, "  FAILED [{stage}] {host}/{task}: {reason}");
        }
        out
    }
}
