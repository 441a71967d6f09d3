//! Pipeline executor.
//!
//! Runs stages strictly in order. Within a parallel stage, one future per
//! task proceeds independently under a bounded semaphore; an
//! any-errors-fatal stage uses `try_join_all` so the first failure cancels
//! in-flight siblings and aborts the remaining stages. Other stages
//! collect per-task failures and let the run continue to the end.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use futures::future::{join_all, try_join_all};
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::pipeline::report::{RunReport, StageReport, TaskReport};
use crate::pipeline::stage::{ExecutionMode, Stage};
use crate::pipeline::task::BoxedTask;

pub struct ExecutorOptions {
    /// Worker-pool bound for parallel stages.
    pub max_parallel: usize,
    /// When set, only stages whose tag is in the set are run.
    pub tags: Option<HashSet<String>>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            max_parallel: 16,
            tags: None,
        }
    }
}

impl ExecutorOptions {
    fn stage_selected(&self, tag: &str) -> bool {
        match &self.tags {
            Some(tags) => tags.contains(tag),
            None => true,
        }
    }
}

pub struct PipelineExecutor;

impl PipelineExecutor {
    /// Execute an ordered stage list against a shared context.
    ///
    /// Always returns a report; callers decide the exit code from
    /// `RunReport::is_success`.
    pub async fn execute<Ctx>(
        stages: Vec<Stage<BoxedTask<Ctx>>>,
        ctx: Ctx,
        options: ExecutorOptions,
    ) -> RunReport
    where
        Ctx: Clone,
    {
        let total_start = Instant::now();
        let semaphore = Arc::new(Semaphore::new(options.max_parallel.max(1)));
        let mut stage_reports = Vec::new();
        let mut aborted = false;

        for stage in stages {
            if !options.stage_selected(&stage.tag) {
                stage_reports.push(StageReport {
                    name: stage.name,
                    execution: stage.execution,
                    duration_ms: 0,
                    tasks: Vec::new(),
                    skipped: true,
                });
                continue;
            }

            tracing::info!(stage = %stage.name, tasks = stage.tasks.len(), "stage starting");
            let stage_start = Instant::now();
            let fatal = stage.any_errors_fatal;
            let execution = stage.execution;
            let name = stage.name;

            let (tasks, stage_failed) = match execution {
                ExecutionMode::Parallel => {
                    if fatal {
                        // First failure cancels in-flight siblings, but
                        // reports of siblings that already finished are
                        // kept so the summary shows what actually ran.
                        let completed = Arc::new(Mutex::new(Vec::new()));
                        let futures = stage.tasks.into_iter().map(|task| {
                            let ctx = ctx.clone();
                            let semaphore = Arc::clone(&semaphore);
                            let completed = Arc::clone(&completed);
                            async move {
                                let _permit = semaphore.acquire().await;
                                match run_one(task, ctx).await {
                                    Ok(report) => {
                                        completed.lock().push(report);
                                        Ok(())
                                    }
                                    Err(failed) => Err(failed),
                                }
                            }
                        });

                        match try_join_all(futures).await {
                            Ok(_) => (std::mem::take(&mut *completed.lock()), false),
                            Err(failed) => {
                                let mut reports = std::mem::take(&mut *completed.lock());
                                reports.push(failed);
                                (reports, true)
                            }
                        }
                    } else {
                        let futures = stage.tasks.into_iter().map(|task| {
                            let ctx = ctx.clone();
                            let semaphore = Arc::clone(&semaphore);
                            async move {
                                let _permit = semaphore.acquire().await;
                                run_one(task, ctx).await
                            }
                        });

                        let reports: Vec<TaskReport> = join_all(futures)
                            .await
                            .into_iter()
                            .map(|r| r.unwrap_or_else(|failed| failed))
                            .collect();
                        (reports, false)
                    }
                }
                ExecutionMode::Sequential => {
                    let mut reports = Vec::new();
                    let mut stage_failed = false;
                    for task in stage.tasks {
                        match run_one(task, ctx.clone()).await {
                            Ok(report) => reports.push(report),
                            Err(failed) => {
                                reports.push(failed);
                                if fatal {
                                    stage_failed = true;
                                    break;
                                }
                            }
                        }
                    }
                    (reports, stage_failed)
                }
            };

            let duration_ms = stage_start.elapsed().as_millis();
            tracing::info!(stage = %name, duration_ms = duration_ms as u64, "stage finished");
            stage_reports.push(StageReport {
                name,
                execution,
                duration_ms,
                tasks,
                skipped: false,
            });

            if stage_failed {
                aborted = true;
                break;
            }
        }

        RunReport {
            total_duration_ms: total_start.elapsed().as_millis(),
            stages: stage_reports,
            aborted,
        }
    }
}

/// Run one task, folding success and failure into a `TaskReport`.
async fn run_one<Ctx>(task: BoxedTask<Ctx>, ctx: Ctx) -> Result<TaskReport, TaskReport> {
    let name = task.name().to_string();
    let host = task.host().to_string();
    let start = Instant::now();

    match task.run(ctx).await {
        Ok(outcome) => Ok(TaskReport {
            name,
            host,
            outcome: Some(outcome),
            error: None,
            duration_ms: start.elapsed().as_millis(),
        }),
        Err(e) => {
            tracing::error!(task = %name, host = %host, error = %e, "task failed");
            Err(TaskReport {
                name,
                host,
                outcome: None,
                error: Some(e.to_string()),
                duration_ms: start.elapsed().as_millis(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineTask;
    use crate::runner::Outcome;
    use async_trait::async_trait;
    use meshboot_shared::{MeshbootError, MeshbootResult};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Probe {
        order: Mutex<Vec<String>>,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    struct TestTask {
        name: String,
        host: String,
        fail: bool,
        delay: Duration,
        probe: Arc<Probe>,
    }

    impl TestTask {
        fn boxed(name: &str, host: &str, fail: bool, probe: &Arc<Probe>) -> BoxedTask<()> {
            Self::boxed_with_delay(name, host, fail, 5, probe)
        }

        fn boxed_with_delay(
            name: &str,
            host: &str,
            fail: bool,
            delay_ms: u64,
            probe: &Arc<Probe>,
        ) -> BoxedTask<()> {
            Box::new(TestTask {
                name: name.into(),
                host: host.into(),
                fail,
                delay: Duration::from_millis(delay_ms),
                probe: Arc::clone(probe),
            })
        }
    }

    #[async_trait]
    impl PipelineTask<()> for TestTask {
        async fn run(self: Box<Self>, _ctx: ()) -> MeshbootResult<Outcome> {
            let now = self.probe.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.probe.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.probe.order.lock().push(self.name.clone());
            self.probe.active.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                Err(MeshbootError::Fatal(format!("{} exploded", self.name)))
            } else {
                Ok(Outcome::Applied)
            }
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn host(&self) -> &str {
            &self.host
        }
    }

    #[tokio::test]
    async fn sequential_stage_never_overlaps_tasks() {
        let probe = Arc::new(Probe::default());
        let stage = Stage::sequential(
            "restart",
            "restart",
            (0..4)
                .map(|i| TestTask::boxed(&format!("t{i}"), &format!("h{i}"), false, &probe))
                .collect(),
        );

        let report =
            PipelineExecutor::execute(vec![stage], (), ExecutorOptions::default()).await;
        assert!(report.is_success());
        assert_eq!(probe.peak.load(Ordering::SeqCst), 1);
        assert_eq!(
            probe.order.lock().clone(),
            vec!["t0", "t1", "t2", "t3"]
        );
    }

    #[tokio::test]
    async fn parallel_stage_overlaps_tasks() {
        let probe = Arc::new(Probe::default());
        let stage = Stage::parallel(
            "bootstrap",
            "bootstrap",
            (0..4)
                .map(|i| TestTask::boxed(&format!("t{i}"), &format!("h{i}"), false, &probe))
                .collect(),
        );

        let report =
            PipelineExecutor::execute(vec![stage], (), ExecutorOptions::default()).await;
        assert!(report.is_success());
        assert!(probe.peak.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn pool_bound_caps_parallelism() {
        let probe = Arc::new(Probe::default());
        let stage = Stage::parallel(
            "bootstrap",
            "bootstrap",
            (0..8)
                .map(|i| TestTask::boxed(&format!("t{i}"), &format!("h{i}"), false, &probe))
                .collect(),
        );

        let options = ExecutorOptions {
            max_parallel: 2,
            tags: None,
        };
        PipelineExecutor::execute(vec![stage], (), options).await;
        assert!(probe.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn fatal_stage_failure_aborts_remaining_stages() {
        let probe = Arc::new(Probe::default());
        let stages = vec![
            Stage::parallel(
                "pki",
                "pki",
                vec![TestTask::boxed("bad", "h0", true, &probe)],
            )
            .fatal(),
            Stage::parallel(
                "etcd",
                "etcd",
                vec![TestTask::boxed("never", "h1", false, &probe)],
            ),
        ];

        let report = PipelineExecutor::execute(stages, (), ExecutorOptions::default()).await;
        assert!(report.aborted);
        assert!(!report.is_success());
        assert_eq!(report.stages.len(), 1);
        assert!(!probe.order.lock().iter().any(|n| n == "never"));
    }

    #[tokio::test]
    async fn aborted_stage_keeps_reports_of_finished_siblings() {
        let probe = Arc::new(Probe::default());
        let stage = Stage::parallel(
            "pki",
            "pki",
            vec![
                TestTask::boxed_with_delay("fast-ok", "h0", false, 1, &probe),
                TestTask::boxed_with_delay("slow-bad", "h1", true, 40, &probe),
            ],
        )
        .fatal();

        let report =
            PipelineExecutor::execute(vec![stage], (), ExecutorOptions::default()).await;
        assert!(report.aborted);

        let names: Vec<&str> = report.stages[0]
            .tasks
            .iter()
            .map(|t| t.name.as_str())
            .collect();
        assert!(names.contains(&"fast-ok"));
        assert!(names.contains(&"slow-bad"));
        assert_eq!(report.failures().len(), 1);
        assert_eq!(report.failures()[0].1, "h1");
    }

    #[tokio::test]
    async fn non_fatal_stage_collects_failures_and_continues() {
        let probe = Arc::new(Probe::default());
        let stages = vec![
            Stage::parallel(
                "tuning",
                "tuning",
                vec![
                    TestTask::boxed("bad", "h0", true, &probe),
                    TestTask::boxed("good", "h1", false, &probe),
                ],
            ),
            Stage::parallel(
                "later",
                "later",
                vec![TestTask::boxed("ran", "h2", false, &probe)],
            ),
        ];

        let report = PipelineExecutor::execute(stages, (), ExecutorOptions::default()).await;
        assert!(!report.aborted);
        assert!(!report.is_success());
        assert_eq!(report.stages.len(), 2);
        let failures = report.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].1, "h0");
        assert!(probe.order.lock().iter().any(|n| n == "ran"));
    }

    #[tokio::test]
    async fn tag_filter_skips_unselected_stages() {
        let probe = Arc::new(Probe::default());
        let stages = vec![
            Stage::parallel(
                "bootstrap",
                "bootstrap",
                vec![TestTask::boxed("skipped", "h0", false, &probe)],
            ),
            Stage::parallel(
                "pki",
                "pki",
                vec![TestTask::boxed("ran", "h1", false, &probe)],
            ),
        ];

        let options = ExecutorOptions {
            max_parallel: 16,
            tags: Some(["pki".to_string()].into_iter().collect()),
        };
        let report = PipelineExecutor::execute(stages, (), options).await;
        assert!(report.stages[0].skipped);
        assert!(!report.stages[1].skipped);
        assert_eq!(probe.order.lock().clone(), vec!["ran"]);
    }
}
