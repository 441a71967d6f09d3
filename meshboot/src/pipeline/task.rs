//! Generic task trait for pipeline execution.

use async_trait::async_trait;

use meshboot_shared::MeshbootResult;

use crate::runner::Outcome;

/// A unit of stage work, scoped to one host.
///
/// Tasks run with a shared context, cloned per task. The outcome reports
/// whether the host was changed or the desired state already held.
#[async_trait]
pub trait PipelineTask<Ctx>: Send + Sync {
    /// Execute the task with the shared pipeline context.
    async fn run(self: Box<Self>, ctx: Ctx) -> MeshbootResult<Outcome>;

    /// Human-readable task name for logging and reports.
    fn name(&self) -> &str;

    /// Host the task targets, for failure attribution.
    fn host(&self) -> &str;
}

pub type BoxedTask<Ctx> = Box<dyn PipelineTask<Ctx>>;
