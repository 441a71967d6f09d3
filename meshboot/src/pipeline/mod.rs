//! Table-driven stage execution framework.
//!
//! An execution plan is an ordered list of named stages; each stage holds
//! per-host tasks and declares how they run (parallel or sequential) and
//! what a failure means (abort the run vs collect and continue).

mod executor;
mod report;
mod stage;
mod task;

pub use executor::{ExecutorOptions, PipelineExecutor};
pub use report::{RunReport, StageReport, TaskReport};
pub use stage::{ExecutionMode, Stage};
pub use task::{BoxedTask, PipelineTask};
