//! Task: rolling restart of the per-node daemon.
//!
//! Always scheduled in a sequential stage: the executor does not contact
//! host i+1 until this task returned for host i, so at most one node is
//! ever down for the daemon at a time.

use async_trait::async_trait;
use std::sync::Arc;

use meshboot_shared::MeshbootResult;

use super::NODE_DAEMON_UNIT;
use crate::context::Ctx;
use crate::pipeline::PipelineTask;
use crate::runner::{Operation, Outcome, RemoteCommand};
use crate::topology::Node;

pub struct RollingRestartTask {
    pub node: Arc<Node>,
}

#[async_trait]
impl PipelineTask<Ctx> for RollingRestartTask {
    async fn run(self: Box<Self>, ctx: Ctx) -> MeshbootResult<Outcome> {
        let restart = Operation::new(
            format!("restart-{NODE_DAEMON_UNIT}"),
            RemoteCommand::new(["systemctl", "restart", NODE_DAEMON_UNIT]),
        );
        let outcome = ctx.runner.run(&self.node, &restart).await?;
        tracing::info!(host = %self.node.name, "node daemon restarted");
        Ok(outcome)
    }

    fn name(&self) -> &str {
        "rolling-restart"
    }

    fn host(&self) -> &str {
        &self.node.name
    }
}
