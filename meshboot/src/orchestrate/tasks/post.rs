//! Task: post-bootstrap, run once on the primary node.
//!
//! Establishes the administrative namespace key in the consistent store
//! exactly once; a populated key makes the task a no-op forever after.

use async_trait::async_trait;
use std::sync::Arc;

use meshboot_shared::{MeshbootError, MeshbootResult};

use crate::context::Ctx;
use crate::pipeline::PipelineTask;
use crate::runner::{Operation, Outcome, RemoteCommand};
use crate::topology::Node;

const ADMIN_NAMESPACE_KEY: &str = "/mesh/namespaces/system";

pub struct PostBootstrapTask {
    pub primary: Arc<Node>,
}

impl PostBootstrapTask {
    fn etcdctl<I, S>(&self, ctx: &Ctx, args: I) -> RemoteCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv = vec![
            "etcdctl".to_string(),
            format!("--endpoints={}", ctx.config.etcd_endpoint),
        ];
        argv.extend(args.into_iter().map(Into::into));
        RemoteCommand::new(argv).env("ETCDCTL_API", "3")
    }
}

#[async_trait]
impl PipelineTask<Ctx> for PostBootstrapTask {
    async fn run(self: Box<Self>, ctx: Ctx) -> MeshbootResult<Outcome> {
        let read = self.etcdctl(
            &ctx,
            [
                "get".to_string(),
                ADMIN_NAMESPACE_KEY.to_string(),
                "--print-value-only".to_string(),
            ],
        );
        let output = ctx.runner.transport().exec(&self.primary, &read).await?;
        if !output.ok() {
            return Err(MeshbootError::Fatal(format!(
                "cannot read {ADMIN_NAMESPACE_KEY}: {}",
                output.failure_detail()
            )));
        }
        if !output.stdout.trim().is_empty() {
            tracing::debug!("administrative namespace already established");
            return Ok(Outcome::AlreadySatisfied);
        }

        let create = Operation::new(
            "create-admin-namespace",
            self.etcdctl(
                &ctx,
                [
                    "put".to_string(),
                    ADMIN_NAMESPACE_KEY.to_string(),
                    r#"{"name":"system","state":"created"}"#.to_string(),
                ],
            ),
        );
        ctx.runner.run(&self.primary, &create).await?;
        tracing::info!("administrative namespace established");
        Ok(Outcome::Applied)
    }

    fn name(&self) -> &str {
        "post-bootstrap"
    }

    fn host(&self) -> &str {
        &self.primary.name
    }
}
