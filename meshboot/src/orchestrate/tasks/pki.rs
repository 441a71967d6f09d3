//! Tasks: PKI.
//!
//! Root issuance runs alone on the coordinator; leaf issuance and
//! distribution fan out per host, strictly after the root exists.

use async_trait::async_trait;
use std::sync::Arc;

use meshboot_shared::MeshbootResult;

use crate::context::Ctx;
use crate::pipeline::PipelineTask;
use crate::runner::Outcome;
use crate::topology::Node;

pub struct PkiRootTask {
    pub coordinator: Arc<Node>,
}

#[async_trait]
impl PipelineTask<Ctx> for PkiRootTask {
    async fn run(self: Box<Self>, ctx: Ctx) -> MeshbootResult<Outcome> {
        let cert_path = ctx.ca.root_cert_path();
        let already = crate::pki::exists(&cert_path);
        ctx.ca.ensure_root()?;
        Ok(if already {
            Outcome::AlreadySatisfied
        } else {
            Outcome::Applied
        })
    }

    fn name(&self) -> &str {
        "ensure-root-ca"
    }

    fn host(&self) -> &str {
        &self.coordinator.name
    }
}

pub struct PkiLeafTask {
    pub node: Arc<Node>,
}

#[async_trait]
impl PipelineTask<Ctx> for PkiLeafTask {
    async fn run(self: Box<Self>, ctx: Ctx) -> MeshbootResult<Outcome> {
        let already = crate::pki::exists(&ctx.ca.leaf_cert_path(&self.node.name));

        // ensure_root here is a cheap read: the root stage ran first.
        let root = ctx.ca.ensure_root()?;
        let leaf = ctx.ca.ensure_leaf(&self.node)?;
        let distributed = ctx
            .ca
            .distribute(&ctx.runner, &self.node, &leaf, &root)
            .await?;

        Ok(if already && distributed == Outcome::AlreadySatisfied {
            Outcome::AlreadySatisfied
        } else {
            Outcome::Applied
        })
    }

    fn name(&self) -> &str {
        "issue-leaf-certificate"
    }

    fn host(&self) -> &str {
        &self.node.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrate::tests::test_context;
    use crate::pki::TRUST_DIR;
    use crate::runner::testing::MemoryTransport;
    use crate::runner::RemoteCommand;

    #[tokio::test]
    async fn leaf_task_issues_and_distributes() {
        let transport = Arc::new(MemoryTransport::new());
        let ctx = test_context(transport.clone());
        let node = ctx.topology.nodes()[1].clone();

        Box::new(PkiRootTask {
            coordinator: ctx.topology.primary(),
        })
        .run(ctx.clone())
        .await
        .unwrap();

        let outcome = Box::new(PkiLeafTask { node: node.clone() })
            .run(ctx.clone())
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Applied);
        assert!(transport
            .upload_contents(&format!("{TRUST_DIR}/{}.crt", node.name))
            .is_some());

        // Re-run with the host reporting its material present: no-op.
        for name in [
            "ca.crt".to_string(),
            format!("{}.key", node.name),
            format!("{}.crt", node.name),
        ] {
            let check = RemoteCommand::new(["test", "-s", &format!("{TRUST_DIR}/{name}")]);
            transport.mark_satisfied(&check.rendered());
        }
        let outcome = Box::new(PkiLeafTask { node })
            .run(ctx)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::AlreadySatisfied);
    }

    #[tokio::test]
    async fn root_task_is_idempotent() {
        let transport = Arc::new(MemoryTransport::new());
        let ctx = test_context(transport);
        let node = ctx.topology.nodes()[0].clone();

        let first = Box::new(PkiRootTask {
            coordinator: node.clone(),
        })
        .run(ctx.clone())
        .await
        .unwrap();
        let second = Box::new(PkiRootTask { coordinator: node })
            .run(ctx)
            .await
            .unwrap();
        assert_eq!(first, Outcome::Applied);
        assert_eq!(second, Outcome::AlreadySatisfied);
    }
}
