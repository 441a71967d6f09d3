//! Tasks: mesh MTU discovery and policy enforcement.
//!
//! Probes read each node's mesh-NIC MTU into the fact store; the policy
//! task aggregates the hypervisor minimum and aborts the run when it is
//! below the absolute floor, unless the override flag is set.

use async_trait::async_trait;
use std::sync::Arc;

use meshboot_shared::{MeshbootError, MeshbootResult};

use crate::configstore::{enforce_mtu_floor, mtu_floor};
use crate::context::Ctx;
use crate::pipeline::PipelineTask;
use crate::runner::{Outcome, RemoteCommand};
use crate::topology::Node;

pub struct MtuProbeTask {
    pub node: Arc<Node>,
}

#[async_trait]
impl PipelineTask<Ctx> for MtuProbeTask {
    async fn run(self: Box<Self>, ctx: Ctx) -> MeshbootResult<Outcome> {
        let path = format!("/sys/class/net/{}/mtu", self.node.mesh_nic);
        let probe = RemoteCommand::new(["cat", &path]);
        let output = ctx.runner.transport().exec(&self.node, &probe).await?;
        if !output.ok() {
            return Err(MeshbootError::Fatal(format!(
                "cannot read mesh MTU on {}: {}",
                self.node.name,
                output.failure_detail()
            )));
        }

        let mtu: u32 = output.stdout.trim().parse().map_err(|_| {
            MeshbootError::Fatal(format!(
                "unparseable MTU reading '{}' from {}",
                output.stdout.trim(),
                self.node.name
            ))
        })?;

        tracing::debug!(host = %self.node.name, nic = %self.node.mesh_nic, mtu, "mesh MTU observed");
        ctx.facts.set_mesh_mtu(&self.node.name, mtu);
        Ok(Outcome::Applied)
    }

    fn name(&self) -> &str {
        "mtu-probe"
    }

    fn host(&self) -> &str {
        &self.node.name
    }
}

/// Aggregates the hypervisor minimum and enforces the safety floor.
/// Runs once, on the coordinator, after every probe returned.
pub struct MtuFloorTask {
    pub coordinator: Arc<Node>,
}

#[async_trait]
impl PipelineTask<Ctx> for MtuFloorTask {
    async fn run(self: Box<Self>, ctx: Ctx) -> MeshbootResult<Outcome> {
        let mut observed = Vec::new();
        for node in ctx.topology.hypervisors() {
            let mtu = ctx
                .facts
                .host(&node.name)
                .and_then(|f| f.mesh_mtu)
                .ok_or_else(|| {
                    MeshbootError::Internal(format!(
                        "no MTU fact recorded for hypervisor {}",
                        node.name
                    ))
                })?;
            observed.push(mtu);
        }

        let floor = mtu_floor(&observed).ok_or_else(|| {
            MeshbootError::Internal("no hypervisors to aggregate MTU across".into())
        })?;
        let ceiling = enforce_mtu_floor(floor, ctx.config.mtu_override)?;

        tracing::info!(ceiling, "cluster MTU ceiling computed");
        ctx.facts.set_mtu_ceiling(ceiling);
        Ok(Outcome::Applied)
    }

    fn name(&self) -> &str {
        "mtu-policy"
    }

    fn host(&self) -> &str {
        &self.coordinator.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrate::tests::{test_context, test_context_with_config};
    use crate::runner::testing::MemoryTransport;

    #[tokio::test]
    async fn probe_records_fact() {
        let transport = Arc::new(MemoryTransport::new());
        transport.respond_matching("/sys/class/net/eth1/mtu", "9000\n");
        let ctx = test_context(transport);
        let node = ctx.topology.nodes()[0].clone();

        Box::new(MtuProbeTask { node: node.clone() })
            .run(ctx.clone())
            .await
            .unwrap();
        assert_eq!(ctx.facts.host(&node.name).unwrap().mesh_mtu, Some(9000));
    }

    #[tokio::test]
    async fn unreadable_mtu_is_fatal() {
        let transport = Arc::new(MemoryTransport::new());
        transport.respond_matching("/sys/class/net/eth1/mtu", "garbage\n");
        let ctx = test_context(transport);
        let node = ctx.topology.nodes()[0].clone();

        assert!(Box::new(MtuProbeTask { node }).run(ctx).await.is_err());
    }

    #[tokio::test]
    async fn floor_is_hypervisor_minimum() {
        let transport = Arc::new(MemoryTransport::new());
        let ctx = test_context(transport);
        // node-1 and node-2 are the hypervisors in the test topology.
        ctx.facts.set_mesh_mtu("node-1", 9000);
        ctx.facts.set_mesh_mtu("node-2", 2200);
        ctx.facts.set_mesh_mtu("node-3", 1500);

        Box::new(MtuFloorTask {
            coordinator: ctx.topology.primary(),
        })
        .run(ctx.clone())
        .await
        .unwrap();
        assert_eq!(ctx.facts.mtu_ceiling(), Some(2200));
    }

    #[tokio::test]
    async fn low_floor_aborts_without_override() {
        let transport = Arc::new(MemoryTransport::new());
        let ctx = test_context(transport);
        ctx.facts.set_mesh_mtu("node-1", 1500);
        ctx.facts.set_mesh_mtu("node-2", 9000);

        let err = Box::new(MtuFloorTask {
            coordinator: ctx.topology.primary(),
        })
        .run(ctx)
        .await
        .unwrap_err();
        assert!(matches!(err, MeshbootError::MtuPolicy { observed: 1500, .. }));
    }

    #[tokio::test]
    async fn override_permits_low_floor() {
        let transport = Arc::new(MemoryTransport::new());
        let ctx = test_context_with_config(transport, |config| config.mtu_override = true);
        ctx.facts.set_mesh_mtu("node-1", 1500);
        ctx.facts.set_mesh_mtu("node-2", 9000);

        Box::new(MtuFloorTask {
            coordinator: ctx.topology.primary(),
        })
        .run(ctx.clone())
        .await
        .unwrap();
        assert_eq!(ctx.facts.mtu_ceiling(), Some(1500));
    }

    #[tokio::test]
    async fn missing_probe_fact_is_internal_error() {
        let transport = Arc::new(MemoryTransport::new());
        let ctx = test_context(transport);

        let err = Box::new(MtuFloorTask {
            coordinator: ctx.topology.primary(),
        })
        .run(ctx)
        .await
        .unwrap_err();
        assert!(matches!(err, MeshbootError::Internal(_)));
    }
}
