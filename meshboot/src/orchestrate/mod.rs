//! Stage orchestration.
//!
//! Builds the fixed execution plan from the resolved topology and drives
//! it through the pipeline executor. The stage table is the contract:
//! order, fan-out, and failure policy per stage all live here, not inside
//! the tasks.

pub mod tasks;

use std::sync::Arc;

use crate::context::Ctx;
use crate::pipeline::{BoxedTask, ExecutorOptions, PipelineExecutor, RunReport, Stage};
use crate::topology::Node;
use tasks::{
    BootstrapTask, ConfigPropagateTask, EtcdMemberTask, HypervisorTuningTask, MtuFloorTask,
    MtuProbeTask, PkiLeafTask, PkiRootTask, PostBootstrapTask, RollingRestartTask,
};

fn per_node<F>(nodes: &[Arc<Node>], make: F) -> Vec<BoxedTask<Ctx>>
where
    F: Fn(Arc<Node>) -> BoxedTask<Ctx>,
{
    nodes.iter().map(|node| make(Arc::clone(node))).collect()
}

/// The fixed stage table, derived from the topology.
///
/// Order matters: leaves need the root CA, the MTU policy needs every
/// probe, config propagation needs a formed store, the restart needs the
/// config in place, post-bootstrap needs restarted daemons.
pub fn execution_plan(ctx: &Ctx) -> Vec<Stage<BoxedTask<Ctx>>> {
    let topology = &ctx.topology;
    let primary = topology.primary();

    vec![
        Stage::parallel(
            "bootstrap",
            "bootstrap",
            per_node(topology.nodes(), |node| Box::new(BootstrapTask { node })),
        )
        .fatal(),
        Stage::sequential(
            "pki-root",
            "pki",
            vec![Box::new(PkiRootTask {
                coordinator: Arc::clone(&primary),
            }) as BoxedTask<Ctx>],
        )
        .fatal(),
        Stage::parallel(
            "pki-leaves",
            "pki",
            per_node(topology.nodes(), |node| Box::new(PkiLeafTask { node })),
        )
        .fatal(),
        // Collect-and-continue: a tuning failure degrades one hypervisor
        // but does not invalidate the rest of the cluster.
        Stage::parallel(
            "hypervisor-tuning",
            "tuning",
            per_node(&topology.hypervisors(), |node| {
                Box::new(HypervisorTuningTask { node })
            }),
        ),
        Stage::parallel(
            "mtu-discovery",
            "mtu",
            per_node(&topology.mtu_probe_targets(), |node| {
                Box::new(MtuProbeTask { node })
            }),
        )
        .fatal(),
        Stage::sequential(
            "mtu-policy",
            "mtu",
            vec![Box::new(MtuFloorTask {
                coordinator: Arc::clone(&primary),
            }) as BoxedTask<Ctx>],
        )
        .fatal(),
        Stage::parallel(
            "etcd-cluster",
            "etcd",
            per_node(&topology.etcd_masters(), |node| {
                Box::new(EtcdMemberTask { node })
            }),
        )
        .fatal(),
        Stage::sequential(
            "config-propagation",
            "config",
            vec![Box::new(ConfigPropagateTask {
                coordinator: Arc::clone(&primary),
            }) as BoxedTask<Ctx>],
        )
        .fatal(),
        Stage::sequential(
            "rolling-restart",
            "restart",
            per_node(&topology.restart_order(), |node| {
                Box::new(RollingRestartTask { node })
            }),
        )
        .fatal(),
        Stage::sequential(
            "post-bootstrap",
            "post",
            vec![Box::new(PostBootstrapTask { primary }) as BoxedTask<Ctx>],
        )
        .fatal(),
    ]
}

/// Build the plan, execute it, and close the audit record.
pub async fn run(ctx: Ctx, options: ExecutorOptions) -> RunReport {
    let plan = execution_plan(&ctx);
    let report = PipelineExecutor::execute(plan, Arc::clone(&ctx), options).await;
    ctx.audit.lock().run_end(report.is_success());
    report
}
