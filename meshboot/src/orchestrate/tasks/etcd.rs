//! Task: consistent-store cluster formation.
//!
//! Writes the member environment (initial-cluster string built from all
//! etcd masters in declaration order) and enables the service. A member
//! whose config is present and whose service is active is left alone.

use async_trait::async_trait;
use std::sync::Arc;

use meshboot_shared::MeshbootResult;

use super::fold_outcomes;
use crate::context::Ctx;
use crate::pipeline::PipelineTask;
use crate::runner::{Operation, Outcome, RemoteCommand};
use crate::topology::Node;

const ETCD_ENV_FILE: &str = "/etc/default/etcd";

pub struct EtcdMemberTask {
    pub node: Arc<Node>,
}

/// `name=http://ip:2380` peer list over every etcd master.
fn initial_cluster(ctx: &Ctx) -> String {
    ctx.topology
        .etcd_masters()
        .iter()
        .map(|n| format!("{}=http://{}:2380", n.name, n.mesh_ip))
        .collect::<Vec<_>>()
        .join(",")
}

fn member_env(ctx: &Ctx, node: &Node) -> String {
    format!(
        "ETCD_NAME={name}\n\
         ETCD_DATA_DIR=/var/lib/etcd\n\
         ETCD_LISTEN_PEER_URLS=http://{ip}:2380\n\
         ETCD_LISTEN_CLIENT_URLS=http://{ip}:2379,http://127.0.0.1:2379\n\
         ETCD_ADVERTISE_CLIENT_URLS=http://{ip}:2379\n\
         ETCD_INITIAL_ADVERTISE_PEER_URLS=http://{ip}:2380\n\
         ETCD_INITIAL_CLUSTER={cluster}\n\
         ETCD_INITIAL_CLUSTER_STATE=new\n\
         ETCD_INITIAL_CLUSTER_TOKEN={token}\n",
        name = node.name,
        ip = node.mesh_ip,
        cluster = initial_cluster(ctx),
        token = ctx.config.deploy_name,
    )
}

#[async_trait]
impl PipelineTask<Ctx> for EtcdMemberTask {
    async fn run(self: Box<Self>, ctx: Ctx) -> MeshbootResult<Outcome> {
        let mut outcomes = Vec::new();
        let transport = ctx.runner.transport();

        let config_check = RemoteCommand::new(["test", "-s", ETCD_ENV_FILE]);
        if transport.exec(&self.node, &config_check).await?.ok() {
            outcomes.push(Outcome::AlreadySatisfied);
        } else {
            let env = member_env(&ctx, &self.node);
            transport
                .upload(&self.node, env.as_bytes(), ETCD_ENV_FILE, 0o644)
                .await?;
            tracing::info!(host = %self.node.name, "etcd member environment written");
            outcomes.push(Outcome::Applied);
        }

        let enable = Operation::new(
            "etcd-enable",
            RemoteCommand::new(["systemctl", "enable", "--now", "etcd"]),
        )
        .check(RemoteCommand::new(["systemctl", "is-active", "--quiet", "etcd"]));
        outcomes.push(ctx.runner.run(&self.node, &enable).await?);

        Ok(fold_outcomes(&outcomes))
    }

    fn name(&self) -> &str {
        "etcd-member"
    }

    fn host(&self) -> &str {
        &self.node.name
    }
}
