//! Task: per-node bootstrap.
//!
//! Package installation (with a distro fallback and apt-lock retry) and
//! base OS tuning: IPv6 off, IP forwarding on, suspend masked, journal
//! size capped. Every operation is idempotent via path or line checks.

use async_trait::async_trait;
use std::sync::Arc;

use meshboot_shared::MeshbootResult;

use super::{fold_outcomes, line_in_file};
use crate::context::Ctx;
use crate::pipeline::PipelineTask;
use crate::runner::{Operation, Outcome, RemoteCommand, TransientMatcher};
use crate::topology::Node;

const SYSCTL_FILE: &str = "/etc/sysctl.d/99-mesh.conf";

pub struct BootstrapTask {
    pub node: Arc<Node>,
}

#[async_trait]
impl PipelineTask<Ctx> for BootstrapTask {
    async fn run(self: Box<Self>, ctx: Ctx) -> MeshbootResult<Outcome> {
        let mut outcomes = Vec::new();

        let install = Operation::new(
            "install-base-packages",
            RemoteCommand::new([
                "apt-get",
                "install",
                "-y",
                "meshd",
                "qemu-kvm",
                "libvirt-daemon-system",
                "bridge-utils",
            ]),
        )
        .fallback(RemoteCommand::new([
            "dnf",
            "install",
            "-y",
            "meshd",
            "qemu-kvm",
            "libvirt",
            "bridge-utils",
        ]))
        .check(RemoteCommand::new(["test", "-x", "/usr/bin/meshd"]))
        .transient(TransientMatcher::package_locks());
        outcomes.push(ctx.runner.run(&self.node, &install).await?);

        let operations = [
            line_in_file(
                "disable-ipv6",
                SYSCTL_FILE,
                "net.ipv6.conf.all.disable_ipv6=1",
                Some(&format!("sysctl -p {SYSCTL_FILE}")),
            ),
            line_in_file(
                "enable-ip-forward",
                SYSCTL_FILE,
                "net.ipv4.ip_forward=1",
                Some(&format!("sysctl -p {SYSCTL_FILE}")),
            ),
            Operation::new(
                "disable-suspend",
                RemoteCommand::new([
                    "systemctl",
                    "mask",
                    "sleep.target",
                    "suspend.target",
                    "hibernate.target",
                ]),
            )
            .check(RemoteCommand::new([
                "test",
                "-L",
                "/etc/systemd/system/sleep.target",
            ])),
            line_in_file(
                "cap-journal-size",
                "/etc/systemd/journald.conf.d/mesh.conf",
                "SystemMaxUse=512M",
                Some("systemctl restart systemd-journald"),
            ),
        ];
        for op in &operations {
            outcomes.push(ctx.runner.run(&self.node, op).await?);
        }

        Ok(fold_outcomes(&outcomes))
    }

    fn name(&self) -> &str {
        "bootstrap"
    }

    fn host(&self) -> &str {
        &self.node.name
    }
}
