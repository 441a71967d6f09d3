//! Task: hypervisor tuning.
//!
//! Probes the CPU vendor once and dispatches the matching
//! nested-virtualization module config, toggles KSM page deduplication,
//! injects the security-profile rule (line-presence, never a blind
//! append), and restarts libvirtd only when something actually changed.

use async_trait::async_trait;
use std::sync::Arc;

use meshboot_shared::{MeshbootError, MeshbootResult};

use super::{fold_outcomes, line_in_file};
use crate::context::{CpuVendor, Ctx};
use crate::pipeline::PipelineTask;
use crate::runner::{Operation, Outcome, RemoteCommand};
use crate::topology::Node;

const KVM_MODPROBE_FILE: &str = "/etc/modprobe.d/mesh-kvm.conf";
const LIBVIRT_PROFILE: &str = "/etc/apparmor.d/local/abstractions/libvirt-qemu";

pub struct HypervisorTuningTask {
    pub node: Arc<Node>,
}

impl HypervisorTuningTask {
    /// Probe `/proc/cpuinfo` and resolve the vendor from the closed
    /// `{intel, amd}` set. Anything else is an error, not a no-op.
    async fn probe_vendor(&self, ctx: &Ctx) -> MeshbootResult<CpuVendor> {
        let probe = RemoteCommand::new(["grep", "-m1", "vendor_id", "/proc/cpuinfo"]);
        let output = ctx.runner.transport().exec(&self.node, &probe).await?;
        if !output.ok() {
            return Err(MeshbootError::Fatal(format!(
                "cannot probe CPU vendor on {}: {}",
                self.node.name,
                output.failure_detail()
            )));
        }
        let vendor = CpuVendor::from_vendor_string(&output.stdout)?;
        ctx.facts.set_cpu_vendor(&self.node.name, vendor);
        Ok(vendor)
    }
}

#[async_trait]
impl PipelineTask<Ctx> for HypervisorTuningTask {
    async fn run(self: Box<Self>, ctx: Ctx) -> MeshbootResult<Outcome> {
        let vendor = self.probe_vendor(&ctx).await?;
        tracing::debug!(host = %self.node.name, ?vendor, "CPU vendor resolved");

        let mut outcomes = Vec::new();

        let operations = [
            line_in_file(
                "nested-virtualization",
                KVM_MODPROBE_FILE,
                &format!("options {} nested=1", vendor.kvm_module()),
                None,
            ),
            Operation::new(
                "enable-ksm",
                RemoteCommand::shell("echo 1 > /sys/kernel/mm/ksm/run"),
            )
            .check(RemoteCommand::new([
                "grep",
                "-qx",
                "1",
                "/sys/kernel/mm/ksm/run",
            ])),
            line_in_file(
                "security-profile-rule",
                LIBVIRT_PROFILE,
                "/var/lib/mesh/** rwk,",
                Some("systemctl reload apparmor"),
            ),
        ];
        for op in &operations {
            outcomes.push(ctx.runner.run(&self.node, op).await?);
        }

        // Restart picks up the new module options and profile; skipped
        // when the host was already in the desired state.
        if fold_outcomes(&outcomes) == Outcome::Applied {
            let restart = Operation::new(
                "restart-libvirtd",
                RemoteCommand::new(["systemctl", "restart", "libvirtd"]),
            );
            outcomes.push(ctx.runner.run(&self.node, &restart).await?);
        }

        Ok(fold_outcomes(&outcomes))
    }

    fn name(&self) -> &str {
        "hypervisor-tuning"
    }

    fn host(&self) -> &str {
        &self.node.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrate::tests::test_context;
    use crate::runner::testing::MemoryTransport;

    #[tokio::test]
    async fn intel_host_gets_kvm_intel_options() {
        let transport = Arc::new(MemoryTransport::new());
        transport.respond_matching("vendor_id", "vendor_id\t: GenuineIntel\n");
        let ctx = test_context(transport.clone());
        let node = ctx.topology.hypervisors()[0].clone();

        let outcome = Box::new(HypervisorTuningTask { node: node.clone() })
            .run(ctx.clone())
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Applied);
        assert!(transport
            .log()
            .iter()
            .any(|(_, c)| c.contains("options kvm_intel nested=1")));
        assert_eq!(
            ctx.facts.host(&node.name).unwrap().cpu_vendor,
            Some(CpuVendor::Intel)
        );
    }

    #[tokio::test]
    async fn amd_host_gets_kvm_amd_options() {
        let transport = Arc::new(MemoryTransport::new());
        transport.respond_matching("vendor_id", "vendor_id\t: AuthenticAMD\n");
        let ctx = test_context(transport.clone());
        let node = ctx.topology.hypervisors()[0].clone();

        Box::new(HypervisorTuningTask { node })
            .run(ctx)
            .await
            .unwrap();
        assert!(transport
            .log()
            .iter()
            .any(|(_, c)| c.contains("options kvm_amd nested=1")));
    }

    #[tokio::test]
    async fn unknown_vendor_is_an_explicit_error() {
        let transport = Arc::new(MemoryTransport::new());
        transport.respond_matching("vendor_id", "vendor_id\t: MysteryChip\n");
        let ctx = test_context(transport.clone());
        let node = ctx.topology.hypervisors()[0].clone();

        let err = Box::new(HypervisorTuningTask { node })
            .run(ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("MysteryChip"));
        // No tuning applied after a failed probe.
        assert!(transport.log().iter().all(|(_, c)| !c.contains("nested=1")));
    }

    #[tokio::test]
    async fn satisfied_host_skips_libvirtd_restart() {
        let transport = Arc::new(MemoryTransport::new());
        transport.respond_matching("vendor_id", "vendor_id\t: GenuineIntel\n");
        for check in [
            "grep -qxF 'options kvm_intel nested=1' /etc/modprobe.d/mesh-kvm.conf",
            "grep -qx 1 /sys/kernel/mm/ksm/run",
            "grep -qxF '/var/lib/mesh/** rwk,' /etc/apparmor.d/local/abstractions/libvirt-qemu",
        ] {
            transport.mark_satisfied(check);
        }
        let ctx = test_context(transport.clone());
        let node = ctx.topology.hypervisors()[0].clone();

        let outcome = Box::new(HypervisorTuningTask { node })
            .run(ctx)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::AlreadySatisfied);
        assert!(transport
            .log()
            .iter()
            .all(|(_, c)| !c.contains("restart libvirtd")));
    }
}
