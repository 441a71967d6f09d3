//! Run-scoped shared context.
//!
//! Facts discovered by early stages (mesh MTUs, CPU vendors) are written
//! here and read by later stages through the same object, so there are no
//! cross-host globals.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use meshboot_shared::{MeshbootError, MeshbootResult};

use crate::audit::AuditLog;
use crate::pki::CaManager;
use crate::runner::HostRunner;
use crate::topology::Topology;

/// CPU vendor, resolved once per hypervisor from `/proc/cpuinfo`.
///
/// A closed set: an unrecognized vendor string is an explicit error, not
/// a silent no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuVendor {
    Intel,
    Amd,
}

impl CpuVendor {
    pub fn from_vendor_string(raw: &str) -> MeshbootResult<CpuVendor> {
        if raw.contains("GenuineIntel") {
            Ok(CpuVendor::Intel)
        } else if raw.contains("AuthenticAMD") {
            Ok(CpuVendor::Amd)
        } else {
            Err(MeshbootError::Fatal(format!(
                "unrecognized CPU vendor '{}': cannot select a nested-virtualization module",
                raw.trim()
            )))
        }
    }

    /// Kernel module carrying the nested-virtualization option.
    pub fn kvm_module(&self) -> &'static str {
        match self {
            CpuVendor::Intel => "kvm_intel",
            CpuVendor::Amd => "kvm_amd",
        }
    }
}

/// Facts gathered from one host during the run.
#[derive(Debug, Clone, Default)]
pub struct HostFacts {
    pub mesh_mtu: Option<u32>,
    pub cpu_vendor: Option<CpuVendor>,
}

/// Per-node fact store, keyed by node identity.
#[derive(Default)]
pub struct FactStore {
    hosts: RwLock<HashMap<String, HostFacts>>,
    /// Cluster-wide MTU ceiling, computed by the MTU policy stage.
    mtu_ceiling: Mutex<Option<u32>>,
}

impl FactStore {
    pub fn set_mesh_mtu(&self, host: &str, mtu: u32) {
        self.hosts.write().entry(host.to_string()).or_default().mesh_mtu = Some(mtu);
    }

    pub fn set_cpu_vendor(&self, host: &str, vendor: CpuVendor) {
        self.hosts.write().entry(host.to_string()).or_default().cpu_vendor = Some(vendor);
    }

    pub fn host(&self, host: &str) -> Option<HostFacts> {
        self.hosts.read().get(host).cloned()
    }

    pub fn set_mtu_ceiling(&self, ceiling: u32) {
        *self.mtu_ceiling.lock() = Some(ceiling);
    }

    pub fn mtu_ceiling(&self) -> Option<u32> {
        *self.mtu_ceiling.lock()
    }
}

/// Operator-supplied run configuration, decoded from the variable
/// pipeline plus command-line flags.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Deploy-scoped name, used for the CA common name and key prefixes.
    pub deploy_name: String,
    /// One reachable member of the consistent store.
    pub etcd_endpoint: String,
    pub dns_server: String,
    pub http_proxy: Option<String>,
    /// Fraction of host memory reserved for the system.
    pub ram_system_reservation: f64,
    /// Pre-supplied authentication secret seed; generated when absent.
    pub auth_secret_seed: Option<String>,
    /// Proceed even when the observed MTU floor is below the minimum.
    pub mtu_override: bool,
    /// Free-form operator key/value pairs, applied after the fixed keys.
    pub extra_config: Vec<(String, String)>,
    pub pki_dir: PathBuf,
}

impl RunConfig {
    /// Fold decoded pipeline variables into the configuration.
    ///
    /// Known keys (`deploy_name`, `dns_server`, `http_proxy`,
    /// `ram_system_reservation`, `auth_secret_seed`) override defaults;
    /// keys prefixed `extra.` become free-form config entries; provider
    /// inputs (region, vpc_id, ...) are validated upstream and ignored
    /// here.
    pub fn apply_vars(&mut self, vars: &[(String, String)]) -> MeshbootResult<()> {
        for (key, value) in vars {
            match key.as_str() {
                "deploy_name" => self.deploy_name = value.clone(),
                "dns_server" => self.dns_server = value.clone(),
                "http_proxy" => self.http_proxy = Some(value.clone()),
                "auth_secret_seed" => self.auth_secret_seed = Some(value.clone()),
                "ram_system_reservation" => {
                    self.ram_system_reservation = value.parse().map_err(|_| {
                        MeshbootError::Configuration(format!(
                            "ram_system_reservation must be a number, got '{value}'"
                        ))
                    })?;
                }
                _ => {
                    if let Some(stripped) = key.strip_prefix("extra.") {
                        self.extra_config.push((stripped.to_string(), value.clone()));
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            deploy_name: "mesh".to_string(),
            etcd_endpoint: "http://127.0.0.1:2379".to_string(),
            dns_server: "8.8.8.8".to_string(),
            http_proxy: None,
            ram_system_reservation: 0.25,
            auth_secret_seed: None,
            mtu_override: false,
            extra_config: Vec::new(),
            pki_dir: PathBuf::from("/var/lib/mesh/pki"),
        }
    }
}

/// Everything a stage task can reach: resolved topology, the host
/// runner, run configuration, the fact store, the CA, the audit log.
pub struct RunContext {
    pub topology: Topology,
    pub runner: Arc<HostRunner>,
    pub config: RunConfig,
    pub facts: FactStore,
    pub ca: CaManager,
    pub audit: Mutex<AuditLog>,
}

/// Shared context handle cloned into every task.
pub type Ctx = Arc<RunContext>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_string_resolution() {
        assert_eq!(
            CpuVendor::from_vendor_string("vendor_id\t: GenuineIntel").unwrap(),
            CpuVendor::Intel
        );
        assert_eq!(
            CpuVendor::from_vendor_string("vendor_id\t: AuthenticAMD").unwrap(),
            CpuVendor::Amd
        );
        assert!(CpuVendor::from_vendor_string("vendor_id\t: SomethingElse").is_err());
    }

    #[test]
    fn apply_vars_folds_known_keys_and_extras() {
        let mut config = RunConfig::default();
        config
            .apply_vars(&[
                ("deploy_name".into(), "prod".into()),
                ("ram_system_reservation".into(), "0.4".into()),
                ("extra.SCHEDULER_CACHE".into(), "30".into()),
                ("region".into(), "us-east-1".into()),
            ])
            .unwrap();
        assert_eq!(config.deploy_name, "prod");
        assert_eq!(config.ram_system_reservation, 0.4);
        assert_eq!(config.extra_config, vec![("SCHEDULER_CACHE".to_string(), "30".to_string())]);
    }

    #[test]
    fn apply_vars_rejects_bad_ratio() {
        let mut config = RunConfig::default();
        let err = config
            .apply_vars(&[("ram_system_reservation".into(), "lots".into())])
            .unwrap_err();
        assert!(matches!(err, MeshbootError::Configuration(_)));
    }
}
