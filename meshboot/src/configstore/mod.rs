//! Config propagation into the distributed consistent store.
//!
//! Writes go through one reachable member of the etcd cluster (the
//! coordinator address) by driving `etcdctl` over the host task runner,
//! and every key written this run is verified by read-back before the
//! run may report success.

use std::fmt;
use std::sync::Arc;

use meshboot_shared::{MeshbootError, MeshbootResult};

use crate::runner::{HostRunner, Operation, RemoteCommand};
use crate::topology::Node;

/// Keyspace prefix for cluster configuration entries.
pub const CONFIG_PREFIX: &str = "/mesh/config/";

/// Hard floor for the mesh transport MTU. Below this, overlay traffic
/// fragments badly enough that the cluster is not worth bringing up.
pub const ABSOLUTE_MIN_MTU: u32 = 2000;

/// Where a configuration entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// Computed by the orchestrator (e.g. the MTU ceiling).
    Computed,
    /// Supplied by the operator through the variable pipeline.
    Operator,
    /// Free-form extra pair, applied after the fixed keys.
    Extra,
}

/// A typed configuration value with a canonical string rendering.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Str(s) => f.write_str(s),
            ConfigValue::Int(i) => write!(f, "{i}"),
            ConfigValue::Float(x) => write!(f, "{x}"),
            ConfigValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(s: &str) -> Self {
        ConfigValue::Str(s.to_string())
    }
}

/// One entry applied during this run, kept for the verification pass.
#[derive(Debug, Clone)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
    pub provenance: Provenance,
}

/// Minimum observed MTU across the given per-host readings.
pub fn mtu_floor(observed: &[u32]) -> Option<u32> {
    observed.iter().copied().min()
}

/// Enforce the MTU safety floor. The override flag turns the abort into
/// a loud warning.
pub fn enforce_mtu_floor(observed_min: u32, override_flag: bool) -> MeshbootResult<u32> {
    if observed_min < ABSOLUTE_MIN_MTU {
        if override_flag {
            tracing::warn!(
                observed = observed_min,
                floor = ABSOLUTE_MIN_MTU,
                "mesh MTU below floor, proceeding because the override flag is set"
            );
            return Ok(observed_min);
        }
        return Err(MeshbootError::MtuPolicy {
            observed: observed_min,
            floor: ABSOLUTE_MIN_MTU,
        });
    }
    Ok(observed_min)
}

/// Writes and verifies configuration entries via `etcdctl` on the
/// coordinator host.
pub struct ConfigPropagator {
    runner: Arc<HostRunner>,
    coordinator: Arc<Node>,
    endpoint: String,
    applied: Vec<ConfigEntry>,
}

impl ConfigPropagator {
    pub fn new(runner: Arc<HostRunner>, coordinator: Arc<Node>, endpoint: impl Into<String>) -> Self {
        Self {
            runner,
            coordinator,
            endpoint: endpoint.into(),
            applied: Vec::new(),
        }
    }

    fn etcdctl<I, S>(&self, args: I) -> RemoteCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv = vec!["etcdctl".to_string(), format!("--endpoints={}", self.endpoint)];
        argv.extend(args.into_iter().map(Into::into));
        RemoteCommand::new(argv).env("ETCDCTL_API", "3")
    }

    fn qualified(key: &str) -> String {
        format!("{CONFIG_PREFIX}{key}")
    }

    /// Write one entry. Puts are overwrite-idempotent, so there is no
    /// separate check step; re-runs simply rewrite the same value.
    pub async fn set(
        &mut self,
        key: &str,
        value: ConfigValue,
        provenance: Provenance,
    ) -> MeshbootResult<()> {
        let rendered = value.to_string();
        let op = Operation::new(
            format!("config-set-{key}"),
            self.etcdctl(["put".to_string(), Self::qualified(key), rendered.clone()]),
        );
        self.runner.run(&self.coordinator, &op).await?;
        tracing::info!(key, value = %rendered, ?provenance, "config entry written");
        self.applied.push(ConfigEntry {
            key: key.to_string(),
            value: rendered,
            provenance,
        });
        Ok(())
    }

    /// Read one entry back; `None` when the key is unset.
    pub async fn get(&self, key: &str) -> MeshbootResult<Option<String>> {
        let command = self.etcdctl([
            "get".to_string(),
            Self::qualified(key),
            "--print-value-only".to_string(),
        ]);
        let output = self.runner.transport().exec(&self.coordinator, &command).await?;
        if !output.ok() {
            return Err(MeshbootError::Fatal(format!(
                "etcdctl get {key} failed: {}",
                output.failure_detail()
            )));
        }
        let value = output.stdout.trim_end_matches('\n');
        if value.is_empty() {
            Ok(None)
        } else {
            Ok(Some(value.to_string()))
        }
    }

    /// Read back every key written this run. Any missing or mismatched
    /// key fails the verification, listing exactly the offenders.
    pub async fn verify(&self) -> MeshbootResult<()> {
        let mut bad_keys = Vec::new();
        for entry in &self.applied {
            match self.get(&entry.key).await? {
                Some(stored) if stored == entry.value => {}
                _ => bad_keys.push(entry.key.clone()),
            }
        }
        if bad_keys.is_empty() {
            tracing::info!(keys = self.applied.len(), "config verification passed");
            Ok(())
        } else {
            Err(MeshbootError::ConfigMismatch { keys: bad_keys })
        }
    }

    /// Entries applied this run, in application order.
    pub fn applied(&self) -> &[ConfigEntry] {
        &self.applied
    }
}
