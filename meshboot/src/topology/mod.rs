//! Topology resolution.
//!
//! Turns the declarative node list into role-qualified, immutable node
//! records plus derived role groups. Resolution is the only place topology
//! invariants are checked; everything downstream may assume they hold.

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use meshboot_shared::{MeshbootError, MeshbootResult};

/// Functional responsibilities a node may carry. Membership is
/// many-to-many: one node is commonly hypervisor and etcd master at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Hypervisor,
    NetworkNode,
    EtcdMaster,
    Storage,
    PrimaryNode,
    EventlogNode,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Hypervisor => "hypervisor",
            Role::NetworkNode => "network_node",
            Role::EtcdMaster => "etcd_master",
            Role::Storage => "storage",
            Role::PrimaryNode => "primary_node",
            Role::EventlogNode => "eventlog_node",
        };
        f.write_str(name)
    }
}

/// One entry of the topology input, as supplied by the operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    pub mesh_ip: String,
    pub mesh_nic: String,
    pub roles: Vec<Role>,
}

/// A resolved cluster member. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub mesh_ip: IpAddr,
    /// NIC carrying mesh traffic; its MTU bounds the transport MTU.
    pub mesh_nic: String,
    pub roles: HashSet<Role>,
    /// Declaration index. Gives stable iteration order wherever output
    /// formatting depends on it (inventory files, hosts tables).
    pub index: usize,
}

impl Node {
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Resolved topology: nodes in declaration order plus role-group views.
#[derive(Debug, Clone)]
pub struct Topology {
    nodes: Vec<Arc<Node>>,
}

impl Topology {
    /// Resolve the raw node list, enforcing the role invariants:
    /// exactly one `primary_node`, exactly one `network_node`, at least
    /// one `etcd_master`, unique node names, parseable mesh addresses.
    pub fn resolve(specs: Vec<NodeSpec>) -> MeshbootResult<Topology> {
        if specs.is_empty() {
            return Err(MeshbootError::Topology("topology has no nodes".into()));
        }

        let mut seen = HashSet::new();
        let mut nodes = Vec::with_capacity(specs.len());

        for (index, spec) in specs.into_iter().enumerate() {
            if !seen.insert(spec.name.clone()) {
                return Err(MeshbootError::Topology(format!(
                    "duplicate node name '{}'",
                    spec.name
                )));
            }
            let mesh_ip: IpAddr = spec.mesh_ip.parse().map_err(|_| {
                MeshbootError::Topology(format!(
                    "node '{}': invalid mesh_ip '{}'",
                    spec.name, spec.mesh_ip
                ))
            })?;
            nodes.push(Arc::new(Node {
                name: spec.name,
                mesh_ip,
                mesh_nic: spec.mesh_nic,
                roles: spec.roles.into_iter().collect(),
                index,
            }));
        }

        let topology = Topology { nodes };

        topology.require_exactly_one(Role::PrimaryNode)?;
        topology.require_exactly_one(Role::NetworkNode)?;
        if topology.group(Role::EtcdMaster).is_empty() {
            return Err(MeshbootError::Topology(
                "at least one etcd_master node is required".into(),
            ));
        }

        Ok(topology)
    }

    /// Load and resolve a topology from a JSON node list.
    pub fn from_json(path: &Path) -> MeshbootResult<Topology> {
        let raw = std::fs::read_to_string(path)?;
        let specs: Vec<NodeSpec> = serde_json::from_str(&raw).map_err(|e| {
            MeshbootError::Topology(format!("cannot parse topology {}: {e}", path.display()))
        })?;
        Topology::resolve(specs)
    }

    fn require_exactly_one(&self, role: Role) -> MeshbootResult<()> {
        let members = self.group(role);
        match members.len() {
            1 => Ok(()),
            0 => Err(MeshbootError::Topology(format!(
                "no node carries the {role} role"
            ))),
            n => Err(MeshbootError::Topology(format!(
                "{n} nodes carry the {role} role, expected exactly one"
            ))),
        }
    }

    /// All nodes in declaration order.
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// Members of one role group, in declaration order.
    pub fn group(&self, role: Role) -> Vec<Arc<Node>> {
        self.nodes
            .iter()
            .filter(|n| n.has_role(role))
            .cloned()
            .collect()
    }

    pub fn primary(&self) -> Arc<Node> {
        // Invariant checked at resolution time.
        self.group(Role::PrimaryNode).remove(0)
    }

    pub fn network_node(&self) -> Arc<Node> {
        self.group(Role::NetworkNode).remove(0)
    }

    pub fn etcd_masters(&self) -> Vec<Arc<Node>> {
        self.group(Role::EtcdMaster)
    }

    pub fn hypervisors(&self) -> Vec<Arc<Node>> {
        self.group(Role::Hypervisor)
    }

    /// Hosts touched by the rolling restart, in declaration order, each at
    /// most once even when it carries several of the restarted roles.
    pub fn restart_order(&self) -> Vec<Arc<Node>> {
        self.nodes
            .iter()
            .filter(|n| {
                n.has_role(Role::Hypervisor)
                    || n.has_role(Role::NetworkNode)
                    || n.has_role(Role::Storage)
                    || n.has_role(Role::EtcdMaster)
            })
            .cloned()
            .collect()
    }

    /// Nodes participating in mesh-MTU discovery.
    pub fn mtu_probe_targets(&self) -> Vec<Arc<Node>> {
        self.nodes
            .iter()
            .filter(|n| {
                n.has_role(Role::Hypervisor)
                    || n.has_role(Role::NetworkNode)
                    || n.has_role(Role::EventlogNode)
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, ip: &str, roles: Vec<Role>) -> NodeSpec {
        NodeSpec {
            name: name.to_string(),
            mesh_ip: ip.to_string(),
            mesh_nic: "eth1".to_string(),
            roles,
        }
    }

    fn valid_specs() -> Vec<NodeSpec> {
        vec![
            spec(
                "node-1",
                "10.0.0.1",
                vec![Role::PrimaryNode, Role::Hypervisor, Role::EtcdMaster],
            ),
            spec(
                "node-2",
                "10.0.0.2",
                vec![Role::NetworkNode, Role::Hypervisor],
            ),
            spec("node-3", "10.0.0.3", vec![Role::Storage, Role::EtcdMaster]),
        ]
    }

    #[test]
    fn resolves_valid_topology() {
        let topo = Topology::resolve(valid_specs()).unwrap();
        assert_eq!(topo.nodes().len(), 3);
        assert_eq!(topo.primary().name, "node-1");
        assert_eq!(topo.network_node().name, "node-2");
        assert_eq!(topo.etcd_masters().len(), 2);
    }

    #[test]
    fn rejects_missing_primary() {
        let mut specs = valid_specs();
        specs[0].roles.retain(|r| *r != Role::PrimaryNode);
        let err = Topology::resolve(specs).unwrap_err();
        assert!(matches!(err, MeshbootError::Topology(_)));
        assert!(err.to_string().contains("primary_node"));
    }

    #[test]
    fn rejects_two_network_nodes() {
        let mut specs = valid_specs();
        specs[2].roles.push(Role::NetworkNode);
        let err = Topology::resolve(specs).unwrap_err();
        assert!(err.to_string().contains("network_node"));
    }

    #[test]
    fn rejects_no_etcd_master() {
        let mut specs = valid_specs();
        for s in &mut specs {
            s.roles.retain(|r| *r != Role::EtcdMaster);
        }
        let err = Topology::resolve(specs).unwrap_err();
        assert!(err.to_string().contains("etcd_master"));
    }

    #[test]
    fn rejects_duplicate_names() {
        let mut specs = valid_specs();
        specs[1].name = "node-1".to_string();
        let err = Topology::resolve(specs).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn rejects_bad_mesh_ip() {
        let mut specs = valid_specs();
        specs[1].mesh_ip = "not-an-ip".to_string();
        assert!(Topology::resolve(specs).is_err());
    }

    #[test]
    fn restart_order_follows_declaration_order() {
        let topo = Topology::resolve(valid_specs()).unwrap();
        let order: Vec<_> = topo
            .restart_order()
            .iter()
            .map(|n| n.name.clone())
            .collect();
        assert_eq!(order, vec!["node-1", "node-2", "node-3"]);
    }
}
