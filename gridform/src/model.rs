//! Declared resources and the state persisted between reconciliations.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clients::WgKeyPair;
use crate::grid::ZdbMode;

// =============================================================================
// Declared resources
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpec {
    pub name: String,
    /// Size in GB.
    pub size: u64,
    #[serde(default)]
    pub description: String,
}

/// Key-value storage node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZdbSpec {
    pub name: String,
    /// Size in GB.
    pub size: u64,
    #[serde(default)]
    pub description: String,
    /// Plain password; encrypted before it reaches a workload.
    pub password: String,
    #[serde(default)]
    pub mode: ZdbMode,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MountSpec {
    pub disk_name: String,
    pub mount_point: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

fn default_planetary() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSpec {
    pub name: String,
    pub flist: String,
    pub cpu: u8,
    /// Memory in MB.
    pub memory: u64,
    #[serde(default)]
    pub entrypoint: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
    #[serde(default)]
    pub env_vars: Vec<EnvVar>,
    /// Requested address; assigned by the allocator when absent.
    #[serde(default)]
    pub ip: Option<Ipv4Addr>,
    #[serde(default = "default_planetary")]
    pub planetary: bool,
}

impl MachineSpec {
    /// Environment as a map. A key declared twice keeps its last value.
    pub fn env(&self) -> BTreeMap<String, String> {
        self.env_vars
            .iter()
            .map(|e| (e.key.clone(), e.value.clone()))
            .collect()
    }

    pub fn mount_set(&self) -> BTreeSet<&MountSpec> {
        self.mounts.iter().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Disk,
    StorageNode,
    Machine,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Disk => write!(f, "disk"),
            ResourceKind::StorageNode => write!(f, "storage node"),
            ResourceKind::Machine => write!(f, "machine"),
        }
    }
}

/// One declared resource of a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resource {
    Disk(DiskSpec),
    StorageNode(ZdbSpec),
    Machine(MachineSpec),
}

/// Stable identity of a resource across reconciliations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub name: String,
    /// Machines are a distinct entity per image.
    pub flist: Option<String>,
}

impl Resource {
    pub fn name(&self) -> &str {
        match self {
            Resource::Disk(d) => &d.name,
            Resource::StorageNode(z) => &z.name,
            Resource::Machine(m) => &m.name,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Disk(_) => ResourceKind::Disk,
            Resource::StorageNode(_) => ResourceKind::StorageNode,
            Resource::Machine(_) => ResourceKind::Machine,
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey {
            kind: self.kind(),
            name: self.name().to_string(),
            flist: match self {
                Resource::Machine(m) => Some(m.flist.clone()),
                _ => None,
            },
        }
    }
}

/// A resource as last successfully applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedResource {
    pub version: u32,
    pub resource: Resource,
}

impl RecordedResource {
    /// Address the machine was deployed with.
    pub fn machine_ip(&self) -> Option<Ipv4Addr> {
        match &self.resource {
            Resource::Machine(m) => m.ip,
            _ => None,
        }
    }
}

// =============================================================================
// Deployment resource
// =============================================================================

/// Desired state of a single-node deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSpec {
    pub node_id: u32,
    /// Network workload the machines attach to.
    pub network_name: String,
    /// Subnet machine addresses are allocated from, e.g. `10.1.3.0/24`.
    pub ip_range: String,
    #[serde(default)]
    pub disks: Vec<DiskSpec>,
    #[serde(default)]
    pub zdbs: Vec<ZdbSpec>,
    #[serde(default)]
    pub vms: Vec<MachineSpec>,
}

impl DeploymentSpec {
    /// All resources in submission order: disks, storage nodes, machines.
    pub fn resources(&self) -> Vec<Resource> {
        self.disks
            .iter()
            .cloned()
            .map(Resource::Disk)
            .chain(self.zdbs.iter().cloned().map(Resource::StorageNode))
            .chain(self.vms.iter().cloned().map(Resource::Machine))
            .collect()
    }
}

/// Persisted state of a single-node deployment.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeploymentState {
    pub node_id: Option<u32>,
    /// Network the machines were attached to.
    #[serde(default)]
    pub network_name: String,
    #[serde(default)]
    pub ip_range: Option<Ipv4Net>,
    pub contract_id: Option<u64>,
    /// Version of the last manifest placed under the contract.
    pub version: Option<u32>,
    /// A contract exists but the agent has not confirmed the manifest.
    #[serde(default)]
    pub pending: bool,
    #[serde(default)]
    pub resources: Vec<RecordedResource>,
    #[serde(default)]
    pub used_ips: BTreeSet<Ipv4Addr>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl DeploymentState {
    pub fn is_provisioned(&self) -> bool {
        self.contract_id.is_some()
    }
}

// =============================================================================
// Network resource
// =============================================================================

/// Desired state of a mesh network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Whole network range, e.g. `10.1.0.0/16`.
    pub ip_range: String,
    pub nodes: Vec<u32>,
    /// Node the external access point dials into. Defaults to the first node.
    #[serde(default)]
    pub public_node: Option<u32>,
}

/// Durable per-node record of a mesh network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDeploymentRecord {
    pub node_id: u32,
    /// `None` until the node accepted a deployment.
    pub version: Option<u32>,
    /// `None` until the ledger created a contract.
    pub contract_id: Option<u64>,
    #[serde(default)]
    pub pending: bool,
    pub key: WgKeyPair,
    pub port: u16,
    pub subnet: Ipv4Net,
}

/// Persisted state of a mesh network.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetworkState {
    pub id: Option<Uuid>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub ip_range: Option<Ipv4Net>,
    pub public_node: Option<u32>,
    pub external_subnet: Option<Ipv4Net>,
    pub external_key: Option<WgKeyPair>,
    #[serde(default)]
    pub access_config: String,
    #[serde(default)]
    pub nodes: Vec<NodeDeploymentRecord>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl NetworkState {
    pub fn node(&self, node_id: u32) -> Option<&NodeDeploymentRecord> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    pub fn node_mut(&mut self, node_id: u32) -> Option<&mut NodeDeploymentRecord> {
        self.nodes.iter_mut().find(|n| n.node_id == node_id)
    }

    pub fn node_ids(&self) -> BTreeSet<u32> {
        self.nodes.iter().map(|n| n.node_id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(name: &str, flist: &str) -> MachineSpec {
        MachineSpec {
            name: name.to_string(),
            flist: flist.to_string(),
            cpu: 1,
            memory: 1024,
            entrypoint: String::new(),
            description: String::new(),
            mounts: vec![],
            env_vars: vec![],
            ip: None,
            planetary: true,
        }
    }

    #[test]
    fn test_env_last_write_wins() {
        let mut vm = machine("web1", "base.flist");
        vm.env_vars = vec![
            EnvVar {
                key: "MODE".to_string(),
                value: "dev".to_string(),
            },
            EnvVar {
                key: "PORT".to_string(),
                value: "80".to_string(),
            },
            EnvVar {
                key: "MODE".to_string(),
                value: "prod".to_string(),
            },
        ];
        let env = vm.env();
        assert_eq!(env.len(), 2);
        assert_eq!(env["MODE"], "prod");
        assert_eq!(env["PORT"], "80");
    }

    #[test]
    fn test_machine_key_includes_flist() {
        let a = Resource::Machine(machine("web1", "a.flist"));
        let b = Resource::Machine(machine("web1", "b.flist"));
        assert_ne!(a.key(), b.key());

        let disk = Resource::Disk(DiskSpec {
            name: "web1".to_string(),
            size: 1,
            description: String::new(),
        });
        assert_ne!(disk.key(), a.key());
        assert_eq!(disk.key().flist, None);
    }

    #[test]
    fn test_resources_in_submission_order() {
        let spec: DeploymentSpec = serde_json::from_str(
            r#"{
                "node_id": 2,
                "network_name": "net1",
                "ip_range": "10.1.3.0/24",
                "vms": [{"name": "web1", "flist": "base.flist", "cpu": 1, "memory": 1024}],
                "disks": [{"name": "data", "size": 10}],
                "zdbs": [{"name": "kv", "size": 5, "password": "secret"}]
            }"#,
        )
        .unwrap();

        let kinds: Vec<_> = spec.resources().iter().map(Resource::kind).collect();
        assert_eq!(
            kinds,
            vec![
                ResourceKind::Disk,
                ResourceKind::StorageNode,
                ResourceKind::Machine
            ]
        );
        assert!(spec.vms[0].planetary);
        assert_eq!(spec.zdbs[0].mode, ZdbMode::User);
    }

    #[test]
    fn test_recorded_resource_is_kind_tagged() {
        let recorded = RecordedResource {
            version: 3,
            resource: Resource::Disk(DiskSpec {
                name: "data".to_string(),
                size: 10,
                description: "logs".to_string(),
            }),
        };
        let value = serde_json::to_value(&recorded).unwrap();
        assert_eq!(value["version"], 3);
        assert_eq!(value["resource"]["kind"], "disk");
        assert_eq!(value["resource"]["name"], "data");
    }
}
