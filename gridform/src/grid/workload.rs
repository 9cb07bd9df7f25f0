//! Workload payloads.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

pub const MEGABYTE: u64 = 1024 * 1024;
pub const GIGABYTE: u64 = 1024 * MEGABYTE;

/// Kind tag of a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadKind {
    ZMount,
    Zdb,
    ZMachine,
    Network,
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkloadKind::ZMount => "zmount",
            WorkloadKind::Zdb => "zdb",
            WorkloadKind::ZMachine => "zmachine",
            WorkloadKind::Network => "network",
        };
        write!(f, "{}", s)
    }
}

/// Block-backed disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZMount {
    /// Size in bytes.
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZdbMode {
    #[default]
    User,
    Seq,
}

impl fmt::Display for ZdbMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZdbMode::User => write!(f, "user"),
            ZdbMode::Seq => write!(f, "seq"),
        }
    }
}

/// Key-value storage namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zdb {
    /// Size in bytes.
    pub size: u64,
    pub mode: ZdbMode,
    /// Hex-encoded ciphertext, never the plain password.
    pub password: String,
    pub public: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineInterface {
    /// Name of the network workload the interface joins.
    pub network: String,
    pub ip: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineNetwork {
    pub planetary: bool,
    pub interfaces: Vec<MachineInterface>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeCapacity {
    pub cpu: u8,
    /// Memory in bytes.
    pub memory: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineMount {
    /// Name of the zmount workload.
    pub name: String,
    pub mountpoint: String,
}

/// Virtual machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZMachine {
    pub flist: String,
    pub network: MachineNetwork,
    pub compute_capacity: ComputeCapacity,
    pub entrypoint: String,
    /// Mounts in declaration order.
    pub mounts: Vec<MachineMount>,
    pub env: BTreeMap<String, String>,
}

/// One mesh peer as seen from the node owning the network workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub subnet: Ipv4Net,
    pub wg_public_key: String,
    /// `None` for a peer that dials in (the external access point).
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<Ipv4Net>,
}

/// Private mesh network on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkData {
    pub ip_range: Ipv4Net,
    pub subnet: Ipv4Net,
    pub wg_private_key: String,
    pub wg_listen_port: u16,
    pub peers: Vec<Peer>,
}

/// Kind-specific payload of a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WorkloadData {
    ZMount(ZMount),
    Zdb(Zdb),
    ZMachine(ZMachine),
    Network(NetworkData),
}

impl WorkloadData {
    pub fn kind(&self) -> WorkloadKind {
        match self {
            WorkloadData::ZMount(_) => WorkloadKind::ZMount,
            WorkloadData::Zdb(_) => WorkloadKind::Zdb,
            WorkloadData::ZMachine(_) => WorkloadKind::ZMachine,
            WorkloadData::Network(_) => WorkloadKind::Network,
        }
    }
}

/// Terminal (or pending) state the agent reports for a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultState {
    /// Not processed yet.
    #[default]
    #[serde(rename = "")]
    Init,
    Ok,
    Error,
    Deleted,
}

impl ResultState {
    pub fn is_pending(self) -> bool {
        self == ResultState::Init
    }
}

impl fmt::Display for ResultState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultState::Init => write!(f, "init"),
            ResultState::Ok => write!(f, "ok"),
            ResultState::Error => write!(f, "error"),
            ResultState::Deleted => write!(f, "deleted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkloadResult {
    pub state: ResultState,
    #[serde(default)]
    pub error: String,
}

/// Versioned unit of a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub version: u32,
    pub name: String,
    pub description: String,
    pub data: WorkloadData,
    /// Filled in by the agent; empty on submission.
    #[serde(default)]
    pub result: WorkloadResult,
}

impl Workload {
    pub fn new(name: impl Into<String>, version: u32, description: impl Into<String>, data: WorkloadData) -> Self {
        Self {
            version,
            name: name.into(),
            description: description.into(),
            data,
            result: WorkloadResult::default(),
        }
    }

    pub fn kind(&self) -> WorkloadKind {
        self.data.kind()
    }
}
