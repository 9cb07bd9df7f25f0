//! Shared test utilities for gridform integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use gridform::clients::memory::{MemoryGrid, MemoryIdentity, SequentialKeys};
use gridform::grid::{Deployment, Peer, WorkloadData};
use gridform::model::MachineSpec;
use gridform::{EngineConfig, GridClients, NetworkSpec};

pub const TWIN_ID: u32 = 14;

/// Engine configuration with short polling so failures surface quickly.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        completion_budget_secs: 1,
        poll_interval_ms: 10,
        ..EngineConfig::default()
    }
}

/// A fresh in-memory grid plus the clients bundle pointing at it.
pub fn memory_grid() -> (Arc<MemoryGrid>, GridClients) {
    let grid = Arc::new(MemoryGrid::new());
    let clients = GridClients {
        ledger: grid.clone(),
        agent: grid.clone(),
        directory: grid.clone(),
        identity: Arc::new(MemoryIdentity::new(TWIN_ID)),
        keys: Arc::new(SequentialKeys::new("integration")),
    };
    (grid, clients)
}

pub fn machine(name: &str) -> MachineSpec {
    MachineSpec {
        name: name.to_string(),
        flist: "https://hub.grid.tf/tf-official-apps/base:latest.flist".to_string(),
        cpu: 1,
        memory: 1024,
        entrypoint: "/sbin/zinit init".to_string(),
        description: String::new(),
        mounts: vec![],
        env_vars: vec![],
        ip: None,
        planetary: true,
    }
}

pub fn network(nodes: Vec<u32>) -> NetworkSpec {
    NetworkSpec {
        name: "net1".to_string(),
        description: "integration mesh".to_string(),
        ip_range: "10.1.0.0/16".to_string(),
        nodes,
        public_node: None,
    }
}

/// Peers of the single network workload in `deployment`.
pub fn peers(deployment: &Deployment) -> Vec<Peer> {
    match &deployment.workloads[0].data {
        WorkloadData::Network(net) => net.peers.clone(),
        other => panic!("expected a network workload, got {:?}", other),
    }
}

/// Peers reachable through an endpoint, i.e. other mesh members.
pub fn mesh_peers(deployment: &Deployment) -> Vec<Peer> {
    peers(deployment)
        .into_iter()
        .filter(|p| p.endpoint.is_some())
        .collect()
}
