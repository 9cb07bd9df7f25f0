//! Network reconciler - keeps a full WireGuard mesh across the declared nodes.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::Utc;
use ipnet::Ipv4Net;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

use super::Reconciler;
use crate::allocator::{allocate_port, allocate_subnet, external_subnet, FIRST_NODE_SUBNET_INDEX};
use crate::clients::{GridClients, WgKeyPair};
use crate::config::EngineConfig;
use crate::error::{ProvisionError, Result};
use crate::lifecycle::{LifecycleController, Submission};
use crate::model::{NetworkSpec, NetworkState, NodeDeploymentRecord};
use crate::topology::{generate_deployments, NetworkConfiguration, NodeAssignment};
use crate::validation::{parse_ip_range, validate_name, ValidationError};

/// Network reconciler that provisions one network deployment per member node.
pub struct NetworkReconciler {
    clients: GridClients,
    config: EngineConfig,
    lifecycle: LifecycleController,
    rng: Mutex<StdRng>,
}

impl NetworkReconciler {
    pub fn new(clients: GridClients, config: EngineConfig) -> Self {
        Self::with_rng(clients, config, StdRng::from_entropy())
    }

    /// Use a fixed port sampler, e.g. a seeded one.
    pub fn with_rng(clients: GridClients, config: EngineConfig, rng: StdRng) -> Self {
        let lifecycle =
            LifecycleController::new(&clients, config.network_call_timeout(), &config);
        Self {
            clients,
            config,
            lifecycle,
            rng: Mutex::new(rng),
        }
    }

    fn generate_key(&self, node_id: u32) -> Result<WgKeyPair> {
        self.clients
            .keys
            .generate()
            .map_err(|e| ProvisionError::remote("generate key pair", node_id, None, e))
    }

    /// Pick subnet, port and key for a node joining the mesh.
    async fn assign(
        &self,
        node_id: u32,
        range: &Ipv4Net,
        used: &BTreeSet<Ipv4Net>,
    ) -> Result<NodeDeploymentRecord> {
        let subnet = allocate_subnet(range, used, FIRST_NODE_SUBNET_INDEX)?;
        let reserved = self.lifecycle.reserved_ports(node_id).await?;
        let port = {
            let mut rng = self.rng.lock().await;
            allocate_port(
                node_id,
                &reserved,
                self.config.port_range(),
                self.config.port_attempts,
                &mut *rng,
            )?
        };
        let key = self.generate_key(node_id)?;
        info!(
            "Assigned subnet {} and listen port {} to node {}",
            subnet, port, node_id
        );
        Ok(NodeDeploymentRecord {
            node_id,
            version: None,
            contract_id: None,
            pending: false,
            key,
            port,
            subnet,
        })
    }
}

/// Validation that needs no remote call. Returns the parsed range and the
/// public node.
pub(crate) fn check_input(
    spec: &NetworkSpec,
    state: &NetworkState,
) -> std::result::Result<(Ipv4Net, u32), ValidationError> {
    validate_name(&spec.name)?;
    let range = parse_ip_range(&spec.ip_range)?;
    if let Some(recorded) = state.ip_range {
        if recorded != range {
            return Err(ValidationError::InvalidIpRange(format!(
                "{} differs from recorded range {}",
                range, recorded
            )));
        }
    }

    if spec.nodes.is_empty() {
        return Err(ValidationError::NoNodes);
    }
    let mut seen = BTreeSet::new();
    for &node_id in &spec.nodes {
        if !seen.insert(node_id) {
            return Err(ValidationError::DuplicateNode(node_id));
        }
    }

    let public_node = spec
        .public_node
        .or(state.public_node.filter(|id| seen.contains(id)))
        .unwrap_or(spec.nodes[0]);
    if !seen.contains(&public_node) {
        return Err(ValidationError::PublicNodeMissing(public_node));
    }
    Ok((range, public_node))
}

pub(crate) fn is_up_to_date(spec: &NetworkSpec, state: &NetworkState, public_node: u32) -> bool {
    let declared: BTreeSet<u32> = spec.nodes.iter().copied().collect();
    declared == state.node_ids()
        && state
            .nodes
            .iter()
            .all(|n| n.contract_id.is_some() && !n.pending)
        && state.public_node == Some(public_node)
        && state.name == spec.name
        && state.description == spec.description
        && !state.access_config.is_empty()
}

#[async_trait]
impl Reconciler for NetworkReconciler {
    type Spec = NetworkSpec;
    type State = NetworkState;

    async fn reconcile(&self, spec: &Self::Spec, state: &mut Self::State) -> Result<()> {
        info!("Reconciling network {} ({} nodes)", spec.name, spec.nodes.len());

        let (range, public_node) = check_input(spec, state)?;
        if is_up_to_date(spec, state, public_node) {
            info!("Network {} is up to date", spec.name);
            return Ok(());
        }

        let external_subnet = match state.external_subnet {
            Some(subnet) => subnet,
            None => external_subnet(&range)?,
        };
        let external_key = match &state.external_key {
            Some(key) => key.clone(),
            None => self.generate_key(public_node)?,
        };
        state.id.get_or_insert_with(Uuid::new_v4);
        state.ip_range = Some(range);
        state.external_subnet = Some(external_subnet);
        state.external_key = Some(external_key.clone());

        let mut used: BTreeSet<Ipv4Net> = state.nodes.iter().map(|n| n.subnet).collect();
        used.insert(external_subnet);
        for &node_id in &spec.nodes {
            if state.node(node_id).is_none() {
                let record = self.assign(node_id, &range, &used).await?;
                used.insert(record.subnet);
                state.nodes.push(record);
                state.updated_at = Some(Utc::now());
            }
        }

        let mut nodes = Vec::with_capacity(spec.nodes.len());
        for &node_id in &spec.nodes {
            let record = state
                .node(node_id)
                .ok_or(ValidationError::MissingAssignment(node_id))?;
            nodes.push(NodeAssignment {
                node_id,
                subnet: record.subnet,
                port: record.port,
                key: record.key.clone(),
                version: record.version,
                contract_id: record.contract_id,
            });
        }
        let configuration = NetworkConfiguration {
            name: spec.name.clone(),
            description: spec.description.clone(),
            ip_range: range,
            overlay_range: self.config.overlay_range,
            keepalive_secs: self.config.keepalive_secs,
            nodes,
            public_node,
            external_subnet,
            external_key,
        };
        let generated = generate_deployments(
            &configuration,
            self.clients.directory.as_ref(),
            self.clients.identity.as_ref(),
        )
        .await?;

        for (node_id, mut deployment) in generated.deployments {
            let record = state
                .node(node_id)
                .ok_or(ValidationError::MissingAssignment(node_id))?;
            let submission = Submission::from_record(record.contract_id, record.pending);

            let contract_id = self
                .lifecycle
                .place_contract(node_id, submission, &mut deployment)
                .await?;
            if let Some(record) = state.node_mut(node_id) {
                record.contract_id = Some(contract_id);
                record.version = Some(deployment.version);
                record.pending = true;
            }
            state.updated_at = Some(Utc::now());

            self.lifecycle
                .deliver(node_id, submission, &deployment)
                .await?;
            if let Some(record) = state.node_mut(node_id) {
                record.pending = false;
            }
        }

        // the retained members run the new topology from here on
        state.name = spec.name.clone();
        state.description = spec.description.clone();
        state.public_node = Some(public_node);
        state.access_config = generated.access_config;
        state.updated_at = Some(Utc::now());

        let removed: Vec<NodeDeploymentRecord> = state
            .nodes
            .iter()
            .filter(|n| !spec.nodes.contains(&n.node_id))
            .cloned()
            .collect();
        for record in removed {
            info!("Removing node {} from network {}", record.node_id, spec.name);
            if let Some(contract_id) = record.contract_id {
                self.lifecycle.cancel(record.node_id, contract_id).await?;
            }
            state.nodes.retain(|n| n.node_id != record.node_id);
            state.updated_at = Some(Utc::now());
        }

        info!(
            "Network {} ready on {} nodes (public node {})",
            spec.name,
            state.nodes.len(),
            public_node
        );
        Ok(())
    }

    async fn finalize(&self, state: &mut Self::State) -> Result<()> {
        info!("Finalizing (deleting) network {}", state.name);

        let mut first_error = None;
        let mut kept = Vec::new();
        for record in std::mem::take(&mut state.nodes) {
            let Some(contract_id) = record.contract_id else {
                continue;
            };
            if let Err(e) = self.lifecycle.cancel(record.node_id, contract_id).await {
                error!(
                    "Failed to remove network {} from node {}: {}",
                    state.name, record.node_id, e
                );
                kept.push(record);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(e) => {
                state.nodes = kept;
                state.updated_at = Some(Utc::now());
                Err(e)
            }
            None => {
                *state = NetworkState::default();
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::memory::{MemoryGrid, MemoryIdentity, Operation, SequentialKeys};
    use crate::clients::ClientError;
    use std::sync::Arc;

    fn config() -> EngineConfig {
        EngineConfig {
            completion_budget_secs: 1,
            poll_interval_ms: 10,
            port_range_start: 3000,
            port_range_end: 3004,
            port_attempts: 64,
            ..EngineConfig::default()
        }
    }

    fn setup() -> (Arc<MemoryGrid>, NetworkReconciler) {
        let grid = Arc::new(MemoryGrid::new());
        let clients = GridClients {
            ledger: grid.clone(),
            agent: grid.clone(),
            directory: grid.clone(),
            identity: Arc::new(MemoryIdentity::new(14)),
            keys: Arc::new(SequentialKeys::new("test")),
        };
        let reconciler = NetworkReconciler::with_rng(clients, config(), StdRng::seed_from_u64(7));
        (grid, reconciler)
    }

    fn spec(nodes: Vec<u32>) -> NetworkSpec {
        NetworkSpec {
            name: "net1".to_string(),
            description: "mesh".to_string(),
            ip_range: "10.1.0.0/16".to_string(),
            nodes,
            public_node: None,
        }
    }

    #[tokio::test]
    async fn test_create_single_node() {
        let (grid, reconciler) = setup();
        let mut state = NetworkState::default();
        reconciler.reconcile(&spec(vec![1]), &mut state).await.unwrap();

        assert!(state.id.is_some());
        assert_eq!(state.public_node, Some(1));
        assert_eq!(state.external_subnet, Some("10.1.2.0/24".parse().unwrap()));
        assert_eq!(state.nodes.len(), 1);

        let node = &state.nodes[0];
        assert_eq!(node.subnet, "10.1.3.0/24".parse::<Ipv4Net>().unwrap());
        assert!((3000..3004).contains(&node.port));
        assert_eq!(node.version, Some(0));
        assert!(!node.pending);
        assert!(grid.reserved(1).contains(&node.port));
        assert!(state.access_config.contains("Address = 100.64.1.2\n"));
    }

    #[tokio::test]
    async fn test_port_avoids_reserved() {
        let (grid, reconciler) = setup();
        grid.set_reserved_ports(1, [3000, 3001, 3003]);
        let mut state = NetworkState::default();
        reconciler.reconcile(&spec(vec![1]), &mut state).await.unwrap();
        assert_eq!(state.nodes[0].port, 3002);
    }

    #[tokio::test]
    async fn test_port_space_exhausted() {
        let (grid, reconciler) = setup();
        grid.set_reserved_ports(1, 3000..3004);
        let mut state = NetworkState::default();
        assert!(matches!(
            reconciler.reconcile(&spec(vec![1]), &mut state).await,
            Err(ProvisionError::PortSpaceExhausted {
                node_id: 1,
                attempts: 64
            })
        ));
        assert_eq!(grid.count(Operation::CreateContract), 0);
        assert!(state.nodes.is_empty());
    }

    #[tokio::test]
    async fn test_public_node_must_be_declared() {
        let (grid, reconciler) = setup();
        let mut declared = spec(vec![1, 2]);
        declared.public_node = Some(9);
        let mut state = NetworkState::default();
        assert!(matches!(
            reconciler.reconcile(&declared, &mut state).await,
            Err(ProvisionError::Validation(ValidationError::PublicNodeMissing(9)))
        ));
        assert!(grid.calls().is_empty());
        assert_eq!(state, NetworkState::default());
    }

    #[tokio::test]
    async fn test_duplicate_node_rejected() {
        let (grid, reconciler) = setup();
        let mut state = NetworkState::default();
        assert!(matches!(
            reconciler.reconcile(&spec(vec![1, 2, 1]), &mut state).await,
            Err(ProvisionError::Validation(ValidationError::DuplicateNode(1)))
        ));
        assert!(grid.calls().is_empty());
    }

    #[tokio::test]
    async fn test_range_change_rejected() {
        let (_grid, reconciler) = setup();
        let mut state = NetworkState::default();
        reconciler.reconcile(&spec(vec![1]), &mut state).await.unwrap();

        let mut moved = spec(vec![1]);
        moved.ip_range = "10.2.0.0/16".to_string();
        assert!(matches!(
            reconciler.reconcile(&moved, &mut state).await,
            Err(ProvisionError::Validation(ValidationError::InvalidIpRange(_)))
        ));
    }

    #[tokio::test]
    async fn test_unchanged_network_makes_no_remote_calls() {
        let (grid, reconciler) = setup();
        let mut state = NetworkState::default();
        reconciler.reconcile(&spec(vec![1, 2]), &mut state).await.unwrap();
        let before = state.clone();

        grid.clear_calls();
        reconciler.reconcile(&spec(vec![2, 1]), &mut state).await.unwrap();
        assert!(grid.calls().is_empty());
        assert_eq!(state, before);
    }

    #[tokio::test]
    async fn test_description_change_updates_every_node() {
        let (grid, reconciler) = setup();
        let mut state = NetworkState::default();
        reconciler.reconcile(&spec(vec![1, 2]), &mut state).await.unwrap();

        let mut declared = spec(vec![1, 2]);
        declared.description = "renamed".to_string();
        grid.clear_calls();
        reconciler.reconcile(&declared, &mut state).await.unwrap();

        assert_eq!(grid.count(Operation::UpdateContract), 2);
        assert_eq!(grid.count(Operation::CreateContract), 0);
        assert!(state.nodes.iter().all(|n| n.version == Some(1)));
        assert_eq!(state.description, "renamed");
    }

    #[tokio::test]
    async fn test_finalize_cancels_every_node() {
        let (grid, reconciler) = setup();
        let mut state = NetworkState::default();
        reconciler.reconcile(&spec(vec![1, 2]), &mut state).await.unwrap();
        let contracts: Vec<u64> = state.nodes.iter().filter_map(|n| n.contract_id).collect();

        reconciler.finalize(&mut state).await.unwrap();
        assert_eq!(state, NetworkState::default());
        for contract_id in contracts {
            assert!(grid.is_cancelled(contract_id));
        }
        assert!(grid.reserved(1).is_empty());
    }

    #[tokio::test]
    async fn test_finalize_keeps_records_it_could_not_cancel() {
        let (grid, reconciler) = setup();
        let mut state = NetworkState::default();
        reconciler.reconcile(&spec(vec![1, 2]), &mut state).await.unwrap();

        grid.fail_next(
            Operation::CancelContract,
            ClientError::Transport("connection reset".to_string()),
        );
        assert!(matches!(
            reconciler.finalize(&mut state).await,
            Err(ProvisionError::Remote {
                operation: "cancel contract",
                node_id: 1,
                ..
            })
        ));
        assert_eq!(state.node_ids(), BTreeSet::from([1]));
        assert_eq!(grid.count(Operation::CancelContract), 2);
    }

    #[tokio::test]
    async fn test_failed_removal_keeps_new_access_point() {
        let (grid, reconciler) = setup();
        let mut state = NetworkState::default();
        reconciler.reconcile(&spec(vec![1, 2]), &mut state).await.unwrap();
        assert_eq!(state.public_node, Some(1));

        grid.fail_next(
            Operation::CancelContract,
            ClientError::Transport("ledger down".to_string()),
        );
        assert!(reconciler.reconcile(&spec(vec![2]), &mut state).await.is_err());

        // node 1 still awaits removal, node 2 already carries the access point
        assert_eq!(state.node_ids(), BTreeSet::from([1, 2]));
        assert_eq!(state.public_node, Some(2));
        let public_key = state.node(2).unwrap().key.public_key.clone();
        assert!(state
            .access_config
            .contains(&format!("PublicKey = {}\n", public_key)));

        reconciler.reconcile(&spec(vec![2]), &mut state).await.unwrap();
        assert_eq!(state.node_ids(), BTreeSet::from([2]));
        assert_eq!(grid.count_for(Operation::CancelContract, 1), 2);
    }

    #[tokio::test]
    async fn test_networks_sharing_a_node() {
        let (grid, reconciler) = setup();
        let mut first = NetworkState::default();
        reconciler.reconcile(&spec(vec![1, 2]), &mut first).await.unwrap();

        let mut other = spec(vec![2]);
        other.name = "net2".to_string();
        let mut second = NetworkState::default();
        reconciler.reconcile(&other, &mut second).await.unwrap();

        assert_ne!(
            first.node(2).unwrap().contract_id,
            second.node(2).unwrap().contract_id
        );
        assert_eq!(grid.count_for(Operation::CreateContract, 2), 2);
    }
}
