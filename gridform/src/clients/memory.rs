//! In-memory collaborators.
//!
//! `MemoryGrid` plays ledger, node agents and node directory at once. It backs
//! the `simulate` command and the test suite, and records every call so tests
//! can assert on what a reconciliation did.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{
    AgentAddress, ClientError, ClientResult, Identity, KeyGenerator, Ledger, NodeAgent,
    NodeDirectory, WgKeyPair,
};
use crate::grid::{Deployment, ResultState, WorkloadData, WorkloadResult};

/// Agents are addressed by the node's twin, which sits at a fixed offset.
const TWIN_OFFSET: u32 = 1000;

/// A collaborator operation, as recorded in the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateContract,
    UpdateContract,
    CancelContract,
    ResolveNode,
    Deploy,
    Update,
    Get,
    Delete,
    ReservedPorts,
    ResolveAddress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: Operation,
    pub node_id: Option<u32>,
    pub contract_id: Option<u64>,
}

#[derive(Debug, Clone)]
struct Contract {
    node_id: u32,
    hash: String,
    cancelled: bool,
}

#[derive(Debug, Clone)]
struct Stored {
    node_id: u32,
    deployment: Deployment,
    polls_left: u32,
}

#[derive(Debug, Default)]
struct GridInner {
    next_contract: u64,
    contracts: BTreeMap<u64, Contract>,
    deployments: HashMap<u64, Stored>,
    reserved_ports: HashMap<u32, BTreeSet<u16>>,
    addresses: HashMap<u32, IpAddr>,
    failing: HashMap<String, String>,
    held: BTreeSet<String>,
    pending_polls: u32,
    fail_next: HashMap<Operation, ClientError>,
    calls: Vec<Call>,
}

impl GridInner {
    fn record(&mut self, op: Operation, node_id: Option<u32>, contract_id: Option<u64>) {
        self.calls.push(Call {
            op,
            node_id,
            contract_id,
        });
    }

    fn injected(&mut self, op: Operation) -> ClientResult<()> {
        match self.fail_next.remove(&op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn live_contract(&self, contract_id: u64) -> ClientResult<&Contract> {
        match self.contracts.get(&contract_id) {
            Some(c) if !c.cancelled => Ok(c),
            Some(_) => Err(ClientError::Rejected(format!(
                "contract {} is cancelled",
                contract_id
            ))),
            None => Err(ClientError::NotFound(format!("contract {}", contract_id))),
        }
    }

    /// Check a submitted deployment against its contract before accepting it.
    fn admit(&self, node_id: u32, deployment: &Deployment) -> ClientResult<()> {
        let contract = self.live_contract(deployment.contract_id)?;
        if contract.node_id != node_id {
            return Err(ClientError::Rejected(format!(
                "contract {} belongs to node {}",
                deployment.contract_id, contract.node_id
            )));
        }
        if !deployment.is_signed_by(deployment.twin_id) {
            return Err(ClientError::Rejected("deployment is not signed".to_string()));
        }
        let hash = deployment
            .challenge_hash_hex()
            .map_err(|e| ClientError::Rejected(e.to_string()))?;
        if hash != contract.hash {
            return Err(ClientError::Rejected(
                "deployment hash does not match contract".to_string(),
            ));
        }
        Ok(())
    }

    fn store(&mut self, node_id: u32, deployment: &Deployment) {
        let mut deployment = deployment.clone();
        for wl in &mut deployment.workloads {
            wl.result = WorkloadResult::default();
            if let WorkloadData::Network(net) = &wl.data {
                self.reserved_ports
                    .entry(node_id)
                    .or_default()
                    .insert(net.wg_listen_port);
            }
        }
        self.deployments.insert(
            deployment.contract_id,
            Stored {
                node_id,
                deployment,
                polls_left: self.pending_polls,
            },
        );
    }

    fn release_ports(&mut self, stored: &Stored) {
        for wl in &stored.deployment.workloads {
            if let WorkloadData::Network(net) = &wl.data {
                if let Some(ports) = self.reserved_ports.get_mut(&stored.node_id) {
                    ports.remove(&net.wg_listen_port);
                }
            }
        }
    }
}

/// Ledger, node agents and node directory of a simulated grid.
#[derive(Debug)]
pub struct MemoryGrid {
    inner: Mutex<GridInner>,
}

impl Default for MemoryGrid {
    fn default() -> Self {
        Self {
            inner: Mutex::new(GridInner {
                next_contract: 1,
                ..GridInner::default()
            }),
        }
    }
}

fn node_of(agent: AgentAddress) -> ClientResult<u32> {
    agent
        .0
        .checked_sub(TWIN_OFFSET)
        .ok_or_else(|| ClientError::NotFound(format!("agent {}", agent)))
}

fn poisoned<T>(e: PoisonError<T>) -> ClientError {
    ClientError::Transport(format!("mutex poisoned: {e}"))
}

impl MemoryGrid {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, GridInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock(&self) -> ClientResult<MutexGuard<'_, GridInner>> {
        self.inner.lock().map_err(poisoned)
    }

    /// Make the named workload report an error with `message`.
    pub fn fail_workload(&self, name: &str, message: &str) {
        self.state()
            .failing
            .insert(name.to_string(), message.to_string());
    }

    /// Keep the named workload pending forever.
    pub fn hold_pending(&self, name: &str) {
        self.state().held.insert(name.to_string());
    }

    /// Number of fetches a fresh submission stays pending before completing.
    pub fn set_pending_polls(&self, polls: u32) {
        self.state().pending_polls = polls;
    }

    /// Fail the next call of `op` with `err`.
    pub fn fail_next(&self, op: Operation, err: ClientError) {
        self.state().fail_next.insert(op, err);
    }

    pub fn set_reserved_ports(&self, node_id: u32, ports: impl IntoIterator<Item = u16>) {
        self.state()
            .reserved_ports
            .insert(node_id, ports.into_iter().collect());
    }

    pub fn set_address(&self, node_id: u32, addr: IpAddr) {
        self.state().addresses.insert(node_id, addr);
    }

    /// Register an existing contract and deployment version, as if an earlier
    /// run had created them.
    pub fn adopt(&self, node_id: u32, twin_id: u32, contract_id: u64, version: u32) {
        let mut state = self.state();
        state.contracts.insert(
            contract_id,
            Contract {
                node_id,
                hash: String::new(),
                cancelled: false,
            },
        );
        let mut deployment = Deployment::new(twin_id, version, Vec::new());
        deployment.contract_id = contract_id;
        state.deployments.insert(
            contract_id,
            Stored {
                node_id,
                deployment,
                polls_left: 0,
            },
        );
        state.next_contract = state.next_contract.max(contract_id + 1);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn count(&self, op: Operation) -> usize {
        self.state().calls.iter().filter(|c| c.op == op).count()
    }

    /// Calls of `op` concerning `node_id`.
    pub fn count_for(&self, op: Operation, node_id: u32) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.op == op && c.node_id == Some(node_id))
            .count()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// The deployment currently stored under `contract_id`, as submitted.
    pub fn deployment(&self, contract_id: u64) -> Option<Deployment> {
        self.state()
            .deployments
            .get(&contract_id)
            .map(|s| s.deployment.clone())
    }

    pub fn is_cancelled(&self, contract_id: u64) -> bool {
        self.state()
            .contracts
            .get(&contract_id)
            .is_some_and(|c| c.cancelled)
    }

    pub fn reserved(&self, node_id: u32) -> BTreeSet<u16> {
        self.state()
            .reserved_ports
            .get(&node_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Ledger for MemoryGrid {
    async fn create_contract(&self, node_id: u32, hash: &str) -> ClientResult<u64> {
        let mut state = self.lock()?;
        state.record(Operation::CreateContract, Some(node_id), None);
        state.injected(Operation::CreateContract)?;
        let id = state.next_contract;
        state.next_contract += 1;
        state.contracts.insert(
            id,
            Contract {
                node_id,
                hash: hash.to_string(),
                cancelled: false,
            },
        );
        Ok(id)
    }

    async fn update_contract(&self, contract_id: u64, hash: &str) -> ClientResult<u64> {
        let mut state = self.lock()?;
        let node_id = state.contracts.get(&contract_id).map(|c| c.node_id);
        state.record(Operation::UpdateContract, node_id, Some(contract_id));
        state.injected(Operation::UpdateContract)?;
        state.live_contract(contract_id)?;
        if let Some(contract) = state.contracts.get_mut(&contract_id) {
            contract.hash = hash.to_string();
        }
        Ok(contract_id)
    }

    async fn cancel_contract(&self, contract_id: u64) -> ClientResult<()> {
        let mut state = self.lock()?;
        let node_id = state.contracts.get(&contract_id).map(|c| c.node_id);
        state.record(Operation::CancelContract, node_id, Some(contract_id));
        state.injected(Operation::CancelContract)?;
        state.live_contract(contract_id)?;
        if let Some(contract) = state.contracts.get_mut(&contract_id) {
            contract.cancelled = true;
        }
        Ok(())
    }

    async fn resolve_node(&self, node_id: u32) -> ClientResult<AgentAddress> {
        let mut state = self.lock()?;
        state.record(Operation::ResolveNode, Some(node_id), None);
        state.injected(Operation::ResolveNode)?;
        Ok(AgentAddress(node_id + TWIN_OFFSET))
    }
}

#[async_trait]
impl NodeAgent for MemoryGrid {
    async fn deploy(&self, agent: AgentAddress, deployment: &Deployment) -> ClientResult<()> {
        let node_id = node_of(agent)?;
        let mut state = self.lock()?;
        state.record(Operation::Deploy, Some(node_id), Some(deployment.contract_id));
        state.injected(Operation::Deploy)?;
        if state.deployments.contains_key(&deployment.contract_id) {
            return Err(ClientError::Rejected(format!(
                "deployment {} already exists",
                deployment.contract_id
            )));
        }
        state.admit(node_id, deployment)?;
        state.store(node_id, deployment);
        Ok(())
    }

    async fn update(&self, agent: AgentAddress, deployment: &Deployment) -> ClientResult<()> {
        let node_id = node_of(agent)?;
        let mut state = self.lock()?;
        state.record(Operation::Update, Some(node_id), Some(deployment.contract_id));
        state.injected(Operation::Update)?;
        let current = match state.deployments.get(&deployment.contract_id) {
            Some(stored) => stored.clone(),
            None => {
                return Err(ClientError::NotFound(format!(
                    "deployment {}",
                    deployment.contract_id
                )))
            }
        };
        if deployment.version <= current.deployment.version {
            return Err(ClientError::Rejected(format!(
                "version {} is not newer than {}",
                deployment.version, current.deployment.version
            )));
        }
        state.admit(node_id, deployment)?;
        state.release_ports(&current);
        state.store(node_id, deployment);
        Ok(())
    }

    async fn get(&self, agent: AgentAddress, contract_id: u64) -> ClientResult<Deployment> {
        let node_id = node_of(agent)?;
        let mut state = self.lock()?;
        state.record(Operation::Get, Some(node_id), Some(contract_id));
        state.injected(Operation::Get)?;

        let GridInner {
            deployments,
            failing,
            held,
            ..
        } = &mut *state;
        let stored = match deployments.get_mut(&contract_id) {
            Some(s) if s.node_id == node_id => s,
            _ => return Err(ClientError::NotFound(format!("deployment {}", contract_id))),
        };
        let settled = stored.polls_left == 0;
        stored.polls_left = stored.polls_left.saturating_sub(1);

        let mut deployment = stored.deployment.clone();
        for wl in &mut deployment.workloads {
            wl.result = match failing.get(&wl.name) {
                Some(message) => WorkloadResult {
                    state: ResultState::Error,
                    error: message.clone(),
                },
                None if settled && !held.contains(&wl.name) => WorkloadResult {
                    state: ResultState::Ok,
                    error: String::new(),
                },
                None => WorkloadResult::default(),
            };
        }
        Ok(deployment)
    }

    async fn delete(&self, agent: AgentAddress, contract_id: u64) -> ClientResult<()> {
        let node_id = node_of(agent)?;
        let mut state = self.lock()?;
        state.record(Operation::Delete, Some(node_id), Some(contract_id));
        state.injected(Operation::Delete)?;
        match state.deployments.remove(&contract_id) {
            Some(stored) => {
                state.release_ports(&stored);
                Ok(())
            }
            None => Err(ClientError::NotFound(format!("deployment {}", contract_id))),
        }
    }

    async fn reserved_ports(&self, agent: AgentAddress) -> ClientResult<Vec<u16>> {
        let node_id = node_of(agent)?;
        let mut state = self.lock()?;
        state.record(Operation::ReservedPorts, Some(node_id), None);
        state.injected(Operation::ReservedPorts)?;
        Ok(state
            .reserved_ports
            .get(&node_id)
            .map(|p| p.iter().copied().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl NodeDirectory for MemoryGrid {
    async fn resolve(&self, node_id: u32) -> ClientResult<IpAddr> {
        let mut state = self.lock()?;
        state.record(Operation::ResolveAddress, Some(node_id), None);
        state.injected(Operation::ResolveAddress)?;
        let addr = state
            .addresses
            .get(&node_id)
            .copied()
            .unwrap_or_else(|| simulated_address(node_id));
        Ok(addr)
    }
}

/// Public address of a node nobody assigned one to. Ids that fit in 16 bits
/// map into 185.69.0.0/16, larger ones into 2a02:1802::/96.
fn simulated_address(node_id: u32) -> IpAddr {
    match u16::try_from(node_id) {
        Ok(id) => {
            let [hi, lo] = id.to_be_bytes();
            IpAddr::V4(Ipv4Addr::new(185, 69, hi, lo))
        }
        Err(_) => {
            let [a, b, c, d] = node_id.to_be_bytes();
            IpAddr::V6(Ipv6Addr::new(
                0x2a02,
                0x1802,
                0,
                0,
                0,
                0,
                u16::from_be_bytes([a, b]),
                u16::from_be_bytes([c, d]),
            ))
        }
    }
}

fn digest(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Deterministic signing identity.
#[derive(Debug, Clone)]
pub struct MemoryIdentity {
    twin_id: u32,
    secret: [u8; 32],
}

impl MemoryIdentity {
    pub fn new(twin_id: u32) -> Self {
        Self {
            twin_id,
            secret: digest(&[&b"gridform-identity"[..], &twin_id.to_be_bytes()[..]]),
        }
    }

    /// Reverse of [`Identity::encrypt`].
    pub fn decrypt(&self, ciphertext: &[u8]) -> Vec<u8> {
        self.xor(ciphertext)
    }

    fn xor(&self, data: &[u8]) -> Vec<u8> {
        data.iter()
            .zip(self.secret.iter().cycle())
            .map(|(b, k)| b ^ k)
            .collect()
    }
}

impl Identity for MemoryIdentity {
    fn twin_id(&self) -> u32 {
        self.twin_id
    }

    fn sign(&self, message: &[u8]) -> ClientResult<Vec<u8>> {
        Ok(digest(&[&self.secret[..], message]).to_vec())
    }

    fn encrypt(&self, plaintext: &[u8]) -> ClientResult<Vec<u8>> {
        Ok(self.xor(plaintext))
    }
}

/// Key generator handing out reproducible key pairs.
#[derive(Debug, Default)]
pub struct SequentialKeys {
    seed: String,
    next: AtomicU32,
}

impl SequentialKeys {
    pub fn new(seed: impl Into<String>) -> Self {
        Self {
            seed: seed.into(),
            next: AtomicU32::new(0),
        }
    }
}

impl KeyGenerator for SequentialKeys {
    fn generate(&self) -> ClientResult<WgKeyPair> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        let private = digest(&[self.seed.as_bytes(), &n.to_be_bytes()[..]]);
        let public = digest(&[&b"public"[..], &private[..]]);
        Ok(WgKeyPair {
            private_key: hex::encode(private),
            public_key: hex::encode(public),
        })
    }
}
