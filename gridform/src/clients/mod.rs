//! Collaborators the engine drives.
//!
//! The engine never talks to the grid directly. It goes through these traits:
//! - `Ledger`: billing contracts and node identity resolution
//! - `NodeAgent`: deployment submission on the node itself
//! - `NodeDirectory`: reachable address of a node for mesh endpoints
//! - `Identity`: signing and secret-field encryption for the owning twin
//! - `KeyGenerator`: WireGuard key pairs

pub mod memory;

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::grid::Deployment;

/// Failure reported by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("deadline elapsed after {0:?}")]
    DeadlineElapsed(std::time::Duration),
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Address of the agent serving a node (the node's twin on the grid).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentAddress(pub u32);

impl std::fmt::Display for AgentAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "twin-{}", self.0)
    }
}

/// A WireGuard key pair in its textual form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WgKeyPair {
    pub private_key: String,
    pub public_key: String,
}

/// Ledger client, bound to the owning identity.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Create a contract for a deployment hash on a node.
    async fn create_contract(&self, node_id: u32, hash: &str) -> ClientResult<u64>;

    /// Point an existing contract at a new deployment hash.
    async fn update_contract(&self, contract_id: u64, hash: &str) -> ClientResult<u64>;

    async fn cancel_contract(&self, contract_id: u64) -> ClientResult<()>;

    /// Resolve the agent serving a node.
    async fn resolve_node(&self, node_id: u32) -> ClientResult<AgentAddress>;
}

/// Node agent client.
#[async_trait]
pub trait NodeAgent: Send + Sync {
    async fn deploy(&self, agent: AgentAddress, deployment: &Deployment) -> ClientResult<()>;

    async fn update(&self, agent: AgentAddress, deployment: &Deployment) -> ClientResult<()>;

    /// Fetch a deployment including per-workload results.
    async fn get(&self, agent: AgentAddress, contract_id: u64) -> ClientResult<Deployment>;

    async fn delete(&self, agent: AgentAddress, contract_id: u64) -> ClientResult<()>;

    /// Listen ports currently reserved on the node.
    async fn reserved_ports(&self, agent: AgentAddress) -> ClientResult<Vec<u16>>;
}

/// Resolves the publicly reachable address of a node.
#[async_trait]
pub trait NodeDirectory: Send + Sync {
    async fn resolve(&self, node_id: u32) -> ClientResult<IpAddr>;
}

/// Signing identity of the deployment owner.
pub trait Identity: Send + Sync {
    fn twin_id(&self) -> u32;

    fn sign(&self, message: &[u8]) -> ClientResult<Vec<u8>>;

    /// Encrypt a secret field so only the owner and the node can read it.
    fn encrypt(&self, plaintext: &[u8]) -> ClientResult<Vec<u8>>;
}

pub trait KeyGenerator: Send + Sync {
    fn generate(&self) -> ClientResult<WgKeyPair>;
}

/// All collaborators of one reconciliation.
#[derive(Clone)]
pub struct GridClients {
    pub ledger: Arc<dyn Ledger>,
    pub agent: Arc<dyn NodeAgent>,
    pub directory: Arc<dyn NodeDirectory>,
    pub identity: Arc<dyn Identity>,
    pub keys: Arc<dyn KeyGenerator>,
}
