//! Provisioning error types.

use std::time::Duration;

use thiserror::Error;

use crate::clients::ClientError;
use crate::validation::ValidationError;

/// Errors that abort a reconciliation.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Malformed or cross-reference-invalid input. Raised before any remote call.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// No free address or subnet left.
    #[error("address space exhausted in {range}")]
    AddressSpaceExhausted { range: String },

    /// Port sampling hit its retry cap.
    #[error("no free listen port found on node {node_id} after {attempts} attempts")]
    PortSpaceExhausted { node_id: u32, attempts: u32 },

    /// A ledger or node agent call failed.
    #[error("{operation} failed for node {node_id}{}: {message}", contract_suffix(.contract_id))]
    Remote {
        operation: &'static str,
        node_id: u32,
        contract_id: Option<u64>,
        message: String,
    },

    /// The node agent reported a non-success terminal state for a workload.
    #[error("workload {index} ({name}) failed within deployment {contract_id} on node {node_id}: {error}")]
    WorkloadFailed {
        index: usize,
        name: String,
        node_id: u32,
        contract_id: u64,
        error: String,
    },

    /// Completion polling ran out of budget without a definitive failure.
    #[error("waiting for deployment {contract_id} on node {node_id} timed out after {waited:?}")]
    Timeout {
        node_id: u32,
        contract_id: u64,
        waited: Duration,
    },

    #[error("signing as twin {twin_id} failed: {message}")]
    Signing { twin_id: u32, message: String },

    #[error("encrypting a secret as twin {twin_id} failed: {message}")]
    Encryption { twin_id: u32, message: String },

    #[error("invalid lifecycle transition for node {node_id}: {from} -> {to}")]
    InvalidTransition {
        node_id: u32,
        from: String,
        to: String,
    },

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn contract_suffix(contract_id: &Option<u64>) -> String {
    contract_id
        .map(|id| format!(" (contract {id})"))
        .unwrap_or_default()
}

impl ProvisionError {
    /// Wrap a collaborator failure with the entity it concerns.
    pub fn remote(
        operation: &'static str,
        node_id: u32,
        contract_id: Option<u64>,
        err: ClientError,
    ) -> Self {
        ProvisionError::Remote {
            operation,
            node_id,
            contract_id,
            message: err.to_string(),
        }
    }

    /// Whether re-polling could still succeed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProvisionError::Timeout { .. })
    }
}

/// Result type for provisioning operations.
pub type Result<T> = std::result::Result<T, ProvisionError>;
