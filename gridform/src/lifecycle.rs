//! Deployment lifecycle: contract placement, manifest submission, completion
//! polling and cancellation for one node at a time.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::clients::{AgentAddress, ClientError, ClientResult, GridClients, Ledger, NodeAgent};
use crate::config::EngineConfig;
use crate::error::{ProvisionError, Result};
use crate::grid::{Deployment, ResultState};
use crate::validation::ValidationError;

/// Phase of the deployment on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentPhase {
    Absent,
    Creating,
    Deployed,
    Updating,
    Cancelling,
    Failed,
}

impl fmt::Display for DeploymentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeploymentPhase::Absent => "absent",
            DeploymentPhase::Creating => "creating",
            DeploymentPhase::Deployed => "deployed",
            DeploymentPhase::Updating => "updating",
            DeploymentPhase::Cancelling => "cancelling",
            DeploymentPhase::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

pub fn validate_transition(
    node_id: u32,
    from: DeploymentPhase,
    to: DeploymentPhase,
) -> Result<()> {
    use DeploymentPhase::*;

    let valid = matches!(
        (from, to),
        (Absent | Failed, Creating)
            | (Deployed | Failed, Updating)
            | (Creating | Updating, Deployed)
            | (Creating | Updating | Cancelling, Failed)
            | (Deployed | Failed, Cancelling)
            | (Cancelling, Absent)
    );

    if valid {
        Ok(())
    } else {
        Err(ProvisionError::InvalidTransition {
            node_id,
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// How a manifest reaches a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// No contract yet.
    Create,
    /// A contract exists but the node never confirmed the manifest.
    Resume { contract_id: u64 },
    /// The node runs an earlier version.
    Update { contract_id: u64 },
}

impl Submission {
    /// Pick the submission for a node from what was recorded about it.
    pub fn from_record(contract_id: Option<u64>, pending: bool) -> Self {
        match contract_id {
            None => Submission::Create,
            Some(contract_id) if pending => Submission::Resume { contract_id },
            Some(contract_id) => Submission::Update { contract_id },
        }
    }

    pub fn contract_id(&self) -> Option<u64> {
        match self {
            Submission::Create => None,
            Submission::Resume { contract_id } | Submission::Update { contract_id } => {
                Some(*contract_id)
            }
        }
    }

    /// Phase the node is assumed to be in when nothing was observed this run.
    fn assumed_phase(&self) -> DeploymentPhase {
        match self {
            Submission::Create => DeploymentPhase::Absent,
            Submission::Resume { .. } => DeploymentPhase::Failed,
            Submission::Update { .. } => DeploymentPhase::Deployed,
        }
    }
}

/// Outcome of inspecting one fetched deployment.
fn completion(node_id: u32, deployment: &Deployment) -> Result<bool> {
    let mut done = true;
    for (index, wl) in deployment.workloads.iter().enumerate() {
        match wl.result.state {
            ResultState::Ok => {}
            ResultState::Init => done = false,
            state => {
                let error = if wl.result.error.is_empty() {
                    format!("workload reported state {}", state)
                } else {
                    wl.result.error.clone()
                };
                return Err(ProvisionError::WorkloadFailed {
                    index,
                    name: wl.name.clone(),
                    node_id,
                    contract_id: deployment.contract_id,
                    error,
                });
            }
        }
    }
    Ok(done)
}

/// Drives deployments through the ledger and the node agents.
pub struct LifecycleController {
    ledger: Arc<dyn Ledger>,
    agent: Arc<dyn NodeAgent>,
    call_timeout: Duration,
    completion_budget: Duration,
    poll_interval: Duration,
    /// Phases observed by this controller, per contract.
    phases: Mutex<HashMap<u64, DeploymentPhase>>,
}

impl LifecycleController {
    pub fn new(clients: &GridClients, call_timeout: Duration, config: &EngineConfig) -> Self {
        Self {
            ledger: Arc::clone(&clients.ledger),
            agent: Arc::clone(&clients.agent),
            call_timeout,
            completion_budget: config.completion_budget(),
            poll_interval: config.poll_interval(),
            phases: Mutex::new(HashMap::new()),
        }
    }

    /// Phase observed for `contract_id` during this controller's lifetime.
    pub async fn phase(&self, contract_id: u64) -> Option<DeploymentPhase> {
        self.phases.lock().await.get(&contract_id).copied()
    }

    /// Move a contract to `to`. Without an observation the phase is the one
    /// the caller's record implies; a new contract always starts `Absent`.
    async fn transition(
        &self,
        node_id: u32,
        contract_id: Option<u64>,
        assumed: DeploymentPhase,
        to: DeploymentPhase,
    ) -> Result<()> {
        let mut phases = self.phases.lock().await;
        let from = contract_id
            .and_then(|id| phases.get(&id).copied())
            .unwrap_or(assumed);
        validate_transition(node_id, from, to)?;
        debug!("Node {}: {} -> {}", node_id, from, to);
        if let Some(id) = contract_id {
            phases.insert(id, to);
        }
        Ok(())
    }

    /// Record a failure and hand the error back.
    async fn settle<T>(&self, contract_id: Option<u64>, result: Result<T>) -> Result<T> {
        if let (Err(_), Some(id)) = (&result, contract_id) {
            self.phases.lock().await.insert(id, DeploymentPhase::Failed);
        }
        result
    }

    /// Run one collaborator call under the per-call deadline.
    async fn call<T, F>(
        &self,
        operation: &'static str,
        node_id: u32,
        contract_id: Option<u64>,
        fut: F,
    ) -> Result<T>
    where
        F: Future<Output = ClientResult<T>> + Send,
    {
        let result = match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::DeadlineElapsed(self.call_timeout)),
        };
        result.map_err(|e| ProvisionError::remote(operation, node_id, contract_id, e))
    }

    /// Create or update the contract for a signed deployment. Sets
    /// `deployment.contract_id` and returns it.
    pub async fn place_contract(
        &self,
        node_id: u32,
        submission: Submission,
        deployment: &mut Deployment,
    ) -> Result<u64> {
        if !deployment.is_signed_by(deployment.twin_id) {
            return Err(ValidationError::Unsigned(deployment.twin_id).into());
        }
        let target = match submission {
            Submission::Create => DeploymentPhase::Creating,
            _ => DeploymentPhase::Updating,
        };
        self.transition(
            node_id,
            submission.contract_id(),
            submission.assumed_phase(),
            target,
        )
        .await?;

        let result = self.contract_call(node_id, submission, deployment).await;
        let contract_id = self.settle(submission.contract_id(), result).await?;
        deployment.contract_id = contract_id;
        if submission == Submission::Create {
            self.phases
                .lock()
                .await
                .insert(contract_id, DeploymentPhase::Creating);
        }
        Ok(contract_id)
    }

    async fn contract_call(
        &self,
        node_id: u32,
        submission: Submission,
        deployment: &Deployment,
    ) -> Result<u64> {
        let hash = deployment.challenge_hash_hex()?;
        match submission {
            Submission::Create => {
                info!(
                    "Creating contract on node {} for deployment version {}",
                    node_id, deployment.version
                );
                self.call(
                    "create contract",
                    node_id,
                    None,
                    self.ledger.create_contract(node_id, &hash),
                )
                .await
            }
            Submission::Resume { contract_id } | Submission::Update { contract_id } => {
                info!(
                    "Updating contract {} on node {} to deployment version {}",
                    contract_id, node_id, deployment.version
                );
                self.call(
                    "update contract",
                    node_id,
                    Some(contract_id),
                    self.ledger.update_contract(contract_id, &hash),
                )
                .await
            }
        }
    }

    /// Submit the manifest under an already placed contract and wait until
    /// every workload settled.
    pub async fn deliver(
        &self,
        node_id: u32,
        submission: Submission,
        deployment: &Deployment,
    ) -> Result<()> {
        let result = self.submit_and_wait(node_id, submission, deployment).await;
        let contract_id = deployment.contract_id;
        self.settle(Some(contract_id), result).await?;
        self.phases
            .lock()
            .await
            .insert(contract_id, DeploymentPhase::Deployed);
        info!(
            "Deployment {} on node {} is ready (version {})",
            deployment.contract_id, node_id, deployment.version
        );
        Ok(())
    }

    async fn submit_and_wait(
        &self,
        node_id: u32,
        submission: Submission,
        deployment: &Deployment,
    ) -> Result<()> {
        let contract_id = deployment.contract_id;
        let agent = self.resolve(node_id, Some(contract_id)).await?;

        let update = match submission {
            Submission::Create => false,
            Submission::Update { .. } => true,
            Submission::Resume { .. } => self.exists(node_id, agent, contract_id).await?,
        };

        if update {
            debug!("Updating deployment {} on node {}", contract_id, node_id);
            self.call(
                "update deployment",
                node_id,
                Some(contract_id),
                self.agent.update(agent, deployment),
            )
            .await?;
        } else {
            debug!("Submitting deployment {} to node {}", contract_id, node_id);
            self.call(
                "deploy",
                node_id,
                Some(contract_id),
                self.agent.deploy(agent, deployment),
            )
            .await?;
        }

        self.wait_for_completion(node_id, agent, contract_id).await
    }

    /// Whether the node already holds a deployment under `contract_id`.
    async fn exists(&self, node_id: u32, agent: AgentAddress, contract_id: u64) -> Result<bool> {
        match tokio::time::timeout(self.call_timeout, self.agent.get(agent, contract_id)).await {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(ClientError::NotFound(_))) => Ok(false),
            Ok(Err(e)) => Err(ProvisionError::remote(
                "fetch deployment",
                node_id,
                Some(contract_id),
                e,
            )),
            Err(_) => Err(ProvisionError::remote(
                "fetch deployment",
                node_id,
                Some(contract_id),
                ClientError::DeadlineElapsed(self.call_timeout),
            )),
        }
    }

    async fn resolve(&self, node_id: u32, contract_id: Option<u64>) -> Result<AgentAddress> {
        self.call(
            "resolve node",
            node_id,
            contract_id,
            self.ledger.resolve_node(node_id),
        )
        .await
    }

    /// Place the contract and deliver the manifest in one go.
    pub async fn apply(
        &self,
        node_id: u32,
        submission: Submission,
        deployment: &mut Deployment,
    ) -> Result<u64> {
        let contract_id = self.place_contract(node_id, submission, deployment).await?;
        self.deliver(node_id, submission, deployment).await?;
        Ok(contract_id)
    }

    /// Poll until every workload reports a terminal state.
    ///
    /// A workload in any state other than `ok` fails the whole deployment at
    /// once. Running out of budget without such a failure is a `Timeout`.
    pub async fn wait_for_completion(
        &self,
        node_id: u32,
        agent: AgentAddress,
        contract_id: u64,
    ) -> Result<()> {
        let started = Instant::now();
        loop {
            let deployment = self
                .call(
                    "fetch deployment",
                    node_id,
                    Some(contract_id),
                    self.agent.get(agent, contract_id),
                )
                .await?;
            if completion(node_id, &deployment)? {
                return Ok(());
            }

            let waited = started.elapsed();
            if waited >= self.completion_budget {
                return Err(ProvisionError::Timeout {
                    node_id,
                    contract_id,
                    waited,
                });
            }
            debug!(
                "Deployment {} on node {} still pending after {:?}",
                contract_id, node_id, waited
            );
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Listen ports the node has handed out already.
    pub async fn reserved_ports(&self, node_id: u32) -> Result<HashSet<u16>> {
        let agent = self.resolve(node_id, None).await?;
        let ports = self
            .call(
                "list reserved ports",
                node_id,
                None,
                self.agent.reserved_ports(agent),
            )
            .await?;
        Ok(ports.into_iter().collect())
    }

    /// Fetch the deployment as the node currently reports it.
    pub async fn fetch(&self, node_id: u32, contract_id: u64) -> Result<Deployment> {
        let agent = self.resolve(node_id, Some(contract_id)).await?;
        self.call(
            "fetch deployment",
            node_id,
            Some(contract_id),
            self.agent.get(agent, contract_id),
        )
        .await
    }

    /// Cancel the contract, then remove the deployment from the node.
    ///
    /// The contract cancellation decides the outcome; a failed remote delete
    /// afterwards is only logged.
    pub async fn cancel(&self, node_id: u32, contract_id: u64) -> Result<()> {
        self.transition(
            node_id,
            Some(contract_id),
            DeploymentPhase::Deployed,
            DeploymentPhase::Cancelling,
        )
        .await?;

        info!("Cancelling contract {} on node {}", contract_id, node_id);
        let cancelled = self
            .call(
                "cancel contract",
                node_id,
                Some(contract_id),
                self.ledger.cancel_contract(contract_id),
            )
            .await;
        self.settle(Some(contract_id), cancelled).await?;

        let deleted = match self.resolve(node_id, Some(contract_id)).await {
            Ok(agent) => {
                self.call(
                    "delete deployment",
                    node_id,
                    Some(contract_id),
                    self.agent.delete(agent, contract_id),
                )
                .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = deleted {
            warn!(
                "Contract {} on node {} is cancelled but the deployment could not be removed: {}",
                contract_id, node_id, e
            );
        }

        self.transition(
            node_id,
            Some(contract_id),
            DeploymentPhase::Cancelling,
            DeploymentPhase::Absent,
        )
        .await
    }
}
