//! Deployment reconciler - disks, storage nodes and machines on a single node.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::Ipv4Addr;

use async_trait::async_trait;
use chrono::Utc;
use ipnet::Ipv4Net;
use serde::Serialize;
use tracing::info;

use super::Reconciler;
use crate::allocator::allocate_ip;
use crate::clients::GridClients;
use crate::config::EngineConfig;
use crate::diff::{diff, removed, Diff};
use crate::error::{ProvisionError, Result};
use crate::grid::{Deployment, ResultState, WorkloadKind};
use crate::lifecycle::{LifecycleController, Submission};
use crate::model::{DeploymentSpec, DeploymentState, RecordedResource, Resource};
use crate::validation::{parse_ip_range, validate_name, validate_requested_ip, ValidationError};
use crate::workload::WorkloadBuilder;

/// A workload as the node reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObservedWorkload {
    pub kind: WorkloadKind,
    pub name: String,
    pub version: u32,
    pub state: ResultState,
    pub error: String,
}

/// Everything computed offline for one run.
struct Prepared {
    deployment: Deployment,
    recorded: Vec<RecordedResource>,
    used_ips: BTreeSet<Ipv4Addr>,
    range: Ipv4Net,
    changed: bool,
}

/// Deployment reconciler that drives one node through the ledger and its agent.
pub struct DeploymentReconciler {
    clients: GridClients,
    lifecycle: LifecycleController,
}

impl DeploymentReconciler {
    pub fn new(clients: GridClients, config: &EngineConfig) -> Self {
        let lifecycle =
            LifecycleController::new(&clients, config.deployment_call_timeout(), config);
        Self { clients, lifecycle }
    }

    /// Fetch what the node currently runs under the recorded contract.
    pub async fn read(&self, state: &DeploymentState) -> Result<Vec<ObservedWorkload>> {
        let (Some(node_id), Some(contract_id)) = (state.node_id, state.contract_id) else {
            return Ok(Vec::new());
        };
        let deployment = self.lifecycle.fetch(node_id, contract_id).await?;
        Ok(deployment
            .workloads
            .into_iter()
            .map(|wl| ObservedWorkload {
                kind: wl.kind(),
                name: wl.name,
                version: wl.version,
                state: wl.result.state,
                error: wl.result.error,
            })
            .collect())
    }

    fn seal(&self, secret: &str) -> Result<String> {
        let identity = &self.clients.identity;
        identity
            .encrypt(secret.as_bytes())
            .map(hex::encode)
            .map_err(|e| ProvisionError::Encryption {
                twin_id: identity.twin_id(),
                message: e.to_string(),
            })
    }

    fn prepare(&self, spec: &DeploymentSpec, state: &DeploymentState) -> Result<Prepared> {
        let resolution = resolve(spec, state)?;
        let builder = WorkloadBuilder::new(spec.network_name.as_str(), &spec.resources());

        let mut workloads = Vec::with_capacity(resolution.resources.len());
        let mut recorded = Vec::with_capacity(resolution.resources.len());
        for entry in resolution.resources {
            let resource = entry.resource;
            if entry.is_new {
                info!(
                    "Adding {} {} (version {})",
                    resource.kind(),
                    resource.name(),
                    entry.version
                );
            } else if entry.changed {
                info!(
                    "Updating {} {} to version {}",
                    resource.kind(),
                    resource.name(),
                    entry.version
                );
            }

            let password = match &resource {
                Resource::StorageNode(zdb) => Some(self.seal(&zdb.password)?),
                _ => None,
            };
            let ip = match &resource {
                Resource::Machine(vm) => vm.ip,
                _ => None,
            };
            workloads.push(builder.build(&resource, entry.version, ip, password.as_deref())?);
            recorded.push(RecordedResource {
                version: entry.version,
                resource,
            });
        }
        for gone in &resolution.removed {
            info!(
                "Removing {} {} from deployment on node {}",
                gone.resource.kind(),
                gone.resource.name(),
                spec.node_id
            );
        }

        let identity = self.clients.identity.as_ref();
        let version = state.version.map_or(0, |v| v + 1);
        let mut deployment = Deployment::new(identity.twin_id(), version, workloads);
        deployment.sign(identity)?;

        Ok(Prepared {
            deployment,
            recorded,
            used_ips: resolution.used_ips,
            range: resolution.range,
            changed: resolution.changed,
        })
    }
}

/// A declared resource with its final address and version.
#[derive(Debug, Clone)]
pub(crate) struct Resolved {
    pub resource: Resource,
    pub version: u32,
    pub is_new: bool,
    pub changed: bool,
}

/// Offline outcome of comparing a declared deployment with its recorded state.
#[derive(Debug, Clone)]
pub(crate) struct Resolution {
    pub range: Ipv4Net,
    pub resources: Vec<Resolved>,
    pub removed: Vec<RecordedResource>,
    pub used_ips: BTreeSet<Ipv4Addr>,
    /// Anything differs from what was last applied.
    pub changed: bool,
}

/// Validate the declared deployment, assign machine addresses and compute
/// every resource version. Makes no remote call.
pub(crate) fn resolve(spec: &DeploymentSpec, state: &DeploymentState) -> Result<Resolution> {
    let declared = spec.resources();
    let range = check_input(spec, state, &declared)?;
    let ips = assign_ips(spec, state, &range)?;
    let network_moved = state.is_provisioned()
        && (state.network_name != spec.network_name || state.ip_range != Some(range));

    let mut changed = !state.is_provisioned();
    let mut resources = Vec::with_capacity(declared.len());
    for declared_resource in &declared {
        let found = diff(declared_resource, &state.resources);
        let mut resource = declared_resource.clone();
        let mut moved = false;
        if let Resource::Machine(vm) = &mut resource {
            let ip = ips.get(&vm.name).copied();
            if let Some(prior) = found.prior {
                moved = network_moved || prior.machine_ip() != ip;
            }
            vm.ip = ip;
        }

        let found = Diff {
            changed: found.changed || moved,
            prior: found.prior,
        };
        changed |= found.is_new() || found.changed;
        resources.push(Resolved {
            resource,
            version: found.next_version(),
            is_new: found.is_new(),
            changed: found.changed,
        });
    }

    let dropped: Vec<RecordedResource> = removed(&declared, &state.resources)
        .into_iter()
        .cloned()
        .collect();
    changed |= !dropped.is_empty();

    Ok(Resolution {
        range,
        resources,
        removed: dropped,
        used_ips: ips.into_values().collect(),
        changed,
    })
}

/// Validation that needs no remote call.
fn check_input(
    spec: &DeploymentSpec,
    state: &DeploymentState,
    resources: &[Resource],
) -> std::result::Result<Ipv4Net, ValidationError> {
    if let Some(recorded) = state.node_id {
        if recorded != spec.node_id {
            return Err(ValidationError::NodeChanged {
                recorded,
                declared: spec.node_id,
            });
        }
    }
    validate_name(&spec.network_name)?;

    let range = parse_ip_range(&spec.ip_range)?;
    if range.prefix_len() > 24 {
        return Err(ValidationError::RangeTooSmall(range.to_string()));
    }

    let mut names = HashSet::new();
    for resource in resources {
        validate_name(resource.name())?;
        if !names.insert(resource.name()) {
            return Err(ValidationError::DuplicateName {
                kind: "resource",
                name: resource.name().to_string(),
            });
        }
    }
    Ok(range)
}

/// Address of every declared machine.
///
/// Requested addresses are claimed first. Machines without a request keep
/// their recorded address when it is still free, otherwise they get the first
/// free one.
fn assign_ips(
    spec: &DeploymentSpec,
    state: &DeploymentState,
    range: &Ipv4Net,
) -> Result<BTreeMap<String, Ipv4Addr>> {
    let mut used = BTreeSet::new();
    let mut assigned = BTreeMap::new();

    for vm in &spec.vms {
        if let Some(ip) = vm.ip {
            validate_requested_ip(ip, range, |a| used.contains(a))?;
            used.insert(ip);
            assigned.insert(vm.name.clone(), ip);
        }
    }

    for vm in spec.vms.iter().filter(|vm| vm.ip.is_none()) {
        let key = Resource::Machine(vm.clone()).key();
        let recorded = state
            .resources
            .iter()
            .find(|r| r.resource.key() == key)
            .and_then(RecordedResource::machine_ip)
            .filter(|ip| range.contains(ip) && !used.contains(ip));
        let ip = match recorded {
            Some(ip) => ip,
            None => allocate_ip(range, &used)?,
        };
        used.insert(ip);
        assigned.insert(vm.name.clone(), ip);
    }

    Ok(assigned)
}

#[async_trait]
impl Reconciler for DeploymentReconciler {
    type Spec = DeploymentSpec;
    type State = DeploymentState;

    async fn reconcile(&self, spec: &Self::Spec, state: &mut Self::State) -> Result<()> {
        info!("Reconciling deployment on node {}", spec.node_id);

        let prepared = self.prepare(spec, state)?;
        if state.is_provisioned() && !state.pending && !prepared.changed {
            info!(
                "Deployment {:?} on node {} is up to date",
                state.contract_id, spec.node_id
            );
            return Ok(());
        }

        let Prepared {
            mut deployment,
            recorded,
            used_ips,
            range,
            ..
        } = prepared;
        let submission = Submission::from_record(state.contract_id, state.pending);

        let contract_id = self
            .lifecycle
            .place_contract(spec.node_id, submission, &mut deployment)
            .await?;
        state.node_id = Some(spec.node_id);
        state.contract_id = Some(contract_id);
        state.version = Some(deployment.version);
        state.pending = true;
        state.updated_at = Some(Utc::now());

        self.lifecycle
            .deliver(spec.node_id, submission, &deployment)
            .await?;

        state.pending = false;
        state.network_name = spec.network_name.clone();
        state.ip_range = Some(range);
        state.resources = recorded;
        state.used_ips = used_ips;
        state.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn finalize(&self, state: &mut Self::State) -> Result<()> {
        let (Some(node_id), Some(contract_id)) = (state.node_id, state.contract_id) else {
            return Ok(());
        };
        info!("Finalizing (deleting) deployment {} on node {}", contract_id, node_id);
        self.lifecycle.cancel(node_id, contract_id).await?;
        *state = DeploymentState::default();
        Ok(())
    }
}
