//! Offline plans: what a reconciliation would do, computed without any remote call.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::Serialize;

use crate::allocator::{allocate_subnet, external_subnet, FIRST_NODE_SUBNET_INDEX};
use crate::error::Result;
use crate::model::{
    DeploymentSpec, DeploymentState, NetworkSpec, NetworkState, Resource, ResourceKind,
};
use crate::reconciler::{deployment, network};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Update,
    Keep,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourcePlan {
    pub kind: ResourceKind,
    pub name: String,
    pub action: Action,
    /// Version after the run; the recorded one for removals.
    pub version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentPlan {
    pub node_id: u32,
    pub contract_id: Option<u64>,
    pub action: Action,
    pub version: u32,
    pub resources: Vec<ResourcePlan>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodePlan {
    pub node_id: u32,
    pub action: Action,
    pub version: u32,
    /// Subnet the node has or would get.
    pub subnet: Ipv4Net,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkPlan {
    pub name: String,
    pub public_node: u32,
    pub external_subnet: Ipv4Net,
    pub nodes: Vec<NodePlan>,
}

/// Plan a single-node deployment.
pub fn plan_deployment(spec: &DeploymentSpec, state: &DeploymentState) -> Result<DeploymentPlan> {
    let resolution = deployment::resolve(spec, state)?;

    let mut resources: Vec<ResourcePlan> = resolution
        .resources
        .into_iter()
        .map(|entry| {
            let action = if entry.is_new {
                Action::Create
            } else if entry.changed {
                Action::Update
            } else {
                Action::Keep
            };
            let ip = match &entry.resource {
                Resource::Machine(vm) => vm.ip,
                _ => None,
            };
            ResourcePlan {
                kind: entry.resource.kind(),
                name: entry.resource.name().to_string(),
                action,
                version: entry.version,
                ip,
            }
        })
        .collect();
    resources.extend(resolution.removed.iter().map(|gone| ResourcePlan {
        kind: gone.resource.kind(),
        name: gone.resource.name().to_string(),
        action: Action::Remove,
        version: gone.version,
        ip: gone.machine_ip(),
    }));

    let (action, version) = match state.version {
        _ if !state.is_provisioned() => (Action::Create, 0),
        Some(v) if resolution.changed || state.pending => (Action::Update, v + 1),
        Some(v) => (Action::Keep, v),
        None => (Action::Update, 0),
    };

    Ok(DeploymentPlan {
        node_id: spec.node_id,
        contract_id: state.contract_id,
        action,
        version,
        resources,
    })
}

/// Plan a mesh network. Listen ports are picked at run time and are not part
/// of the plan.
pub fn plan_network(spec: &NetworkSpec, state: &NetworkState) -> Result<NetworkPlan> {
    let (range, public_node) = network::check_input(spec, state)?;
    let up_to_date = network::is_up_to_date(spec, state, public_node);

    let external = match state.external_subnet {
        Some(subnet) => subnet,
        None => external_subnet(&range)?,
    };
    let mut used: BTreeSet<Ipv4Net> = state.nodes.iter().map(|n| n.subnet).collect();
    used.insert(external);

    let mut nodes = Vec::with_capacity(spec.nodes.len());
    for &node_id in &spec.nodes {
        let plan = match state.node(node_id) {
            Some(record) if up_to_date => NodePlan {
                node_id,
                action: Action::Keep,
                version: record.version.unwrap_or(0),
                subnet: record.subnet,
            },
            Some(record) => NodePlan {
                node_id,
                action: if record.contract_id.is_some() {
                    Action::Update
                } else {
                    Action::Create
                },
                version: record.version.map_or(0, |v| v + 1),
                subnet: record.subnet,
            },
            None => {
                let subnet = allocate_subnet(&range, &used, FIRST_NODE_SUBNET_INDEX)?;
                used.insert(subnet);
                NodePlan {
                    node_id,
                    action: Action::Create,
                    version: 0,
                    subnet,
                }
            }
        };
        nodes.push(plan);
    }
    nodes.extend(
        state
            .nodes
            .iter()
            .filter(|n| !spec.nodes.contains(&n.node_id))
            .map(|n| NodePlan {
                node_id: n.node_id,
                action: Action::Remove,
                version: n.version.unwrap_or(0),
                subnet: n.subnet,
            }),
    );

    Ok(NetworkPlan {
        name: spec.name.clone(),
        public_node,
        external_subnet: external,
        nodes,
    })
}
