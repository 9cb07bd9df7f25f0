//! Full-mesh topology generation.
//!
//! Given every member's subnet, port and key, builds one signed deployment per
//! node carrying a single network workload, plus the configuration an external
//! client uses to join the mesh through the public node.

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddr};

use ipnet::Ipv4Net;
use tracing::debug;

use crate::allocator::overlay_ip;
use crate::clients::{Identity, NodeDirectory, WgKeyPair};
use crate::error::{ProvisionError, Result};
use crate::grid::{Deployment, Peer};
use crate::validation::{ipv4_subnets_overlap, validate_name, ValidationError};
use crate::workload::NetworkWorkload;

/// One member of the mesh as assigned for this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAssignment {
    pub node_id: u32,
    pub subnet: Ipv4Net,
    pub port: u16,
    pub key: WgKeyPair,
    /// Last recorded version; `None` if the node was never provisioned.
    pub version: Option<u32>,
    /// `None` if no contract exists for the node yet.
    pub contract_id: Option<u64>,
}

impl NodeAssignment {
    /// Version of the deployment generated for this node.
    pub fn next_version(&self) -> u32 {
        self.version.map_or(0, |v| v + 1)
    }
}

/// Everything needed to generate the mesh of one reconciliation run.
#[derive(Debug, Clone)]
pub struct NetworkConfiguration {
    pub name: String,
    pub description: String,
    pub ip_range: Ipv4Net,
    pub overlay_range: Ipv4Net,
    pub keepalive_secs: u32,
    /// Members in declaration order.
    pub nodes: Vec<NodeAssignment>,
    pub public_node: u32,
    pub external_subnet: Ipv4Net,
    pub external_key: WgKeyPair,
}

/// Result of [`generate_deployments`].
#[derive(Debug, Clone)]
pub struct GeneratedNetwork {
    pub access_config: String,
    /// One signed deployment per node, in member order.
    pub deployments: Vec<(u32, Deployment)>,
}

impl NetworkConfiguration {
    pub fn node(&self, node_id: u32) -> Option<&NodeAssignment> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    /// Structural checks that must hold before anything is generated.
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        validate_name(&self.name)?;
        if self.nodes.is_empty() {
            return Err(ValidationError::NoNodes);
        }

        let mut seen = BTreeSet::new();
        for node in &self.nodes {
            if !seen.insert(node.node_id) {
                return Err(ValidationError::DuplicateNode(node.node_id));
            }
        }
        if !seen.contains(&self.public_node) {
            return Err(ValidationError::PublicNodeMissing(self.public_node));
        }

        let subnets: Vec<Ipv4Net> = self
            .nodes
            .iter()
            .map(|n| n.subnet)
            .chain(std::iter::once(self.external_subnet))
            .collect();
        for (i, a) in subnets.iter().enumerate() {
            if !self.ip_range.contains(a) {
                return Err(ValidationError::Ipv4NotInRange(
                    a.to_string(),
                    self.ip_range.to_string(),
                ));
            }
            if let Some(b) = subnets[i + 1..].iter().find(|b| ipv4_subnets_overlap(a, b)) {
                return Err(ValidationError::SubnetOverlap(a.to_string(), b.to_string()));
            }
        }
        Ok(())
    }

    fn routes(&self, subnet: &Ipv4Net) -> Vec<Ipv4Net> {
        vec![*subnet, overlay_ip(subnet, &self.overlay_range)]
    }

    fn peer(&self, node: &NodeAssignment, addr: IpAddr) -> Peer {
        let mut allowed_ips = self.routes(&node.subnet);
        if node.node_id == self.public_node {
            // traffic for the external client goes through the public node
            allowed_ips.extend(self.routes(&self.external_subnet));
        }
        Peer {
            subnet: node.subnet,
            wg_public_key: node.key.public_key.clone(),
            endpoint: Some(SocketAddr::new(addr, node.port).to_string()),
            allowed_ips,
        }
    }

    fn external_peer(&self) -> Peer {
        Peer {
            subnet: self.external_subnet,
            wg_public_key: self.external_key.public_key.clone(),
            endpoint: None,
            allowed_ips: self.routes(&self.external_subnet),
        }
    }

    fn access_config(&self, public: &NodeAssignment, addr: IpAddr) -> String {
        let address = overlay_ip(&self.external_subnet, &self.overlay_range).addr();
        format!(
            "[Interface]\n\
             Address = {address}\n\
             PrivateKey = {private_key}\n\
             [Peer]\n\
             PublicKey = {public_key}\n\
             AllowedIPs = {range}, {overlay}\n\
             PersistentKeepalive = {keepalive}\n\
             Endpoint = {endpoint}\n",
            private_key = self.external_key.private_key,
            public_key = public.key.public_key,
            range = self.ip_range,
            overlay = self.overlay_range,
            keepalive = self.keepalive_secs,
            endpoint = SocketAddr::new(addr, public.port),
        )
    }
}

/// Generate the access configuration and one signed deployment per node.
///
/// Fails as a whole: no deployment is returned if any of them cannot be
/// validated or signed.
pub async fn generate_deployments(
    config: &NetworkConfiguration,
    directory: &dyn NodeDirectory,
    identity: &dyn Identity,
) -> Result<GeneratedNetwork> {
    config.validate()?;

    let mut addresses = HashMap::with_capacity(config.nodes.len());
    for node in &config.nodes {
        let addr = directory
            .resolve(node.node_id)
            .await
            .map_err(|e| {
                ProvisionError::remote("resolve node address", node.node_id, node.contract_id, e)
            })?;
        addresses.insert(node.node_id, addr);
    }

    let mut access_config = String::new();
    let mut deployments = Vec::with_capacity(config.nodes.len());
    for node in &config.nodes {
        let mut peers: Vec<Peer> = config
            .nodes
            .iter()
            .filter(|other| other.node_id != node.node_id)
            .map(|other| config.peer(other, addresses[&other.node_id]))
            .collect();

        if node.node_id == config.public_node {
            peers.push(config.external_peer());
            access_config = config.access_config(node, addresses[&node.node_id]);
        }

        let version = node.next_version();
        let peer_count = peers.len();
        let workload = NetworkWorkload {
            name: &config.name,
            description: &config.description,
            version,
            ip_range: config.ip_range,
            subnet: node.subnet,
            private_key: &node.key.private_key,
            listen_port: node.port,
            peers,
        }
        .build()?;

        let mut deployment = Deployment::new(identity.twin_id(), version, vec![workload]);
        deployment.description = config.description.clone();
        deployment.sign(identity)?;
        debug!(
            "Generated network deployment for node {} (version {}, {} peers)",
            node.node_id, version, peer_count
        );
        deployments.push((node.node_id, deployment));
    }

    Ok(GeneratedNetwork {
        access_config,
        deployments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::memory::{MemoryGrid, MemoryIdentity};
    use crate::grid::WorkloadData;

    fn key(tag: &str) -> WgKeyPair {
        WgKeyPair {
            private_key: format!("{}-sk", tag),
            public_key: format!("{}-pk", tag),
        }
    }

    fn assignment(node_id: u32, third: u8, port: u16) -> NodeAssignment {
        NodeAssignment {
            node_id,
            subnet: format!("10.1.{}.0/24", third).parse().unwrap(),
            port,
            key: key(&format!("node{}", node_id)),
            version: None,
            contract_id: None,
        }
    }

    fn config(nodes: Vec<NodeAssignment>, public_node: u32) -> NetworkConfiguration {
        NetworkConfiguration {
            name: "net1".to_string(),
            description: "mesh".to_string(),
            ip_range: "10.1.0.0/16".parse().unwrap(),
            overlay_range: "100.64.0.0/16".parse().unwrap(),
            keepalive_secs: 25,
            nodes,
            public_node,
            external_subnet: "10.1.2.0/24".parse().unwrap(),
            external_key: key("external"),
        }
    }

    fn peers(deployment: &Deployment) -> &[Peer] {
        match &deployment.workloads[0].data {
            WorkloadData::Network(n) => &n.peers,
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_two_nodes_see_each_other() {
        let grid = MemoryGrid::new();
        let identity = MemoryIdentity::new(14);
        let cfg = config(vec![assignment(1, 3, 3000), assignment(2, 4, 4000)], 1);

        let generated = generate_deployments(&cfg, &grid, &identity).await.unwrap();
        assert_eq!(generated.deployments.len(), 2);

        let (_, on_node2) = &generated.deployments[1];
        let node2_peers = peers(on_node2);
        assert_eq!(node2_peers.len(), 1);
        assert_eq!(node2_peers[0].subnet, cfg.nodes[0].subnet);
        assert_eq!(node2_peers[0].endpoint.as_deref(), Some("185.69.0.1:3000"));
        // node 1 is public, so it also routes the external subnet
        assert!(node2_peers[0]
            .allowed_ips
            .contains(&"10.1.2.0/24".parse().unwrap()));
        assert!(node2_peers[0]
            .allowed_ips
            .contains(&"100.64.1.2/32".parse().unwrap()));

        let (_, on_node1) = &generated.deployments[0];
        let node1_peers = peers(on_node1);
        assert_eq!(node1_peers.len(), 2);
        assert_eq!(node1_peers[0].subnet, cfg.nodes[1].subnet);
        assert_eq!(node1_peers[0].endpoint.as_deref(), Some("185.69.0.2:4000"));
        assert_eq!(
            node1_peers[0].allowed_ips,
            vec![
                "10.1.4.0/24".parse().unwrap(),
                "100.64.1.4/32".parse().unwrap()
            ]
        );
        assert_eq!(node1_peers[1].endpoint, None);
        assert_eq!(node1_peers[1].wg_public_key, "external-pk");

        for (_, deployment) in &generated.deployments {
            assert!(deployment.is_signed_by(14));
            assert_eq!(deployment.version, 0);
        }
    }

    #[tokio::test]
    async fn test_topology_is_symmetric_without_self_loops() {
        let grid = MemoryGrid::new();
        let identity = MemoryIdentity::new(14);
        let nodes = vec![
            assignment(1, 3, 3000),
            assignment(5, 4, 3001),
            assignment(9, 5, 3002),
            assignment(11, 6, 3003),
        ];
        let cfg = config(nodes.clone(), 5);
        let generated = generate_deployments(&cfg, &grid, &identity).await.unwrap();

        for (node_id, deployment) in &generated.deployments {
            let own = cfg.node(*node_id).unwrap();
            let mesh: Vec<_> = peers(deployment)
                .iter()
                .filter(|p| p.endpoint.is_some())
                .collect();
            assert_eq!(mesh.len(), nodes.len() - 1);
            assert!(mesh.iter().all(|p| p.subnet != own.subnet));

            for peer in mesh {
                let other = nodes.iter().find(|n| n.subnet == peer.subnet).unwrap();
                assert_eq!(peer.wg_public_key, other.key.public_key);
                let (_, theirs) = generated
                    .deployments
                    .iter()
                    .find(|(id, _)| *id == other.node_id)
                    .unwrap();
                assert!(peers(theirs).iter().any(|p| p.subnet == own.subnet));
            }
        }
    }

    #[tokio::test]
    async fn test_access_config_points_at_public_node() {
        let grid = MemoryGrid::new();
        grid.set_address(2, "185.206.122.31".parse().unwrap());
        let identity = MemoryIdentity::new(14);
        let cfg = config(vec![assignment(1, 3, 3000), assignment(2, 4, 4000)], 2);

        let generated = generate_deployments(&cfg, &grid, &identity).await.unwrap();
        let access = &generated.access_config;
        assert!(access.contains("Address = 100.64.1.2\n"));
        assert!(access.contains("PrivateKey = external-sk\n"));
        assert!(access.contains("PublicKey = node2-pk\n"));
        assert!(access.contains("AllowedIPs = 10.1.0.0/16, 100.64.0.0/16\n"));
        assert!(access.contains("PersistentKeepalive = 25\n"));
        assert!(access.contains("Endpoint = 185.206.122.31:4000\n"));
        assert!(access.starts_with("[Interface]\nAddress = "));
        assert_eq!(access.lines().count(), 8);
        assert!(access.lines().all(|l| !l.starts_with(' ')));

        // the external subnet is routed through the public node only
        let (_, on_node1) = &generated.deployments[0];
        assert!(peers(on_node1)[0]
            .allowed_ips
            .contains(&cfg.external_subnet));
    }

    #[tokio::test]
    async fn test_ipv6_endpoint_is_bracketed() {
        let grid = MemoryGrid::new();
        grid.set_address(2, "2a02:1802:5e::1".parse().unwrap());
        let identity = MemoryIdentity::new(14);
        let cfg = config(vec![assignment(1, 3, 3000), assignment(2, 4, 4000)], 1);

        let generated = generate_deployments(&cfg, &grid, &identity).await.unwrap();
        let (_, on_node1) = &generated.deployments[0];
        assert_eq!(
            peers(on_node1)[0].endpoint.as_deref(),
            Some("[2a02:1802:5e::1]:4000")
        );
    }

    #[tokio::test]
    async fn test_missing_public_node_is_rejected() {
        let grid = MemoryGrid::new();
        let identity = MemoryIdentity::new(14);
        let cfg = config(vec![assignment(1, 3, 3000)], 7);
        assert!(matches!(
            generate_deployments(&cfg, &grid, &identity).await,
            Err(ProvisionError::Validation(ValidationError::PublicNodeMissing(7)))
        ));
    }

    #[tokio::test]
    async fn test_single_node_has_only_external_peer() {
        let grid = MemoryGrid::new();
        let identity = MemoryIdentity::new(14);
        let cfg = config(vec![assignment(1, 3, 3000)], 1);
        let generated = generate_deployments(&cfg, &grid, &identity).await.unwrap();
        let (_, only) = &generated.deployments[0];
        assert_eq!(peers(only).len(), 1);
        assert_eq!(peers(only)[0].endpoint, None);
        assert!(!generated.access_config.is_empty());
    }

    #[test]
    fn test_overlapping_subnets_are_rejected() {
        let cfg = config(vec![assignment(1, 3, 3000), assignment(2, 3, 3001)], 1);
        assert!(matches!(
            cfg.validate(),
            Err(ValidationError::SubnetOverlap(_, _))
        ));

        let cfg = config(vec![assignment(1, 2, 3000)], 1);
        assert!(matches!(
            cfg.validate(),
            Err(ValidationError::SubnetOverlap(_, _))
        ));
    }

    #[test]
    fn test_versions_bump_from_recorded() {
        let mut node = assignment(1, 3, 3000);
        assert_eq!(node.next_version(), 0);
        node.version = Some(4);
        assert_eq!(node.next_version(), 5);
    }

    #[tokio::test]
    async fn test_unresolvable_node_aborts_generation() {
        let grid = MemoryGrid::new();
        grid.fail_next(
            crate::clients::memory::Operation::ResolveAddress,
            crate::clients::ClientError::NotFound("node 1".to_string()),
        );
        let identity = MemoryIdentity::new(14);
        let cfg = config(vec![assignment(1, 3, 3000), assignment(2, 4, 4000)], 1);
        assert!(matches!(
            generate_deployments(&cfg, &grid, &identity).await,
            Err(ProvisionError::Remote { node_id: 1, .. })
        ));
    }
}
