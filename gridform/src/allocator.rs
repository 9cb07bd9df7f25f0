//! Address, subnet and listen port allocation.

use std::collections::{BTreeSet, HashSet};
use std::net::Ipv4Addr;
use std::ops::Range;

use ipnet::Ipv4Net;
use rand::Rng;

use crate::error::{ProvisionError, Result};

/// First and last host id handed out inside a /24. `.0` and `.1` are the
/// network and gateway, `.255` is broadcast.
const FIRST_HOST: u8 = 2;
const LAST_HOST: u8 = 254;

/// Subnet index of the external access point inside a network range.
pub const EXTERNAL_SUBNET_INDEX: u8 = 2;
/// First subnet index handed to nodes.
pub const FIRST_NODE_SUBNET_INDEX: u8 = 3;

/// Allocate the first free machine address in `subnet`.
///
/// Host ids are scanned in order, so the result is deterministic for a given
/// used set.
pub fn allocate_ip(subnet: &Ipv4Net, used: &BTreeSet<Ipv4Addr>) -> Result<Ipv4Addr> {
    let [a, b, c, _] = subnet.network().octets();
    (FIRST_HOST..=LAST_HOST)
        .map(|host| Ipv4Addr::new(a, b, c, host))
        .find(|addr| subnet.contains(addr) && !used.contains(addr))
        .ok_or_else(|| ProvisionError::AddressSpaceExhausted {
            range: subnet.to_string(),
        })
}

/// Allocate a free /24 inside `range`, starting at third-octet index `first_index`.
///
/// `range` must be at least a /16; the index walks the third octet.
pub fn allocate_subnet(
    range: &Ipv4Net,
    used: &BTreeSet<Ipv4Net>,
    first_index: u8,
) -> Result<Ipv4Net> {
    let [a, b, _, _] = range.network().octets();
    (first_index..=u8::MAX)
        .filter_map(|index| Ipv4Net::new(Ipv4Addr::new(a, b, index, 0), 24).ok())
        .find(|subnet| range.contains(subnet) && !used.contains(subnet))
        .ok_or_else(|| ProvisionError::AddressSpaceExhausted {
            range: range.to_string(),
        })
}

/// The /24 reserved for the external access point.
pub fn external_subnet(range: &Ipv4Net) -> Result<Ipv4Net> {
    allocate_subnet(range, &BTreeSet::new(), EXTERNAL_SUBNET_INDEX)
}

/// Sample a listen port in `range` that is not reserved on the node.
///
/// Gives up after `attempts` samples.
pub fn allocate_port<R: Rng>(
    node_id: u32,
    reserved: &HashSet<u16>,
    range: Range<u16>,
    attempts: u32,
    rng: &mut R,
) -> Result<u16> {
    if !range.is_empty() {
        for _ in 0..attempts {
            let port = rng.gen_range(range.clone());
            if !reserved.contains(&port) {
                return Ok(port);
            }
        }
    }
    Err(ProvisionError::PortSpaceExhausted { node_id, attempts })
}

/// Overlay address of a subnet: `a.b.c.d/24` maps to `100.64.b.c/32`.
pub fn overlay_ip(subnet: &Ipv4Net, overlay: &Ipv4Net) -> Ipv4Net {
    let [_, b, c, _] = subnet.network().octets();
    let [o1, o2, _, _] = overlay.network().octets();
    Ipv4Net::from(Ipv4Addr::new(o1, o2, b, c))
}
