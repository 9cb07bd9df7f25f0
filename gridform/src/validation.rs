//! Input validation for declared resources and generated deployments.

use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Resource name is required")]
    NameRequired,

    #[error("Invalid resource name '{0}': only ASCII letters, digits, '-' and '_' are allowed")]
    InvalidName(String),

    #[error("Invalid resource '{name}': {reason}")]
    InvalidResource { name: String, reason: String },

    #[error("Duplicate {kind} name '{name}'")]
    DuplicateName { kind: &'static str, name: String },

    #[error("Machine '{machine}' mounts unknown disk '{disk}'")]
    UnknownDisk { machine: String, disk: String },

    #[error("Invalid IPv4 range: {0}")]
    InvalidIpRange(String),

    #[error("IPv4 range {0} must be at least a /24")]
    RangeTooSmall(String),

    #[error("IPv4 address {0} is not within range {1}")]
    Ipv4NotInRange(String, String),

    #[error("IPv4 address {0} is already in use")]
    Ipv4AddressInUse(String),

    #[error("Subnet {0} overlaps with subnet {1}")]
    SubnetOverlap(String, String),

    #[error("At least one node is required")]
    NoNodes,

    #[error("Node {0} is declared more than once")]
    DuplicateNode(u32),

    #[error("Public node {0} is not part of the declared node set")]
    PublicNodeMissing(u32),

    #[error("Deployment is placed on node {recorded}; moving it to node {declared} requires destroying it first")]
    NodeChanged { recorded: u32, declared: u32 },

    #[error("Node {0} has no recorded network assignment")]
    MissingAssignment(u32),

    #[error("Invalid deployment: {0}")]
    InvalidDeployment(String),

    #[error("Deployment is not signed by twin {0}")]
    Unsigned(u32),
}

pub type Result<T> = std::result::Result<T, ValidationError>;

/// Validate a workload / resource name.
pub fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(ValidationError::NameRequired);
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ValidationError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Parse an IPv4 range such as `10.1.0.0/16`, normalising the host bits away.
pub fn parse_ip_range(range: &str) -> Result<Ipv4Net> {
    let net: Ipv4Net = range
        .parse()
        .map_err(|_| ValidationError::InvalidIpRange(range.to_string()))?;
    Ok(net.trunc())
}

/// Check if two IPv4 subnets overlap.
pub fn ipv4_subnets_overlap(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    a.contains(&b.network())
        || a.contains(&b.broadcast())
        || b.contains(&a.network())
        || b.contains(&a.broadcast())
}

/// Validate an explicitly requested machine address.
pub fn validate_requested_ip(
    addr: Ipv4Addr,
    range: &Ipv4Net,
    in_use: impl Fn(&Ipv4Addr) -> bool,
) -> Result<()> {
    if !range.contains(&addr) {
        return Err(ValidationError::Ipv4NotInRange(
            addr.to_string(),
            range.to_string(),
        ));
    }
    if in_use(&addr) {
        return Err(ValidationError::Ipv4AddressInUse(addr.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("web1").is_ok());
        assert!(validate_name("data_disk-2").is_ok());
        assert_eq!(validate_name(""), Err(ValidationError::NameRequired));
        assert_eq!(validate_name("  "), Err(ValidationError::NameRequired));
        assert!(matches!(
            validate_name("web 1"),
            Err(ValidationError::InvalidName(_))
        ));
    }

    #[test]
    fn test_parse_ip_range_truncates_host_bits() {
        let net = parse_ip_range("10.1.3.7/16").unwrap();
        assert_eq!(net.to_string(), "10.1.0.0/16");
        assert!(parse_ip_range("10.1.0.0").is_err());
        assert!(parse_ip_range("not-a-range").is_err());
    }

    #[test]
    fn test_ipv4_subnets_overlap() {
        let a: Ipv4Net = "10.1.0.0/16".parse().unwrap();
        let b: Ipv4Net = "10.1.3.0/24".parse().unwrap();
        assert!(ipv4_subnets_overlap(&a, &b));

        let c: Ipv4Net = "10.1.3.0/24".parse().unwrap();
        let d: Ipv4Net = "10.1.4.0/24".parse().unwrap();
        assert!(!ipv4_subnets_overlap(&c, &d));
    }

    #[test]
    fn test_validate_requested_ip() {
        let range: Ipv4Net = "10.1.1.0/24".parse().unwrap();
        let used = [Ipv4Addr::new(10, 1, 1, 2)];

        assert!(validate_requested_ip(Ipv4Addr::new(10, 1, 1, 3), &range, |a| used.contains(a)).is_ok());
        assert_eq!(
            validate_requested_ip(Ipv4Addr::new(10, 1, 1, 2), &range, |a| used.contains(a)),
            Err(ValidationError::Ipv4AddressInUse("10.1.1.2".to_string()))
        );
        assert!(matches!(
            validate_requested_ip(Ipv4Addr::new(10, 1, 2, 2), &range, |a| used.contains(a)),
            Err(ValidationError::Ipv4NotInRange(_, _))
        ));
    }
}
