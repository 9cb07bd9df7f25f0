//! Signed bundle of workloads submitted to one node under one contract.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::workload::{Workload, WorkloadData};
use crate::clients::Identity;
use crate::error::{ProvisionError, Result};
use crate::validation::{validate_name, ValidationError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRequest {
    pub twin_id: u32,
    pub required: bool,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub twin_id: u32,
    /// Hex-encoded signature over the challenge hash.
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SignatureRequirement {
    pub requests: Vec<SignatureRequest>,
    pub weight_required: u32,
    #[serde(default)]
    pub signatures: Vec<Signature>,
}

impl SignatureRequirement {
    /// A single signer carrying the whole required weight.
    pub fn single(twin_id: u32) -> Self {
        Self {
            requests: vec![SignatureRequest {
                twin_id,
                required: false,
                weight: 1,
            }],
            weight_required: 1,
            signatures: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub version: u32,
    pub twin_id: u32,
    /// Assigned by the ledger; zero until a contract exists.
    #[serde(default)]
    pub contract_id: u64,
    #[serde(default)]
    pub description: String,
    pub signature_requirement: SignatureRequirement,
    pub workloads: Vec<Workload>,
}

/// Fields covered by the signature. Results, contract id and signatures are not.
#[derive(Serialize)]
struct Challenge<'a> {
    version: u32,
    twin_id: u32,
    description: &'a str,
    weight_required: u32,
    requests: Vec<(u32, bool, u32)>,
    workloads: Vec<WorkloadChallenge<'a>>,
}

#[derive(Serialize)]
struct WorkloadChallenge<'a> {
    version: u32,
    name: &'a str,
    description: &'a str,
    data: &'a WorkloadData,
}

impl Deployment {
    /// Deployment owned and signed by a single twin.
    pub fn new(twin_id: u32, version: u32, workloads: Vec<Workload>) -> Self {
        Self {
            version,
            twin_id,
            contract_id: 0,
            description: String::new(),
            signature_requirement: SignatureRequirement::single(twin_id),
            workloads,
        }
    }

    /// Structural validation. Must pass before signing.
    pub fn valid(&self) -> std::result::Result<(), ValidationError> {
        let invalid = |reason: String| Err(ValidationError::InvalidDeployment(reason));

        if self.twin_id == 0 {
            return invalid("owner twin id is zero".to_string());
        }
        if self.workloads.is_empty() {
            return invalid("no workloads".to_string());
        }

        let requirement = &self.signature_requirement;
        if requirement.requests.is_empty() {
            return invalid("no signature requests".to_string());
        }
        if requirement.weight_required == 0 {
            return invalid("required signature weight is zero".to_string());
        }
        let total: u32 = requirement.requests.iter().map(|r| r.weight).sum();
        if total < requirement.weight_required {
            return invalid(format!(
                "signature requests carry weight {} but {} is required",
                total, requirement.weight_required
            ));
        }

        let mut names = HashSet::new();
        for wl in &self.workloads {
            validate_name(&wl.name)?;
            if !names.insert(wl.name.as_str()) {
                return Err(ValidationError::DuplicateName {
                    kind: "workload",
                    name: wl.name.clone(),
                });
            }
        }

        let mounts: BTreeSet<&str> = self
            .workloads
            .iter()
            .filter(|w| matches!(w.data, WorkloadData::ZMount(_)))
            .map(|w| w.name.as_str())
            .collect();

        for wl in &self.workloads {
            let bad = |reason: &str| {
                Err(ValidationError::InvalidResource {
                    name: wl.name.clone(),
                    reason: reason.to_string(),
                })
            };
            match &wl.data {
                WorkloadData::ZMount(m) if m.size == 0 => return bad("disk size is zero"),
                WorkloadData::Zdb(z) if z.size == 0 => return bad("storage size is zero"),
                WorkloadData::Zdb(z) if z.password.is_empty() => return bad("password is empty"),
                WorkloadData::ZMachine(m) => {
                    if m.flist.is_empty() {
                        return bad("flist is empty");
                    }
                    if m.compute_capacity.cpu == 0 || m.compute_capacity.memory == 0 {
                        return bad("machine needs cpu and memory");
                    }
                    if let Some(mount) = m.mounts.iter().find(|mt| !mounts.contains(mt.name.as_str())) {
                        return Err(ValidationError::UnknownDisk {
                            machine: wl.name.clone(),
                            disk: mount.name.clone(),
                        });
                    }
                }
                WorkloadData::Network(n) => {
                    if n.wg_listen_port == 0 {
                        return bad("listen port is zero");
                    }
                    if !n.ip_range.contains(&n.subnet) {
                        return bad("node subnet is outside the network range");
                    }
                    if n.peers.iter().any(|p| p.subnet == n.subnet) {
                        return bad("peer list contains the node itself");
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Canonical bytes covered by the signature.
    pub fn challenge(&self) -> Result<Vec<u8>> {
        let challenge = Challenge {
            version: self.version,
            twin_id: self.twin_id,
            description: &self.description,
            weight_required: self.signature_requirement.weight_required,
            requests: self
                .signature_requirement
                .requests
                .iter()
                .map(|r| (r.twin_id, r.required, r.weight))
                .collect(),
            workloads: self
                .workloads
                .iter()
                .map(|w| WorkloadChallenge {
                    version: w.version,
                    name: &w.name,
                    description: &w.description,
                    data: &w.data,
                })
                .collect(),
        };
        Ok(serde_json::to_vec(&challenge)?)
    }

    pub fn challenge_hash(&self) -> Result<Vec<u8>> {
        Ok(Sha256::digest(self.challenge()?).to_vec())
    }

    /// Hex digest handed to the ledger.
    pub fn challenge_hash_hex(&self) -> Result<String> {
        Ok(hex::encode(self.challenge_hash()?))
    }

    /// Validate, then sign as the given identity. Replaces an older signature of the same twin.
    pub fn sign(&mut self, identity: &dyn Identity) -> Result<()> {
        self.valid()?;
        let twin_id = identity.twin_id();
        if !self
            .signature_requirement
            .requests
            .iter()
            .any(|r| r.twin_id == twin_id)
        {
            return Err(ValidationError::InvalidDeployment(format!(
                "twin {} is not a requested signer",
                twin_id
            ))
            .into());
        }

        let hash = self.challenge_hash()?;
        let signature = identity.sign(&hash).map_err(|e| ProvisionError::Signing {
            twin_id,
            message: e.to_string(),
        })?;

        let signatures = &mut self.signature_requirement.signatures;
        signatures.retain(|s| s.twin_id != twin_id);
        signatures.push(Signature {
            twin_id,
            signature: hex::encode(signature),
        });
        Ok(())
    }

    pub fn is_signed_by(&self, twin_id: u32) -> bool {
        self.signature_requirement
            .signatures
            .iter()
            .any(|s| s.twin_id == twin_id)
    }
}
