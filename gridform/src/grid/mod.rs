//! Deployment and workload types as submitted to node agents.

mod deployment;
mod workload;

pub use deployment::{Deployment, Signature, SignatureRequest, SignatureRequirement};
pub use workload::{
    ComputeCapacity, MachineInterface, MachineMount, MachineNetwork, NetworkData, Peer,
    ResultState, Workload, WorkloadData, WorkloadKind, WorkloadResult, ZMachine, ZMount, Zdb,
    ZdbMode, GIGABYTE, MEGABYTE,
};
