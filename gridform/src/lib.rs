//! gridform: reconciles declared machines, disks, storage nodes and mesh
//! networks against a grid ledger and its node agents.
//!
//! Two reconcilers drive the work:
//! - `DeploymentReconciler`: one signed deployment on one node
//! - `NetworkReconciler`: one network deployment per member node, wired as a full mesh
//!
//! Both go through the collaborator traits in [`clients`], so the engine runs
//! unchanged against the in-memory grid in [`clients::memory`].

pub mod allocator;
pub mod clients;
pub mod config;
pub mod diff;
pub mod error;
pub mod grid;
pub mod lifecycle;
pub mod model;
pub mod plan;
pub mod reconciler;
pub mod topology;
pub mod validation;
pub mod workload;

pub use clients::{GridClients, Identity, KeyGenerator, Ledger, NodeAgent, NodeDirectory};
pub use config::EngineConfig;
pub use error::{ProvisionError, Result};
pub use model::{DeploymentSpec, DeploymentState, NetworkSpec, NetworkState};
pub use plan::{plan_deployment, plan_network};
pub use reconciler::{DeploymentReconciler, NetworkReconciler, Reconciler};
pub use validation::ValidationError;
