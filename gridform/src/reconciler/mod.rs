//! Reconcilers for the two resource types.
//!
//! Each reconciler compares desired state (the declared spec) with recorded
//! state (from the previous run) and drives the grid to converge. The state is
//! updated in place as remote steps succeed, so a failed run leaves behind
//! exactly what was applied.

pub mod deployment;
pub mod network;

use async_trait::async_trait;

use crate::error::Result;

pub use deployment::{DeploymentReconciler, ObservedWorkload};
pub use network::NetworkReconciler;

/// Trait for resource reconcilers.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Declared state.
    type Spec: Sync;
    /// State persisted between runs.
    type State: Send;

    /// Reconcile the resource - compare desired vs recorded state and take action.
    async fn reconcile(&self, spec: &Self::Spec, state: &mut Self::State) -> Result<()>;

    /// Handle resource deletion (finalization).
    async fn finalize(&self, state: &mut Self::State) -> Result<()>;
}
