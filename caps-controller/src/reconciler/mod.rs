//! Sub-reconcilers and the orchestrator running them.
//!
//! Each sub-reconciler owns one provider resource kind of an object and
//! converges it from the object's scope. An [`Orchestrator`] runs them in
//! dependency order on reconcile and in reverse order on delete.

pub mod domain;
pub mod instance;
pub mod k8s_cluster;
pub mod k8s_pool;
pub mod lb;
pub mod lb_backend;
pub mod vpc;
pub mod vpcgw;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::scope::{
    ClusterScope, MachineScope, ManagedClusterScope, ManagedControlPlaneScope,
    ManagedMachinePoolScope,
};

/// Converges one provider resource kind for scope `S`.
#[async_trait]
pub trait Reconciler<S: Send>: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create or update the resources.
    async fn reconcile(&self, scope: &mut S) -> Result<()>;

    /// Delete the resources. Must succeed when they are already gone.
    async fn delete(&self, scope: &mut S) -> Result<()>;
}

/// Ordered list of sub-reconcilers.
///
/// Insertion order is the creation dependency order.
pub struct Orchestrator<S> {
    reconcilers: Vec<Box<dyn Reconciler<S>>>,
}

impl<S: Send> Default for Orchestrator<S> {
    fn default() -> Self {
        Self {
            reconcilers: Vec::new(),
        }
    }
}

impl<S: Send> Orchestrator<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, reconciler: impl Reconciler<S> + 'static) -> Self {
        self.reconcilers.push(Box::new(reconciler));
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.reconcilers.iter().map(|r| r.name()).collect()
    }

    /// Run every sub-reconciler front to back, stopping at the first error.
    pub async fn reconcile(&self, scope: &mut S) -> Result<()> {
        for reconciler in &self.reconcilers {
            debug!(service = reconciler.name(), "Reconciling service");
            reconciler
                .reconcile(scope)
                .await
                .with_context(|| format!("failed to reconcile {}", reconciler.name()))?;
        }
        Ok(())
    }

    /// Run every sub-reconciler back to front, stopping at the first error.
    pub async fn delete(&self, scope: &mut S) -> Result<()> {
        for reconciler in self.reconcilers.iter().rev() {
            debug!(service = reconciler.name(), "Deleting service");
            reconciler
                .delete(scope)
                .await
                .with_context(|| format!("failed to delete {}", reconciler.name()))?;
        }
        Ok(())
    }
}

/// vpc → vpcgw → lb → domain
pub fn cluster_orchestrator() -> Orchestrator<ClusterScope> {
    Orchestrator::new()
        .with(vpc::VpcReconciler)
        .with(vpcgw::GatewayReconciler)
        .with(lb::LoadBalancerReconciler)
        .with(domain::DomainReconciler)
}

/// instance → lb-backend
pub fn machine_orchestrator() -> Orchestrator<MachineScope> {
    Orchestrator::new()
        .with(instance::InstanceReconciler)
        .with(lb_backend::LoadBalancerBackendReconciler)
}

/// vpc → vpcgw
pub fn managed_cluster_orchestrator() -> Orchestrator<ManagedClusterScope> {
    Orchestrator::new()
        .with(vpc::VpcReconciler)
        .with(vpcgw::GatewayReconciler)
}

pub fn managed_control_plane_orchestrator() -> Orchestrator<ManagedControlPlaneScope> {
    Orchestrator::new().with(k8s_cluster::K8sClusterReconciler)
}

pub fn managed_machine_pool_orchestrator() -> Orchestrator<ManagedMachinePoolScope> {
    Orchestrator::new().with(k8s_pool::K8sPoolReconciler)
}
