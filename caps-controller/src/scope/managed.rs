use std::sync::Arc;

use anyhow::Result;

use super::{NetworkScope, ObjectHandle, Owner};
use crate::api::{
    ApiEndpoint, NetworkStatus, PrivateNetworkSpec, PublicGatewaySpec, ScalewayManagedCluster,
    ScalewayManagedControlPlane, ScalewayManagedMachinePool,
};
use crate::clients::{CloudClient, Region, Zone, resolve_zone};
use crate::config::ControllerConfig;
use crate::controller::{KubeconfigSink, StatusSink};
use crate::error::ReconcileError;

/// Scope of one ScalewayManagedCluster reconciliation.
pub struct ManagedClusterScope {
    handle: ObjectHandle<ScalewayManagedCluster>,
    owner: Owner,
    client: Arc<dyn CloudClient>,
    config: Arc<ControllerConfig>,
}

impl ManagedClusterScope {
    pub fn new(
        managed_cluster: ScalewayManagedCluster,
        client: Arc<dyn CloudClient>,
        sink: Arc<dyn StatusSink<ScalewayManagedCluster>>,
        config: Arc<ControllerConfig>,
    ) -> Self {
        Self {
            owner: Owner::of(&managed_cluster, &config),
            handle: ObjectHandle::new(managed_cluster, sink),
            client,
            config,
        }
    }

    pub fn managed_cluster(&self) -> &ScalewayManagedCluster {
        self.handle.get()
    }

    pub fn managed_cluster_mut(&mut self) -> &mut ScalewayManagedCluster {
        self.handle.get_mut()
    }

    pub fn set_control_plane_endpoint(&mut self, endpoint: ApiEndpoint) {
        self.managed_cluster_mut().spec.control_plane_endpoint = endpoint;
    }

    pub fn set_ready(&mut self, ready: bool) {
        self.managed_cluster_mut().status.ready = ready;
    }

    pub async fn close(&mut self) -> Result<()> {
        self.handle.close().await
    }
}

impl NetworkScope for ManagedClusterScope {
    fn client(&self) -> Arc<dyn CloudClient> {
        self.client.clone()
    }

    fn config(&self) -> &ControllerConfig {
        &self.config
    }

    fn region(&self) -> &Region {
        &self.managed_cluster().spec.region
    }

    fn owner(&self) -> &Owner {
        &self.owner
    }

    fn private_network(&self) -> &PrivateNetworkSpec {
        &self.managed_cluster().spec.network.private_network
    }

    fn public_gateways(&self) -> &[PublicGatewaySpec] {
        &self.managed_cluster().spec.network.public_gateways
    }

    fn network_status(&self) -> Option<&NetworkStatus> {
        self.managed_cluster().status.network.as_ref()
    }

    fn network_status_mut(&mut self) -> &mut NetworkStatus {
        self.managed_cluster_mut()
            .status
            .network
            .get_or_insert_with(NetworkStatus::default)
    }

    /// Managed clusters require a private network.
    fn has_private_network(&self) -> bool {
        true
    }
}

/// Scope of one ScalewayManagedControlPlane reconciliation.
pub struct ManagedControlPlaneScope {
    handle: ObjectHandle<ScalewayManagedControlPlane>,
    owner: Owner,
    managed_cluster: ScalewayManagedCluster,
    client: Arc<dyn CloudClient>,
    kubeconfigs: Arc<dyn KubeconfigSink>,
    config: Arc<ControllerConfig>,
}

impl ManagedControlPlaneScope {
    pub fn new(
        control_plane: ScalewayManagedControlPlane,
        managed_cluster: ScalewayManagedCluster,
        client: Arc<dyn CloudClient>,
        sink: Arc<dyn StatusSink<ScalewayManagedControlPlane>>,
        kubeconfigs: Arc<dyn KubeconfigSink>,
        config: Arc<ControllerConfig>,
    ) -> Self {
        Self {
            owner: Owner::of(&control_plane, &config),
            handle: ObjectHandle::new(control_plane, sink),
            managed_cluster,
            client,
            kubeconfigs,
            config,
        }
    }

    pub fn control_plane(&self) -> &ScalewayManagedControlPlane {
        self.handle.get()
    }

    pub fn control_plane_mut(&mut self) -> &mut ScalewayManagedControlPlane {
        self.handle.get_mut()
    }

    pub fn managed_cluster(&self) -> &ScalewayManagedCluster {
        &self.managed_cluster
    }

    pub fn client(&self) -> Arc<dyn CloudClient> {
        self.client.clone()
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn kubeconfigs(&self) -> Arc<dyn KubeconfigSink> {
        self.kubeconfigs.clone()
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    pub fn region(&self) -> &Region {
        &self.managed_cluster.spec.region
    }

    /// Name of the managed cluster at the provider.
    pub fn cluster_name(&self) -> String {
        match &self.control_plane().spec.cluster_name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => self.owner.resource_name(&[]),
        }
    }

    pub fn resource_tags(&self) -> Vec<String> {
        let extra: Vec<&str> = self
            .control_plane()
            .spec
            .additional_tags
            .iter()
            .map(String::as_str)
            .collect();
        self.owner.resource_tags(&extra)
    }

    pub fn private_network_id(&self) -> Option<&str> {
        self.managed_cluster
            .status
            .network
            .as_ref()
            .and_then(|n| n.private_network_id.as_deref())
    }

    /// Name the generic cluster is known by, used for the kubeconfig.
    pub fn owner_cluster_name(&self) -> &str {
        self.control_plane()
            .meta
            .cluster_name()
            .unwrap_or(&self.managed_cluster.meta.name)
    }

    pub fn cluster_id(&self) -> Option<&str> {
        self.control_plane().status.cluster_id.as_deref()
    }

    pub fn set_cluster(&mut self, id: &str, version: &str, endpoint: Option<ApiEndpoint>) {
        let control_plane = self.control_plane_mut();
        control_plane.status.cluster_id = Some(id.to_string());
        control_plane.status.version = Some(version.to_string());
        if let Some(endpoint) = endpoint {
            control_plane.spec.control_plane_endpoint = endpoint;
        }
    }

    pub fn set_ready(&mut self, ready: bool) {
        self.control_plane_mut().status.ready = ready;
    }

    pub fn set_initialized(&mut self) {
        self.control_plane_mut().status.initialized = true;
    }

    pub async fn close(&mut self) -> Result<()> {
        self.handle.close().await
    }
}

/// Scope of one ScalewayManagedMachinePool reconciliation.
pub struct ManagedMachinePoolScope {
    handle: ObjectHandle<ScalewayManagedMachinePool>,
    owner: Owner,
    control_plane: ScalewayManagedControlPlane,
    managed_cluster: ScalewayManagedCluster,
    client: Arc<dyn CloudClient>,
    config: Arc<ControllerConfig>,
}

impl ManagedMachinePoolScope {
    pub fn new(
        pool: ScalewayManagedMachinePool,
        control_plane: ScalewayManagedControlPlane,
        managed_cluster: ScalewayManagedCluster,
        client: Arc<dyn CloudClient>,
        sink: Arc<dyn StatusSink<ScalewayManagedMachinePool>>,
        config: Arc<ControllerConfig>,
    ) -> Self {
        Self {
            owner: Owner::of(&pool, &config),
            handle: ObjectHandle::new(pool, sink),
            control_plane,
            managed_cluster,
            client,
            config,
        }
    }

    pub fn pool(&self) -> &ScalewayManagedMachinePool {
        self.handle.get()
    }

    pub fn pool_mut(&mut self) -> &mut ScalewayManagedMachinePool {
        self.handle.get_mut()
    }

    pub fn control_plane(&self) -> &ScalewayManagedControlPlane {
        &self.control_plane
    }

    pub fn client(&self) -> Arc<dyn CloudClient> {
        self.client.clone()
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    pub fn region(&self) -> &Region {
        &self.managed_cluster.spec.region
    }

    pub fn zone(&self) -> Result<Zone, ReconcileError> {
        resolve_zone(self.region(), self.pool().spec.zone.as_deref())
    }

    /// Pool names only need to be unique inside their cluster.
    pub fn pool_name(&self) -> &str {
        &self.pool().meta.name
    }

    pub fn cluster_id(&self) -> Option<&str> {
        self.control_plane.status.cluster_id.as_deref()
    }

    /// Kubernetes version pools follow: the one the control plane runs.
    pub fn version(&self) -> &str {
        self.control_plane
            .status
            .version
            .as_deref()
            .unwrap_or(&self.control_plane.spec.version)
    }

    pub fn resource_tags(&self) -> Vec<String> {
        let extra: Vec<&str> = self
            .pool()
            .spec
            .additional_tags
            .iter()
            .map(String::as_str)
            .collect();
        self.owner.resource_tags(&extra)
    }

    pub fn set_replicas(&mut self, replicas: u32) {
        self.pool_mut().status.replicas = replicas;
    }

    pub fn set_provider_ids(&mut self, provider_ids: Vec<String>) {
        self.pool_mut().spec.provider_id_list = provider_ids;
    }

    pub fn set_ready(&mut self, ready: bool) {
        self.pool_mut().status.ready = ready;
    }

    pub async fn close(&mut self) -> Result<()> {
        self.handle.close().await
    }
}
