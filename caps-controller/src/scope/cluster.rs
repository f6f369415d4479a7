use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Result;

use super::{NetworkScope, ObjectHandle, Owner};
use crate::api::{
    ApiEndpoint, NetworkStatus, PrivateNetworkSpec, PublicGatewaySpec, ScalewayCluster,
};
use crate::clients::{CloudClient, Region};
use crate::config::ControllerConfig;
use crate::controller::StatusSink;

/// Scope of one ScalewayCluster reconciliation.
pub struct ClusterScope {
    handle: ObjectHandle<ScalewayCluster>,
    owner: Owner,
    client: Arc<dyn CloudClient>,
    config: Arc<ControllerConfig>,
}

impl ClusterScope {
    pub fn new(
        cluster: ScalewayCluster,
        client: Arc<dyn CloudClient>,
        sink: Arc<dyn StatusSink<ScalewayCluster>>,
        config: Arc<ControllerConfig>,
    ) -> Self {
        Self {
            owner: Owner::of(&cluster, &config),
            handle: ObjectHandle::new(cluster, sink),
            client,
            config,
        }
    }

    pub fn cluster(&self) -> &ScalewayCluster {
        self.handle.get()
    }

    pub fn cluster_mut(&mut self) -> &mut ScalewayCluster {
        self.handle.get_mut()
    }

    pub fn resource_name(&self, suffixes: &[&str]) -> String {
        self.owner.resource_name(suffixes)
    }

    pub fn resource_tags(&self, extra: &[&str]) -> Vec<String> {
        self.owner.resource_tags(extra)
    }

    pub fn set_load_balancer_ips(&mut self, main: Option<IpAddr>, extra: Vec<IpAddr>) {
        let status = self.network_status_mut();
        status.load_balancer_ip = main;
        status.extra_load_balancer_ips = extra;
    }

    pub fn set_control_plane_endpoint(&mut self, host: String, port: u16) {
        self.cluster_mut().spec.control_plane_endpoint = ApiEndpoint { host, port };
    }

    pub fn set_failure_domains(&mut self, zones: Vec<String>) {
        self.cluster_mut().status.failure_domains = zones;
    }

    pub fn set_ready(&mut self, ready: bool) {
        self.cluster_mut().status.ready = ready;
    }

    pub async fn close(&mut self) -> Result<()> {
        self.handle.close().await
    }
}

impl NetworkScope for ClusterScope {
    fn client(&self) -> Arc<dyn CloudClient> {
        self.client.clone()
    }

    fn config(&self) -> &ControllerConfig {
        &self.config
    }

    fn region(&self) -> &Region {
        &self.cluster().spec.region
    }

    fn owner(&self) -> &Owner {
        &self.owner
    }

    fn private_network(&self) -> &PrivateNetworkSpec {
        &self.cluster().spec.network.private_network
    }

    fn public_gateways(&self) -> &[PublicGatewaySpec] {
        &self.cluster().spec.network.public_gateways
    }

    fn network_status(&self) -> Option<&NetworkStatus> {
        self.cluster().status.network.as_ref()
    }

    fn network_status_mut(&mut self) -> &mut NetworkStatus {
        self.cluster_mut()
            .status
            .network
            .get_or_insert_with(NetworkStatus::default)
    }
}
