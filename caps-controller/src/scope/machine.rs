use std::sync::Arc;

use anyhow::Result;

use super::{ObjectHandle, Owner};
use crate::api::{MachineAddress, OwnerMachine, ScalewayCluster, ScalewayMachine};
use crate::clients::{CloudClient, Region, Zone, resolve_zone};
use crate::config::ControllerConfig;
use crate::controller::StatusSink;
use crate::error::ReconcileError;

/// Provider IDs read `scaleway://instance/<zone>/<server id>`.
pub const PROVIDER_ID_PREFIX: &str = "scaleway://instance/";

/// Scope of one ScalewayMachine reconciliation.
pub struct MachineScope {
    handle: ObjectHandle<ScalewayMachine>,
    owner: Owner,
    cluster_owner: Owner,
    cluster: ScalewayCluster,
    machine: OwnerMachine,
    bootstrap_data: Option<Vec<u8>>,
    client: Arc<dyn CloudClient>,
    config: Arc<ControllerConfig>,
}

impl MachineScope {
    pub fn new(
        scaleway_machine: ScalewayMachine,
        machine: OwnerMachine,
        cluster: ScalewayCluster,
        bootstrap_data: Option<Vec<u8>>,
        client: Arc<dyn CloudClient>,
        sink: Arc<dyn StatusSink<ScalewayMachine>>,
        config: Arc<ControllerConfig>,
    ) -> Self {
        Self {
            owner: Owner::of(&scaleway_machine, &config),
            cluster_owner: Owner::of(&cluster, &config),
            handle: ObjectHandle::new(scaleway_machine, sink),
            cluster,
            machine,
            bootstrap_data,
            client,
            config,
        }
    }

    pub fn scaleway_machine(&self) -> &ScalewayMachine {
        self.handle.get()
    }

    pub fn scaleway_machine_mut(&mut self) -> &mut ScalewayMachine {
        self.handle.get_mut()
    }

    pub fn cluster(&self) -> &ScalewayCluster {
        &self.cluster
    }

    pub fn owner_machine(&self) -> &OwnerMachine {
        &self.machine
    }

    pub fn client(&self) -> Arc<dyn CloudClient> {
        self.client.clone()
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn region(&self) -> &Region {
        &self.cluster.spec.region
    }

    /// Zone of the server: the one recorded in the provider ID, else the
    /// machine's failure domain, else the region default.
    pub fn zone(&self) -> Result<Zone, ReconcileError> {
        let recorded = self
            .provider_id()
            .and_then(|id| id.strip_prefix(PROVIDER_ID_PREFIX))
            .and_then(|rest| rest.split('/').next());
        match recorded {
            Some(zone) => Zone::parse(zone).map_err(|e| ReconcileError::terminal(e)),
            None => resolve_zone(self.region(), self.machine.failure_domain.as_deref()),
        }
    }

    pub fn is_control_plane(&self) -> bool {
        self.machine.control_plane
    }

    /// Server names double as hostnames, so they stay the machine name.
    pub fn server_name(&self) -> &str {
        &self.scaleway_machine().meta.name
    }

    pub fn resource_tags(&self) -> Vec<String> {
        let cluster_tag = self.cluster_owner.owner_tag();
        self.owner.resource_tags(&[&cluster_tag])
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    /// Owner of the cluster-level resources (load balancers, network).
    pub fn cluster_owner(&self) -> &Owner {
        &self.cluster_owner
    }

    pub fn private_network_id(&self) -> Option<&str> {
        self.cluster
            .status
            .network
            .as_ref()
            .and_then(|n| n.private_network_id.as_deref())
    }

    pub fn bootstrap_data(&self) -> Option<&[u8]> {
        self.bootstrap_data.as_deref()
    }

    pub fn provider_id(&self) -> Option<&str> {
        self.scaleway_machine().spec.provider_id.as_deref()
    }

    pub fn set_provider_id(&mut self, zone: &Zone, server_id: &str) {
        self.scaleway_machine_mut().spec.provider_id =
            Some(format!("{}{}/{}", PROVIDER_ID_PREFIX, zone, server_id));
    }

    pub fn set_addresses(&mut self, addresses: Vec<MachineAddress>) {
        self.scaleway_machine_mut().status.addresses = addresses;
    }

    pub fn set_instance_state(&mut self, state: &str) {
        self.scaleway_machine_mut().status.instance_state = Some(state.to_string());
    }

    pub fn set_ready(&mut self, ready: bool) {
        self.scaleway_machine_mut().status.ready = ready;
    }

    pub async fn close(&mut self) -> Result<()> {
        self.handle.close().await
    }
}
