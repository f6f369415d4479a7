//! Per-invocation reconciliation scopes.
//!
//! A scope bundles the object being reconciled, the cloud client it
//! reconciles with and the naming and tagging of its provider resources.
//! Sub-reconcilers only ever see a scope. The object's status is written
//! back by [`close`](ObjectHandle::close), which controllers call on every
//! exit path.

pub mod cluster;
pub mod machine;
pub mod managed;
pub mod naming;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::warn;

use crate::api::{NetworkStatus, Object, PrivateNetworkSpec, PublicGatewaySpec};
use crate::clients::{CloudClient, Region};
use crate::config::ControllerConfig;
use crate::controller::StatusSink;

pub use cluster::ClusterScope;
pub use machine::MachineScope;
pub use managed::{ManagedClusterScope, ManagedControlPlaneScope, ManagedMachinePoolScope};

/// Object under reconciliation plus the sink its status is persisted to.
pub struct ObjectHandle<T: Object> {
    object: T,
    sink: Arc<dyn StatusSink<T>>,
    closed: bool,
}

impl<T: Object> ObjectHandle<T> {
    pub fn new(object: T, sink: Arc<dyn StatusSink<T>>) -> Self {
        Self {
            object,
            sink,
            closed: false,
        }
    }

    pub fn get(&self) -> &T {
        &self.object
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.object
    }

    /// Persist status and finalizers.
    pub async fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.sink.persist(&self.object).await.with_context(|| {
            format!(
                "failed to persist {} {}/{}",
                T::KIND,
                self.object.meta().namespace,
                self.object.meta().name
            )
        })
    }
}

impl<T: Object> Drop for ObjectHandle<T> {
    fn drop(&mut self) {
        if !self.closed {
            warn!(
                kind = T::KIND,
                namespace = %self.object.meta().namespace,
                name = %self.object.meta().name,
                "Scope dropped without persisting status"
            );
        }
    }
}

/// Name and tag helpers bound to one owner.
#[derive(Debug, Clone)]
pub struct Owner {
    prefix: String,
    namespace: String,
    kind: &'static str,
    name: String,
}

impl Owner {
    pub fn of<T: Object>(object: &T, config: &ControllerConfig) -> Self {
        Self {
            prefix: config.tag_prefix.clone(),
            namespace: object.meta().namespace.clone(),
            kind: T::KIND,
            name: object.meta().name.clone(),
        }
    }

    pub fn resource_name(&self, suffixes: &[&str]) -> String {
        naming::resource_name(&self.prefix, &self.name, suffixes)
    }

    pub fn resource_tags(&self, extra: &[&str]) -> Vec<String> {
        naming::resource_tags(&self.prefix, &self.namespace, self.kind, &self.name, extra)
    }

    pub fn owner_tag(&self) -> String {
        naming::owner_tag(&self.prefix, self.kind, &self.name)
    }

    /// Marker of owned resources that carry no tags.
    pub fn record_owner(&self) -> String {
        naming::record_owner(&self.prefix, &self.namespace, self.kind, &self.name)
    }

    /// Tag marking a flexible IP the controller allocated itself. Only
    /// those IPs are released on deletion.
    pub fn managed_ip_tag(&self) -> String {
        format!("{}-managed-ip", self.prefix)
    }
}

/// Scope of an object owning a private network and public gateways.
pub trait NetworkScope: Send + Sync {
    fn client(&self) -> Arc<dyn CloudClient>;

    fn config(&self) -> &ControllerConfig;

    fn region(&self) -> &Region;

    fn owner(&self) -> &Owner;

    fn private_network(&self) -> &PrivateNetworkSpec;

    fn public_gateways(&self) -> &[PublicGatewaySpec];

    fn network_status(&self) -> Option<&NetworkStatus>;

    fn network_status_mut(&mut self) -> &mut NetworkStatus;

    fn has_private_network(&self) -> bool {
        self.private_network().enabled
    }

    fn private_network_id(&self) -> Option<String> {
        self.network_status()
            .and_then(|s| s.private_network_id.clone())
    }

    fn set_vpc_status(&mut self, private_network_id: Option<String>, vpc_id: Option<String>) {
        let status = self.network_status_mut();
        status.private_network_id = private_network_id;
        status.vpc_id = vpc_id;
    }

    fn set_public_gateway_ids(&mut self, ids: Vec<String>) {
        self.network_status_mut().public_gateway_ids = ids;
    }
}
