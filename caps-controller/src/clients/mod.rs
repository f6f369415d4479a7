//! Cloud provider client contract.
//!
//! The provider API is split by product:
//! - vpc: VPCs and private networks
//! - vpcgw: public gateways, their IPs and network attachments
//! - lb: load balancers, backends, frontends and ACLs
//! - domain: DNS records
//! - instance: servers, flexible IPs and private NICs
//! - k8s: managed Kubernetes clusters and pools
//!
//! Reconcilers only see [`CloudClient`], which bundles all of them.

pub mod domain;
pub mod error;
pub mod instance;
pub mod k8s;
pub mod lb;
pub mod vpc;
pub mod vpcgw;
pub mod zone;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

pub use domain::DomainApi;
pub use error::{
    CloudError, cloud_error, is_not_found, is_precondition_failed, is_quota_exceeded,
};
pub use instance::InstanceApi;
pub use k8s::K8sApi;
pub use lb::LoadBalancerApi;
pub use vpc::VpcApi;
pub use vpcgw::GatewayApi;
pub use zone::{Region, Zone, resolve_zone};

/// Authenticated handle to every provider API.
pub trait CloudClient:
    VpcApi + GatewayApi + LoadBalancerApi + DomainApi + InstanceApi + K8sApi
{
}

impl<T> CloudClient for T where
    T: VpcApi + GatewayApi + LoadBalancerApi + DomainApi + InstanceApi + K8sApi
{
}

/// Reference to the credentials an object reconciles with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub namespace: String,
    pub secret_name: String,
    pub project_id: String,
    pub region: Region,
}

/// Builds authenticated clients for an object's credentials.
#[async_trait]
pub trait CloudClientFactory: Send + Sync {
    async fn client(&self, credentials: &Credentials) -> Result<Arc<dyn CloudClient>>;
}

/// Whether `resource_tags` contains every tag of `wanted`.
pub fn has_tags(resource_tags: &[String], wanted: &[String]) -> bool {
    wanted.iter().all(|t| resource_tags.contains(t))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_tags() {
        let tags = vec!["caps".to_string(), "caps-scalewaycluster=a".to_string()];
        assert!(has_tags(&tags, &[]));
        assert!(has_tags(&tags, &["caps".to_string()]));
        assert!(!has_tags(&tags, &["caps".to_string(), "caps-scalewaycluster=b".to_string()]));
    }
}
