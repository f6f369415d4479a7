//! Registers control-plane machines in the cluster's API server backends.

use std::net::IpAddr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use super::Reconciler;
use super::lb::api_server_backend_name;
use crate::api::AddressType;
use crate::clients::lb::{Backend, LoadBalancer};
use crate::error::ReconcileError;
use crate::scope::MachineScope;

pub struct LoadBalancerBackendReconciler;

/// Address the load balancers reach the machine on.
fn machine_ip(scope: &MachineScope) -> Option<IpAddr> {
    let wanted = if scope.cluster().spec.network.private_network.enabled {
        AddressType::InternalIP
    } else {
        AddressType::ExternalIP
    };
    scope
        .scaleway_machine()
        .status
        .addresses
        .iter()
        .filter(|a| a.address_type == wanted)
        .find_map(|a| a.address.parse().ok())
}

/// API server backend of every cluster load balancer, `None` where the
/// load balancer has none yet.
async fn backends(scope: &MachineScope) -> Result<Vec<(LoadBalancer, Option<Backend>)>> {
    let client = scope.client();
    let owner = scope.cluster_owner();
    let name = api_server_backend_name(owner);
    let lbs = client
        .list_load_balancers(scope.region(), &owner.resource_tags(&[]))
        .await
        .context("failed to list load balancers")?;

    let mut backends = Vec::with_capacity(lbs.len());
    for lb in lbs {
        let backend = client
            .list_backends(&lb.zone, &lb.id)
            .await
            .context("failed to list backends")?
            .into_iter()
            .find(|b| b.name == name);
        backends.push((lb, backend));
    }
    Ok(backends)
}

#[async_trait]
impl Reconciler<MachineScope> for LoadBalancerBackendReconciler {
    fn name(&self) -> &'static str {
        "lb-backend"
    }

    async fn reconcile(&self, scope: &mut MachineScope) -> Result<()> {
        if !scope.is_control_plane() {
            return Ok(());
        }
        let ip = machine_ip(scope).ok_or_else(|| {
            ReconcileError::transient(
                scope.config().transient_retry(),
                "machine has no address for the load balancer yet",
            )
        })?;

        let client = scope.client();
        for (lb, backend) in backends(scope).await? {
            let backend = backend.ok_or_else(|| {
                ReconcileError::transient(
                    scope.config().dependency_wait(),
                    format!("load balancer {} has no API server backend yet", lb.name),
                )
            })?;
            if backend.servers.contains(&ip) {
                continue;
            }
            info!(
                backend = %backend.name,
                lb = %backend.lb_id,
                ip = %ip,
                "Adding server to backend"
            );
            let mut servers = backend.servers.clone();
            servers.push(ip);
            client
                .set_backend_servers(&lb.zone, &backend.id, &servers)
                .await
                .context("failed to update backend servers")?;
        }
        Ok(())
    }

    async fn delete(&self, scope: &mut MachineScope) -> Result<()> {
        if !scope.is_control_plane() {
            return Ok(());
        }
        let Some(ip) = machine_ip(scope) else {
            return Ok(());
        };

        let client = scope.client();
        for (lb, backend) in backends(scope).await? {
            let Some(backend) = backend.filter(|b| b.servers.contains(&ip)) else {
                continue;
            };
            info!(
                backend = %backend.name,
                lb = %backend.lb_id,
                ip = %ip,
                "Removing server from backend"
            );
            let servers: Vec<IpAddr> = backend
                .servers
                .iter()
                .copied()
                .filter(|s| *s != ip)
                .collect();
            client
                .set_backend_servers(&lb.zone, &backend.id, &servers)
                .await
                .context("failed to update backend servers")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MachineAddress;
    use crate::clients::LoadBalancerApi;
    use crate::clients::lb::CreateLoadBalancerRequest;
    use crate::error::{Outcome, classify};
    use crate::test_util::{InMemoryCloud, fixtures, machine_scope};

    fn with_internal_ip(scope: &mut MachineScope, ip: &str) {
        scope.set_addresses(vec![MachineAddress {
            address_type: AddressType::InternalIP,
            address: ip.to_string(),
        }]);
    }

    async fn backend_servers(cloud: &InMemoryCloud) -> Vec<IpAddr> {
        let lbs = cloud
            .list_load_balancers(&fixtures::region(), &[])
            .await
            .unwrap();
        let backends = cloud.list_backends(&lbs[0].zone, &lbs[0].id).await.unwrap();
        backends[0].servers.clone()
    }

    #[tokio::test]
    async fn test_control_plane_machine_is_added_once() {
        let cloud = InMemoryCloud::new();
        let cluster = fixtures::ready_cluster(&cloud, "c1").await;
        let mut scope = machine_scope(&cloud, fixtures::machine("m1"), cluster, true);
        with_internal_ip(&mut scope, "10.0.0.5");

        LoadBalancerBackendReconciler.reconcile(&mut scope).await.unwrap();
        let calls = cloud.mutating_calls();
        LoadBalancerBackendReconciler.reconcile(&mut scope).await.unwrap();

        assert_eq!(cloud.mutating_calls(), calls);
        assert_eq!(backend_servers(&cloud).await, vec!["10.0.0.5".parse::<IpAddr>().unwrap()]);

        LoadBalancerBackendReconciler.delete(&mut scope).await.unwrap();
        assert!(backend_servers(&cloud).await.is_empty());
        scope.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_skips_load_balancer_without_backend() {
        let cloud = InMemoryCloud::new();
        let cluster = fixtures::ready_cluster(&cloud, "c1").await;
        let mut scope = machine_scope(&cloud, fixtures::machine("m1"), cluster, true);
        with_internal_ip(&mut scope, "10.0.0.5");
        LoadBalancerBackendReconciler.reconcile(&mut scope).await.unwrap();

        let tags = scope.cluster_owner().resource_tags(&[]);
        cloud
            .create_load_balancer(
                &fixtures::zone(),
                CreateLoadBalancerRequest {
                    name: scope.cluster_owner().resource_name(&["1"]),
                    lb_type: "LB-S".to_string(),
                    ip_id: None,
                    tags,
                },
            )
            .await
            .unwrap();

        let err = LoadBalancerBackendReconciler
            .reconcile(&mut scope)
            .await
            .unwrap_err();
        assert!(matches!(classify(&err), Outcome::Transient(_)));

        LoadBalancerBackendReconciler.delete(&mut scope).await.unwrap();
        assert!(backend_servers(&cloud).await.is_empty());
        scope.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_machine_is_skipped() {
        let cloud = InMemoryCloud::new();
        let cluster = fixtures::ready_cluster(&cloud, "c1").await;
        let mut scope = machine_scope(&cloud, fixtures::machine("w1"), cluster, false);
        with_internal_ip(&mut scope, "10.0.0.6");
        let calls = cloud.mutating_calls();

        LoadBalancerBackendReconciler.reconcile(&mut scope).await.unwrap();

        assert_eq!(cloud.mutating_calls(), calls);
        scope.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_address_is_transient() {
        let cloud = InMemoryCloud::new();
        let cluster = fixtures::ready_cluster(&cloud, "c1").await;
        let mut scope = machine_scope(&cloud, fixtures::machine("m1"), cluster, true);

        let err = LoadBalancerBackendReconciler
            .reconcile(&mut scope)
            .await
            .unwrap_err();

        assert!(matches!(classify(&err), Outcome::Transient(_)));
        scope.close().await.unwrap();
    }
}
