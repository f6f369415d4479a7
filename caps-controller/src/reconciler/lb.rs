//! Control-plane load balancer reconciler.
//!
//! The first load balancer is the main one; its IP (or the DNS name, when
//! configured) becomes the cluster's control-plane endpoint. Extra load
//! balancers get the same backend and frontend.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ipnet::IpNet;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::Reconciler;
use crate::api::DEFAULT_LB_TYPE;
use crate::clients::lb::{
    Acl, AclAction, CreateBackendRequest, CreateFrontendRequest, CreateLoadBalancerRequest,
    LbStatus, LoadBalancer,
};
use crate::clients::{CloudClient, Region, Zone, is_not_found, resolve_zone};
use crate::ensurer::{ResourceAdapter, ResourceEnsurer};
use crate::error::ReconcileError;
use crate::ladder::TypeLadder;
use crate::scope::{ClusterScope, NetworkScope, Owner};

/// Port of the Kubernetes API server.
pub const API_SERVER_PORT: u16 = 6443;

pub struct LoadBalancerReconciler;

/// Name of the API server backend and frontend of an owner's load balancers.
pub fn api_server_backend_name(owner: &Owner) -> String {
    owner.resource_name(&["kube-apiserver"])
}

struct DesiredLoadBalancer {
    zone: Zone,
    lb_type: String,
    ip: Option<IpAddr>,
}

struct LoadBalancerAdapter {
    client: Arc<dyn CloudClient>,
    region: Region,
    owner: Owner,
    ladders: Mutex<HashMap<Zone, TypeLadder>>,
}

impl LoadBalancerAdapter {
    fn new(scope: &ClusterScope) -> Self {
        Self {
            client: scope.client(),
            region: scope.region().clone(),
            owner: scope.owner().clone(),
            ladders: Mutex::new(HashMap::new()),
        }
    }

    async fn ladder(&self, zone: &Zone) -> Result<TypeLadder> {
        if let Some(ladder) = self.ladders.lock().await.get(zone) {
            return Ok(ladder.clone());
        }
        let types = self
            .client
            .list_lb_types(zone)
            .await
            .context("failed to list load balancer types")?;
        let ladder = TypeLadder::new(types);
        self.ladders.lock().await.insert(zone.clone(), ladder.clone());
        Ok(ladder)
    }
}

#[async_trait]
impl ResourceAdapter for LoadBalancerAdapter {
    type Desired = DesiredLoadBalancer;
    type Resource = LoadBalancer;
    type Zone = Zone;

    fn kind(&self) -> &'static str {
        "load balancer"
    }

    async fn list_resources(&self) -> Result<Vec<LoadBalancer>> {
        self.client
            .list_load_balancers(&self.region, &self.owner.resource_tags(&[]))
            .await
    }

    fn resource_id(&self, lb: &LoadBalancer) -> String {
        lb.id.clone()
    }

    fn resource_name(&self, lb: &LoadBalancer) -> String {
        lb.name.clone()
    }

    fn resource_zone(&self, lb: &LoadBalancer) -> Zone {
        lb.zone.clone()
    }

    fn desired_zone(&self, desired: &DesiredLoadBalancer) -> Result<Zone> {
        Ok(desired.zone.clone())
    }

    fn desired_name(&self, index: usize, _desired: &DesiredLoadBalancer) -> String {
        if index == 0 {
            self.owner.resource_name(&[])
        } else {
            self.owner.resource_name(&[&index.to_string()])
        }
    }

    async fn get_resource(&self, _zone: &Zone, _id: &str) -> Result<Option<LoadBalancer>> {
        Ok(None)
    }

    async fn should_keep_resource(
        &self,
        lb: &LoadBalancer,
        desired: &DesiredLoadBalancer,
    ) -> Result<bool> {
        if lb.ips.is_empty() {
            return Ok(false);
        }
        if let Some(wanted) = desired.ip
            && !lb.ips.iter().any(|ip| ip.address == wanted)
        {
            return Ok(false);
        }
        let ladder = self.ladder(&lb.zone).await?;
        Ok(ladder.accepts(&lb.lb_type, &desired.lb_type))
    }

    async fn update_resource(
        &self,
        lb: LoadBalancer,
        desired: &DesiredLoadBalancer,
    ) -> Result<LoadBalancer> {
        let ladder = self.ladder(&lb.zone).await?;
        if !ladder.can_upgrade(&lb.lb_type, &desired.lb_type) {
            return Ok(lb);
        }
        info!(
            load_balancer = %lb.name,
            from = %lb.lb_type,
            to = %desired.lb_type,
            "Migrating load balancer"
        );
        self.client
            .migrate_load_balancer(&lb.zone, &lb.id, &desired.lb_type)
            .await
    }

    async fn create_resource(
        &self,
        zone: &Zone,
        name: &str,
        desired: &DesiredLoadBalancer,
    ) -> Result<LoadBalancer> {
        let (ip_id, allocated) = match desired.ip {
            Some(address) => {
                let ip = self
                    .client
                    .find_lb_ip(zone, address)
                    .await
                    .context("failed to look up load balancer IP")?
                    .ok_or_else(|| {
                        ReconcileError::terminal(format!(
                            "load balancer IP {} does not exist in zone {}",
                            address, zone
                        ))
                    })?;
                (ip.id, false)
            }
            None => {
                let managed = self.owner.managed_ip_tag();
                let ip = self
                    .client
                    .create_lb_ip(zone, &self.owner.resource_tags(&[&managed]))
                    .await
                    .context("failed to create load balancer IP")?;
                (ip.id, true)
            }
        };

        let created = self
            .client
            .create_load_balancer(
                zone,
                CreateLoadBalancerRequest {
                    name: name.to_string(),
                    lb_type: desired.lb_type.clone(),
                    ip_id: Some(ip_id.clone()),
                    tags: self.owner.resource_tags(&[]),
                },
            )
            .await;

        if created.is_err()
            && allocated
            && let Err(e) = self.client.delete_lb_ip(zone, &ip_id).await
        {
            warn!(ip = %ip_id, error = %e, "Failed to release load balancer IP");
        }
        created
    }

    async fn delete_resource(&self, lb: &LoadBalancer) -> Result<()> {
        let managed = self.owner.managed_ip_tag();
        let release_ip = lb.ips.iter().any(|ip| ip.tags.contains(&managed));
        match self
            .client
            .delete_load_balancer(&lb.zone, &lb.id, release_ip)
            .await
        {
            Err(e) if is_not_found(&e) => Ok(()),
            other => other,
        }
    }
}

/// ACLs restricting the API server to `allowed_ranges`. Empty means open.
fn desired_acls(allowed_ranges: &[IpNet]) -> Vec<Acl> {
    if allowed_ranges.is_empty() {
        return Vec::new();
    }
    vec![
        Acl {
            name: "allow-ranges".to_string(),
            action: AclAction::Allow,
            ranges: allowed_ranges.to_vec(),
            index: 0,
        },
        Acl {
            name: "deny-all".to_string(),
            action: AclAction::Deny,
            ranges: Vec::new(),
            index: 1,
        },
    ]
}

/// Configure private network, backend, frontend and ACLs of one load balancer.
async fn configure(
    client: &dyn CloudClient,
    lb: &LoadBalancer,
    owner: &Owner,
    private_network_id: Option<&str>,
    acls: &[Acl],
) -> Result<()> {
    if let Some(pn_id) = private_network_id {
        let attached = client
            .list_lb_private_networks(&lb.zone, &lb.id)
            .await
            .context("failed to list load balancer private networks")?
            .iter()
            .any(|n| n.private_network_id == pn_id);
        if !attached {
            info!(load_balancer = %lb.name, private_network = %pn_id, "Attaching load balancer");
            client
                .attach_lb_private_network(&lb.zone, &lb.id, pn_id)
                .await
                .context("failed to attach load balancer to private network")?;
        }
    }

    let name = api_server_backend_name(owner);
    let backends = client
        .list_backends(&lb.zone, &lb.id)
        .await
        .context("failed to list backends")?;
    let backend = match backends.into_iter().find(|b| b.name == name) {
        Some(backend) => backend,
        None => client
            .create_backend(
                &lb.zone,
                &lb.id,
                CreateBackendRequest {
                    name: name.clone(),
                    port: API_SERVER_PORT,
                    servers: Vec::new(),
                },
            )
            .await
            .context("failed to create backend")?,
    };

    let frontends = client
        .list_frontends(&lb.zone, &lb.id)
        .await
        .context("failed to list frontends")?;
    let frontend = match frontends.into_iter().find(|f| f.name == name) {
        Some(frontend) => frontend,
        None => client
            .create_frontend(
                &lb.zone,
                &lb.id,
                CreateFrontendRequest {
                    name,
                    port: API_SERVER_PORT,
                    backend_id: backend.id.clone(),
                },
            )
            .await
            .context("failed to create frontend")?,
    };

    let mut current = client
        .list_acls(&lb.zone, &frontend.id)
        .await
        .context("failed to list ACLs")?;
    current.sort_by_key(|acl| acl.index);
    if current != acls {
        info!(load_balancer = %lb.name, rules = acls.len(), "Updating ACLs");
        client
            .set_acls(&lb.zone, &frontend.id, acls)
            .await
            .context("failed to set ACLs")?;
    }
    Ok(())
}

fn first_ip(lb: &LoadBalancer) -> Option<IpAddr> {
    lb.ips.first().map(|ip| ip.address)
}

#[async_trait]
impl Reconciler<ClusterScope> for LoadBalancerReconciler {
    fn name(&self) -> &'static str {
        "lb"
    }

    async fn reconcile(&self, scope: &mut ClusterScope) -> Result<()> {
        let network = scope.cluster().spec.network.clone();
        let region = scope.region().clone();

        let main = &network.control_plane_load_balancer;
        let mut desired = vec![DesiredLoadBalancer {
            zone: resolve_zone(&region, main.zone.as_deref())?,
            lb_type: main.lb_type.clone().unwrap_or_else(|| DEFAULT_LB_TYPE.to_string()),
            ip: main.ip,
        }];
        for extra in &network.control_plane_extra_load_balancers {
            desired.push(DesiredLoadBalancer {
                zone: resolve_zone(&region, extra.zone.as_deref())?,
                lb_type: extra.lb_type.clone().unwrap_or_else(|| DEFAULT_LB_TYPE.to_string()),
                ip: extra.ip,
            });
        }

        let lbs = ResourceEnsurer::new(LoadBalancerAdapter::new(scope))
            .ensure(&desired)
            .await?;

        let retry = scope.config().transient_retry();
        if let Some(pending) = lbs.iter().find(|lb| lb.status != LbStatus::Ready) {
            return Err(ReconcileError::transient(
                retry,
                format!("load balancer {} is not ready yet", pending.name),
            )
            .into());
        }

        let client = scope.client();
        let owner = scope.owner().clone();
        let pn_id = scope.private_network_id();
        let acls = desired_acls(&main.allowed_ranges);
        for lb in &lbs {
            configure(client.as_ref(), lb, &owner, pn_id.as_deref(), &acls)
                .await
                .with_context(|| format!("failed to configure load balancer {}", lb.name))?;
        }

        let main_ip = lbs.first().and_then(first_ip);
        let extra_ips = lbs.iter().skip(1).filter_map(first_ip).collect();
        scope.set_load_balancer_ips(main_ip, extra_ips);

        let host = match (&network.control_plane_dns, main_ip) {
            (Some(dns), _) => Some(dns.fqdn()),
            (None, Some(ip)) => Some(ip.to_string()),
            (None, None) => None,
        };
        if let Some(host) = host {
            scope.set_control_plane_endpoint(host, API_SERVER_PORT);
        }
        Ok(())
    }

    async fn delete(&self, scope: &mut ClusterScope) -> Result<()> {
        ResourceEnsurer::new(LoadBalancerAdapter::new(scope))
            .ensure(&[])
            .await?;
        scope.set_load_balancer_ips(None, Vec::new());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ExtraLoadBalancerSpec;
    use crate::clients::LoadBalancerApi;
    use crate::reconciler::vpc::VpcReconciler;
    use crate::test_util::{InMemoryCloud, cluster_scope, fixtures};

    #[tokio::test]
    async fn test_creates_main_lb_and_sets_endpoint() {
        let cloud = InMemoryCloud::new();
        let mut scope = cluster_scope(&cloud, fixtures::cluster("c1"));
        VpcReconciler.reconcile(&mut scope).await.unwrap();

        LoadBalancerReconciler.reconcile(&mut scope).await.unwrap();

        let ip = scope.network_status().unwrap().load_balancer_ip.unwrap();
        let endpoint = &scope.cluster().spec.control_plane_endpoint;
        assert_eq!(endpoint.host, ip.to_string());
        assert_eq!(endpoint.port, 6443);

        let lbs = cloud
            .list_load_balancers(&fixtures::region(), &[])
            .await
            .unwrap();
        assert_eq!(lbs.len(), 1);
        assert_eq!(lbs[0].name, "caps-c1");
        let backends = cloud.list_backends(&lbs[0].zone, &lbs[0].id).await.unwrap();
        assert_eq!(backends[0].port, 6443);
        let networks = cloud
            .list_lb_private_networks(&lbs[0].zone, &lbs[0].id)
            .await
            .unwrap();
        assert_eq!(networks.len(), 1);
        scope.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_dns_name_wins_over_ip() {
        let cloud = InMemoryCloud::new();
        let mut cluster = fixtures::cluster("c1");
        cluster.spec.network.control_plane_dns = Some(crate::api::ControlPlaneDnsSpec {
            domain: "example.com".to_string(),
            name: "api.c1".to_string(),
        });
        let mut scope = cluster_scope(&cloud, cluster);

        LoadBalancerReconciler.reconcile(&mut scope).await.unwrap();

        assert_eq!(scope.cluster().spec.control_plane_endpoint.host, "api.c1.example.com");
        scope.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_allowed_ranges_become_acls() {
        let cloud = InMemoryCloud::new();
        let mut cluster = fixtures::cluster("c1");
        cluster.spec.network.control_plane_load_balancer.allowed_ranges =
            vec!["203.0.113.0/24".parse().unwrap()];
        let mut scope = cluster_scope(&cloud, cluster);

        LoadBalancerReconciler.reconcile(&mut scope).await.unwrap();
        let calls = cloud.mutating_calls();
        LoadBalancerReconciler.reconcile(&mut scope).await.unwrap();
        assert_eq!(cloud.mutating_calls(), calls);

        let lbs = cloud.list_load_balancers(&fixtures::region(), &[]).await.unwrap();
        let frontends = cloud.list_frontends(&lbs[0].zone, &lbs[0].id).await.unwrap();
        let acls = cloud.list_acls(&lbs[0].zone, &frontends[0].id).await.unwrap();
        assert_eq!(acls.len(), 2);
        assert_eq!(acls[0].action, AclAction::Allow);
        assert_eq!(acls[1].action, AclAction::Deny);
        scope.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_extra_load_balancers_and_delete() {
        let cloud = InMemoryCloud::new();
        let mut cluster = fixtures::cluster("c1");
        cluster.spec.network.control_plane_extra_load_balancers = vec![ExtraLoadBalancerSpec {
            zone: Some("fr-par-2".to_string()),
            ..Default::default()
        }];
        let mut scope = cluster_scope(&cloud, cluster);

        LoadBalancerReconciler.reconcile(&mut scope).await.unwrap();
        assert_eq!(scope.network_status().unwrap().extra_load_balancer_ips.len(), 1);

        LoadBalancerReconciler.delete(&mut scope).await.unwrap();

        assert!(
            cloud
                .list_load_balancers(&fixtures::region(), &[])
                .await
                .unwrap()
                .is_empty()
        );
        assert!(cloud.lb_ips().is_empty());
        scope.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_migrates_forward_on_ladder() {
        let cloud = InMemoryCloud::new();
        let mut scope = cluster_scope(&cloud, fixtures::cluster("c1"));
        LoadBalancerReconciler.reconcile(&mut scope).await.unwrap();
        let ip = scope.network_status().unwrap().load_balancer_ip;

        scope.cluster_mut().spec.network.control_plane_load_balancer.lb_type =
            Some("LB-GP-M".to_string());
        LoadBalancerReconciler.reconcile(&mut scope).await.unwrap();

        let lbs = cloud.list_load_balancers(&fixtures::region(), &[]).await.unwrap();
        assert_eq!(lbs.len(), 1);
        assert_eq!(lbs[0].lb_type, "LB-GP-M");
        assert_eq!(scope.network_status().unwrap().load_balancer_ip, ip);
        scope.close().await.unwrap();
    }
}
