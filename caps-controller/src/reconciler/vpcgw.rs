//! Public gateway reconciler.
//!
//! Gateways give machines on the private network outbound access. Each
//! gateway gets a flexible IP: the one the object requests, or one the
//! controller allocates and tags so it can be released on deletion.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::Reconciler;
use crate::clients::vpcgw::{
    CreateGatewayNetworkRequest, CreateGatewayRequest, Gateway, GatewayStatus,
};
use crate::clients::{CloudClient, Region, Zone, is_not_found, resolve_zone};
use crate::ensurer::{ResourceAdapter, ResourceEnsurer};
use crate::error::ReconcileError;
use crate::ladder::TypeLadder;
use crate::scope::{NetworkScope, Owner};

pub struct GatewayReconciler;

struct DesiredGateway {
    zone: Zone,
    gateway_type: String,
    ip: Option<IpAddr>,
}

struct GatewayAdapter {
    client: Arc<dyn CloudClient>,
    region: Region,
    owner: Owner,
    ladders: Mutex<HashMap<Zone, TypeLadder>>,
}

impl GatewayAdapter {
    fn new<S: NetworkScope>(scope: &S) -> Self {
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
            .list_gateway_types(zone)
            .await
            .context("failed to list gateway types")?;
        let ladder = TypeLadder::new(types);
        self.ladders.lock().await.insert(zone.clone(), ladder.clone());
        Ok(ladder)
    }

    fn releases_ip(&self, gateway: &Gateway) -> bool {
        let managed = self.owner.managed_ip_tag();
        gateway
            .ip
            .as_ref()
            .is_some_and(|ip| ip.tags.contains(&managed))
    }
}

#[async_trait]
impl ResourceAdapter for GatewayAdapter {
    type Desired = DesiredGateway;
    type Resource = Gateway;
    type Zone = Zone;

    fn kind(&self) -> &'static str {
        "public gateway"
    }

    async fn list_resources(&self) -> Result<Vec<Gateway>> {
        self.client
            .list_gateways(&self.region, &self.owner.resource_tags(&[]))
            .await
    }

    fn resource_id(&self, gateway: &Gateway) -> String {
        gateway.id.clone()
    }

    fn resource_name(&self, gateway: &Gateway) -> String {
        gateway.name.clone()
    }

    fn resource_zone(&self, gateway: &Gateway) -> Zone {
        gateway.zone.clone()
    }

    fn desired_zone(&self, desired: &DesiredGateway) -> Result<Zone> {
        Ok(desired.zone.clone())
    }

    fn desired_name(&self, index: usize, _desired: &DesiredGateway) -> String {
        self.owner.resource_name(&[&index.to_string()])
    }

    async fn get_resource(&self, zone: &Zone, id: &str) -> Result<Option<Gateway>> {
        self.client.get_gateway(zone, id).await
    }

    async fn should_keep_resource(
        &self,
        gateway: &Gateway,
        desired: &DesiredGateway,
    ) -> Result<bool> {
        // A gateway without an address cannot serve; replace it.
        let Some(ip) = &gateway.ip else {
            return Ok(false);
        };
        if desired.ip.is_some_and(|wanted| wanted != ip.address) {
            return Ok(false);
        }
        let ladder = self.ladder(&gateway.zone).await?;
        Ok(ladder.accepts(&gateway.gateway_type, &desired.gateway_type))
    }

    async fn update_resource(&self, gateway: Gateway, desired: &DesiredGateway) -> Result<Gateway> {
        let ladder = self.ladder(&gateway.zone).await?;
        if !ladder.can_upgrade(&gateway.gateway_type, &desired.gateway_type) {
            return Ok(gateway);
        }
        info!(
            gateway = %gateway.name,
            from = %gateway.gateway_type,
            to = %desired.gateway_type,
            "Upgrading public gateway"
        );
        self.client
            .upgrade_gateway(&gateway.zone, &gateway.id, &desired.gateway_type)
            .await
    }

    async fn create_resource(
        &self,
        zone: &Zone,
        name: &str,
        desired: &DesiredGateway,
    ) -> Result<Gateway> {
        let (ip_id, allocated) = match desired.ip {
            Some(address) => {
                let ip = self
                    .client
                    .find_gateway_ip(zone, address)
                    .await
                    .context("failed to look up gateway IP")?
                    .ok_or_else(|| {
                        ReconcileError::terminal(format!(
                            "gateway IP {} does not exist in zone {}",
                            address, zone
                        ))
                    })?;
                (ip.id, false)
            }
            None => {
                let managed = self.owner.managed_ip_tag();
                let ip = self
                    .client
                    .create_gateway_ip(zone, &self.owner.resource_tags(&[&managed]))
                    .await
                    .context("failed to create gateway IP")?;
                (ip.id, true)
            }
        };

        let created = self
            .client
            .create_gateway(
                zone,
                CreateGatewayRequest {
                    name: name.to_string(),
                    gateway_type: desired.gateway_type.clone(),
                    ip_id: Some(ip_id.clone()),
                    tags: self.owner.resource_tags(&[]),
                },
            )
            .await;

        if created.is_err() && allocated {
            if let Err(e) = self.client.delete_gateway_ip(zone, &ip_id).await {
                warn!(ip = %ip_id, error = %e, "Failed to release gateway IP");
            }
        }
        created
    }

    async fn delete_resource(&self, gateway: &Gateway) -> Result<()> {
        let release_ip = self.releases_ip(gateway);
        match self
            .client
            .delete_gateway(&gateway.zone, &gateway.id, release_ip)
            .await
        {
            Err(e) if is_not_found(&e) => Ok(()),
            other => other,
        }
    }
}

/// Attach `gateway` to the private network unless it already is.
async fn attach(
    client: &dyn CloudClient,
    gateway: &Gateway,
    private_network_id: &str,
    not_ready_retry: Duration,
) -> Result<()> {
    if gateway.status != GatewayStatus::Running {
        return Err(ReconcileError::transient(
            not_ready_retry,
            format!("public gateway {} is not running yet", gateway.name),
        )
        .into());
    }

    let attached = client
        .list_gateway_networks(&gateway.zone, &gateway.id)
        .await
        .context("failed to list gateway networks")?
        .iter()
        .any(|gn| gn.private_network_id == private_network_id);
    if attached {
        return Ok(());
    }

    info!(
        gateway = %gateway.name,
        private_network = %private_network_id,
        "Attaching public gateway"
    );
    client
        .create_gateway_network(
            &gateway.zone,
            CreateGatewayNetworkRequest {
                gateway_id: gateway.id.clone(),
                private_network_id: private_network_id.to_string(),
                enable_masquerade: true,
                push_default_route: true,
            },
        )
        .await
        .context("failed to attach public gateway")?;
    Ok(())
}

#[async_trait]
impl<S: NetworkScope> Reconciler<S> for GatewayReconciler {
    fn name(&self) -> &'static str {
        "vpcgw"
    }

    async fn reconcile(&self, scope: &mut S) -> Result<()> {
        // Gateways only make sense on a private network.
        let desired = if scope.has_private_network() {
            scope
                .public_gateways()
                .iter()
                .map(|spec| {
                    Ok(DesiredGateway {
                        zone: resolve_zone(scope.region(), spec.zone.as_deref())?,
                        gateway_type: spec.gateway_type().to_string(),
                        ip: spec.ip,
                    })
                })
                .collect::<Result<Vec<_>, ReconcileError>>()?
        } else {
            Vec::new()
        };

        let gateways = ResourceEnsurer::new(GatewayAdapter::new(&*scope))
            .ensure(&desired)
            .await?;

        if let Some(pn_id) = scope.private_network_id() {
            let client = scope.client();
            let retry = scope.config().gateway_not_ready();
            for gateway in &gateways {
                attach(client.as_ref(), gateway, &pn_id, retry).await?;
            }
        }

        scope.set_public_gateway_ids(gateways.into_iter().map(|g| g.id).collect());
        Ok(())
    }

    async fn delete(&self, scope: &mut S) -> Result<()> {
        ResourceEnsurer::new(GatewayAdapter::new(&*scope))
            .ensure(&[])
            .await?;
        scope.set_public_gateway_ids(Vec::new());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::PublicGatewaySpec;
    use crate::clients::GatewayApi;
    use crate::error::{Outcome, classify};
    use crate::test_util::{InMemoryCloud, cluster_scope, fixtures};

    fn gateway_spec(ip: Option<&str>) -> PublicGatewaySpec {
        PublicGatewaySpec {
            gateway_type: None,
            ip: ip.map(|s| s.parse().unwrap()),
            zone: Some("fr-par-1".to_string()),
        }
    }

    #[tokio::test]
    async fn test_grow_to_four_gateways_with_explicit_ip() {
        let cloud = InMemoryCloud::new();
        let mut cluster = fixtures::cluster("c1");
        cluster.spec.network.public_gateways = vec![gateway_spec(None), gateway_spec(None)];
        let mut scope = cluster_scope(&cloud, cluster);
        super::super::vpc::VpcReconciler.reconcile(&mut scope).await.unwrap();
        GatewayReconciler.reconcile(&mut scope).await.unwrap();
        let existing = scope.network_status().unwrap().public_gateway_ids.clone();
        let explicit = cloud.seed_gateway_ip(&fixtures::zone(), "42.42.42.42");

        scope.cluster_mut().spec.network.public_gateways = vec![
            gateway_spec(None),
            gateway_spec(None),
            gateway_spec(Some("42.42.42.42")),
            gateway_spec(None),
        ];
        GatewayReconciler.reconcile(&mut scope).await.unwrap();

        let ids = scope.network_status().unwrap().public_gateway_ids.clone();
        assert_eq!(ids.len(), 4);
        assert_eq!(ids[..2], existing[..]);

        let third = cloud.get_gateway(&fixtures::zone(), &ids[2]).await.unwrap().unwrap();
        assert_eq!(third.ip.as_ref().unwrap().id, explicit.id);
        let fourth = cloud.get_gateway(&fixtures::zone(), &ids[3]).await.unwrap().unwrap();
        assert!(fourth.ip.as_ref().unwrap().tags.contains(&"caps-managed-ip".to_string()));

        let pn_id = scope.private_network_id().unwrap();
        for id in &ids[2..] {
            let networks = cloud.list_gateway_networks(&fixtures::zone(), id).await.unwrap();
            assert_eq!(networks.len(), 1);
            assert_eq!(networks[0].private_network_id, pn_id);
        }
        scope.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_releases_only_managed_ips() {
        let cloud = InMemoryCloud::new();
        let explicit = cloud.seed_gateway_ip(&fixtures::zone(), "42.42.42.42");
        let mut cluster = fixtures::cluster("c1");
        cluster.spec.network.public_gateways =
            vec![gateway_spec(Some("42.42.42.42")), gateway_spec(None)];
        let mut scope = cluster_scope(&cloud, cluster);
        super::super::vpc::VpcReconciler.reconcile(&mut scope).await.unwrap();
        GatewayReconciler.reconcile(&mut scope).await.unwrap();
        assert_eq!(cloud.gateway_ips(&fixtures::zone()).len(), 2);

        GatewayReconciler.delete(&mut scope).await.unwrap();

        assert!(scope.network_status().unwrap().public_gateway_ids.is_empty());
        let remaining = cloud.gateway_ips(&fixtures::zone());
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, explicit.id);
        scope.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_explicit_ip_is_terminal() {
        let cloud = InMemoryCloud::new();
        let mut cluster = fixtures::cluster("c1");
        cluster.spec.network.public_gateways = vec![gateway_spec(Some("42.42.42.42"))];
        let mut scope = cluster_scope(&cloud, cluster);

        let err = GatewayReconciler.reconcile(&mut scope).await.unwrap_err();

        assert!(matches!(classify(&err), Outcome::Terminal(m) if m.contains("42.42.42.42")));
        scope.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_gateway_not_running_is_transient() {
        let cloud = InMemoryCloud::new();
        cloud.set_new_gateway_status(GatewayStatus::Allocating);
        let mut cluster = fixtures::cluster("c1");
        cluster.spec.network.public_gateways = vec![gateway_spec(None)];
        let mut scope = cluster_scope(&cloud, cluster);
        super::super::vpc::VpcReconciler.reconcile(&mut scope).await.unwrap();

        let err = GatewayReconciler.reconcile(&mut scope).await.unwrap_err();

        assert_eq!(classify(&err), Outcome::Transient(Duration::from_secs(3)));
        scope.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_type_upgrade_is_in_place() {
        let cloud = InMemoryCloud::new();
        let mut cluster = fixtures::cluster("c1");
        cluster.spec.network.public_gateways = vec![gateway_spec(None)];
        let mut scope = cluster_scope(&cloud, cluster);
        super::super::vpc::VpcReconciler.reconcile(&mut scope).await.unwrap();
        GatewayReconciler.reconcile(&mut scope).await.unwrap();
        let before = scope.network_status().unwrap().public_gateway_ids.clone();

        scope.cluster_mut().spec.network.public_gateways[0].gateway_type =
            Some("VPC-GW-M".to_string());
        GatewayReconciler.reconcile(&mut scope).await.unwrap();

        let after = scope.network_status().unwrap().public_gateway_ids.clone();
        assert_eq!(before, after);
        let gateway = cloud.get_gateway(&fixtures::zone(), &after[0]).await.unwrap().unwrap();
        assert_eq!(gateway.gateway_type, "VPC-GW-M");
        scope.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_gateway_without_address_is_recreated() {
        let cloud = InMemoryCloud::new();
        let mut cluster = fixtures::cluster("c1");
        cluster.spec.network.public_gateways = vec![gateway_spec(None)];
        let mut scope = cluster_scope(&cloud, cluster);
        super::super::vpc::VpcReconciler.reconcile(&mut scope).await.unwrap();
        GatewayReconciler.reconcile(&mut scope).await.unwrap();
        let old = scope.network_status().unwrap().public_gateway_ids[0].clone();
        cloud.strip_gateway_ip(&old);

        GatewayReconciler.reconcile(&mut scope).await.unwrap();

        let new = scope.network_status().unwrap().public_gateway_ids[0].clone();
        assert_ne!(old, new);
        assert!(cloud.get_gateway(&fixtures::zone(), &old).await.unwrap().is_none());
        scope.close().await.unwrap();
    }
}
