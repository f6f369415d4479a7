//! Server reconciler of a ScalewayMachine.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use super::Reconciler;
use crate::api::{AddressType, MachineAddress};
use crate::clients::instance::{
    CreateServerRequest, IpFamily, RootVolume, Server, ServerAction, ServerState,
};
use crate::clients::{CloudClient, Zone, has_tags, is_not_found, is_quota_exceeded};
use crate::error::ReconcileError;
use crate::scope::MachineScope;

/// User data key read by cloud-init.
pub const CLOUD_INIT_KEY: &str = "cloud-init";

pub struct InstanceReconciler;

async fn find_server(scope: &MachineScope, zone: &Zone) -> Result<Option<Server>> {
    let servers = scope
        .client()
        .list_servers(zone, &scope.resource_tags())
        .await
        .context("failed to list servers")?;
    Ok(servers.into_iter().find(|s| s.name == scope.server_name()))
}

async fn resolve_image(
    client: &dyn CloudClient,
    scope: &MachineScope,
    zone: &Zone,
) -> Result<String> {
    let image = &scope.scaleway_machine().spec.image;
    if let Some(id) = &image.id {
        let found = client
            .get_image(zone, id)
            .await
            .context("failed to get image")?;
        return match found {
            Some(image) => Ok(image.id),
            None => Err(ReconcileError::terminal(format!(
                "image {} not found in zone {}",
                id, zone
            ))
            .into()),
        };
    }
    if let Some(name) = &image.name {
        let found = client
            .find_images(zone, name)
            .await
            .context("failed to find image")?;
        return match found.into_iter().next() {
            Some(image) => Ok(image.id),
            None => Err(ReconcileError::terminal(format!(
                "no image named {:?} in zone {}",
                name, zone
            ))
            .into()),
        };
    }
    Err(ReconcileError::terminal("image id or name must be set").into())
}

/// Flexible IP of `family` for the server, reusing an unattached owned one.
async fn ensure_public_ip(scope: &MachineScope, zone: &Zone, family: IpFamily) -> Result<String> {
    let client = scope.client();
    let tags = scope.resource_tags();
    let existing = client
        .list_ips(zone, &tags)
        .await
        .context("failed to list flexible IPs")?
        .into_iter()
        .find(|ip| ip.family == family && ip.server_id.is_none());
    if let Some(ip) = existing {
        return Ok(ip.id);
    }

    let managed = scope.owner().managed_ip_tag();
    let mut ip_tags = tags;
    ip_tags.push(managed);
    let ip = client
        .create_ip(zone, family, &ip_tags)
        .await
        .context("failed to create flexible IP")?;
    Ok(ip.id)
}

async fn create_server(scope: &MachineScope, zone: &Zone) -> Result<Server> {
    let client = scope.client();
    let spec = &scope.scaleway_machine().spec;
    let image_id = resolve_image(client.as_ref(), scope, zone).await?;

    let mut public_ip_ids = Vec::new();
    if let Some(public) = &spec.public_network {
        if public.enable_ipv4 {
            public_ip_ids.push(ensure_public_ip(scope, zone, IpFamily::V4).await?);
        }
        if public.enable_ipv6 {
            public_ip_ids.push(ensure_public_ip(scope, zone, IpFamily::V6).await?);
        }
    }

    info!(server = %scope.server_name(), zone = %zone, "Creating server");
    let created = client
        .create_server(
            zone,
            CreateServerRequest {
                name: scope.server_name().to_string(),
                commercial_type: spec.commercial_type.clone(),
                image_id,
                root_volume: spec.root_volume.as_ref().map(|v| RootVolume {
                    size_gb: v.size_gb,
                    volume_type: v.volume_type.clone(),
                }),
                public_ip_ids,
                security_group_id: spec.security_group_id.clone(),
                placement_group_id: spec.placement_group_id.clone(),
                tags: scope.resource_tags(),
            },
        )
        .await;
    match created {
        Err(e) if is_quota_exceeded(&e) => {
            Err(ReconcileError::terminal("server quota exceeded").with_source(e).into())
        }
        other => other.context("failed to create server"),
    }
}

async fn addresses(scope: &MachineScope, server: &Server) -> Result<Vec<MachineAddress>> {
    let mut addresses = vec![MachineAddress {
        address_type: AddressType::Hostname,
        address: server.name.clone(),
    }];

    if let Some(pn_id) = scope.private_network_id() {
        for nic in server.private_nics.iter().filter(|n| n.private_network_id == pn_id) {
            let ips = scope
                .client()
                .private_nic_ips(scope.region(), &nic.id)
                .await
                .context("failed to get private NIC IPs")?;
            addresses.extend(ips.into_iter().map(|ip| MachineAddress {
                address_type: AddressType::InternalIP,
                address: ip.to_string(),
            }));
        }
    }

    addresses.extend(server.public_ips.iter().map(|ip| MachineAddress {
        address_type: AddressType::ExternalIP,
        address: ip.address.to_string(),
    }));
    Ok(addresses)
}

/// Delete flexible IPs the controller allocated for this machine.
async fn release_managed_ips(scope: &MachineScope, zone: &Zone) -> Result<()> {
    let client = scope.client();
    let managed = vec![scope.owner().managed_ip_tag()];
    let ips = client
        .list_ips(zone, &scope.resource_tags())
        .await
        .context("failed to list flexible IPs")?;
    for ip in ips.iter().filter(|ip| has_tags(&ip.tags, &managed)) {
        info!(ip = %ip.address, "Releasing flexible IP");
        match client.delete_ip(zone, &ip.id).await {
            Err(e) if !is_not_found(&e) => return Err(e.context("failed to delete flexible IP")),
            _ => {}
        }
    }
    Ok(())
}

#[async_trait]
impl Reconciler<MachineScope> for InstanceReconciler {
    fn name(&self) -> &'static str {
        "instance"
    }

    async fn reconcile(&self, scope: &mut MachineScope) -> Result<()> {
        let zone = scope.zone()?;
        let client = scope.client();
        let transition = scope.config().server_transition();

        let mut server = match find_server(scope, &zone).await? {
            Some(server) => server,
            None => create_server(scope, &zone).await?,
        };
        scope.set_provider_id(&zone, &server.id);
        scope.set_instance_state(server.state.as_str());

        if let Some(pn_id) = scope.private_network_id().map(str::to_string)
            && !server.private_nics.iter().any(|n| n.private_network_id == pn_id)
        {
            info!(server = %server.name, private_network = %pn_id, "Attaching private NIC");
            let nic = client
                .create_private_nic(&zone, &server.id, &pn_id)
                .await
                .context("failed to create private NIC")?;
            server.private_nics.push(nic);
        }

        match server.state {
            ServerState::Running => {}
            ServerState::Stopped | ServerState::StoppedInPlace => {
                let data = scope.bootstrap_data().ok_or_else(|| {
                    ReconcileError::transient(transition, "bootstrap data is not available yet")
                })?;
                client
                    .set_user_data(&zone, &server.id, CLOUD_INIT_KEY, data)
                    .await
                    .context("failed to set cloud-init user data")?;
                info!(server = %server.name, "Powering on server");
                client
                    .server_action(&zone, &server.id, ServerAction::PowerOn)
                    .await
                    .context("failed to power on server")?;
                scope.set_instance_state(ServerState::Starting.as_str());
                return Err(ReconcileError::transient(
                    transition,
                    format!("server {} is starting", server.name),
                )
                .into());
            }
            ServerState::Locked => {
                return Err(ReconcileError::terminal(format!(
                    "server {} is locked by the provider",
                    server.name
                ))
                .into());
            }
            state => {
                return Err(ReconcileError::transient(
                    transition,
                    format!("server {} is {}", server.name, state.as_str()),
                )
                .into());
            }
        }

        let addresses = addresses(scope, &server).await?;
        scope.set_addresses(addresses);
        Ok(())
    }

    async fn delete(&self, scope: &mut MachineScope) -> Result<()> {
        let zone = scope.zone()?;
        let client = scope.client();
        let transition = scope.config().server_transition();

        let Some(server) = find_server(scope, &zone).await? else {
            return release_managed_ips(scope, &zone).await;
        };
        scope.set_instance_state(server.state.as_str());

        match server.state {
            ServerState::Running | ServerState::Starting => {
                info!(server = %server.name, "Powering off server");
                client
                    .server_action(&zone, &server.id, ServerAction::PowerOff)
                    .await
                    .context("failed to power off server")?;
                return Err(ReconcileError::transient(
                    transition,
                    format!("server {} is stopping", server.name),
                )
                .into());
            }
            ServerState::Stopped | ServerState::StoppedInPlace => {}
            state => {
                return Err(ReconcileError::transient(
                    transition,
                    format!("server {} is {}", server.name, state.as_str()),
                )
                .into());
            }
        }

        info!(server = %server.name, "Deleting server");
        match client.delete_server(&zone, &server.id).await {
            Err(e) if !is_not_found(&e) => return Err(e.context("failed to delete server")),
            _ => {}
        }
        release_managed_ips(scope, &zone).await?;

        if let Some(volume_id) = &server.root_volume_id {
            match client.delete_volume(&zone, volume_id).await {
                Err(e) if is_not_found(&e) => {}
                Err(e) => warn!(volume = %volume_id, error = %e, "Failed to delete root volume"),
                Ok(()) => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::PublicNetworkSpec;
    use crate::clients::InstanceApi;
    use crate::error::{Outcome, classify};
    use crate::test_util::{InMemoryCloud, fixtures, machine_scope};
    use std::time::Duration;

    async fn converge(scope: &mut MachineScope) {
        for _ in 0..3 {
            match InstanceReconciler.reconcile(scope).await {
                Ok(()) => return,
                Err(e) => assert!(matches!(classify(&e), Outcome::Transient(_)), "{:#}", e),
            }
        }
        panic!("server did not converge");
    }

    #[tokio::test]
    async fn test_creates_and_starts_server() {
        let cloud = InMemoryCloud::new();
        let cluster = fixtures::ready_cluster(&cloud, "c1").await;
        let mut scope = machine_scope(&cloud, fixtures::machine("m1"), cluster, true);

        let err = InstanceReconciler.reconcile(&mut scope).await.unwrap_err();
        assert_eq!(classify(&err), Outcome::Transient(Duration::from_secs(5)));
        InstanceReconciler.reconcile(&mut scope).await.unwrap();

        let provider_id = scope.provider_id().unwrap().to_string();
        assert!(provider_id.starts_with("scaleway://instance/fr-par-1/"));
        let status = &scope.scaleway_machine().status;
        assert_eq!(status.instance_state.as_deref(), Some("running"));
        assert!(
            status
                .addresses
                .iter()
                .any(|a| a.address_type == AddressType::InternalIP)
        );
        let server_id = provider_id.rsplit('/').next().unwrap();
        assert_eq!(
            cloud.user_data(server_id, CLOUD_INIT_KEY).as_deref(),
            Some(&b"#cloud-config"[..])
        );
        scope.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_public_ips_and_delete_releases_them() {
        let cloud = InMemoryCloud::new();
        let cluster = fixtures::ready_cluster(&cloud, "c1").await;
        let mut machine = fixtures::machine("m1");
        machine.spec.public_network = Some(PublicNetworkSpec {
            enable_ipv4: true,
            enable_ipv6: true,
        });
        let mut scope = machine_scope(&cloud, machine, cluster, true);
        converge(&mut scope).await;

        let external = scope
            .scaleway_machine()
            .status
            .addresses
            .iter()
            .filter(|a| a.address_type == AddressType::ExternalIP)
            .count();
        assert_eq!(external, 2);

        let err = InstanceReconciler.delete(&mut scope).await.unwrap_err();
        assert!(matches!(classify(&err), Outcome::Transient(_)));
        InstanceReconciler.delete(&mut scope).await.unwrap();

        let zone = fixtures::zone();
        assert!(cloud.list_servers(&zone, &[]).await.unwrap().is_empty());
        assert!(cloud.list_ips(&zone, &[]).await.unwrap().is_empty());
        assert_eq!(cloud.volume_count(), 0);
        scope.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_image_is_terminal() {
        let cloud = InMemoryCloud::new();
        let cluster = fixtures::ready_cluster(&cloud, "c1").await;
        let mut machine = fixtures::machine("m1");
        machine.spec.image.name = Some("does-not-exist".to_string());
        let mut scope = machine_scope(&cloud, machine, cluster, true);

        let err = InstanceReconciler.reconcile(&mut scope).await.unwrap_err();

        assert!(matches!(classify(&err), Outcome::Terminal(_)));
        scope.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_quota_exceeded_is_terminal() {
        let cloud = InMemoryCloud::new();
        let cluster = fixtures::ready_cluster(&cloud, "c1").await;
        cloud.set_server_quota(0);
        let mut scope = machine_scope(&cloud, fixtures::machine("m1"), cluster, true);

        let err = InstanceReconciler.reconcile(&mut scope).await.unwrap_err();

        match classify(&err) {
            Outcome::Terminal(reason) => assert!(reason.contains("quota")),
            other => panic!("expected terminal, got {:?}", other),
        }
        assert!(cloud.list_servers(&fixtures::zone(), &[]).await.unwrap().is_empty());
        scope.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_existing_server_is_adopted() {
        let cloud = InMemoryCloud::new();
        let cluster = fixtures::ready_cluster(&cloud, "c1").await;
        let mut scope = machine_scope(&cloud, fixtures::machine("m1"), cluster.clone(), true);
        converge(&mut scope).await;
        let provider_id = scope.provider_id().map(str::to_string);
        scope.close().await.unwrap();

        let mut again = machine_scope(&cloud, fixtures::machine("m1"), cluster, true);
        let calls = cloud.mutating_calls();
        InstanceReconciler.reconcile(&mut again).await.unwrap();

        assert_eq!(cloud.mutating_calls(), calls);
        assert_eq!(again.provider_id().map(str::to_string), provider_id);
        again.close().await.unwrap();
    }
}
