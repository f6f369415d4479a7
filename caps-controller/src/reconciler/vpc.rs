//! Private network reconciler.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net};
use tracing::info;

use super::Reconciler;
use crate::clients::vpc::{CreatePrivateNetworkRequest, PrivateNetwork};
use crate::clients::{CloudClient, Region, is_not_found, is_precondition_failed};
use crate::ensurer::{ResourceAdapter, ResourceEnsurer};
use crate::error::ReconcileError;
use crate::scope::{NetworkScope, Owner};

pub struct VpcReconciler;

struct DesiredNetwork {
    id: Option<String>,
    vpc_id: Option<String>,
    subnet: Option<Ipv4Net>,
}

struct PrivateNetworkAdapter {
    client: Arc<dyn CloudClient>,
    region: Region,
    owner: Owner,
    in_use_retry: Duration,
}

impl PrivateNetworkAdapter {
    fn new<S: NetworkScope>(scope: &S) -> Self {
        Self {
            client: scope.client(),
            region: scope.region().clone(),
            owner: scope.owner().clone(),
            in_use_retry: scope.config().transient_retry(),
        }
    }
}

#[async_trait]
impl ResourceAdapter for PrivateNetworkAdapter {
    type Desired = DesiredNetwork;
    type Resource = PrivateNetwork;
    type Zone = Region;

    fn kind(&self) -> &'static str {
        "private network"
    }

    async fn list_resources(&self) -> Result<Vec<PrivateNetwork>> {
        self.client
            .list_private_networks(&self.region, &self.owner.resource_tags(&[]))
            .await
    }

    fn resource_id(&self, pn: &PrivateNetwork) -> String {
        pn.id.clone()
    }

    fn resource_name(&self, pn: &PrivateNetwork) -> String {
        pn.name.clone()
    }

    fn resource_zone(&self, pn: &PrivateNetwork) -> Region {
        pn.region.clone()
    }

    fn desired_zone(&self, _desired: &DesiredNetwork) -> Result<Region> {
        Ok(self.region.clone())
    }

    fn desired_name(&self, _index: usize, _desired: &DesiredNetwork) -> String {
        self.owner.resource_name(&[])
    }

    fn desired_id(&self, desired: &DesiredNetwork) -> Option<String> {
        desired.id.clone()
    }

    async fn get_resource(&self, region: &Region, id: &str) -> Result<Option<PrivateNetwork>> {
        self.client.get_private_network(region, id).await
    }

    async fn should_keep_resource(
        &self,
        pn: &PrivateNetwork,
        desired: &DesiredNetwork,
    ) -> Result<bool> {
        let same_vpc = desired.vpc_id.as_ref().is_none_or(|vpc| *vpc == pn.vpc_id);
        let same_subnet = desired
            .subnet
            .is_none_or(|subnet| pn.subnets.contains(&IpNet::V4(subnet)));
        Ok(same_vpc && same_subnet)
    }

    async fn update_resource(
        &self,
        pn: PrivateNetwork,
        _desired: &DesiredNetwork,
    ) -> Result<PrivateNetwork> {
        Ok(pn)
    }

    async fn create_resource(
        &self,
        region: &Region,
        name: &str,
        desired: &DesiredNetwork,
    ) -> Result<PrivateNetwork> {
        self.client
            .create_private_network(
                region,
                CreatePrivateNetworkRequest {
                    name: name.to_string(),
                    vpc_id: desired.vpc_id.clone(),
                    subnet: desired.subnet,
                    tags: self.owner.resource_tags(&[]),
                },
            )
            .await
    }

    async fn delete_resource(&self, pn: &PrivateNetwork) -> Result<()> {
        match self.client.delete_private_network(&pn.region, &pn.id).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) if is_precondition_failed(&e) => Err(ReconcileError::transient(
                self.in_use_retry,
                format!("private network {} is still in use", pn.name),
            )
            .with_source(e)
            .into()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl<S: NetworkScope> Reconciler<S> for VpcReconciler {
    fn name(&self) -> &'static str {
        "vpc"
    }

    async fn reconcile(&self, scope: &mut S) -> Result<()> {
        if !scope.has_private_network() {
            return Ok(());
        }

        let spec = scope.private_network().clone();
        let client = scope.client();

        let vpc_id = match (&spec.id, &spec.vpc_id) {
            (Some(_), _) => None,
            (None, Some(vpc_id)) => {
                client
                    .get_vpc(scope.region(), vpc_id)
                    .await
                    .context("failed to get VPC")?
                    .ok_or_else(|| ReconcileError::terminal(format!("VPC {} not found", vpc_id)))?;
                Some(vpc_id.clone())
            }
            (None, None) => Some(
                client
                    .get_default_vpc(scope.region())
                    .await
                    .context("failed to get default VPC")?
                    .id,
            ),
        };

        let desired = DesiredNetwork {
            id: spec.id.clone(),
            vpc_id,
            subnet: spec.subnet,
        };
        let ensurer = ResourceEnsurer::new(PrivateNetworkAdapter::new(&*scope));
        let mut networks = ensurer.ensure(std::slice::from_ref(&desired)).await?;
        let Some(pn) = networks.pop() else {
            return Ok(());
        };

        if !pn.dhcp_enabled {
            return Err(ReconcileError::terminal(format!(
                "private network {} must have DHCP enabled",
                pn.id
            ))
            .into());
        }

        if scope.private_network_id().as_deref() != Some(pn.id.as_str()) {
            info!(private_network = %pn.id, vpc = %pn.vpc_id, "Using private network");
        }
        scope.set_vpc_status(Some(pn.id), Some(pn.vpc_id));
        Ok(())
    }

    async fn delete(&self, scope: &mut S) -> Result<()> {
        if scope.has_private_network() && scope.private_network().id.is_none() {
            ResourceEnsurer::new(PrivateNetworkAdapter::new(&*scope))
                .ensure(&[])
                .await?;
        }
        scope.set_vpc_status(None, None);
        Ok(())
    }
}
