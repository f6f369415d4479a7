//! Managed Kubernetes pool reconciler.
//!
//! Mutable settings are updated in place. A change to a setting the
//! provider fixes at creation (node type, zone, root volume, networking)
//! replaces the pool.

use std::cmp::Ordering;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use super::Reconciler;
use crate::api::ScalewayManagedMachinePoolSpec;
use crate::clients::k8s::{CreatePoolRequest, Pool, PoolStatus, UpdatePoolRequest, UpgradePolicy};
use crate::clients::{Zone, is_not_found};
use crate::error::ReconcileError;
use crate::ladder::compare_versions;
use crate::scope::ManagedMachinePoolScope;

pub struct K8sPoolReconciler;

/// Sizing of a pool derived from its spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Sizing {
    autoscaling: bool,
    size: u32,
    min_size: u32,
    max_size: u32,
}

impl Sizing {
    fn of(spec: &ScalewayManagedMachinePoolSpec) -> Self {
        let size = spec.replicas.unwrap_or(1);
        let scaling = spec.scaling.clone().unwrap_or_default();
        let min_size = scaling.min_size.unwrap_or(size);
        Self {
            autoscaling: scaling.autoscaling,
            size,
            min_size,
            max_size: scaling.max_size.unwrap_or(size.max(min_size)),
        }
    }
}

fn upgrade_policy(spec: &ScalewayManagedMachinePoolSpec) -> Option<UpgradePolicy> {
    spec.upgrade_policy.as_ref().map(|p| UpgradePolicy {
        max_unavailable: p.max_unavailable.unwrap_or(1),
        max_surge: p.max_surge.unwrap_or(0),
    })
}

/// Settings of `pool` that differ from the desired pool but cannot be updated.
fn immutable_drift(
    spec: &ScalewayManagedMachinePoolSpec,
    zone: &Zone,
    pool: &Pool,
) -> Vec<&'static str> {
    let mut drift = Vec::new();
    if !pool.node_type.eq_ignore_ascii_case(&spec.node_type) {
        drift.push("nodeType");
    }
    if pool.zone != *zone {
        drift.push("zone");
    }
    if spec.root_volume_type.is_some() && pool.root_volume_type != spec.root_volume_type {
        drift.push("rootVolumeType");
    }
    if spec.root_volume_size_gb.is_some() && pool.root_volume_size_gb != spec.root_volume_size_gb {
        drift.push("rootVolumeSizeGb");
    }
    if pool.public_ip_disabled != spec.public_ip_disabled {
        drift.push("publicIpDisabled");
    }
    if spec.placement_group_id.is_some() && pool.placement_group_id != spec.placement_group_id {
        drift.push("placementGroupId");
    }
    if spec.security_group_id.is_some() && pool.security_group_id != spec.security_group_id {
        drift.push("securityGroupId");
    }
    drift
}

fn desired_update(scope: &ManagedMachinePoolScope, pool: &Pool) -> UpdatePoolRequest {
    let spec = &scope.pool().spec;
    let sizing = Sizing::of(spec);
    let mut update = UpdatePoolRequest::default();

    if pool.autoscaling != sizing.autoscaling {
        update.autoscaling = Some(sizing.autoscaling);
    }
    // The autoscaler owns the size while enabled.
    if !sizing.autoscaling && pool.size != sizing.size {
        update.size = Some(sizing.size);
    }
    if pool.min_size != sizing.min_size {
        update.min_size = Some(sizing.min_size);
    }
    if pool.max_size != sizing.max_size {
        update.max_size = Some(sizing.max_size);
    }
    if pool.autohealing != spec.autohealing {
        update.autohealing = Some(spec.autohealing);
    }

    let mut current_tags = pool.tags.clone();
    let mut tags = scope.resource_tags();
    current_tags.sort();
    tags.sort();
    if current_tags != tags {
        update.tags = Some(scope.resource_tags());
    }
    if pool.kubelet_args != spec.kubelet_args {
        update.kubelet_args = Some(spec.kubelet_args.clone());
    }
    if let Some(policy) = upgrade_policy(spec)
        && policy != pool.upgrade_policy
    {
        update.upgrade_policy = Some(policy);
    }
    update
}

async fn find_pool(scope: &ManagedMachinePoolScope, cluster_id: &str) -> Result<Option<Pool>> {
    let pools = scope
        .client()
        .list_pools(scope.region(), cluster_id)
        .await
        .context("failed to list pools")?;
    Ok(pools.into_iter().find(|p| p.name == scope.pool_name()))
}

async fn create_pool(
    scope: &ManagedMachinePoolScope,
    cluster_id: &str,
    zone: Zone,
) -> Result<Pool> {
    let spec = &scope.pool().spec;
    let sizing = Sizing::of(spec);
    info!(
        pool = %scope.pool_name(),
        node_type = %spec.node_type,
        size = sizing.size,
        "Creating pool"
    );
    scope
        .client()
        .create_pool(
            scope.region(),
            cluster_id,
            CreatePoolRequest {
                name: scope.pool_name().to_string(),
                node_type: spec.node_type.clone(),
                zone,
                version: scope.version().to_string(),
                autoscaling: sizing.autoscaling,
                size: sizing.size,
                min_size: sizing.min_size,
                max_size: sizing.max_size,
                autohealing: spec.autohealing,
                tags: scope.resource_tags(),
                kubelet_args: spec.kubelet_args.clone(),
                upgrade_policy: upgrade_policy(spec).unwrap_or_default(),
                root_volume_type: spec.root_volume_type.clone(),
                root_volume_size_gb: spec.root_volume_size_gb,
                public_ip_disabled: spec.public_ip_disabled,
                placement_group_id: spec.placement_group_id.clone(),
                security_group_id: spec.security_group_id.clone(),
            },
        )
        .await
        .context("failed to create pool")
}

#[async_trait]
impl Reconciler<ManagedMachinePoolScope> for K8sPoolReconciler {
    fn name(&self) -> &'static str {
        "k8s-pool"
    }

    async fn reconcile(&self, scope: &mut ManagedMachinePoolScope) -> Result<()> {
        let provisioning = scope.config().cluster_provisioning();
        let Some(cluster_id) = scope.cluster_id().map(str::to_string) else {
            return Err(ReconcileError::transient(
                scope.config().dependency_wait(),
                "managed cluster does not exist yet",
            )
            .into());
        };
        let zone = scope.zone()?;
        let client = scope.client();

        let Some(mut pool) = find_pool(scope, &cluster_id).await? else {
            create_pool(scope, &cluster_id, zone).await?;
            return Err(ReconcileError::transient(provisioning, "pool is being created").into());
        };

        match pool.status {
            PoolStatus::Locked | PoolStatus::Error => {
                return Err(ReconcileError::terminal(format!(
                    "pool {} is in status {:?}",
                    pool.name, pool.status
                ))
                .into());
            }
            PoolStatus::Deleting => {
                return Err(ReconcileError::transient(
                    provisioning,
                    format!("pool {} is being deleted", pool.name),
                )
                .into());
            }
            _ => {}
        }

        let drift = immutable_drift(&scope.pool().spec, &zone, &pool);
        if !drift.is_empty() {
            info!(pool = %pool.name, ?drift, "Replacing pool");
            client
                .delete_pool(scope.region(), &pool.id)
                .await
                .context("failed to delete pool")?;
            return Err(ReconcileError::transient(
                provisioning,
                format!("pool {} is being replaced", pool.name),
            )
            .into());
        }

        let update = desired_update(scope, &pool);
        if !update.is_empty() {
            debug!(pool = %pool.name, ?update, "Updating pool");
            pool = client
                .update_pool(scope.region(), &pool.id, update)
                .await
                .context("failed to update pool")?;
        }

        let version = scope.version().to_string();
        if compare_versions(&version, &pool.version) == Some(Ordering::Greater) {
            info!(pool = %pool.name, from = %pool.version, to = %version, "Upgrading pool");
            pool = client
                .upgrade_pool(scope.region(), &pool.id, &version)
                .await
                .context("failed to upgrade pool")?;
        }

        let nodes = client
            .list_nodes(scope.region(), &pool.id)
            .await
            .context("failed to list nodes")?;
        let mut provider_ids: Vec<String> = nodes
            .iter()
            .filter(|n| !n.provider_id.is_empty())
            .map(|n| n.provider_id.clone())
            .collect();
        provider_ids.sort();
        scope.set_replicas(nodes.iter().filter(|n| n.ready).count() as u32);
        scope.set_provider_ids(provider_ids);

        if pool.status != PoolStatus::Ready {
            return Err(ReconcileError::transient(
                provisioning,
                format!("pool {} is in status {:?}", pool.name, pool.status),
            )
            .into());
        }
        Ok(())
    }

    async fn delete(&self, scope: &mut ManagedMachinePoolScope) -> Result<()> {
        let Some(cluster_id) = scope.cluster_id().map(str::to_string) else {
            return Ok(());
        };
        let pool = match find_pool(scope, &cluster_id).await {
            Ok(Some(pool)) => pool,
            Ok(None) => return Ok(()),
            Err(e) if is_not_found(&e) => return Ok(()),
            Err(e) => return Err(e),
        };

        if pool.status != PoolStatus::Deleting {
            info!(pool = %pool.name, "Deleting pool");
            match scope.client().delete_pool(scope.region(), &pool.id).await {
                Err(e) if !is_not_found(&e) => return Err(e.context("failed to delete pool")),
                _ => {}
            }
        }
        Err(ReconcileError::transient(
            scope.config().cluster_provisioning(),
            format!("pool {} is being deleted", pool.name),
        )
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ScalingSpec;
    use crate::clients::K8sApi;
    use crate::error::{Outcome, classify};
    use crate::test_util::{InMemoryCloud, fixtures, pool_scope};
    use std::sync::Arc;

    async fn pool_cluster(cloud: &Arc<InMemoryCloud>) -> ManagedMachinePoolScope {
        let managed = fixtures::ready_managed_cluster(cloud, "mc1").await;
        let control_plane = fixtures::ready_control_plane(cloud, &managed, "cp1", "1.30.2").await;
        pool_scope(cloud, fixtures::pool("p1", "DEV1-M", 2), control_plane, managed)
    }

    async fn pools(cloud: &InMemoryCloud, scope: &ManagedMachinePoolScope) -> Vec<Pool> {
        cloud
            .list_pools(&fixtures::region(), scope.cluster_id().unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_then_report_nodes() {
        let cloud = InMemoryCloud::new();
        let mut scope = pool_cluster(&cloud).await;

        let err = K8sPoolReconciler.reconcile(&mut scope).await.unwrap_err();
        assert!(matches!(classify(&err), Outcome::Transient(_)));
        K8sPoolReconciler.reconcile(&mut scope).await.unwrap();

        assert_eq!(scope.pool().status.replicas, 2);
        assert_eq!(scope.pool().spec.provider_id_list.len(), 2);
        let pools = pools(&cloud, &scope).await;
        assert_eq!(pools[0].version, "1.30.2");
        scope.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_resize_in_place() {
        let cloud = InMemoryCloud::new();
        let mut scope = pool_cluster(&cloud).await;
        let _ = K8sPoolReconciler.reconcile(&mut scope).await;
        let id = pools(&cloud, &scope).await[0].id.clone();

        scope.pool_mut().spec.replicas = Some(3);
        K8sPoolReconciler.reconcile(&mut scope).await.unwrap();

        let pools = pools(&cloud, &scope).await;
        assert_eq!(pools[0].id, id);
        assert_eq!(pools[0].size, 3);
        assert_eq!(scope.pool().status.replicas, 3);
        scope.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_autoscaling_keeps_size() {
        let cloud = InMemoryCloud::new();
        let mut scope = pool_cluster(&cloud).await;
        let _ = K8sPoolReconciler.reconcile(&mut scope).await;

        scope.pool_mut().spec.replicas = Some(5);
        scope.pool_mut().spec.scaling = Some(ScalingSpec {
            autoscaling: true,
            min_size: Some(1),
            max_size: Some(6),
        });
        K8sPoolReconciler.reconcile(&mut scope).await.unwrap();

        let pools = pools(&cloud, &scope).await;
        assert!(pools[0].autoscaling);
        assert_eq!(pools[0].size, 2);
        assert_eq!((pools[0].min_size, pools[0].max_size), (1, 6));
        scope.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_node_type_change_replaces_pool() {
        let cloud = InMemoryCloud::new();
        let mut scope = pool_cluster(&cloud).await;
        let _ = K8sPoolReconciler.reconcile(&mut scope).await;
        let old = pools(&cloud, &scope).await[0].id.clone();

        scope.pool_mut().spec.node_type = "GP1-XS".to_string();
        let err = K8sPoolReconciler.reconcile(&mut scope).await.unwrap_err();
        assert!(matches!(classify(&err), Outcome::Transient(_)));
        assert!(format!("{:#}", err).contains("replaced"));
        let _ = K8sPoolReconciler.reconcile(&mut scope).await;
        K8sPoolReconciler.reconcile(&mut scope).await.unwrap();

        let pools = pools(&cloud, &scope).await;
        assert_eq!(pools.len(), 1);
        assert_ne!(pools[0].id, old);
        assert_eq!(pools[0].node_type, "GP1-XS");
        scope.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_pool() {
        let cloud = InMemoryCloud::new();
        let mut scope = pool_cluster(&cloud).await;
        let _ = K8sPoolReconciler.reconcile(&mut scope).await;

        let err = K8sPoolReconciler.delete(&mut scope).await.unwrap_err();
        assert!(matches!(classify(&err), Outcome::Transient(_)));
        K8sPoolReconciler.delete(&mut scope).await.unwrap();

        assert!(pools(&cloud, &scope).await.is_empty());
        scope.close().await.unwrap();
    }
}
