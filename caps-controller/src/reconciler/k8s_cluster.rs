//! Managed Kubernetes cluster reconciler.

use std::cmp::Ordering;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use super::Reconciler;
use crate::api::{ApiEndpoint, AutoUpgradeSpec, AutoscalerSpec};
use crate::clients::is_not_found;
use crate::clients::k8s::{
    AutoUpgrade, AutoscalerConfig, ClusterStatus, CreateClusterRequest, K8sCluster,
    UpdateClusterRequest,
};
use crate::error::ReconcileError;
use crate::ladder::{TypeLadder, Upgrade, compare_versions};
use crate::scope::ManagedControlPlaneScope;

pub struct K8sClusterReconciler;

fn autoscaler_config(spec: &AutoscalerSpec) -> AutoscalerConfig {
    AutoscalerConfig {
        scale_down_disabled: spec.scale_down_disabled,
        scale_down_delay_after_add: spec.scale_down_delay_after_add.clone(),
        estimator: spec.estimator.clone(),
        expander: spec.expander.clone(),
        ignore_daemonsets_utilization: spec.ignore_daemonsets_utilization,
        balance_similar_node_groups: spec.balance_similar_node_groups,
        expendable_pods_priority_cutoff: spec.expendable_pods_priority_cutoff,
        scale_down_unneeded_time: spec.scale_down_unneeded_time.clone(),
        scale_down_utilization_threshold: spec.scale_down_utilization_threshold,
        max_graceful_termination_sec: spec.max_graceful_termination_sec,
    }
}

fn auto_upgrade(spec: &AutoUpgradeSpec) -> AutoUpgrade {
    AutoUpgrade {
        enabled: spec.enabled,
        maintenance_window_start_hour: spec.maintenance_window_start_hour,
        maintenance_window_day: spec.maintenance_window_day.clone(),
    }
}

fn sorted(values: &[String]) -> Vec<String> {
    let mut values = values.to_vec();
    values.sort();
    values
}

/// `Some(desired)` when the two lists differ as sets.
fn list_change(current: &[String], desired: &[String]) -> Option<Vec<String>> {
    (sorted(current) != sorted(desired)).then(|| desired.to_vec())
}

/// Split `https://host:port` into an endpoint. The port defaults to 443.
pub fn parse_endpoint(url: &str) -> Option<ApiEndpoint> {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest.split('/').next()?;
    if authority.is_empty() {
        return None;
    }
    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, rest) = bracketed.split_once(']')?;
        match rest.strip_prefix(':') {
            Some(port) => (host, port.parse().ok()?),
            None => (host, 443),
        }
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().ok()?),
            None => (authority, 443),
        }
    };
    Some(ApiEndpoint {
        host: host.to_string(),
        port,
    })
}

async fn find_cluster(scope: &ManagedControlPlaneScope) -> Result<Option<K8sCluster>> {
    let client = scope.client();
    if let Some(id) = scope.cluster_id() {
        let found = client
            .get_cluster(scope.region(), id)
            .await
            .context("failed to get cluster")?;
        if found.is_some() {
            return Ok(found);
        }
    }
    let name = scope.cluster_name();
    let clusters = client
        .list_clusters(scope.region(), &scope.owner().resource_tags(&[]))
        .await
        .context("failed to list clusters")?;
    Ok(clusters.into_iter().find(|c| c.name == name))
}

fn desired_update(scope: &ManagedControlPlaneScope, cluster: &K8sCluster) -> UpdateClusterRequest {
    let spec = &scope.control_plane().spec;
    let autoscaler = autoscaler_config(&spec.autoscaler);
    let upgrade = auto_upgrade(&spec.auto_upgrade);
    UpdateClusterRequest {
        tags: list_change(&cluster.tags, &scope.resource_tags()),
        feature_gates: list_change(&cluster.feature_gates, &spec.feature_gates),
        admission_plugins: list_change(&cluster.admission_plugins, &spec.admission_plugins),
        apiserver_cert_sans: list_change(&cluster.apiserver_cert_sans, &spec.apiserver_cert_sans),
        autoscaler_config: (cluster.autoscaler_config != autoscaler).then_some(autoscaler),
        auto_upgrade: (cluster.auto_upgrade != upgrade).then_some(upgrade),
    }
}

async fn create_cluster(scope: &mut ManagedControlPlaneScope) -> Result<()> {
    let Some(pn_id) = scope.private_network_id().map(str::to_string) else {
        return Err(ReconcileError::transient(
            scope.config().dependency_wait(),
            "private network of the managed cluster is not ready yet",
        )
        .into());
    };
    let spec = scope.control_plane().spec.clone();
    let name = scope.cluster_name();

    info!(cluster = %name, version = %spec.version, "Creating managed cluster");
    let cluster = scope
        .client()
        .create_cluster(
            scope.region(),
            CreateClusterRequest {
                name,
                cluster_type: spec.cluster_type.clone(),
                version: spec.version.clone(),
                cni: spec.cni.clone(),
                private_network_id: Some(pn_id),
                tags: scope.resource_tags(),
                feature_gates: spec.feature_gates.clone(),
                admission_plugins: spec.admission_plugins.clone(),
                apiserver_cert_sans: spec.apiserver_cert_sans.clone(),
                autoscaler_config: autoscaler_config(&spec.autoscaler),
                auto_upgrade: auto_upgrade(&spec.auto_upgrade),
            },
        )
        .await
        .context("failed to create cluster")?;
    scope.set_cluster(&cluster.id, &cluster.version, None);
    Ok(())
}

/// Move the cluster along the type ladder and the version line.
async fn upgrade(
    scope: &ManagedControlPlaneScope,
    cluster: &K8sCluster,
) -> Result<Option<K8sCluster>> {
    let client = scope.client();
    let spec = &scope.control_plane().spec;
    let mut upgraded = None;

    if !cluster.cluster_type.eq_ignore_ascii_case(&spec.cluster_type) {
        let types = client
            .list_cluster_types(scope.region())
            .await
            .context("failed to list cluster types")?;
        match TypeLadder::new(types).upgrade(&cluster.cluster_type, &spec.cluster_type) {
            Upgrade::Forward => {
                info!(
                    from = %cluster.cluster_type,
                    to = %spec.cluster_type,
                    "Changing cluster type"
                );
                upgraded = Some(
                    client
                        .set_cluster_type(scope.region(), &cluster.id, &spec.cluster_type)
                        .await
                        .context("failed to set cluster type")?,
                );
            }
            Upgrade::Same => {}
            Upgrade::NotUpgradable => {
                return Err(ReconcileError::terminal(format!(
                    "cluster type cannot change from {} to {}",
                    cluster.cluster_type, spec.cluster_type
                ))
                .into());
            }
        }
    }

    match compare_versions(&spec.version, &cluster.version) {
        Some(Ordering::Greater) => {
            info!(from = %cluster.version, to = %spec.version, "Upgrading cluster");
            upgraded = Some(
                client
                    .upgrade_cluster(scope.region(), &cluster.id, &spec.version)
                    .await
                    .context("failed to upgrade cluster")?,
            );
        }
        Some(Ordering::Equal) => {}
        // Auto upgrades may move the cluster past the declared version.
        Some(Ordering::Less) if spec.auto_upgrade.enabled => {}
        Some(Ordering::Less) => {
            return Err(ReconcileError::terminal(format!(
                "cluster version cannot be downgraded from {} to {}",
                cluster.version, spec.version
            ))
            .into());
        }
        None => {
            return Err(ReconcileError::terminal(format!(
                "invalid Kubernetes version {:?}",
                spec.version
            ))
            .into());
        }
    }
    Ok(upgraded)
}

#[async_trait]
impl Reconciler<ManagedControlPlaneScope> for K8sClusterReconciler {
    fn name(&self) -> &'static str {
        "k8s-cluster"
    }

    async fn reconcile(&self, scope: &mut ManagedControlPlaneScope) -> Result<()> {
        let client = scope.client();
        let provisioning = scope.config().cluster_provisioning();

        let Some(mut cluster) = find_cluster(scope).await? else {
            create_cluster(scope).await?;
            return Err(
                ReconcileError::transient(provisioning, "managed cluster is being created").into(),
            );
        };
        scope.set_cluster(&cluster.id, &cluster.version, None);

        match cluster.status {
            ClusterStatus::Locked | ClusterStatus::Error => {
                return Err(ReconcileError::terminal(format!(
                    "cluster {} is in status {:?}",
                    cluster.name, cluster.status
                ))
                .into());
            }
            ClusterStatus::Creating | ClusterStatus::Deleting | ClusterStatus::Unknown => {
                return Err(ReconcileError::transient(
                    provisioning,
                    format!("cluster {} is in status {:?}", cluster.name, cluster.status),
                )
                .into());
            }
            ClusterStatus::Ready | ClusterStatus::PoolRequired | ClusterStatus::Updating => {}
        }

        if cluster.private_network_id.as_deref() != scope.private_network_id() {
            return Err(ReconcileError::terminal(format!(
                "cluster {} is attached to private network {:?}, it cannot be moved",
                cluster.name, cluster.private_network_id
            ))
            .into());
        }

        let update = desired_update(scope, &cluster);
        if !update.is_empty() {
            debug!(cluster = %cluster.name, ?update, "Updating cluster");
            cluster = client
                .update_cluster(scope.region(), &cluster.id, update)
                .await
                .context("failed to update cluster")?;
        }
        if let Some(upgraded) = upgrade(scope, &cluster).await? {
            cluster = upgraded;
        }

        let kubeconfig = client
            .get_kubeconfig(scope.region(), &cluster.id)
            .await
            .context("failed to get kubeconfig")?;
        let namespace = scope.control_plane().meta.namespace.clone();
        scope
            .kubeconfigs()
            .store(&namespace, scope.owner_cluster_name(), &kubeconfig)
            .await
            .context("failed to store kubeconfig")?;

        let endpoint = parse_endpoint(&cluster.cluster_url);
        scope.set_cluster(&cluster.id, &cluster.version, endpoint);
        scope.set_initialized();

        if !cluster.status.is_available() {
            return Err(ReconcileError::transient(
                provisioning,
                format!("cluster {} is not available yet", cluster.name),
            )
            .into());
        }
        Ok(())
    }

    async fn delete(&self, scope: &mut ManagedControlPlaneScope) -> Result<()> {
        let provisioning = scope.config().cluster_provisioning();
        let Some(cluster) = find_cluster(scope).await? else {
            let namespace = scope.control_plane().meta.namespace.clone();
            return scope
                .kubeconfigs()
                .delete(&namespace, scope.owner_cluster_name())
                .await
                .context("failed to delete kubeconfig");
        };

        if cluster.status != ClusterStatus::Deleting {
            let with_additional_resources =
                scope.control_plane().spec.on_delete.with_additional_resources;
            info!(cluster = %cluster.name, with_additional_resources, "Deleting managed cluster");
            match scope
                .client()
                .delete_cluster(scope.region(), &cluster.id, with_additional_resources)
                .await
            {
                Err(e) if !is_not_found(&e) => return Err(e.context("failed to delete cluster")),
                _ => {}
            }
        }
        Err(ReconcileError::transient(
            provisioning,
            format!("cluster {} is being deleted", cluster.name),
        )
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::K8sApi;
    use crate::controller::MockKubeconfigSink;
    use crate::error::{Outcome, classify};
    use crate::test_util::{InMemoryCloud, MemoryKubeconfigs, control_plane_scope, fixtures};
    use std::sync::Arc;

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(
            parse_endpoint("https://abc.api.k8s.fr-par.scw.cloud:6443"),
            Some(ApiEndpoint {
                host: "abc.api.k8s.fr-par.scw.cloud".to_string(),
                port: 6443
            })
        );
        assert_eq!(parse_endpoint("https://api.example.com/").unwrap().port, 443);
        assert_eq!(parse_endpoint("https://[2001:db8::1]:6443").unwrap().host, "2001:db8::1");
        assert_eq!(parse_endpoint(""), None);
    }

    async fn provisioned(
        cloud: &Arc<InMemoryCloud>,
        kubeconfigs: Arc<MemoryKubeconfigs>,
    ) -> ManagedControlPlaneScope {
        let managed = fixtures::ready_managed_cluster(cloud, "mc1").await;
        let mut scope = control_plane_scope(
            cloud,
            fixtures::control_plane("cp1", "1.30.2"),
            managed,
            kubeconfigs,
        );
        let err = K8sClusterReconciler.reconcile(&mut scope).await.unwrap_err();
        assert!(matches!(classify(&err), Outcome::Transient(_)));
        scope
    }

    #[tokio::test]
    async fn test_create_then_ready() {
        let cloud = InMemoryCloud::new();
        let kubeconfigs = MemoryKubeconfigs::new();
        let mut scope = provisioned(&cloud, kubeconfigs.clone()).await;

        K8sClusterReconciler.reconcile(&mut scope).await.unwrap();

        let status = &scope.control_plane().status;
        assert!(status.initialized);
        assert_eq!(status.version.as_deref(), Some("1.30.2"));
        assert_eq!(scope.control_plane().spec.control_plane_endpoint.port, 6443);
        assert!(kubeconfigs.get("default", "cp1").is_some());
        let clusters = cloud.list_clusters(&fixtures::region(), &[]).await.unwrap();
        assert_eq!(clusters[0].name, "caps-cp1");
        assert_eq!(clusters[0].private_network_id.as_deref(), scope.private_network_id());
        scope.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_version_upgrade_and_downgrade() {
        let cloud = InMemoryCloud::new();
        let mut scope = provisioned(&cloud, MemoryKubeconfigs::new()).await;

        scope.control_plane_mut().spec.version = "1.31.1".to_string();
        K8sClusterReconciler.reconcile(&mut scope).await.unwrap();
        assert_eq!(scope.control_plane().status.version.as_deref(), Some("1.31.1"));

        scope.control_plane_mut().spec.version = "1.29.0".to_string();
        let err = K8sClusterReconciler.reconcile(&mut scope).await.unwrap_err();
        assert!(matches!(classify(&err), Outcome::Terminal(m) if m.contains("downgraded")));
        scope.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_type_change_follows_ladder() {
        let cloud = InMemoryCloud::new();
        let mut scope = provisioned(&cloud, MemoryKubeconfigs::new()).await;

        scope.control_plane_mut().spec.cluster_type = "kapsule-dedicated-4".to_string();
        K8sClusterReconciler.reconcile(&mut scope).await.unwrap();
        let clusters = cloud.list_clusters(&fixtures::region(), &[]).await.unwrap();
        assert_eq!(clusters[0].cluster_type, "kapsule-dedicated-4");

        scope.control_plane_mut().spec.cluster_type = "kapsule".to_string();
        let err = K8sClusterReconciler.reconcile(&mut scope).await.unwrap_err();
        assert!(matches!(classify(&err), Outcome::Terminal(_)));
        scope.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_settings_drift_is_updated() {
        let cloud = InMemoryCloud::new();
        let mut scope = provisioned(&cloud, MemoryKubeconfigs::new()).await;
        K8sClusterReconciler.reconcile(&mut scope).await.unwrap();
        let calls = cloud.mutating_calls();
        K8sClusterReconciler.reconcile(&mut scope).await.unwrap();
        assert_eq!(cloud.mutating_calls(), calls);

        scope.control_plane_mut().spec.feature_gates = vec!["HPAScaleToZero".to_string()];
        K8sClusterReconciler.reconcile(&mut scope).await.unwrap();

        let clusters = cloud.list_clusters(&fixtures::region(), &[]).await.unwrap();
        assert_eq!(clusters[0].feature_gates, vec!["HPAScaleToZero".to_string()]);
        scope.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_removes_cluster_then_kubeconfig() {
        let cloud = InMemoryCloud::new();
        let managed = fixtures::ready_managed_cluster(&cloud, "mc1").await;
        let mut kubeconfigs = MockKubeconfigSink::new();
        kubeconfigs.expect_store().returning(|_, _, _| Ok(()));
        kubeconfigs
            .expect_delete()
            .times(1)
            .returning(|_, _| Ok(()));
        let mut scope = control_plane_scope(
            &cloud,
            fixtures::control_plane("cp1", "1.30.2"),
            managed,
            Arc::new(kubeconfigs),
        );
        let _ = K8sClusterReconciler.reconcile(&mut scope).await;
        K8sClusterReconciler.reconcile(&mut scope).await.unwrap();

        let err = K8sClusterReconciler.delete(&mut scope).await.unwrap_err();
        assert!(matches!(classify(&err), Outcome::Transient(_)));
        K8sClusterReconciler.delete(&mut scope).await.unwrap();

        assert!(cloud.list_clusters(&fixtures::region(), &[]).await.unwrap().is_empty());
        scope.close().await.unwrap();
    }
}
