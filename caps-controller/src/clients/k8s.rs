//! Managed Kubernetes API.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;

use super::{Region, Zone};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterStatus {
    Creating,
    Ready,
    /// Ready, but no pool exists yet.
    PoolRequired,
    Updating,
    Deleting,
    Locked,
    Error,
    Unknown,
}

impl ClusterStatus {
    /// Whether the control plane serves requests.
    pub fn is_available(&self) -> bool {
        matches!(
            self,
            ClusterStatus::Ready | ClusterStatus::PoolRequired | ClusterStatus::Updating
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AutoscalerConfig {
    pub scale_down_disabled: bool,
    pub scale_down_delay_after_add: Option<String>,
    pub estimator: Option<String>,
    pub expander: Option<String>,
    pub ignore_daemonsets_utilization: bool,
    pub balance_similar_node_groups: bool,
    pub expendable_pods_priority_cutoff: Option<i32>,
    pub scale_down_unneeded_time: Option<String>,
    pub scale_down_utilization_threshold: Option<f32>,
    pub max_graceful_termination_sec: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AutoUpgrade {
    pub enabled: bool,
    pub maintenance_window_start_hour: Option<u32>,
    pub maintenance_window_day: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct K8sCluster {
    pub id: String,
    pub name: String,
    pub region: Region,
    pub cluster_type: String,
    pub version: String,
    pub cni: String,
    pub status: ClusterStatus,
    pub private_network_id: Option<String>,
    pub cluster_url: String,
    pub tags: Vec<String>,
    pub feature_gates: Vec<String>,
    pub admission_plugins: Vec<String>,
    pub apiserver_cert_sans: Vec<String>,
    pub autoscaler_config: AutoscalerConfig,
    pub auto_upgrade: AutoUpgrade,
}

#[derive(Debug, Clone)]
pub struct CreateClusterRequest {
    pub name: String,
    pub cluster_type: String,
    pub version: String,
    pub cni: String,
    pub private_network_id: Option<String>,
    pub tags: Vec<String>,
    pub feature_gates: Vec<String>,
    pub admission_plugins: Vec<String>,
    pub apiserver_cert_sans: Vec<String>,
    pub autoscaler_config: AutoscalerConfig,
    pub auto_upgrade: AutoUpgrade,
}

/// Fields left as `None` are not changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateClusterRequest {
    pub tags: Option<Vec<String>>,
    pub feature_gates: Option<Vec<String>>,
    pub admission_plugins: Option<Vec<String>>,
    pub apiserver_cert_sans: Option<Vec<String>>,
    pub autoscaler_config: Option<AutoscalerConfig>,
    pub auto_upgrade: Option<AutoUpgrade>,
}

impl UpdateClusterRequest {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStatus {
    Scaling,
    Ready,
    Upgrading,
    Deleting,
    Locked,
    Warning,
    Error,
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradePolicy {
    pub max_unavailable: u32,
    pub max_surge: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pool {
    pub id: String,
    pub cluster_id: String,
    pub name: String,
    pub node_type: String,
    pub zone: Zone,
    pub version: String,
    pub status: PoolStatus,
    pub autoscaling: bool,
    pub size: u32,
    pub min_size: u32,
    pub max_size: u32,
    pub autohealing: bool,
    pub tags: Vec<String>,
    pub kubelet_args: BTreeMap<String, String>,
    pub upgrade_policy: UpgradePolicy,
    pub root_volume_type: Option<String>,
    pub root_volume_size_gb: Option<u64>,
    pub public_ip_disabled: bool,
    pub placement_group_id: Option<String>,
    pub security_group_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreatePoolRequest {
    pub name: String,
    pub node_type: String,
    pub zone: Zone,
    pub version: String,
    pub autoscaling: bool,
    pub size: u32,
    pub min_size: u32,
    pub max_size: u32,
    pub autohealing: bool,
    pub tags: Vec<String>,
    pub kubelet_args: BTreeMap<String, String>,
    pub upgrade_policy: UpgradePolicy,
    pub root_volume_type: Option<String>,
    pub root_volume_size_gb: Option<u64>,
    pub public_ip_disabled: bool,
    pub placement_group_id: Option<String>,
    pub security_group_id: Option<String>,
}

/// Fields left as `None` are not changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdatePoolRequest {
    pub autoscaling: Option<bool>,
    pub size: Option<u32>,
    pub min_size: Option<u32>,
    pub max_size: Option<u32>,
    pub autohealing: Option<bool>,
    pub tags: Option<Vec<String>>,
    pub kubelet_args: Option<BTreeMap<String, String>>,
    pub upgrade_policy: Option<UpgradePolicy>,
}

impl UpdatePoolRequest {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: String,
    pub pool_id: String,
    pub name: String,
    pub provider_id: String,
    pub ready: bool,
}

#[async_trait]
pub trait K8sApi: Send + Sync {
    /// List clusters carrying all of `tags`.
    async fn list_clusters(&self, region: &Region, tags: &[String]) -> Result<Vec<K8sCluster>>;

    async fn get_cluster(&self, region: &Region, id: &str) -> Result<Option<K8sCluster>>;

    async fn create_cluster(&self, region: &Region, req: CreateClusterRequest)
    -> Result<K8sCluster>;

    async fn update_cluster(
        &self,
        region: &Region,
        id: &str,
        req: UpdateClusterRequest,
    ) -> Result<K8sCluster>;

    /// Upgrade the control plane to `version`. Pools are upgraded separately.
    async fn upgrade_cluster(&self, region: &Region, id: &str, version: &str)
    -> Result<K8sCluster>;

    async fn set_cluster_type(
        &self,
        region: &Region,
        id: &str,
        cluster_type: &str,
    ) -> Result<K8sCluster>;

    async fn delete_cluster(
        &self,
        region: &Region,
        id: &str,
        with_additional_resources: bool,
    ) -> Result<()>;

    /// Cluster commercial types, from smallest to largest.
    async fn list_cluster_types(&self, region: &Region) -> Result<Vec<String>>;

    async fn get_kubeconfig(&self, region: &Region, id: &str) -> Result<Vec<u8>>;

    async fn list_pools(&self, region: &Region, cluster_id: &str) -> Result<Vec<Pool>>;

    async fn create_pool(
        &self,
        region: &Region,
        cluster_id: &str,
        req: CreatePoolRequest,
    ) -> Result<Pool>;

    async fn update_pool(&self, region: &Region, id: &str, req: UpdatePoolRequest)
    -> Result<Pool>;

    async fn upgrade_pool(&self, region: &Region, id: &str, version: &str) -> Result<Pool>;

    async fn delete_pool(&self, region: &Region, id: &str) -> Result<()>;

    async fn list_nodes(&self, region: &Region, pool_id: &str) -> Result<Vec<Node>>;
}
