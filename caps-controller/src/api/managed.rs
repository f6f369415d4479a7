//! Managed Kubernetes objects: the network of a managed cluster, its
//! control plane and its machine pools.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{ApiEndpoint, Condition, Failure, ObjectMeta};
use super::cluster::{NetworkStatus, PrivateNetworkSpec, PublicGatewaySpec};
use crate::clients::Region;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalewayManagedCluster {
    pub meta: ObjectMeta,
    pub spec: ScalewayManagedClusterSpec,
    #[serde(default)]
    pub status: ScalewayManagedClusterStatus,
}

super::impl_object!(
    ScalewayManagedCluster,
    "scalewaymanagedcluster",
    "scalewaymanagedcluster.infrastructure.cluster.x-k8s.io"
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalewayManagedClusterSpec {
    pub project_id: String,
    pub region: Region,
    pub scaleway_secret_name: String,
    #[serde(default)]
    pub network: ManagedNetworkSpec,
    /// Copied from the control plane once it is reachable.
    #[serde(default)]
    pub control_plane_endpoint: ApiEndpoint,
}

/// Managed clusters always get a private network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ManagedNetworkSpec {
    pub private_network: PrivateNetworkSpec,
    pub public_gateways: Vec<PublicGatewaySpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScalewayManagedClusterStatus {
    pub ready: bool,
    pub network: Option<NetworkStatus>,
    pub conditions: Vec<Condition>,
    pub failure: Option<Failure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalewayManagedControlPlane {
    pub meta: ObjectMeta,
    pub spec: ScalewayManagedControlPlaneSpec,
    #[serde(default)]
    pub status: ScalewayManagedControlPlaneStatus,
}

super::impl_object!(
    ScalewayManagedControlPlane,
    "scalewaymanagedcontrolplane",
    "scalewaymanagedcontrolplane.infrastructure.cluster.x-k8s.io"
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalewayManagedControlPlaneSpec {
    /// Name of the managed cluster at the provider. Generated when unset.
    #[serde(default)]
    pub cluster_name: Option<String>,
    #[serde(rename = "type", default = "ScalewayManagedControlPlaneSpec::default_type")]
    pub cluster_type: String,
    pub version: String,
    #[serde(default = "ScalewayManagedControlPlaneSpec::default_cni")]
    pub cni: String,
    #[serde(default)]
    pub additional_tags: Vec<String>,
    #[serde(default)]
    pub feature_gates: Vec<String>,
    #[serde(default)]
    pub admission_plugins: Vec<String>,
    #[serde(default)]
    pub apiserver_cert_sans: Vec<String>,
    #[serde(default)]
    pub autoscaler: AutoscalerSpec,
    #[serde(default)]
    pub auto_upgrade: AutoUpgradeSpec,
    #[serde(default)]
    pub on_delete: OnDeleteSpec,
    #[serde(default)]
    pub control_plane_endpoint: ApiEndpoint,
}

impl ScalewayManagedControlPlaneSpec {
    fn default_type() -> String {
        "kapsule".to_string()
    }

    fn default_cni() -> String {
        "cilium".to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AutoscalerSpec {
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

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AutoUpgradeSpec {
    pub enabled: bool,
    pub maintenance_window_start_hour: Option<u32>,
    pub maintenance_window_day: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OnDeleteSpec {
    /// Also delete volumes and load balancers created by the cluster.
    pub with_additional_resources: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScalewayManagedControlPlaneStatus {
    pub ready: bool,
    pub initialized: bool,
    pub cluster_id: Option<String>,
    pub version: Option<String>,
    pub conditions: Vec<Condition>,
    pub failure: Option<Failure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalewayManagedMachinePool {
    pub meta: ObjectMeta,
    pub spec: ScalewayManagedMachinePoolSpec,
    #[serde(default)]
    pub status: ScalewayManagedMachinePoolStatus,
}

super::impl_object!(
    ScalewayManagedMachinePool,
    "scalewaymanagedmachinepool",
    "scalewaymanagedmachinepool.infrastructure.cluster.x-k8s.io"
);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalewayManagedMachinePoolSpec {
    pub node_type: String,
    #[serde(default)]
    pub zone: Option<String>,
    /// Desired size when autoscaling is off.
    #[serde(default)]
    pub replicas: Option<u32>,
    #[serde(default)]
    pub scaling: Option<ScalingSpec>,
    #[serde(default)]
    pub autohealing: bool,
    #[serde(default)]
    pub additional_tags: Vec<String>,
    #[serde(default)]
    pub kubelet_args: BTreeMap<String, String>,
    #[serde(default)]
    pub upgrade_policy: Option<UpgradePolicySpec>,
    #[serde(default)]
    pub root_volume_type: Option<String>,
    #[serde(default)]
    pub root_volume_size_gb: Option<u64>,
    #[serde(default)]
    pub public_ip_disabled: bool,
    #[serde(default)]
    pub placement_group_id: Option<String>,
    #[serde(default)]
    pub security_group_id: Option<String>,
    /// Set by the controller from the pool's nodes.
    #[serde(default)]
    pub provider_id_list: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScalingSpec {
    pub autoscaling: bool,
    pub min_size: Option<u32>,
    pub max_size: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UpgradePolicySpec {
    pub max_unavailable: Option<u32>,
    pub max_surge: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScalewayManagedMachinePoolStatus {
    pub ready: bool,
    pub replicas: u32,
    pub conditions: Vec<Condition>,
    pub failure: Option<Failure>,
}
