//! ScalewayMachine: one server of a self-managed cluster.

use serde::{Deserialize, Serialize};

use super::{Condition, Failure, ObjectMeta};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalewayMachine {
    pub meta: ObjectMeta,
    pub spec: ScalewayMachineSpec,
    #[serde(default)]
    pub status: ScalewayMachineStatus,
}

super::impl_object!(
    ScalewayMachine,
    "scalewaymachine",
    "scalewaymachine.infrastructure.cluster.x-k8s.io"
);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalewayMachineSpec {
    /// Set by the controller once the server exists.
    #[serde(default)]
    pub provider_id: Option<String>,
    pub commercial_type: String,
    pub image: ImageSpec,
    #[serde(default)]
    pub root_volume: Option<RootVolumeSpec>,
    #[serde(default)]
    pub public_network: Option<PublicNetworkSpec>,
    #[serde(default)]
    pub placement_group_id: Option<String>,
    #[serde(default)]
    pub security_group_id: Option<String>,
}

/// Image by ID, or by exact name in the machine's zone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ImageSpec {
    pub id: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootVolumeSpec {
    pub size_gb: u64,
    #[serde(default = "RootVolumeSpec::default_type", rename = "type")]
    pub volume_type: String,
}

impl RootVolumeSpec {
    fn default_type() -> String {
        "sbs_volume".to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PublicNetworkSpec {
    #[serde(rename = "enableIPv4")]
    pub enable_ipv4: bool,
    #[serde(rename = "enableIPv6")]
    pub enable_ipv6: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressType {
    Hostname,
    InternalIP,
    ExternalIP,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineAddress {
    #[serde(rename = "type")]
    pub address_type: AddressType,
    pub address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScalewayMachineStatus {
    pub ready: bool,
    pub addresses: Vec<MachineAddress>,
    pub instance_state: Option<String>,
    pub conditions: Vec<Condition>,
    pub failure: Option<Failure>,
}

/// The generic machine owning a [`ScalewayMachine`], as reported by the
/// surrounding control plane.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnerMachine {
    pub name: String,
    pub cluster_name: String,
    pub control_plane: bool,
    pub failure_domain: Option<String>,
    /// Secret holding the bootstrap data. Unset until bootstrap is done.
    pub bootstrap_data_secret: Option<String>,
}
