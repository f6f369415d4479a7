//! ScalewayCluster: network, gateways, load balancers and DNS of a
//! self-managed cluster.

use std::net::IpAddr;

use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};

use super::{ApiEndpoint, Condition, Failure, ObjectMeta};
use crate::clients::Region;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalewayCluster {
    pub meta: ObjectMeta,
    pub spec: ScalewayClusterSpec,
    #[serde(default)]
    pub status: ScalewayClusterStatus,
}

super::impl_object!(
    ScalewayCluster,
    "scalewaycluster",
    "scalewaycluster.infrastructure.cluster.x-k8s.io"
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalewayClusterSpec {
    pub project_id: String,
    pub region: Region,
    /// Secret holding the provider credentials.
    pub scaleway_secret_name: String,
    #[serde(default)]
    pub network: NetworkSpec,
    /// Zones machines may be placed in. Empty means every zone of the region.
    #[serde(default)]
    pub failure_domains: Vec<String>,
    /// Set by the controller once the load balancer exists.
    #[serde(default)]
    pub control_plane_endpoint: ApiEndpoint,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkSpec {
    pub private_network: PrivateNetworkSpec,
    pub public_gateways: Vec<PublicGatewaySpec>,
    pub control_plane_load_balancer: LoadBalancerSpec,
    pub control_plane_extra_load_balancers: Vec<ExtraLoadBalancerSpec>,
    pub control_plane_dns: Option<ControlPlaneDnsSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PrivateNetworkSpec {
    pub enabled: bool,
    /// Existing private network to use instead of creating one.
    pub id: Option<String>,
    /// VPC to create the private network in. The region default otherwise.
    pub vpc_id: Option<String>,
    pub subnet: Option<Ipv4Net>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PublicGatewaySpec {
    #[serde(rename = "type")]
    pub gateway_type: Option<String>,
    /// Existing flexible IP to bind.
    pub ip: Option<IpAddr>,
    pub zone: Option<String>,
}

impl PublicGatewaySpec {
    pub const DEFAULT_TYPE: &'static str = "VPC-GW-S";

    pub fn gateway_type(&self) -> &str {
        self.gateway_type.as_deref().unwrap_or(Self::DEFAULT_TYPE)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoadBalancerSpec {
    #[serde(rename = "type")]
    pub lb_type: Option<String>,
    pub zone: Option<String>,
    /// Existing flexible IP to bind.
    pub ip: Option<IpAddr>,
    /// Source ranges allowed to reach the API server. Empty allows everyone.
    pub allowed_ranges: Vec<IpNet>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExtraLoadBalancerSpec {
    #[serde(rename = "type")]
    pub lb_type: Option<String>,
    pub zone: Option<String>,
    pub ip: Option<IpAddr>,
}

pub const DEFAULT_LB_TYPE: &str = "LB-S";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneDnsSpec {
    /// DNS zone the record is created in.
    pub domain: String,
    /// Record name inside the zone.
    pub name: String,
}

impl ControlPlaneDnsSpec {
    pub fn fqdn(&self) -> String {
        format!("{}.{}", self.name, self.domain)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScalewayClusterStatus {
    pub ready: bool,
    pub network: Option<NetworkStatus>,
    pub failure_domains: Vec<String>,
    pub conditions: Vec<Condition>,
    pub failure: Option<Failure>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkStatus {
    pub private_network_id: Option<String>,
    pub vpc_id: Option<String>,
    pub public_gateway_ids: Vec<String>,
    pub load_balancer_ip: Option<IpAddr>,
    pub extra_load_balancer_ips: Vec<IpAddr>,
}
