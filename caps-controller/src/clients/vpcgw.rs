//! Public gateway API.

use std::net::IpAddr;

use anyhow::Result;
use async_trait::async_trait;

use super::{Region, Zone};

/// Lifecycle status of a public gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayStatus {
    Allocating,
    Configuring,
    Running,
    Stopping,
    Failed,
    Deleting,
    Unknown,
}

/// Public IP of a gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayIp {
    pub id: String,
    pub zone: Zone,
    pub address: IpAddr,
    pub tags: Vec<String>,
    /// Gateway currently using this IP.
    pub gateway_id: Option<String>,
}

/// A public gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct Gateway {
    pub id: String,
    pub name: String,
    pub zone: Zone,
    pub gateway_type: String,
    pub status: GatewayStatus,
    pub ip: Option<GatewayIp>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CreateGatewayRequest {
    pub name: String,
    pub gateway_type: String,
    /// IP to bind. A new IP is allocated when absent.
    pub ip_id: Option<String>,
    pub tags: Vec<String>,
}

/// Attachment of a gateway to a private network.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayNetwork {
    pub id: String,
    pub gateway_id: String,
    pub private_network_id: String,
    pub enable_masquerade: bool,
    pub push_default_route: bool,
}

#[derive(Debug, Clone)]
pub struct CreateGatewayNetworkRequest {
    pub gateway_id: String,
    pub private_network_id: String,
    pub enable_masquerade: bool,
    pub push_default_route: bool,
}

#[async_trait]
pub trait GatewayApi: Send + Sync {
    /// List gateways carrying all of `tags` in every zone of `region`.
    async fn list_gateways(&self, region: &Region, tags: &[String]) -> Result<Vec<Gateway>>;

    async fn get_gateway(&self, zone: &Zone, id: &str) -> Result<Option<Gateway>>;

    /// Gateway commercial types of a zone, from smallest to largest.
    async fn list_gateway_types(&self, zone: &Zone) -> Result<Vec<String>>;

    async fn create_gateway(&self, zone: &Zone, req: CreateGatewayRequest) -> Result<Gateway>;

    /// Move a gateway to a larger commercial type.
    async fn upgrade_gateway(&self, zone: &Zone, id: &str, gateway_type: &str) -> Result<Gateway>;

    /// Delete a gateway and its network attachments. The IP is released
    /// when `release_ip` is set.
    async fn delete_gateway(&self, zone: &Zone, id: &str, release_ip: bool) -> Result<()>;

    async fn find_gateway_ip(&self, zone: &Zone, address: IpAddr) -> Result<Option<GatewayIp>>;

    async fn create_gateway_ip(&self, zone: &Zone, tags: &[String]) -> Result<GatewayIp>;

    async fn delete_gateway_ip(&self, zone: &Zone, id: &str) -> Result<()>;

    async fn list_gateway_networks(&self, zone: &Zone, gateway_id: &str)
    -> Result<Vec<GatewayNetwork>>;

    async fn create_gateway_network(
        &self,
        zone: &Zone,
        req: CreateGatewayNetworkRequest,
    ) -> Result<GatewayNetwork>;
}
