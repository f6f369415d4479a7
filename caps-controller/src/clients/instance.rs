//! Instance (server) API.

use std::net::IpAddr;

use anyhow::Result;
use async_trait::async_trait;

use super::{Region, Zone};

/// Server power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    StoppedInPlace,
    Starting,
    Running,
    Stopping,
    Locked,
    Unknown,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Stopped => "stopped",
            ServerState::StoppedInPlace => "stopped in place",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Stopping => "stopping",
            ServerState::Locked => "locked",
            ServerState::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

/// Flexible IP of an instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceIp {
    pub id: String,
    pub zone: Zone,
    pub address: IpAddr,
    pub family: IpFamily,
    pub tags: Vec<String>,
    pub server_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrivateNic {
    pub id: String,
    pub server_id: String,
    pub private_network_id: String,
    pub mac_address: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub id: String,
    pub name: String,
    pub zone: Zone,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RootVolume {
    pub size_gb: u64,
    pub volume_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub zone: Zone,
    pub commercial_type: String,
    pub state: ServerState,
    pub image_id: String,
    pub root_volume_id: Option<String>,
    pub public_ips: Vec<InstanceIp>,
    pub private_nics: Vec<PrivateNic>,
    pub security_group_id: Option<String>,
    pub placement_group_id: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CreateServerRequest {
    pub name: String,
    pub commercial_type: String,
    pub image_id: String,
    pub root_volume: Option<RootVolume>,
    pub public_ip_ids: Vec<String>,
    pub security_group_id: Option<String>,
    pub placement_group_id: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerAction {
    PowerOn,
    PowerOff,
}

#[async_trait]
pub trait InstanceApi: Send + Sync {
    /// List servers carrying all of `tags` in `zone`.
    async fn list_servers(&self, zone: &Zone, tags: &[String]) -> Result<Vec<Server>>;

    async fn get_server(&self, zone: &Zone, id: &str) -> Result<Option<Server>>;

    async fn get_image(&self, zone: &Zone, id: &str) -> Result<Option<Image>>;

    /// Find images by exact name.
    async fn find_images(&self, zone: &Zone, name: &str) -> Result<Vec<Image>>;

    async fn create_server(&self, zone: &Zone, req: CreateServerRequest) -> Result<Server>;

    async fn server_action(&self, zone: &Zone, id: &str, action: ServerAction) -> Result<()>;

    /// Delete a stopped server. Attached flexible IPs are detached, volumes kept.
    async fn delete_server(&self, zone: &Zone, id: &str) -> Result<()>;

    async fn set_user_data(&self, zone: &Zone, id: &str, key: &str, data: &[u8]) -> Result<()>;

    /// List flexible IPs carrying all of `tags` in `zone`.
    async fn list_ips(&self, zone: &Zone, tags: &[String]) -> Result<Vec<InstanceIp>>;

    async fn create_ip(&self, zone: &Zone, family: IpFamily, tags: &[String]) -> Result<InstanceIp>;

    async fn delete_ip(&self, zone: &Zone, id: &str) -> Result<()>;

    async fn create_private_nic(
        &self,
        zone: &Zone,
        server_id: &str,
        private_network_id: &str,
    ) -> Result<PrivateNic>;

    async fn delete_volume(&self, zone: &Zone, id: &str) -> Result<()>;

    /// Addresses assigned by IPAM to a private NIC.
    async fn private_nic_ips(&self, region: &Region, private_nic_id: &str) -> Result<Vec<IpAddr>>;
}
