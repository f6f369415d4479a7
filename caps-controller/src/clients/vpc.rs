//! VPC and private network API.

use anyhow::Result;
use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net};

use super::Region;

/// A VPC.
#[derive(Debug, Clone, PartialEq)]
pub struct Vpc {
    pub id: String,
    pub name: String,
    pub region: Region,
    pub is_default: bool,
    pub tags: Vec<String>,
}

/// A regional private network.
#[derive(Debug, Clone, PartialEq)]
pub struct PrivateNetwork {
    pub id: String,
    pub name: String,
    pub region: Region,
    pub vpc_id: String,
    pub subnets: Vec<IpNet>,
    pub dhcp_enabled: bool,
    pub tags: Vec<String>,
}

/// Request to create a private network. DHCP is always enabled.
#[derive(Debug, Clone)]
pub struct CreatePrivateNetworkRequest {
    pub name: String,
    pub vpc_id: Option<String>,
    pub subnet: Option<Ipv4Net>,
    pub tags: Vec<String>,
}

#[async_trait]
pub trait VpcApi: Send + Sync {
    /// Get the default VPC of a region.
    async fn get_default_vpc(&self, region: &Region) -> Result<Vpc>;

    async fn get_vpc(&self, region: &Region, id: &str) -> Result<Option<Vpc>>;

    async fn get_private_network(&self, region: &Region, id: &str)
    -> Result<Option<PrivateNetwork>>;

    /// List private networks carrying all of `tags`.
    async fn list_private_networks(
        &self,
        region: &Region,
        tags: &[String],
    ) -> Result<Vec<PrivateNetwork>>;

    async fn create_private_network(
        &self,
        region: &Region,
        req: CreatePrivateNetworkRequest,
    ) -> Result<PrivateNetwork>;

    /// Delete a private network. Fails with a precondition error while
    /// resources are still attached to it.
    async fn delete_private_network(&self, region: &Region, id: &str) -> Result<()>;
}
