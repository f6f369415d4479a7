//! Load balancer API.

use std::net::IpAddr;

use anyhow::Result;
use async_trait::async_trait;
use ipnet::IpNet;

use super::{Region, Zone};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LbStatus {
    Pending,
    Ready,
    Migrating,
    Error,
    Unknown,
}

/// Flexible IP of a load balancer.
#[derive(Debug, Clone, PartialEq)]
pub struct LbIp {
    pub id: String,
    pub zone: Zone,
    pub address: IpAddr,
    pub tags: Vec<String>,
    pub lb_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadBalancer {
    pub id: String,
    pub name: String,
    pub zone: Zone,
    pub lb_type: String,
    pub status: LbStatus,
    pub ips: Vec<LbIp>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CreateLoadBalancerRequest {
    pub name: String,
    pub lb_type: String,
    pub ip_id: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LbPrivateNetwork {
    pub lb_id: String,
    pub private_network_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Backend {
    pub id: String,
    pub lb_id: String,
    pub name: String,
    pub port: u16,
    pub servers: Vec<IpAddr>,
}

#[derive(Debug, Clone)]
pub struct CreateBackendRequest {
    pub name: String,
    pub port: u16,
    pub servers: Vec<IpAddr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frontend {
    pub id: String,
    pub lb_id: String,
    pub name: String,
    pub port: u16,
    pub backend_id: String,
}

#[derive(Debug, Clone)]
pub struct CreateFrontendRequest {
    pub name: String,
    pub port: u16,
    pub backend_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclAction {
    Allow,
    Deny,
}

/// A frontend ACL rule. Rules are evaluated by ascending `index`;
/// an empty `ranges` matches every source.
#[derive(Debug, Clone, PartialEq)]
pub struct Acl {
    pub name: String,
    pub action: AclAction,
    pub ranges: Vec<IpNet>,
    pub index: u32,
}

#[async_trait]
pub trait LoadBalancerApi: Send + Sync {
    /// List load balancers carrying all of `tags` in every zone of `region`.
    async fn list_load_balancers(
        &self,
        region: &Region,
        tags: &[String],
    ) -> Result<Vec<LoadBalancer>>;

    /// Load balancer commercial types of a zone, from smallest to largest.
    async fn list_lb_types(&self, zone: &Zone) -> Result<Vec<String>>;

    async fn create_load_balancer(
        &self,
        zone: &Zone,
        req: CreateLoadBalancerRequest,
    ) -> Result<LoadBalancer>;

    /// Change the commercial type of a load balancer in place.
    async fn migrate_load_balancer(&self, zone: &Zone, id: &str, lb_type: &str)
    -> Result<LoadBalancer>;

    async fn delete_load_balancer(&self, zone: &Zone, id: &str, release_ip: bool) -> Result<()>;

    async fn find_lb_ip(&self, zone: &Zone, address: IpAddr) -> Result<Option<LbIp>>;

    async fn create_lb_ip(&self, zone: &Zone, tags: &[String]) -> Result<LbIp>;

    async fn delete_lb_ip(&self, zone: &Zone, id: &str) -> Result<()>;

    async fn list_lb_private_networks(&self, zone: &Zone, lb_id: &str)
    -> Result<Vec<LbPrivateNetwork>>;

    async fn attach_lb_private_network(
        &self,
        zone: &Zone,
        lb_id: &str,
        private_network_id: &str,
    ) -> Result<LbPrivateNetwork>;

    async fn list_backends(&self, zone: &Zone, lb_id: &str) -> Result<Vec<Backend>>;

    async fn create_backend(
        &self,
        zone: &Zone,
        lb_id: &str,
        req: CreateBackendRequest,
    ) -> Result<Backend>;

    /// Replace the server list of a backend.
    async fn set_backend_servers(
        &self,
        zone: &Zone,
        backend_id: &str,
        servers: &[IpAddr],
    ) -> Result<Backend>;

    async fn list_frontends(&self, zone: &Zone, lb_id: &str) -> Result<Vec<Frontend>>;

    async fn create_frontend(
        &self,
        zone: &Zone,
        lb_id: &str,
        req: CreateFrontendRequest,
    ) -> Result<Frontend>;

    async fn list_acls(&self, zone: &Zone, frontend_id: &str) -> Result<Vec<Acl>>;

    /// Replace every ACL of a frontend.
    async fn set_acls(&self, zone: &Zone, frontend_id: &str, acls: &[Acl]) -> Result<()>;
}
