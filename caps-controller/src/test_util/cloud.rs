//! In-memory cloud provider.
//!
//! Behaves like the real APIs where reconcilers depend on it: tag filtering,
//! not-found and precondition errors, IP attachment, and resources that
//! become ready immediately unless told otherwise.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use ipnet::IpNet;
use uuid::Uuid;

use crate::clients::domain::{CreateDnsRecordRequest, DnsRecord, RecordType};
use crate::clients::instance::{
    CreateServerRequest, Image, InstanceIp, IpFamily, PrivateNic, Server, ServerAction,
    ServerState,
};
use crate::clients::k8s::{
    ClusterStatus, CreateClusterRequest, CreatePoolRequest, K8sCluster, Node, Pool, PoolStatus,
    UpdateClusterRequest, UpdatePoolRequest,
};
use crate::clients::lb::{
    Acl, Backend, CreateBackendRequest, CreateFrontendRequest, CreateLoadBalancerRequest,
    Frontend, LbIp, LbPrivateNetwork, LbStatus, LoadBalancer,
};
use crate::clients::vpc::{CreatePrivateNetworkRequest, PrivateNetwork, Vpc};
use crate::clients::vpcgw::{
    CreateGatewayNetworkRequest, CreateGatewayRequest, Gateway, GatewayIp, GatewayNetwork,
    GatewayStatus,
};
use crate::clients::{
    CloudClient, CloudClientFactory, CloudError, Credentials, DomainApi, GatewayApi, InstanceApi,
    K8sApi, LoadBalancerApi, Region, VpcApi, Zone, has_tags,
};
use crate::scope::machine::PROVIDER_ID_PREFIX;

const REGIONS: [&str; 3] = ["fr-par", "nl-ams", "pl-waw"];

pub const GATEWAY_TYPES: [&str; 4] = ["VPC-GW-S", "VPC-GW-M", "VPC-GW-L", "VPC-GW-XL"];
pub const LB_TYPES: [&str; 4] = ["LB-S", "LB-GP-M", "LB-GP-L", "LB-GP-XL"];
pub const CLUSTER_TYPES: [&str; 4] = [
    "kapsule",
    "kapsule-dedicated-4",
    "kapsule-dedicated-8",
    "kapsule-dedicated-16",
];

/// Image available in every zone.
pub const IMAGE_NAME: &str = "ubuntu_jammy";

#[derive(Default)]
struct State {
    mutations: usize,
    next_address: u32,
    credentials: Vec<Credentials>,

    vpcs: Vec<Vpc>,
    private_networks: Vec<PrivateNetwork>,
    networks_in_use: HashSet<String>,

    gateways: Vec<Gateway>,
    gateway_ips: Vec<GatewayIp>,
    gateway_networks: Vec<GatewayNetwork>,
    new_gateway_status: Option<GatewayStatus>,

    load_balancers: Vec<LoadBalancer>,
    lb_ips: Vec<LbIp>,
    lb_networks: Vec<LbPrivateNetwork>,
    backends: Vec<Backend>,
    frontends: Vec<Frontend>,
    acls: HashMap<String, Vec<Acl>>,

    dns_records: Vec<DnsRecord>,

    images: Vec<Image>,
    servers: Vec<Server>,
    instance_ips: Vec<InstanceIp>,
    volumes: Vec<String>,
    user_data: HashMap<(String, String), Vec<u8>>,
    nic_ips: HashMap<String, IpAddr>,
    server_quota: Option<usize>,

    clusters: Vec<K8sCluster>,
    pools: Vec<Pool>,
    nodes: Vec<Node>,
}

impl State {
    fn next(&mut self) -> u32 {
        self.next_address += 1;
        self.next_address
    }

    fn public_v4(&mut self) -> IpAddr {
        let n = self.next();
        IpAddr::V4(Ipv4Addr::new(51, 158, (n >> 8) as u8, n as u8))
    }

    fn public_v6(&mut self) -> IpAddr {
        let n = self.next();
        IpAddr::V6(Ipv6Addr::new(0x2001, 0xbc8, 0x1200, 0, 0, 0, 0, n as u16))
    }

    fn private_v4(&mut self) -> IpAddr {
        let n = self.next();
        IpAddr::V4(Ipv4Addr::new(172, 16, (n >> 8) as u8, n as u8))
    }

    fn network_in_use(&self, id: &str) -> bool {
        self.networks_in_use.contains(id)
            || self.gateway_networks.iter().any(|gn| gn.private_network_id == id)
            || self.lb_networks.iter().any(|n| n.private_network_id == id)
            || self
                .servers
                .iter()
                .any(|s| s.private_nics.iter().any(|n| n.private_network_id == id))
            || self
                .clusters
                .iter()
                .any(|c| c.private_network_id.as_deref() == Some(id))
    }

    fn resize_nodes(&mut self, pool: &Pool) {
        let current: Vec<usize> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.pool_id == pool.id)
            .map(|(i, _)| i)
            .collect();
        let wanted = pool.size as usize;
        if current.len() > wanted {
            let extra: HashSet<usize> = current[wanted..].iter().copied().collect();
            let mut index = 0;
            self.nodes.retain(|_| {
                let keep = !extra.contains(&index);
                index += 1;
                keep
            });
            return;
        }
        for i in current.len()..wanted {
            self.nodes.push(Node {
                id: Uuid::new_v4().to_string(),
                pool_id: pool.id.clone(),
                name: format!("scw-{}-{}", pool.name, i),
                provider_id: format!("{}{}/{}", PROVIDER_ID_PREFIX, pool.zone, Uuid::new_v4()),
                ready: true,
            });
        }
    }
}

fn not_found(kind: &str, id: &str) -> anyhow::Error {
    CloudError::not_found(kind, id).into()
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Provider double shared by every object of a test.
pub struct InMemoryCloud {
    this: Weak<InMemoryCloud>,
    state: Mutex<State>,
}

impl InMemoryCloud {
    pub fn new() -> Arc<Self> {
        let mut state = State::default();
        for region in REGIONS.iter().filter_map(|r| Region::parse(r).ok()) {
            state.vpcs.push(Vpc {
                id: new_id(),
                name: "default".to_string(),
                region: region.clone(),
                is_default: true,
                tags: Vec::new(),
            });
            for zone in region.zones() {
                state.images.push(Image {
                    id: new_id(),
                    name: IMAGE_NAME.to_string(),
                    zone,
                });
            }
        }
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            state: Mutex::new(state),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mutate(&self) -> MutexGuard<'_, State> {
        let mut state = self.state();
        state.mutations += 1;
        state
    }

    /// Number of create, update, delete and action calls so far.
    pub fn mutating_calls(&self) -> usize {
        self.state().mutations
    }

    /// Credentials clients were requested for, in order.
    pub fn credentials(&self) -> Vec<Credentials> {
        self.state().credentials.clone()
    }

    pub fn seed_private_network(
        &self,
        name: &str,
        dhcp_enabled: bool,
        tags: &[&str],
    ) -> PrivateNetwork {
        let mut state = self.state();
        let region = Region::parse(REGIONS[0]).expect("known region");
        let vpc_id = state
            .vpcs
            .iter()
            .find(|v| v.is_default && v.region == region)
            .map(|v| v.id.clone())
            .unwrap_or_default();
        let pn = PrivateNetwork {
            id: new_id(),
            name: name.to_string(),
            region,
            vpc_id,
            subnets: vec!["192.168.0.0/24".parse().expect("valid subnet")],
            dhcp_enabled,
            tags: tags.iter().map(|t| t.to_string()).collect(),
        };
        state.private_networks.push(pn.clone());
        pn
    }

    /// Make deleting the private network fail as if resources were attached.
    pub fn set_private_network_in_use(&self, id: &str, in_use: bool) {
        let mut state = self.state();
        if in_use {
            state.networks_in_use.insert(id.to_string());
        } else {
            state.networks_in_use.remove(id);
        }
    }

    pub fn seed_gateway_ip(&self, zone: &Zone, address: &str) -> GatewayIp {
        let ip = GatewayIp {
            id: new_id(),
            zone: zone.clone(),
            address: address.parse().expect("valid address"),
            tags: Vec::new(),
            gateway_id: None,
        };
        self.state().gateway_ips.push(ip.clone());
        ip
    }

    pub fn gateway_ips(&self, zone: &Zone) -> Vec<GatewayIp> {
        self.state()
            .gateway_ips
            .iter()
            .filter(|ip| ip.zone == *zone)
            .cloned()
            .collect()
    }

    /// Status of gateways created from now on.
    pub fn set_new_gateway_status(&self, status: GatewayStatus) {
        self.state().new_gateway_status = Some(status);
    }

    /// Detach the IP of a gateway behind the controller's back.
    pub fn strip_gateway_ip(&self, gateway_id: &str) {
        let mut state = self.state();
        for ip in state.gateway_ips.iter_mut() {
            if ip.gateway_id.as_deref() == Some(gateway_id) {
                ip.gateway_id = None;
            }
        }
        if let Some(gateway) = state.gateways.iter_mut().find(|g| g.id == gateway_id) {
            gateway.ip = None;
        }
    }

    pub fn lb_ips(&self) -> Vec<LbIp> {
        self.state().lb_ips.clone()
    }

    pub fn seed_dns_record(
        &self,
        dns_zone: &str,
        name: &str,
        data: &str,
        comment: Option<&str>,
    ) -> DnsRecord {
        let record_type = match data.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => RecordType::Aaaa,
            _ => RecordType::A,
        };
        let record = DnsRecord {
            id: new_id(),
            dns_zone: dns_zone.to_string(),
            name: name.to_string(),
            record_type,
            data: data.to_string(),
            ttl: 3600,
            comment: comment.map(str::to_string),
        };
        self.state().dns_records.push(record.clone());
        record
    }

    pub fn user_data(&self, server_id: &str, key: &str) -> Option<Vec<u8>> {
        self.state()
            .user_data
            .get(&(server_id.to_string(), key.to_string()))
            .cloned()
    }

    pub fn volume_count(&self) -> usize {
        self.state().volumes.len()
    }

    /// Refuse server creation once `limit` servers exist.
    pub fn set_server_quota(&self, limit: usize) {
        self.state().server_quota = Some(limit);
    }

    /// Put a server into `state`, e.g. to simulate a provider lock.
    pub fn set_server_state(&self, server_id: &str, state: ServerState) {
        if let Some(server) = self.state().servers.iter_mut().find(|s| s.id == server_id) {
            server.state = state;
        }
    }
}

#[async_trait]
impl CloudClientFactory for InMemoryCloud {
    async fn client(&self, credentials: &Credentials) -> Result<Arc<dyn CloudClient>> {
        self.state().credentials.push(credentials.clone());
        let cloud = self
            .this
            .upgrade()
            .ok_or_else(|| anyhow!("in-memory cloud was dropped"))?;
        Ok(cloud)
    }
}

#[async_trait]
impl VpcApi for InMemoryCloud {
    async fn get_default_vpc(&self, region: &Region) -> Result<Vpc> {
        self.state()
            .vpcs
            .iter()
            .find(|v| v.is_default && v.region == *region)
            .cloned()
            .ok_or_else(|| not_found("default VPC", region.as_str()))
    }

    async fn get_vpc(&self, region: &Region, id: &str) -> Result<Option<Vpc>> {
        Ok(self
            .state()
            .vpcs
            .iter()
            .find(|v| v.region == *region && v.id == id)
            .cloned())
    }

    async fn get_private_network(
        &self,
        region: &Region,
        id: &str,
    ) -> Result<Option<PrivateNetwork>> {
        Ok(self
            .state()
            .private_networks
            .iter()
            .find(|pn| pn.region == *region && pn.id == id)
            .cloned())
    }

    async fn list_private_networks(
        &self,
        region: &Region,
        tags: &[String],
    ) -> Result<Vec<PrivateNetwork>> {
        Ok(self
            .state()
            .private_networks
            .iter()
            .filter(|pn| pn.region == *region && has_tags(&pn.tags, tags))
            .cloned()
            .collect())
    }

    async fn create_private_network(
        &self,
        region: &Region,
        req: CreatePrivateNetworkRequest,
    ) -> Result<PrivateNetwork> {
        let mut state = self.mutate();
        let vpc_id = match req.vpc_id {
            Some(id) if state.vpcs.iter().any(|v| v.id == id) => id,
            Some(id) => return Err(not_found("VPC", &id)),
            None => state
                .vpcs
                .iter()
                .find(|v| v.is_default && v.region == *region)
                .map(|v| v.id.clone())
                .ok_or_else(|| not_found("default VPC", region.as_str()))?,
        };
        let subnet = match req.subnet {
            Some(subnet) => subnet,
            None => {
                let n = state.private_networks.len() % 64;
                format!("172.16.{}.0/22", n * 4).parse()?
            }
        };
        let pn = PrivateNetwork {
            id: new_id(),
            name: req.name,
            region: region.clone(),
            vpc_id,
            subnets: vec![IpNet::V4(subnet)],
            dhcp_enabled: true,
            tags: req.tags,
        };
        state.private_networks.push(pn.clone());
        Ok(pn)
    }

    async fn delete_private_network(&self, region: &Region, id: &str) -> Result<()> {
        let mut state = self.mutate();
        if !state
            .private_networks
            .iter()
            .any(|pn| pn.region == *region && pn.id == id)
        {
            return Err(not_found("private network", id));
        }
        if state.network_in_use(id) {
            return Err(CloudError::PreconditionFailed(format!(
                "private network {} has attached resources",
                id
            ))
            .into());
        }
        state.private_networks.retain(|pn| pn.id != id);
        Ok(())
    }
}

#[async_trait]
impl GatewayApi for InMemoryCloud {
    async fn list_gateways(&self, region: &Region, tags: &[String]) -> Result<Vec<Gateway>> {
        Ok(self
            .state()
            .gateways
            .iter()
            .filter(|g| region.contains(&g.zone) && has_tags(&g.tags, tags))
            .cloned()
            .collect())
    }

    async fn get_gateway(&self, zone: &Zone, id: &str) -> Result<Option<Gateway>> {
        Ok(self
            .state()
            .gateways
            .iter()
            .find(|g| g.zone == *zone && g.id == id)
            .cloned())
    }

    async fn list_gateway_types(&self, _zone: &Zone) -> Result<Vec<String>> {
        Ok(GATEWAY_TYPES.iter().map(|t| t.to_string()).collect())
    }

    async fn create_gateway(&self, zone: &Zone, req: CreateGatewayRequest) -> Result<Gateway> {
        let mut state = self.mutate();
        if !GATEWAY_TYPES.contains(&req.gateway_type.as_str()) {
            return Err(CloudError::InvalidArgument(format!(
                "unknown gateway type {}",
                req.gateway_type
            ))
            .into());
        }
        let id = new_id();
        let ip = match req.ip_id {
            Some(ip_id) => {
                let ip = state
                    .gateway_ips
                    .iter_mut()
                    .find(|ip| ip.zone == *zone && ip.id == ip_id)
                    .ok_or_else(|| not_found("gateway IP", &ip_id))?;
                if ip.gateway_id.is_some() {
                    return Err(CloudError::Conflict(format!(
                        "gateway IP {} is in use",
                        ip_id
                    ))
                    .into());
                }
                ip.gateway_id = Some(id.clone());
                ip.clone()
            }
            None => {
                let ip = GatewayIp {
                    id: new_id(),
                    zone: zone.clone(),
                    address: state.public_v4(),
                    tags: Vec::new(),
                    gateway_id: Some(id.clone()),
                };
                state.gateway_ips.push(ip.clone());
                ip
            }
        };
        let gateway = Gateway {
            id,
            name: req.name,
            zone: zone.clone(),
            gateway_type: req.gateway_type,
            status: state.new_gateway_status.unwrap_or(GatewayStatus::Running),
            ip: Some(ip),
            tags: req.tags,
        };
        state.gateways.push(gateway.clone());
        Ok(gateway)
    }

    async fn upgrade_gateway(&self, zone: &Zone, id: &str, gateway_type: &str) -> Result<Gateway> {
        let mut state = self.mutate();
        let gateway = state
            .gateways
            .iter_mut()
            .find(|g| g.zone == *zone && g.id == id)
            .ok_or_else(|| not_found("gateway", id))?;
        gateway.gateway_type = gateway_type.to_string();
        Ok(gateway.clone())
    }

    async fn delete_gateway(&self, zone: &Zone, id: &str, release_ip: bool) -> Result<()> {
        let mut state = self.mutate();
        let Some(index) = state.gateways.iter().position(|g| g.zone == *zone && g.id == id) else {
            return Err(not_found("gateway", id));
        };
        let gateway = state.gateways.remove(index);
        state.gateway_networks.retain(|gn| gn.gateway_id != id);
        if let Some(ip) = gateway.ip {
            if release_ip {
                state.gateway_ips.retain(|i| i.id != ip.id);
            } else if let Some(i) = state.gateway_ips.iter_mut().find(|i| i.id == ip.id) {
                i.gateway_id = None;
            }
        }
        Ok(())
    }

    async fn find_gateway_ip(&self, zone: &Zone, address: IpAddr) -> Result<Option<GatewayIp>> {
        Ok(self
            .state()
            .gateway_ips
            .iter()
            .find(|ip| ip.zone == *zone && ip.address == address)
            .cloned())
    }

    async fn create_gateway_ip(&self, zone: &Zone, tags: &[String]) -> Result<GatewayIp> {
        let mut state = self.mutate();
        let ip = GatewayIp {
            id: new_id(),
            zone: zone.clone(),
            address: state.public_v4(),
            tags: tags.to_vec(),
            gateway_id: None,
        };
        state.gateway_ips.push(ip.clone());
        Ok(ip)
    }

    async fn delete_gateway_ip(&self, zone: &Zone, id: &str) -> Result<()> {
        let mut state = self.mutate();
        let before = state.gateway_ips.len();
        state.gateway_ips.retain(|ip| !(ip.zone == *zone && ip.id == id));
        if state.gateway_ips.len() == before {
            return Err(not_found("gateway IP", id));
        }
        Ok(())
    }

    async fn list_gateway_networks(
        &self,
        _zone: &Zone,
        gateway_id: &str,
    ) -> Result<Vec<GatewayNetwork>> {
        Ok(self
            .state()
            .gateway_networks
            .iter()
            .filter(|gn| gn.gateway_id == gateway_id)
            .cloned()
            .collect())
    }

    async fn create_gateway_network(
        &self,
        zone: &Zone,
        req: CreateGatewayNetworkRequest,
    ) -> Result<GatewayNetwork> {
        let mut state = self.mutate();
        if !state.gateways.iter().any(|g| g.zone == *zone && g.id == req.gateway_id) {
            return Err(not_found("gateway", &req.gateway_id));
        }
        let network = GatewayNetwork {
            id: new_id(),
            gateway_id: req.gateway_id,
            private_network_id: req.private_network_id,
            enable_masquerade: req.enable_masquerade,
            push_default_route: req.push_default_route,
        };
        state.gateway_networks.push(network.clone());
        Ok(network)
    }
}

#[async_trait]
impl LoadBalancerApi for InMemoryCloud {
    async fn list_load_balancers(
        &self,
        region: &Region,
        tags: &[String],
    ) -> Result<Vec<LoadBalancer>> {
        Ok(self
            .state()
            .load_balancers
            .iter()
            .filter(|lb| region.contains(&lb.zone) && has_tags(&lb.tags, tags))
            .cloned()
            .collect())
    }

    async fn list_lb_types(&self, _zone: &Zone) -> Result<Vec<String>> {
        Ok(LB_TYPES.iter().map(|t| t.to_string()).collect())
    }

    async fn create_load_balancer(
        &self,
        zone: &Zone,
        req: CreateLoadBalancerRequest,
    ) -> Result<LoadBalancer> {
        let mut state = self.mutate();
        let id = new_id();
        let ip = match req.ip_id {
            Some(ip_id) => {
                let ip = state
                    .lb_ips
                    .iter_mut()
                    .find(|ip| ip.zone == *zone && ip.id == ip_id)
                    .ok_or_else(|| not_found("load balancer IP", &ip_id))?;
                if ip.lb_id.is_some() {
                    return Err(CloudError::Conflict(format!(
                        "load balancer IP {} is in use",
                        ip_id
                    ))
                    .into());
                }
                ip.lb_id = Some(id.clone());
                ip.clone()
            }
            None => {
                let ip = LbIp {
                    id: new_id(),
                    zone: zone.clone(),
                    address: state.public_v4(),
                    tags: Vec::new(),
                    lb_id: Some(id.clone()),
                };
                state.lb_ips.push(ip.clone());
                ip
            }
        };
        let lb = LoadBalancer {
            id,
            name: req.name,
            zone: zone.clone(),
            lb_type: req.lb_type,
            status: LbStatus::Ready,
            ips: vec![ip],
            tags: req.tags,
        };
        state.load_balancers.push(lb.clone());
        Ok(lb)
    }

    async fn migrate_load_balancer(
        &self,
        zone: &Zone,
        id: &str,
        lb_type: &str,
    ) -> Result<LoadBalancer> {
        let mut state = self.mutate();
        let lb = state
            .load_balancers
            .iter_mut()
            .find(|lb| lb.zone == *zone && lb.id == id)
            .ok_or_else(|| not_found("load balancer", id))?;
        lb.lb_type = lb_type.to_string();
        Ok(lb.clone())
    }

    async fn delete_load_balancer(&self, zone: &Zone, id: &str, release_ip: bool) -> Result<()> {
        let mut state = self.mutate();
        let Some(index) = state
            .load_balancers
            .iter()
            .position(|lb| lb.zone == *zone && lb.id == id)
        else {
            return Err(not_found("load balancer", id));
        };
        state.load_balancers.remove(index);
        state.lb_networks.retain(|n| n.lb_id != id);
        state.backends.retain(|b| b.lb_id != id);
        let frontends: Vec<String> = state
            .frontends
            .iter()
            .filter(|f| f.lb_id == id)
            .map(|f| f.id.clone())
            .collect();
        for frontend in &frontends {
            state.acls.remove(frontend);
        }
        state.frontends.retain(|f| f.lb_id != id);
        if release_ip {
            state.lb_ips.retain(|ip| ip.lb_id.as_deref() != Some(id));
        } else {
            for ip in state.lb_ips.iter_mut().filter(|ip| ip.lb_id.as_deref() == Some(id)) {
                ip.lb_id = None;
            }
        }
        Ok(())
    }

    async fn find_lb_ip(&self, zone: &Zone, address: IpAddr) -> Result<Option<LbIp>> {
        Ok(self
            .state()
            .lb_ips
            .iter()
            .find(|ip| ip.zone == *zone && ip.address == address)
            .cloned())
    }

    async fn create_lb_ip(&self, zone: &Zone, tags: &[String]) -> Result<LbIp> {
        let mut state = self.mutate();
        let ip = LbIp {
            id: new_id(),
            zone: zone.clone(),
            address: state.public_v4(),
            tags: tags.to_vec(),
            lb_id: None,
        };
        state.lb_ips.push(ip.clone());
        Ok(ip)
    }

    async fn delete_lb_ip(&self, zone: &Zone, id: &str) -> Result<()> {
        let mut state = self.mutate();
        let before = state.lb_ips.len();
        state.lb_ips.retain(|ip| !(ip.zone == *zone && ip.id == id));
        if state.lb_ips.len() == before {
            return Err(not_found("load balancer IP", id));
        }
        Ok(())
    }

    async fn list_lb_private_networks(
        &self,
        _zone: &Zone,
        lb_id: &str,
    ) -> Result<Vec<LbPrivateNetwork>> {
        Ok(self
            .state()
            .lb_networks
            .iter()
            .filter(|n| n.lb_id == lb_id)
            .cloned()
            .collect())
    }

    async fn attach_lb_private_network(
        &self,
        zone: &Zone,
        lb_id: &str,
        private_network_id: &str,
    ) -> Result<LbPrivateNetwork> {
        let mut state = self.mutate();
        if !state.load_balancers.iter().any(|lb| lb.zone == *zone && lb.id == lb_id) {
            return Err(not_found("load balancer", lb_id));
        }
        let attachment = LbPrivateNetwork {
            lb_id: lb_id.to_string(),
            private_network_id: private_network_id.to_string(),
        };
        state.lb_networks.push(attachment.clone());
        Ok(attachment)
    }

    async fn list_backends(&self, _zone: &Zone, lb_id: &str) -> Result<Vec<Backend>> {
        Ok(self
            .state()
            .backends
            .iter()
            .filter(|b| b.lb_id == lb_id)
            .cloned()
            .collect())
    }

    async fn create_backend(
        &self,
        _zone: &Zone,
        lb_id: &str,
        req: CreateBackendRequest,
    ) -> Result<Backend> {
        let mut state = self.mutate();
        let backend = Backend {
            id: new_id(),
            lb_id: lb_id.to_string(),
            name: req.name,
            port: req.port,
            servers: req.servers,
        };
        state.backends.push(backend.clone());
        Ok(backend)
    }

    async fn set_backend_servers(
        &self,
        _zone: &Zone,
        backend_id: &str,
        servers: &[IpAddr],
    ) -> Result<Backend> {
        let mut state = self.mutate();
        let backend = state
            .backends
            .iter_mut()
            .find(|b| b.id == backend_id)
            .ok_or_else(|| not_found("backend", backend_id))?;
        backend.servers = servers.to_vec();
        Ok(backend.clone())
    }

    async fn list_frontends(&self, _zone: &Zone, lb_id: &str) -> Result<Vec<Frontend>> {
        Ok(self
            .state()
            .frontends
            .iter()
            .filter(|f| f.lb_id == lb_id)
            .cloned()
            .collect())
    }

    async fn create_frontend(
        &self,
        _zone: &Zone,
        lb_id: &str,
        req: CreateFrontendRequest,
    ) -> Result<Frontend> {
        let mut state = self.mutate();
        let frontend = Frontend {
            id: new_id(),
            lb_id: lb_id.to_string(),
            name: req.name,
            port: req.port,
            backend_id: req.backend_id,
        };
        state.frontends.push(frontend.clone());
        Ok(frontend)
    }

    async fn list_acls(&self, _zone: &Zone, frontend_id: &str) -> Result<Vec<Acl>> {
        Ok(self.state().acls.get(frontend_id).cloned().unwrap_or_default())
    }

    async fn set_acls(&self, _zone: &Zone, frontend_id: &str, acls: &[Acl]) -> Result<()> {
        self.mutate().acls.insert(frontend_id.to_string(), acls.to_vec());
        Ok(())
    }
}

#[async_trait]
impl DomainApi for InMemoryCloud {
    async fn list_dns_records(&self, dns_zone: &str, name: &str) -> Result<Vec<DnsRecord>> {
        Ok(self
            .state()
            .dns_records
            .iter()
            .filter(|r| r.dns_zone == dns_zone && r.name == name)
            .cloned()
            .collect())
    }

    async fn create_dns_record(
        &self,
        dns_zone: &str,
        req: CreateDnsRecordRequest,
    ) -> Result<DnsRecord> {
        let record = DnsRecord {
            id: new_id(),
            dns_zone: dns_zone.to_string(),
            name: req.name,
            record_type: req.record_type,
            data: req.data,
            ttl: req.ttl,
            comment: req.comment,
        };
        self.mutate().dns_records.push(record.clone());
        Ok(record)
    }

    async fn delete_dns_record(&self, dns_zone: &str, id: &str) -> Result<()> {
        let mut state = self.mutate();
        let before = state.dns_records.len();
        state.dns_records.retain(|r| !(r.dns_zone == dns_zone && r.id == id));
        if state.dns_records.len() == before {
            return Err(not_found("DNS record", id));
        }
        Ok(())
    }
}

#[async_trait]
impl InstanceApi for InMemoryCloud {
    async fn list_servers(&self, zone: &Zone, tags: &[String]) -> Result<Vec<Server>> {
        Ok(self
            .state()
            .servers
            .iter()
            .filter(|s| s.zone == *zone && has_tags(&s.tags, tags))
            .cloned()
            .collect())
    }

    async fn get_server(&self, zone: &Zone, id: &str) -> Result<Option<Server>> {
        Ok(self
            .state()
            .servers
            .iter()
            .find(|s| s.zone == *zone && s.id == id)
            .cloned())
    }

    async fn get_image(&self, zone: &Zone, id: &str) -> Result<Option<Image>> {
        Ok(self
            .state()
            .images
            .iter()
            .find(|i| i.zone == *zone && i.id == id)
            .cloned())
    }

    async fn find_images(&self, zone: &Zone, name: &str) -> Result<Vec<Image>> {
        Ok(self
            .state()
            .images
            .iter()
            .filter(|i| i.zone == *zone && i.name == name)
            .cloned()
            .collect())
    }

    async fn create_server(&self, zone: &Zone, req: CreateServerRequest) -> Result<Server> {
        let mut state = self.mutate();
        if !state.images.iter().any(|i| i.zone == *zone && i.id == req.image_id) {
            return Err(CloudError::InvalidArgument(format!(
                "unknown image {}",
                req.image_id
            ))
            .into());
        }
        if let Some(limit) = state.server_quota
            && state.servers.len() >= limit
        {
            return Err(CloudError::QuotaExceeded(format!("servers: {}", limit)).into());
        }
        let id = new_id();
        let mut public_ips = Vec::with_capacity(req.public_ip_ids.len());
        for ip_id in &req.public_ip_ids {
            let ip = state
                .instance_ips
                .iter_mut()
                .find(|ip| ip.zone == *zone && ip.id == *ip_id)
                .ok_or_else(|| not_found("flexible IP", ip_id))?;
            if ip.server_id.is_some() {
                return Err(CloudError::Conflict(format!(
                    "flexible IP {} is attached",
                    ip_id
                ))
                .into());
            }
            ip.server_id = Some(id.clone());
            public_ips.push(ip.clone());
        }
        let volume_id = new_id();
        state.volumes.push(volume_id.clone());

        let server = Server {
            id,
            name: req.name,
            zone: zone.clone(),
            commercial_type: req.commercial_type,
            state: ServerState::Stopped,
            image_id: req.image_id,
            root_volume_id: Some(volume_id),
            public_ips,
            private_nics: Vec::new(),
            security_group_id: req.security_group_id,
            placement_group_id: req.placement_group_id,
            tags: req.tags,
        };
        state.servers.push(server.clone());
        Ok(server)
    }

    async fn server_action(&self, zone: &Zone, id: &str, action: ServerAction) -> Result<()> {
        let mut state = self.mutate();
        let server = state
            .servers
            .iter_mut()
            .find(|s| s.zone == *zone && s.id == id)
            .ok_or_else(|| not_found("server", id))?;
        server.state = match action {
            ServerAction::PowerOn => ServerState::Running,
            ServerAction::PowerOff => ServerState::Stopped,
        };
        Ok(())
    }

    async fn delete_server(&self, zone: &Zone, id: &str) -> Result<()> {
        let mut state = self.mutate();
        let Some(index) = state.servers.iter().position(|s| s.zone == *zone && s.id == id) else {
            return Err(not_found("server", id));
        };
        if !matches!(
            state.servers[index].state,
            ServerState::Stopped | ServerState::StoppedInPlace
        ) {
            return Err(CloudError::PreconditionFailed(format!(
                "server {} is not stopped",
                id
            ))
            .into());
        }
        let server = state.servers.remove(index);
        for ip in state
            .instance_ips
            .iter_mut()
            .filter(|ip| ip.server_id.as_deref() == Some(id))
        {
            ip.server_id = None;
        }
        for nic in &server.private_nics {
            state.nic_ips.remove(&nic.id);
        }
        state.user_data.retain(|(server_id, _), _| server_id != id);
        Ok(())
    }

    async fn set_user_data(&self, zone: &Zone, id: &str, key: &str, data: &[u8]) -> Result<()> {
        let mut state = self.mutate();
        if !state.servers.iter().any(|s| s.zone == *zone && s.id == id) {
            return Err(not_found("server", id));
        }
        state
            .user_data
            .insert((id.to_string(), key.to_string()), data.to_vec());
        Ok(())
    }

    async fn list_ips(&self, zone: &Zone, tags: &[String]) -> Result<Vec<InstanceIp>> {
        Ok(self
            .state()
            .instance_ips
            .iter()
            .filter(|ip| ip.zone == *zone && has_tags(&ip.tags, tags))
            .cloned()
            .collect())
    }

    async fn create_ip(
        &self,
        zone: &Zone,
        family: IpFamily,
        tags: &[String],
    ) -> Result<InstanceIp> {
        let mut state = self.mutate();
        let address = match family {
            IpFamily::V4 => state.public_v4(),
            IpFamily::V6 => state.public_v6(),
        };
        let ip = InstanceIp {
            id: new_id(),
            zone: zone.clone(),
            address,
            family,
            tags: tags.to_vec(),
            server_id: None,
        };
        state.instance_ips.push(ip.clone());
        Ok(ip)
    }

    async fn delete_ip(&self, zone: &Zone, id: &str) -> Result<()> {
        let mut state = self.mutate();
        let before = state.instance_ips.len();
        state.instance_ips.retain(|ip| !(ip.zone == *zone && ip.id == id));
        if state.instance_ips.len() == before {
            return Err(not_found("flexible IP", id));
        }
        for server in state.servers.iter_mut() {
            server.public_ips.retain(|ip| ip.id != id);
        }
        Ok(())
    }

    async fn create_private_nic(
        &self,
        zone: &Zone,
        server_id: &str,
        private_network_id: &str,
    ) -> Result<PrivateNic> {
        let mut state = self.mutate();
        if !state.private_networks.iter().any(|pn| pn.id == private_network_id) {
            return Err(not_found("private network", private_network_id));
        }
        let address = state.private_v4();
        let n = state.next_address;
        let server = state
            .servers
            .iter_mut()
            .find(|s| s.zone == *zone && s.id == server_id)
            .ok_or_else(|| not_found("server", server_id))?;
        let nic = PrivateNic {
            id: new_id(),
            server_id: server_id.to_string(),
            private_network_id: private_network_id.to_string(),
            mac_address: format!("02:00:00:00:{:02x}:{:02x}", (n >> 8) as u8, n as u8),
        };
        server.private_nics.push(nic.clone());
        state.nic_ips.insert(nic.id.clone(), address);
        Ok(nic)
    }

    async fn delete_volume(&self, _zone: &Zone, id: &str) -> Result<()> {
        let mut state = self.mutate();
        let before = state.volumes.len();
        state.volumes.retain(|v| v != id);
        if state.volumes.len() == before {
            return Err(not_found("volume", id));
        }
        Ok(())
    }

    async fn private_nic_ips(&self, _region: &Region, private_nic_id: &str) -> Result<Vec<IpAddr>> {
        self.state()
            .nic_ips
            .get(private_nic_id)
            .map(|ip| vec![*ip])
            .ok_or_else(|| not_found("private NIC", private_nic_id))
    }
}

#[async_trait]
impl K8sApi for InMemoryCloud {
    async fn list_clusters(&self, region: &Region, tags: &[String]) -> Result<Vec<K8sCluster>> {
        Ok(self
            .state()
            .clusters
            .iter()
            .filter(|c| c.region == *region && has_tags(&c.tags, tags))
            .cloned()
            .collect())
    }

    async fn get_cluster(&self, region: &Region, id: &str) -> Result<Option<K8sCluster>> {
        Ok(self
            .state()
            .clusters
            .iter()
            .find(|c| c.region == *region && c.id == id)
            .cloned())
    }

    async fn create_cluster(
        &self,
        region: &Region,
        req: CreateClusterRequest,
    ) -> Result<K8sCluster> {
        let mut state = self.mutate();
        if state.clusters.iter().any(|c| c.region == *region && c.name == req.name) {
            return Err(CloudError::Conflict(format!("cluster {} already exists", req.name)).into());
        }
        if let Some(pn_id) = &req.private_network_id
            && !state.private_networks.iter().any(|pn| pn.id == *pn_id)
        {
            return Err(not_found("private network", pn_id));
        }
        let id = new_id();
        let cluster = K8sCluster {
            cluster_url: format!("https://{}.api.k8s.{}.scw.cloud:6443", id, region),
            id,
            name: req.name,
            region: region.clone(),
            cluster_type: req.cluster_type,
            version: req.version,
            cni: req.cni,
            status: ClusterStatus::PoolRequired,
            private_network_id: req.private_network_id,
            tags: req.tags,
            feature_gates: req.feature_gates,
            admission_plugins: req.admission_plugins,
            apiserver_cert_sans: req.apiserver_cert_sans,
            autoscaler_config: req.autoscaler_config,
            auto_upgrade: req.auto_upgrade,
        };
        state.clusters.push(cluster.clone());
        Ok(cluster)
    }

    async fn update_cluster(
        &self,
        region: &Region,
        id: &str,
        req: UpdateClusterRequest,
    ) -> Result<K8sCluster> {
        let mut state = self.mutate();
        let cluster = state
            .clusters
            .iter_mut()
            .find(|c| c.region == *region && c.id == id)
            .ok_or_else(|| not_found("cluster", id))?;
        if let Some(tags) = req.tags {
            cluster.tags = tags;
        }
        if let Some(gates) = req.feature_gates {
            cluster.feature_gates = gates;
        }
        if let Some(plugins) = req.admission_plugins {
            cluster.admission_plugins = plugins;
        }
        if let Some(sans) = req.apiserver_cert_sans {
            cluster.apiserver_cert_sans = sans;
        }
        if let Some(config) = req.autoscaler_config {
            cluster.autoscaler_config = config;
        }
        if let Some(upgrade) = req.auto_upgrade {
            cluster.auto_upgrade = upgrade;
        }
        Ok(cluster.clone())
    }

    async fn upgrade_cluster(
        &self,
        region: &Region,
        id: &str,
        version: &str,
    ) -> Result<K8sCluster> {
        let mut state = self.mutate();
        let cluster = state
            .clusters
            .iter_mut()
            .find(|c| c.region == *region && c.id == id)
            .ok_or_else(|| not_found("cluster", id))?;
        cluster.version = version.to_string();
        Ok(cluster.clone())
    }

    async fn set_cluster_type(
        &self,
        region: &Region,
        id: &str,
        cluster_type: &str,
    ) -> Result<K8sCluster> {
        let mut state = self.mutate();
        if !CLUSTER_TYPES.contains(&cluster_type) {
            return Err(CloudError::InvalidArgument(format!(
                "unknown cluster type {}",
                cluster_type
            ))
            .into());
        }
        let cluster = state
            .clusters
            .iter_mut()
            .find(|c| c.region == *region && c.id == id)
            .ok_or_else(|| not_found("cluster", id))?;
        cluster.cluster_type = cluster_type.to_string();
        Ok(cluster.clone())
    }

    async fn delete_cluster(
        &self,
        region: &Region,
        id: &str,
        _with_additional_resources: bool,
    ) -> Result<()> {
        let mut state = self.mutate();
        let before = state.clusters.len();
        state.clusters.retain(|c| !(c.region == *region && c.id == id));
        if state.clusters.len() == before {
            return Err(not_found("cluster", id));
        }
        let pools: HashSet<String> = state
            .pools
            .iter()
            .filter(|p| p.cluster_id == id)
            .map(|p| p.id.clone())
            .collect();
        state.pools.retain(|p| p.cluster_id != id);
        state.nodes.retain(|n| !pools.contains(&n.pool_id));
        Ok(())
    }

    async fn list_cluster_types(&self, _region: &Region) -> Result<Vec<String>> {
        Ok(CLUSTER_TYPES.iter().map(|t| t.to_string()).collect())
    }

    async fn get_kubeconfig(&self, region: &Region, id: &str) -> Result<Vec<u8>> {
        let state = self.state();
        let cluster = state
            .clusters
            .iter()
            .find(|c| c.region == *region && c.id == id)
            .ok_or_else(|| not_found("cluster", id))?;
        Ok(format!(
            "apiVersion: v1\nkind: Config\nclusters:\n- name: {}\n  cluster:\n    server: {}\n",
            cluster.name, cluster.cluster_url
        )
        .into_bytes())
    }

    async fn list_pools(&self, region: &Region, cluster_id: &str) -> Result<Vec<Pool>> {
        let state = self.state();
        if !state.clusters.iter().any(|c| c.region == *region && c.id == cluster_id) {
            return Err(not_found("cluster", cluster_id));
        }
        Ok(state
            .pools
            .iter()
            .filter(|p| p.cluster_id == cluster_id)
            .cloned()
            .collect())
    }

    async fn create_pool(
        &self,
        region: &Region,
        cluster_id: &str,
        req: CreatePoolRequest,
    ) -> Result<Pool> {
        let mut state = self.mutate();
        let cluster = state
            .clusters
            .iter_mut()
            .find(|c| c.region == *region && c.id == cluster_id)
            .ok_or_else(|| not_found("cluster", cluster_id))?;
        cluster.status = ClusterStatus::Ready;
        let pool = Pool {
            id: new_id(),
            cluster_id: cluster_id.to_string(),
            name: req.name,
            node_type: req.node_type,
            zone: req.zone,
            version: req.version,
            status: PoolStatus::Ready,
            autoscaling: req.autoscaling,
            size: req.size,
            min_size: req.min_size,
            max_size: req.max_size,
            autohealing: req.autohealing,
            tags: req.tags,
            kubelet_args: req.kubelet_args,
            upgrade_policy: req.upgrade_policy,
            root_volume_type: req.root_volume_type,
            root_volume_size_gb: req.root_volume_size_gb,
            public_ip_disabled: req.public_ip_disabled,
            placement_group_id: req.placement_group_id,
            security_group_id: req.security_group_id,
        };
        state.resize_nodes(&pool);
        state.pools.push(pool.clone());
        Ok(pool)
    }

    async fn update_pool(
        &self,
        _region: &Region,
        id: &str,
        req: UpdatePoolRequest,
    ) -> Result<Pool> {
        let mut state = self.mutate();
        let pool = state
            .pools
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| not_found("pool", id))?;
        if let Some(autoscaling) = req.autoscaling {
            pool.autoscaling = autoscaling;
        }
        if let Some(size) = req.size {
            pool.size = size;
        }
        if let Some(min_size) = req.min_size {
            pool.min_size = min_size;
        }
        if let Some(max_size) = req.max_size {
            pool.max_size = max_size;
        }
        if let Some(autohealing) = req.autohealing {
            pool.autohealing = autohealing;
        }
        if let Some(tags) = req.tags {
            pool.tags = tags;
        }
        if let Some(args) = req.kubelet_args {
            pool.kubelet_args = args;
        }
        if let Some(policy) = req.upgrade_policy {
            pool.upgrade_policy = policy;
        }
        let pool = pool.clone();
        state.resize_nodes(&pool);
        Ok(pool)
    }

    async fn upgrade_pool(&self, _region: &Region, id: &str, version: &str) -> Result<Pool> {
        let mut state = self.mutate();
        let pool = state
            .pools
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| not_found("pool", id))?;
        pool.version = version.to_string();
        Ok(pool.clone())
    }

    async fn delete_pool(&self, _region: &Region, id: &str) -> Result<()> {
        let mut state = self.mutate();
        let before = state.pools.len();
        state.pools.retain(|p| p.id != id);
        if state.pools.len() == before {
            return Err(not_found("pool", id));
        }
        state.nodes.retain(|n| n.pool_id != id);
        Ok(())
    }

    async fn list_nodes(&self, _region: &Region, pool_id: &str) -> Result<Vec<Node>> {
        Ok(self
            .state()
            .nodes
            .iter()
            .filter(|n| n.pool_id == pool_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fr_par() -> Region {
        Region::parse("fr-par").unwrap()
    }

    #[tokio::test]
    async fn test_tag_filtering() {
        let cloud = InMemoryCloud::new();
        cloud.seed_private_network("a", true, &["caps", "owner=a"]);
        cloud.seed_private_network("b", true, &["caps", "owner=b"]);

        let all = cloud.list_private_networks(&fr_par(), &[]).await.unwrap();
        let owned = cloud
            .list_private_networks(&fr_par(), &["owner=a".to_string()])
            .await
            .unwrap();

        assert_eq!(all.len(), 2);
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].name, "a");
        assert_eq!(cloud.mutating_calls(), 0);
    }

    #[tokio::test]
    async fn test_attached_network_cannot_be_deleted() {
        let cloud = InMemoryCloud::new();
        let pn = cloud.seed_private_network("pn", true, &[]);
        let zone = fr_par().default_zone();
        let gateway = cloud
            .create_gateway(
                &zone,
                CreateGatewayRequest {
                    name: "gw".to_string(),
                    gateway_type: "VPC-GW-S".to_string(),
                    ip_id: None,
                    tags: Vec::new(),
                },
            )
            .await
            .unwrap();
        cloud
            .create_gateway_network(
                &zone,
                CreateGatewayNetworkRequest {
                    gateway_id: gateway.id.clone(),
                    private_network_id: pn.id.clone(),
                    enable_masquerade: true,
                    push_default_route: true,
                },
            )
            .await
            .unwrap();

        let err = cloud.delete_private_network(&fr_par(), &pn.id).await.unwrap_err();
        assert!(crate::clients::is_precondition_failed(&err));

        cloud.delete_gateway(&zone, &gateway.id, true).await.unwrap();
        cloud.delete_private_network(&fr_par(), &pn.id).await.unwrap();
        assert!(cloud.gateway_ips(&zone).is_empty());
    }

    #[tokio::test]
    async fn test_pool_nodes_follow_size() {
        let cloud = InMemoryCloud::new();
        let pn = cloud.seed_private_network("pn", true, &[]);
        let cluster = cloud
            .create_cluster(
                &fr_par(),
                CreateClusterRequest {
                    name: "k".to_string(),
                    cluster_type: "kapsule".to_string(),
                    version: "1.30.2".to_string(),
                    cni: "cilium".to_string(),
                    private_network_id: Some(pn.id),
                    tags: Vec::new(),
                    feature_gates: Vec::new(),
                    admission_plugins: Vec::new(),
                    apiserver_cert_sans: Vec::new(),
                    autoscaler_config: Default::default(),
                    auto_upgrade: Default::default(),
                },
            )
            .await
            .unwrap();
        let pool = cloud
            .create_pool(
                &fr_par(),
                &cluster.id,
                CreatePoolRequest {
                    name: "p".to_string(),
                    node_type: "DEV1-M".to_string(),
                    zone: fr_par().default_zone(),
                    version: "1.30.2".to_string(),
                    autoscaling: false,
                    size: 3,
                    min_size: 3,
                    max_size: 3,
                    autohealing: false,
                    tags: Vec::new(),
                    kubelet_args: Default::default(),
                    upgrade_policy: Default::default(),
                    root_volume_type: None,
                    root_volume_size_gb: None,
                    public_ip_disabled: false,
                    placement_group_id: None,
                    security_group_id: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(cloud.list_nodes(&fr_par(), &pool.id).await.unwrap().len(), 3);

        let update = UpdatePoolRequest {
            size: Some(1),
            ..Default::default()
        };
        cloud.update_pool(&fr_par(), &pool.id, update).await.unwrap();

        let nodes = cloud.list_nodes(&fr_par(), &pool.id).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].provider_id.starts_with("scaleway://instance/fr-par-1/"));
    }
}
