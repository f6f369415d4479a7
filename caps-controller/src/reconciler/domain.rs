//! Control-plane DNS records.
//!
//! One A/AAAA record per load balancer IP, all under the same name. DNS
//! records carry no tags, so ownership is kept in the record comment and
//! records are matched by address.

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use super::Reconciler;
use crate::api::ControlPlaneDnsSpec;
use crate::clients::domain::{CreateDnsRecordRequest, DnsRecord, RecordType};
use crate::clients::{CloudClient, is_not_found};
use crate::ensurer::{ResourceAdapter, ResourceEnsurer};
use crate::scope::{ClusterScope, NetworkScope};

pub const RECORD_TTL: u32 = 60;

pub struct DomainReconciler;

struct DnsRecordAdapter {
    client: Arc<dyn CloudClient>,
    dns: ControlPlaneDnsSpec,
    comment: String,
}

impl DnsRecordAdapter {
    fn new(scope: &ClusterScope, dns: ControlPlaneDnsSpec) -> Self {
        Self {
            client: scope.client(),
            dns,
            comment: scope.owner().record_owner(),
        }
    }
}

fn record_type(address: &IpAddr) -> RecordType {
    match address {
        IpAddr::V4(_) => RecordType::A,
        IpAddr::V6(_) => RecordType::Aaaa,
    }
}

#[async_trait]
impl ResourceAdapter for DnsRecordAdapter {
    type Desired = IpAddr;
    type Resource = DnsRecord;
    type Zone = String;

    fn kind(&self) -> &'static str {
        "DNS record"
    }

    async fn list_resources(&self) -> Result<Vec<DnsRecord>> {
        let records = self
            .client
            .list_dns_records(&self.dns.domain, &self.dns.name)
            .await?;
        Ok(records
            .into_iter()
            .filter(|r| r.comment.as_deref() == Some(self.comment.as_str()))
            .collect())
    }

    fn resource_id(&self, record: &DnsRecord) -> String {
        record.id.clone()
    }

    fn resource_name(&self, record: &DnsRecord) -> String {
        record.data.clone()
    }

    fn resource_zone(&self, record: &DnsRecord) -> String {
        record.dns_zone.clone()
    }

    fn desired_zone(&self, _address: &IpAddr) -> Result<String> {
        Ok(self.dns.domain.clone())
    }

    fn desired_name(&self, _index: usize, address: &IpAddr) -> String {
        address.to_string()
    }

    async fn get_resource(&self, _zone: &String, _id: &str) -> Result<Option<DnsRecord>> {
        Ok(None)
    }

    async fn should_keep_resource(&self, record: &DnsRecord, address: &IpAddr) -> Result<bool> {
        Ok(record.record_type == record_type(address) && record.ttl == RECORD_TTL)
    }

    async fn update_resource(&self, record: DnsRecord, _address: &IpAddr) -> Result<DnsRecord> {
        Ok(record)
    }

    async fn create_resource(
        &self,
        zone: &String,
        _name: &str,
        address: &IpAddr,
    ) -> Result<DnsRecord> {
        self.client
            .create_dns_record(
                zone,
                CreateDnsRecordRequest {
                    name: self.dns.name.clone(),
                    record_type: record_type(address),
                    data: address.to_string(),
                    ttl: RECORD_TTL,
                    comment: Some(self.comment.clone()),
                },
            )
            .await
    }

    async fn delete_resource(&self, record: &DnsRecord) -> Result<()> {
        match self
            .client
            .delete_dns_record(&record.dns_zone, &record.id)
            .await
        {
            Err(e) if is_not_found(&e) => Ok(()),
            other => other,
        }
    }
}

#[async_trait]
impl Reconciler<ClusterScope> for DomainReconciler {
    fn name(&self) -> &'static str {
        "domain"
    }

    async fn reconcile(&self, scope: &mut ClusterScope) -> Result<()> {
        let Some(dns) = scope.cluster().spec.network.control_plane_dns.clone() else {
            return Ok(());
        };
        let addresses: Vec<IpAddr> = scope
            .network_status()
            .map(|s| {
                s.load_balancer_ip
                    .into_iter()
                    .chain(s.extra_load_balancer_ips.iter().copied())
                    .collect()
            })
            .unwrap_or_default();

        ResourceEnsurer::new(DnsRecordAdapter::new(scope, dns))
            .ensure(&addresses)
            .await?;
        Ok(())
    }

    async fn delete(&self, scope: &mut ClusterScope) -> Result<()> {
        let Some(dns) = scope.cluster().spec.network.control_plane_dns.clone() else {
            return Ok(());
        };
        ResourceEnsurer::new(DnsRecordAdapter::new(scope, dns))
            .ensure(&[])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::DomainApi;
    use crate::test_util::{InMemoryCloud, cluster_scope, fixtures};

    fn dns_cluster() -> crate::api::ScalewayCluster {
        dns_cluster_in(fixtures::NAMESPACE)
    }

    fn dns_cluster_in(namespace: &str) -> crate::api::ScalewayCluster {
        let mut cluster = fixtures::cluster("c1");
        cluster.meta.namespace = namespace.to_string();
        cluster.spec.network.control_plane_dns = Some(ControlPlaneDnsSpec {
            domain: "example.com".to_string(),
            name: "api".to_string(),
        });
        cluster
    }

    #[tokio::test]
    async fn test_one_record_per_lb_ip() {
        let cloud = InMemoryCloud::new();
        let mut scope = cluster_scope(&cloud, dns_cluster());
        scope.set_load_balancer_ips(
            Some("192.0.2.10".parse().unwrap()),
            vec!["2001:db8::10".parse().unwrap()],
        );

        DomainReconciler.reconcile(&mut scope).await.unwrap();

        let mut records = cloud.list_dns_records("example.com", "api").await.unwrap();
        records.sort_by(|a, b| a.data.cmp(&b.data));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].record_type, RecordType::A);
        assert_eq!(records[1].record_type, RecordType::Aaaa);
        assert_eq!(records[0].comment.as_deref(), Some("caps-scalewaycluster=default/c1"));
        scope.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_foreign_records_are_untouched() {
        let cloud = InMemoryCloud::new();
        cloud.seed_dns_record("example.com", "api", "198.51.100.1", None);
        let mut scope = cluster_scope(&cloud, dns_cluster());
        scope.set_load_balancer_ips(Some("192.0.2.10".parse().unwrap()), Vec::new());

        DomainReconciler.reconcile(&mut scope).await.unwrap();
        DomainReconciler.delete(&mut scope).await.unwrap();

        let records = cloud.list_dns_records("example.com", "api").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data, "198.51.100.1");
        scope.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_ip_change_replaces_record() {
        let cloud = InMemoryCloud::new();
        let mut scope = cluster_scope(&cloud, dns_cluster());
        scope.set_load_balancer_ips(Some("192.0.2.10".parse().unwrap()), Vec::new());
        DomainReconciler.reconcile(&mut scope).await.unwrap();

        scope.set_load_balancer_ips(Some("192.0.2.20".parse().unwrap()), Vec::new());
        DomainReconciler.reconcile(&mut scope).await.unwrap();

        let records = cloud.list_dns_records("example.com", "api").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data, "192.0.2.20");
        scope.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_same_name_in_other_namespace_is_not_owned() {
        let cloud = InMemoryCloud::new();
        let mut team_a = cluster_scope(&cloud, dns_cluster_in("team-a"));
        team_a.set_load_balancer_ips(Some("192.0.2.10".parse().unwrap()), Vec::new());
        let mut team_b = cluster_scope(&cloud, dns_cluster_in("team-b"));
        team_b.set_load_balancer_ips(Some("192.0.2.20".parse().unwrap()), Vec::new());

        DomainReconciler.reconcile(&mut team_a).await.unwrap();
        DomainReconciler.reconcile(&mut team_b).await.unwrap();

        let mut data: Vec<String> = cloud
            .list_dns_records("example.com", "api")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.data)
            .collect();
        data.sort();
        assert_eq!(data, vec!["192.0.2.10", "192.0.2.20"]);

        DomainReconciler.delete(&mut team_a).await.unwrap();

        let records = cloud.list_dns_records("example.com", "api").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data, "192.0.2.20");
        team_a.close().await.unwrap();
        team_b.close().await.unwrap();
    }
}
