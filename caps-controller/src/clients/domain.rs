//! DNS record API.

use anyhow::Result;
use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    A,
    Aaaa,
}

/// A record in a DNS zone.
///
/// Records carry no tags; ownership is stored in `comment`.
#[derive(Debug, Clone, PartialEq)]
pub struct DnsRecord {
    pub id: String,
    pub dns_zone: String,
    pub name: String,
    pub record_type: RecordType,
    pub data: String,
    pub ttl: u32,
    pub comment: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreateDnsRecordRequest {
    pub name: String,
    pub record_type: RecordType,
    pub data: String,
    pub ttl: u32,
    pub comment: Option<String>,
}

#[async_trait]
pub trait DomainApi: Send + Sync {
    /// List the records of `dns_zone` named `name`.
    async fn list_dns_records(&self, dns_zone: &str, name: &str) -> Result<Vec<DnsRecord>>;

    async fn create_dns_record(
        &self,
        dns_zone: &str,
        req: CreateDnsRecordRequest,
    ) -> Result<DnsRecord>;

    async fn delete_dns_record(&self, dns_zone: &str, id: &str) -> Result<()>;
}
