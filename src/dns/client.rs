use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use hickory_client::client::{Client, SyncClient};
use hickory_client::rr::{DNSClass, Name, RData, Record, RecordType};
use hickory_client::udp::UdpClientConnection;
use log::debug;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryType {
    A,
    Ns,
    Cname,
    Txt,
}

impl From<QueryType> for RecordType {
    fn from(value: QueryType) -> Self {
        match value {
            QueryType::A => RecordType::A,
            QueryType::Ns => RecordType::NS,
            QueryType::Cname => RecordType::CNAME,
            QueryType::Txt => RecordType::TXT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    Address(IpAddr),
    Ns(String),
    Cname(String),
    /// Character-strings of one TXT record, in wire order.
    Txt(Vec<String>),
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub data: RecordData,
}

impl DnsRecord {
    pub fn new(name: &str, data: RecordData) -> Self {
        Self {
            name: trim_name(name),
            data,
        }
    }
}

/// Answer and authority sections of one response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsResponse {
    pub server: Option<IpAddr>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
}

impl DnsResponse {
    pub fn answer_name_servers(&self) -> Vec<String> {
        ns_names(&self.answers)
    }

    pub fn authority_name_servers(&self) -> Vec<String> {
        ns_names(&self.authorities)
    }

    pub fn first_cname(&self) -> Option<String> {
        self.answers.iter().find_map(|record| match &record.data {
            RecordData::Cname(target) => Some(target.clone()),
            _ => None,
        })
    }

    pub fn addresses(&self) -> Vec<IpAddr> {
        self.answers
            .iter()
            .filter_map(|record| match record.data {
                RecordData::Address(ip) => Some(ip),
                _ => None,
            })
            .collect()
    }

    /// TXT answers with multi-string records joined.
    pub fn txt_values(&self) -> Vec<String> {
        self.answers
            .iter()
            .filter_map(|record| match &record.data {
                RecordData::Txt(parts) if !parts.is_empty() => Some(parts.concat()),
                _ => None,
            })
            .collect()
    }
}

fn ns_names(records: &[DnsRecord]) -> Vec<String> {
    records
        .iter()
        .filter_map(|record| match &record.data {
            RecordData::Ns(host) => Some(host.clone()),
            _ => None,
        })
        .collect()
}

pub(crate) fn trim_name(name: &str) -> String {
    name.trim().trim_end_matches('.').to_lowercase()
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DnsError {
    /// One query against one server failed; callers treat the hop as empty.
    #[error("dns query for {name} ({query_type:?}) via {server} failed: {reason}")]
    Transient {
        name: String,
        query_type: QueryType,
        server: IpAddr,
        reason: String,
    },
    #[error("invalid dns name: {0}")]
    InvalidName(String),
    #[error("no dns servers configured")]
    NoServers,
}

/// Sends a single question to a single server. Implementations must not cache.
pub trait DnsTransport: Send + Sync {
    fn query(
        &self,
        name: &str,
        query_type: QueryType,
        server: IpAddr,
    ) -> Result<DnsResponse, DnsError>;
}

/// UDP transport opening a fresh connection per query, so no answer outlives its request.
#[derive(Debug, Clone)]
pub struct UdpTransport {
    timeout: Duration,
}

impl UdpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl DnsTransport for UdpTransport {
    fn query(
        &self,
        name: &str,
        query_type: QueryType,
        server: IpAddr,
    ) -> Result<DnsResponse, DnsError> {
        let fqdn = format!("{}.", name.trim().trim_end_matches('.'));
        let question =
            Name::from_ascii(&fqdn).map_err(|err| DnsError::InvalidName(format!("{fqdn}: {err}")))?;
        let transient = |reason: String| DnsError::Transient {
            name: fqdn.clone(),
            query_type,
            server,
            reason,
        };

        let conn = UdpClientConnection::with_timeout(SocketAddr::new(server, 53), self.timeout)
            .map_err(|err| transient(err.to_string()))?;
        let client = SyncClient::new(conn);
        let response = client
            .query(&question, DNSClass::IN, query_type.into())
            .map_err(|err| transient(err.to_string()))?;

        debug!(
            "[dns] {} {:?} via {}: rcode={:?} answers={} authorities={}",
            fqdn,
            query_type,
            server,
            response.response_code(),
            response.answers().len(),
            response.name_servers().len()
        );

        Ok(DnsResponse {
            server: Some(server),
            answers: response.answers().iter().map(convert_record).collect(),
            authorities: response.name_servers().iter().map(convert_record).collect(),
        })
    }
}

fn convert_record(record: &Record) -> DnsRecord {
    let data = match record.data() {
        Some(RData::A(a)) => RecordData::Address(IpAddr::V4(a.0)),
        Some(RData::AAAA(aaaa)) => RecordData::Address(IpAddr::V6(aaaa.0)),
        Some(RData::NS(ns)) => RecordData::Ns(trim_name(&ns.0.to_ascii())),
        Some(RData::CNAME(cname)) => RecordData::Cname(trim_name(&cname.0.to_ascii())),
        Some(RData::TXT(txt)) => RecordData::Txt(
            txt.txt_data()
                .iter()
                .map(|data| String::from_utf8_lossy(data).into_owned())
                .collect(),
        ),
        _ => RecordData::Other,
    };
    DnsRecord::new(&record.name().to_ascii(), data)
}
