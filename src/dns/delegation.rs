use std::{net::IpAddr, sync::Arc};

use log::{debug, info, warn};

use super::client::{DnsResponse, QueryType, trim_name};
use super::provider::{LookupClient, LookupClientProvider};
use crate::domain::DomainParser;

/// An authoritative server found during delegation discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedNameServer {
    pub ip: IpAddr,
    pub name_server: String,
    /// Zone the server answered NS for.
    pub zone: String,
    pub round: usize,
}

/// Reads DNS-01 records straight from authoritative servers, following CNAME
/// delegation into other zones.
pub struct DelegationResolver {
    provider: LookupClientProvider,
    domain_parser: Arc<dyn DomainParser>,
}

impl DelegationResolver {
    pub fn new(provider: LookupClientProvider, domain_parser: Arc<dyn DomainParser>) -> Self {
        Self {
            provider,
            domain_parser,
        }
    }

    pub fn provider(&self) -> &LookupClientProvider {
        &self.provider
    }

    /// TXT values at the end of the CNAME chain starting at `host`.
    /// Query failures yield an empty result; callers retry with `attempt + 1`.
    pub fn resolve_txt_records(&self, host: &str, attempt: usize) -> Vec<String> {
        let host = trim_name(host);
        let client = self.client_for(&host, attempt);
        let response = match client.query(&host, QueryType::Txt) {
            Ok(response) => response,
            Err(err) => {
                warn!("[dns] {}", err);
                return Vec::new();
            }
        };

        let mut visited = vec![host];
        match self.follow_cnames(response, attempt, &mut visited) {
            Some(response) => {
                let values = response.txt_values();
                debug!(
                    "[dns] {} TXT value(s) at {} after {} hop(s)",
                    values.len(),
                    visited.last().map(String::as_str).unwrap_or_default(),
                    visited.len() - 1
                );
                values
            }
            None => Vec::new(),
        }
    }

    fn follow_cnames(
        &self,
        mut response: DnsResponse,
        attempt: usize,
        visited: &mut Vec<String>,
    ) -> Option<DnsResponse> {
        while let Some(target) = response.first_cname() {
            if visited.contains(&target) {
                warn!("[dns] CNAME loop at {} (chain: {})", target, visited.join(" -> "));
                return None;
            }
            info!("[dns] following CNAME {} -> {}", visited.last()?, target);
            visited.push(target.clone());

            let client = self.client_for(&target, attempt);
            response = match client.query(&target, QueryType::Txt) {
                Ok(response) => response,
                Err(err) => {
                    warn!("[dns] {}", err);
                    return None;
                }
            };
        }
        Some(response)
    }

    /// Client pinned to the first authoritative server of the zone owning
    /// `domain`, or the round's default resolver when discovery finds none.
    pub fn client_for(&self, domain: &str, round: usize) -> Arc<LookupClient> {
        let host = trim_name(domain);
        let zone = self
            .domain_parser
            .registrable_domain(&host)
            .unwrap_or_else(|| host.clone());
        let default = self.provider.default_client(round);

        match self
            .authoritative_name_servers(&default, &zone, round)
            .next()
        {
            Some(server) => {
                debug!(
                    "[dns] using {} ({}) for {} in zone {}",
                    server.name_server, server.ip, host, server.zone
                );
                self.provider.client_for_server(server.ip)
            }
            None => {
                warn!(
                    "[dns] no authoritative server found for {}; using resolver {}",
                    zone,
                    default.server()
                );
                default
            }
        }
    }

    /// Discovers authoritative servers for `domain` via `client`. Name server
    /// addresses are resolved lazily, one A query per server as the iterator advances.
    pub fn authoritative_name_servers(
        &self,
        client: &LookupClient,
        domain: &str,
        round: usize,
    ) -> impl Iterator<Item = ResolvedNameServer> + use<> {
        let zone = trim_name(domain);
        let names = match client.query(&zone, QueryType::Ns) {
            Ok(response) => {
                let answers = response.answer_name_servers();
                if answers.is_empty() {
                    response.authority_name_servers()
                } else {
                    answers
                }
            }
            Err(err) => {
                warn!("[dns] {}", err);
                Vec::new()
            }
        };
        if names.is_empty() {
            debug!("[dns] no NS records for {}", zone);
        }

        let resolver = self.provider.default_client(round);
        names.into_iter().filter_map(move |name_server| {
            match resolver.query(&name_server, QueryType::A) {
                Ok(response) => match response.addresses().first() {
                    Some(ip) => Some(ResolvedNameServer {
                        ip: *ip,
                        name_server,
                        zone: zone.clone(),
                        round,
                    }),
                    None => {
                        debug!("[dns] name server {} has no address", name_server);
                        None
                    }
                },
                Err(err) => {
                    warn!("[dns] skipping name server {}: {}", name_server, err);
                    None
                }
            }
        })
    }
}
