use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{Arc, Mutex},
};

use log::{debug, warn};

use super::client::{DnsError, DnsResponse, DnsTransport, QueryType};

/// A transport bound to one server.
pub struct LookupClient {
    server: IpAddr,
    transport: Arc<dyn DnsTransport>,
}

impl LookupClient {
    pub fn server(&self) -> IpAddr {
        self.server
    }

    pub fn query(&self, name: &str, query_type: QueryType) -> Result<DnsResponse, DnsError> {
        self.transport.query(name, query_type, self.server)
    }
}

/// Hands out lookup clients: the configured default resolvers, selected by
/// `round % count`, and pooled clients pinned to discovered name servers.
pub struct LookupClientProvider {
    transport: Arc<dyn DnsTransport>,
    defaults: Vec<Arc<LookupClient>>,
    pool: Mutex<HashMap<IpAddr, Arc<LookupClient>>>,
}

impl LookupClientProvider {
    pub fn new(servers: &[IpAddr], transport: Arc<dyn DnsTransport>) -> Result<Self, DnsError> {
        if servers.is_empty() {
            return Err(DnsError::NoServers);
        }
        let defaults: Vec<Arc<LookupClient>> = servers
            .iter()
            .map(|server| {
                Arc::new(LookupClient {
                    server: *server,
                    transport: transport.clone(),
                })
            })
            .collect();
        let pool = defaults
            .iter()
            .map(|client| (client.server, client.clone()))
            .collect();
        Ok(Self {
            transport,
            defaults,
            pool: Mutex::new(pool),
        })
    }

    pub fn default_client(&self, round: usize) -> Arc<LookupClient> {
        let client = self.defaults[round % self.defaults.len()].clone();
        debug!("[dns] round {} uses default resolver {}", round, client.server);
        client
    }

    /// Returns the pooled client for `server`, creating it on first use.
    pub fn client_for_server(&self, server: IpAddr) -> Arc<LookupClient> {
        let mut pool = match self.pool.lock() {
            Ok(pool) => pool,
            Err(poisoned) => {
                warn!("[dns] lookup client pool poisoned; recovering");
                poisoned.into_inner()
            }
        };
        pool.entry(server)
            .or_insert_with(|| {
                Arc::new(LookupClient {
                    server,
                    transport: self.transport.clone(),
                })
            })
            .clone()
    }
}
