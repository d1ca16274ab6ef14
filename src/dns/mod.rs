//! Authoritative DNS lookups used to verify DNS-01 records before the CA does.
//!
//! Nothing here caches: every query goes to a named server so a freshly
//! published TXT record is seen as soon as the authoritative zone serves it.

pub mod client;
pub mod delegation;
pub mod provider;

pub use client::{DnsError, DnsRecord, DnsResponse, DnsTransport, QueryType, RecordData, UdpTransport};
pub use delegation::{DelegationResolver, ResolvedNameServer};
pub use provider::{LookupClient, LookupClientProvider};
