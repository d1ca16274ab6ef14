//! Challenge validation plugins.
//!
//! DNS-01 plugins share [`Dns01Validation`], which tracks published records
//! for cleanup and reads them back through the delegation resolver before the
//! CA is asked to look.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use log::{debug, info, warn};

use crate::{
    dns::DelegationResolver,
    issuance::issuer::{ChallengeKind, ChallengeOffer},
    plugins::{PluginServices, ValidationPlugin},
};

pub mod cloudflare;
pub mod dns_script;
pub mod http;
pub mod http_webroot;

/// `_acme-challenge` owner name for an identifier; wildcards share the base name's record.
pub fn record_name(identifier: &str) -> String {
    let base = identifier
        .trim()
        .trim_end_matches('.')
        .trim_start_matches("*.");
    format!("_acme-challenge.{base}")
}

/// Publishes and removes TXT records at some DNS provider.
pub trait RecordPublisher: Send + Sync {
    fn name(&self) -> &'static str;
    fn create_record(&self, identifier: &str, record_name: &str, value: &str) -> Result<()>;
    fn delete_record(&self, identifier: &str, record_name: &str, value: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
struct PublishedRecord {
    record_name: String,
    value: String,
}

pub struct Dns01Validation {
    publisher: Box<dyn RecordPublisher>,
    resolver: Option<Arc<DelegationResolver>>,
    preflight_attempts: u32,
    preflight_delay: Duration,
    published: Mutex<HashMap<String, PublishedRecord>>,
}

impl Dns01Validation {
    pub fn new(publisher: Box<dyn RecordPublisher>, services: &PluginServices) -> Self {
        Self {
            publisher,
            resolver: services.resolver.clone(),
            preflight_attempts: services.preflight_attempts,
            preflight_delay: services.preflight_delay,
            published: Mutex::new(HashMap::new()),
        }
    }

    /// Reads the record back from its authoritative servers, moving to the
    /// next resolver round after each miss. Returns whether the value was seen.
    fn preflight(&self, record_name: &str, value: &str) -> bool {
        let Some(resolver) = &self.resolver else {
            return true;
        };
        for attempt in 0..self.preflight_attempts {
            let values = resolver.resolve_txt_records(record_name, attempt as usize);
            if values.iter().any(|found| found == value) {
                info!("[dns] {} visible on attempt {}", record_name, attempt + 1);
                return true;
            }
            debug!(
                "[dns] {} not visible yet (attempt {}, saw {:?})",
                record_name,
                attempt + 1,
                values
            );
            if attempt + 1 < self.preflight_attempts {
                std::thread::sleep(self.preflight_delay);
            }
        }
        warn!(
            "[dns] {} not visible after {} attempts; letting the CA check anyway",
            record_name, self.preflight_attempts
        );
        false
    }

    fn take_published(&self, identifier: &str) -> Option<PublishedRecord> {
        match self.published.lock() {
            Ok(mut published) => published.remove(identifier),
            Err(poisoned) => poisoned.into_inner().remove(identifier),
        }
    }
}

impl ValidationPlugin for Dns01Validation {
    fn challenge_kind(&self) -> ChallengeKind {
        ChallengeKind::Dns01
    }

    fn prepare_challenge(&self, identifier: &str, offer: &ChallengeOffer) -> Result<()> {
        let record_name = record_name(identifier);
        info!(
            "[dns] publishing {} via {} for {}",
            record_name,
            self.publisher.name(),
            identifier
        );
        self.publisher
            .create_record(identifier, &record_name, &offer.proof)?;
        if let Ok(mut published) = self.published.lock() {
            published.insert(
                identifier.to_string(),
                PublishedRecord {
                    record_name: record_name.clone(),
                    value: offer.proof.clone(),
                },
            );
        }
        self.preflight(&record_name, &offer.proof);
        Ok(())
    }

    fn clean_up(&self, identifier: &str) {
        let Some(record) = self.take_published(identifier) else {
            debug!("[dns] nothing to clean up for {}", identifier);
            return;
        };
        if let Err(err) =
            self.publisher
                .delete_record(identifier, &record.record_name, &record.value)
        {
            warn!(
                "[dns] failed to remove {} via {}: {}",
                record.record_name,
                self.publisher.name(),
                err
            );
        }
    }
}
