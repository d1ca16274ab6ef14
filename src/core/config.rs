//! Runtime settings.
//!
//! Loaded from an optional JSON file, then overridden by `ACME_RENEWER_*`
//! environment variables. Every field has a default so an empty file (or no
//! file) yields a working configuration against Let's Encrypt production.

use std::{
    fs,
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};

pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub acme: AcmeSettings,
    pub dns: DnsSettings,
    pub polling: PollingSettings,
    /// Days after a successful renewal before the definition is due again.
    pub renewal_days: i64,
    pub http_timeout_secs: u64,
    /// Renew every definition on this run, due or not.
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcmeSettings {
    pub directory_url: String,
    pub contact_email: Option<String>,
    /// PEM account key; generated on first use when missing.
    pub account_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsSettings {
    /// Upstream resolvers, selected round-robin by attempt number.
    pub servers: Vec<IpAddr>,
    pub query_timeout_secs: u64,
    /// Read-back attempts for published DNS-01 records before asking the CA to validate.
    pub preflight_attempts: u32,
    pub preflight_delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSettings {
    pub max_attempts: u32,
    pub initial_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            acme: AcmeSettings::default(),
            dns: DnsSettings::default(),
            polling: PollingSettings::default(),
            renewal_days: 55,
            http_timeout_secs: 15,
            force: false,
        }
    }
}

impl Default for AcmeSettings {
    fn default() -> Self {
        Self {
            directory_url: LETS_ENCRYPT_PRODUCTION.to_string(),
            contact_email: None,
            account_key_path: None,
        }
    }
}

impl Default for DnsSettings {
    fn default() -> Self {
        Self {
            servers: vec![
                IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
                IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
                IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)),
            ],
            query_timeout_secs: 10,
            preflight_attempts: 3,
            preflight_delay_secs: 5,
        }
    }
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_secs: 2,
            max_delay_secs: 60,
        }
    }
}

impl Settings {
    /// Reads the JSON file when given (missing file means defaults) and applies env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) if path.exists() => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("failed to read settings {}", path.display()))?;
                serde_json::from_str::<Settings>(&raw)
                    .with_context(|| format!("failed to parse settings {}", path.display()))?
            }
            _ => Settings::default(),
        };
        settings.apply_env();
        Ok(settings)
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("ACME_RENEWER_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(url) = std::env::var("ACME_RENEWER_DIRECTORY_URL") {
            self.acme.directory_url = url;
        }
        if let Ok(email) = std::env::var("ACME_RENEWER_CONTACT_EMAIL") {
            self.acme.contact_email = Some(email);
        }
        if let Ok(raw) = std::env::var("ACME_RENEWER_DNS_SERVERS") {
            let servers: Vec<IpAddr> = raw
                .split(',')
                .filter_map(|part| part.trim().parse().ok())
                .collect();
            if servers.is_empty() {
                warn!("[config] ACME_RENEWER_DNS_SERVERS has no valid addresses; keeping defaults");
            } else {
                self.dns.servers = servers;
            }
        }
        self.dns.query_timeout_secs =
            positive_from_env("ACME_RENEWER_DNS_TIMEOUT_SECS", self.dns.query_timeout_secs);
        self.http_timeout_secs =
            positive_from_env("ACME_RENEWER_HTTP_TIMEOUT_SECS", self.http_timeout_secs);
        self.polling.max_attempts = positive_from_env(
            "ACME_RENEWER_POLL_ATTEMPTS",
            u64::from(self.polling.max_attempts),
        )
        .try_into()
        .unwrap_or(self.polling.max_attempts);
        self.force = flag_from_env("ACME_RENEWER_FORCE", self.force);
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_secs(self.dns.query_timeout_secs.max(1))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("renewals.sqlite")
    }

    pub fn key_cache_dir(&self) -> PathBuf {
        self.data_dir.join("keys")
    }

    pub fn account_key_path(&self) -> PathBuf {
        self.acme
            .account_key_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("account.pem"))
    }
}

fn positive_from_env(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(0) | Err(_) => {
                warn!("[config] invalid value for {key}; using {default}");
                default
            }
            Ok(value) => value,
        },
        Err(_) => default,
    }
}

fn flag_from_env(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" | "" => false,
            _ => {
                warn!("[config] invalid value for {key}; using {default}");
                default
            }
        },
        Err(_) => default,
    }
}
