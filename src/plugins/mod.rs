//! Plugin contracts and the factories the registry dispatches to.
//!
//! Each category has a runtime trait. Factories are looked up by
//! `(category, id)` and produce a [`PluginInstance`] tagged with its category.

use std::{path::Path, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{
    core::{
        config::Settings,
        types::{CertificateInfo, PluginCategory, StoreLocation, Target},
    },
    dns::DelegationResolver,
    issuance::issuer::{ChallengeKind, ChallengeOffer, SigningRequest},
};

pub mod csr;
pub mod installation;
pub mod registry;
pub mod script;
pub mod store;
pub mod target;
pub mod validation;

pub use registry::PluginRegistry;

pub trait TargetPlugin: Send + Sync {
    /// `Ok(None)` when the thing the target was built from no longer exists.
    fn generate(&self) -> Result<Option<Target>>;
}

pub trait ValidationPlugin: Send + Sync {
    fn challenge_kind(&self) -> ChallengeKind;
    fn prepare_challenge(&self, identifier: &str, offer: &ChallengeOffer) -> Result<()>;
    /// Best-effort removal of what `prepare_challenge` published. Must be a
    /// no-op for identifiers that were never prepared.
    fn clean_up(&self, identifier: &str);
}

pub trait CsrPlugin: Send + Sync {
    /// Private key in PKCS#8 PEM. Repeated calls on one instance return the same key.
    fn get_keys(&self) -> Result<String>;
    fn generate_csr(
        &self,
        cache_file: &Path,
        common_name: &str,
        identifiers: &[String],
    ) -> Result<SigningRequest>;
    fn post_process(&self, certificate: CertificateInfo) -> Result<CertificateInfo> {
        Ok(certificate)
    }
}

pub trait StorePlugin: Send + Sync {
    fn save(&self, certificate: &CertificateInfo) -> Result<StoreLocation>;
}

pub trait InstallationPlugin: Send + Sync {
    fn install(
        &self,
        stores: &[StoreLocation],
        new_certificate: &CertificateInfo,
        old_certificate: Option<&CertificateInfo>,
    ) -> Result<()>;
}

pub enum PluginInstance {
    Target(Box<dyn TargetPlugin>),
    Validation(Box<dyn ValidationPlugin>),
    Csr(Box<dyn CsrPlugin>),
    Store(Box<dyn StorePlugin>),
    Installation(Box<dyn InstallationPlugin>),
}

impl PluginInstance {
    pub fn category(&self) -> PluginCategory {
        match self {
            PluginInstance::Target(_) => PluginCategory::Target,
            PluginInstance::Validation(_) => PluginCategory::Validation,
            PluginInstance::Csr(_) => PluginCategory::Csr,
            PluginInstance::Store(_) => PluginCategory::Store,
            PluginInstance::Installation(_) => PluginCategory::Installation,
        }
    }

    pub fn into_target(self) -> Result<Box<dyn TargetPlugin>> {
        match self {
            PluginInstance::Target(plugin) => Ok(plugin),
            other => Err(mismatch(PluginCategory::Target, other.category())),
        }
    }

    pub fn into_validation(self) -> Result<Box<dyn ValidationPlugin>> {
        match self {
            PluginInstance::Validation(plugin) => Ok(plugin),
            other => Err(mismatch(PluginCategory::Validation, other.category())),
        }
    }

    pub fn into_csr(self) -> Result<Box<dyn CsrPlugin>> {
        match self {
            PluginInstance::Csr(plugin) => Ok(plugin),
            other => Err(mismatch(PluginCategory::Csr, other.category())),
        }
    }

    pub fn into_store(self) -> Result<Box<dyn StorePlugin>> {
        match self {
            PluginInstance::Store(plugin) => Ok(plugin),
            other => Err(mismatch(PluginCategory::Store, other.category())),
        }
    }

    pub fn into_installation(self) -> Result<Box<dyn InstallationPlugin>> {
        match self {
            PluginInstance::Installation(plugin) => Ok(plugin),
            other => Err(mismatch(PluginCategory::Installation, other.category())),
        }
    }
}

fn mismatch(expected: PluginCategory, found: PluginCategory) -> anyhow::Error {
    anyhow!("expected a {expected} plugin, factory produced a {found} plugin")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginDescriptor {
    pub id: &'static str,
    pub category: PluginCategory,
    pub description: &'static str,
}

/// Operator prompts used while acquiring plugin options interactively.
pub trait InputService {
    fn request_string(&self, prompt: &str) -> Result<String>;
    fn prompt_yes_no(&self, prompt: &str, default: bool) -> Result<bool>;
}

pub trait PluginFactory: Send + Sync {
    fn descriptor(&self) -> PluginDescriptor;

    /// Validated options from unattended arguments (a JSON object).
    fn default_options(&self, arguments: &Value) -> Result<Value>;

    fn acquire_options(&self, target: Option<&Target>, input: &dyn InputService) -> Result<Value>;

    fn is_active(&self, _options: &Value) -> bool {
        true
    }

    /// Validation factories reject targets they cannot serve.
    fn can_validate(&self, _target: &Target) -> bool {
        true
    }

    fn create(&self, options: &Value, services: &PluginServices) -> Result<PluginInstance>;
}

/// Shared collaborators handed to every plugin at creation.
#[derive(Clone)]
pub struct PluginServices {
    pub resolver: Option<Arc<DelegationResolver>>,
    pub preflight_attempts: u32,
    pub preflight_delay: Duration,
    pub http_timeout: Duration,
    pub key_cache_dir: PathBuf,
}

impl PluginServices {
    pub fn from_settings(settings: &Settings, resolver: Option<Arc<DelegationResolver>>) -> Self {
        Self {
            resolver,
            preflight_attempts: settings.dns.preflight_attempts,
            preflight_delay: Duration::from_secs(settings.dns.preflight_delay_secs),
            http_timeout: settings.http_timeout(),
            key_cache_dir: settings.key_cache_dir(),
        }
    }
}

/// Deserializes plugin options, naming the plugin in the error.
pub(crate) fn parse_options<T: DeserializeOwned>(plugin: &str, options: &Value) -> Result<T> {
    serde_json::from_value(options.clone())
        .map_err(|err| anyhow!("invalid options for plugin {plugin}: {err}"))
}

pub(crate) fn to_value<T: Serialize>(plugin: &str, options: &T) -> Result<Value> {
    serde_json::to_value(options)
        .map_err(|err| anyhow!("failed to serialize options for plugin {plugin}: {err}"))
}
