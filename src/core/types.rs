use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::RenewalError;
use crate::domain::normalize_identifiers;

/// The five capability sets a renewal is assembled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginCategory {
    Target,
    Validation,
    Csr,
    Store,
    Installation,
}

impl PluginCategory {
    pub const ALL: [PluginCategory; 5] = [
        PluginCategory::Target,
        PluginCategory::Validation,
        PluginCategory::Csr,
        PluginCategory::Store,
        PluginCategory::Installation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PluginCategory::Target => "target",
            PluginCategory::Validation => "validation",
            PluginCategory::Csr => "csr",
            PluginCategory::Store => "store",
            PluginCategory::Installation => "installation",
        }
    }
}

impl fmt::Display for PluginCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One group of identifiers, optionally tied to a site or application binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetPart {
    pub identifiers: Vec<String>,
    pub site_id: Option<String>,
}

/// What a certificate should cover. Regenerated by the target plugin on every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub friendly_name: String,
    pub common_name: String,
    pub parts: Vec<TargetPart>,
}

impl Target {
    /// All identifiers across parts, in order, without duplicates.
    pub fn identifiers(&self) -> Vec<String> {
        let mut all: Vec<String> = Vec::new();
        for part in &self.parts {
            for identifier in &part.identifiers {
                if !all.contains(identifier) {
                    all.push(identifier.clone());
                }
            }
        }
        all
    }

    /// Normalizes every identifier and the common name; the common name defaults to
    /// the first identifier and must be one of them.
    pub fn normalized(self) -> Result<Target, RenewalError> {
        let mut parts = Vec::with_capacity(self.parts.len());
        for part in self.parts {
            if part.identifiers.is_empty() {
                continue;
            }
            let identifiers = normalize_identifiers(&part.identifiers)
                .map_err(|err| RenewalError::TargetUnavailable(err.to_string()))?;
            parts.push(TargetPart {
                identifiers,
                site_id: part.site_id,
            });
        }
        let target = Target {
            friendly_name: self.friendly_name,
            common_name: self.common_name,
            parts,
        };
        let identifiers = target.identifiers();
        let first = identifiers.first().cloned().ok_or_else(|| {
            RenewalError::TargetUnavailable("target contains no identifiers".to_string())
        })?;
        let common_name = match normalize_identifiers([target.common_name.as_str()]) {
            Ok(mut names) if identifiers.contains(&names[0]) => names.remove(0),
            _ => first,
        };
        Ok(Target {
            common_name,
            ..target
        })
    }
}

/// A plugin chosen for a renewal plus its opaque options blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSelection {
    pub plugin: String,
    #[serde(default)]
    pub options: serde_json::Value,
    /// Installation only: a failure aborts the run instead of becoming a warning.
    #[serde(default)]
    pub required: bool,
}

impl PluginSelection {
    pub fn new(plugin: impl Into<String>, options: serde_json::Value) -> Self {
        Self {
            plugin: plugin.into(),
            options,
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenewalHistoryEntry {
    pub date: DateTime<Utc>,
    pub success: bool,
    pub message: String,
    pub thumbprint: Option<String>,
}

/// Persisted description of one certificate and the plugin chain that maintains it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenewalDefinition {
    pub id: String,
    pub friendly_name: String,
    pub target: PluginSelection,
    pub validation: PluginSelection,
    pub csr: PluginSelection,
    pub stores: Vec<PluginSelection>,
    #[serde(default)]
    pub installations: Vec<PluginSelection>,
    pub created_at: DateTime<Utc>,
    pub last_renewal: Option<DateTime<Utc>>,
    pub next_due: Option<DateTime<Utc>>,
    #[serde(default)]
    pub history: Vec<RenewalHistoryEntry>,
    pub last_certificate: Option<CertificateInfo>,
}

impl RenewalDefinition {
    pub fn new(
        friendly_name: impl Into<String>,
        target: PluginSelection,
        validation: PluginSelection,
        csr: PluginSelection,
        stores: Vec<PluginSelection>,
        installations: Vec<PluginSelection>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().as_simple().to_string(),
            friendly_name: friendly_name.into(),
            target,
            validation,
            csr,
            stores,
            installations,
            created_at: Utc::now(),
            last_renewal: None,
            next_due: None,
            history: Vec::new(),
            last_certificate: None,
        }
    }

    /// Installation always has to reference a stored certificate.
    pub fn check_shape(&self) -> Result<(), RenewalError> {
        if self.stores.is_empty() {
            return Err(RenewalError::InvalidDefinition(format!(
                "renewal {} has no store plugin configured",
                self.id
            )));
        }
        Ok(())
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.next_due {
            Some(due) => due <= now,
            None => true,
        }
    }

    pub fn record_success(
        &mut self,
        now: DateTime<Utc>,
        renewal_days: i64,
        certificate: &CertificateInfo,
        message: impl Into<String>,
    ) {
        self.last_renewal = Some(now);
        self.next_due = Some(now + Duration::days(renewal_days));
        self.history.push(RenewalHistoryEntry {
            date: now,
            success: true,
            message: message.into(),
            thumbprint: Some(certificate.thumbprint.clone()),
        });
        self.last_certificate = Some(certificate.clone());
    }

    /// Records a failed attempt without touching the schedule.
    pub fn record_failure(&mut self, now: DateTime<Utc>, message: impl Into<String>) {
        self.history.push(RenewalHistoryEntry {
            date: now,
            success: false,
            message: message.into(),
            thumbprint: None,
        });
    }
}

/// Where a store plugin put a certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreLocation {
    pub plugin: String,
    pub location: String,
}

/// An issued certificate with chain and key, bound to its renewal.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateInfo {
    pub renewal_id: String,
    pub friendly_name: String,
    pub common_name: String,
    pub identifiers: Vec<String>,
    pub serial: String,
    /// SHA-256 over the leaf DER, hex encoded.
    pub thumbprint: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub chain_pem: String,
    #[serde(skip)]
    pub private_key_pem: Option<String>,
    #[serde(default)]
    pub store_locations: Vec<StoreLocation>,
}

impl fmt::Debug for CertificateInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateInfo")
            .field("renewal_id", &self.renewal_id)
            .field("common_name", &self.common_name)
            .field("identifiers", &self.identifiers)
            .field("thumbprint", &self.thumbprint)
            .field("not_after", &self.not_after)
            .field("store_locations", &self.store_locations)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunLevel {
    /// Renew even when the definition is not due.
    pub force: bool,
}

impl RunLevel {
    pub fn unattended() -> Self {
        Self::default()
    }

    pub fn forced() -> Self {
        Self { force: true }
    }
}

/// Cooperative cancellation shared between a caller and a running renewal.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Errors when cancellation was requested before `stage` starts.
    pub fn checkpoint(&self, stage: &str) -> Result<(), RenewalError> {
        if self.is_cancelled() {
            return Err(RenewalError::Cancelled(stage.to_string()));
        }
        Ok(())
    }
}

/// A non-fatal failure of one store or installation plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginFailure {
    pub category: PluginCategory,
    pub plugin: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalStatus {
    Succeeded,
    CompletedWithWarnings,
    Failed,
}

/// Outcome of one orchestrator run.
#[derive(Debug, Clone)]
pub struct RenewalResult {
    pub renewal_id: String,
    pub status: RenewalStatus,
    pub error: Option<RenewalError>,
    pub certificate: Option<CertificateInfo>,
    pub warnings: Vec<PluginFailure>,
}

impl RenewalResult {
    pub fn failed(renewal_id: &str, error: RenewalError, warnings: Vec<PluginFailure>) -> Self {
        Self {
            renewal_id: renewal_id.to_string(),
            status: RenewalStatus::Failed,
            error: Some(error),
            certificate: None,
            warnings,
        }
    }

    pub fn completed(
        renewal_id: &str,
        certificate: CertificateInfo,
        warnings: Vec<PluginFailure>,
    ) -> Self {
        let status = if warnings.is_empty() {
            RenewalStatus::Succeeded
        } else {
            RenewalStatus::CompletedWithWarnings
        };
        Self {
            renewal_id: renewal_id.to_string(),
            status,
            error: None,
            certificate: Some(certificate),
            warnings,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status != RenewalStatus::Failed
    }
}
