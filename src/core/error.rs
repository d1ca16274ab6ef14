use thiserror::Error;

use super::types::PluginCategory;

/// Failure taxonomy of a renewal run.
///
/// `InstallFailed` is fatal only for a required installation. Store failures and
/// optional installation failures surface as warnings in the result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenewalError {
    #[error("target unavailable: {0}")]
    TargetUnavailable(String),
    #[error("validation failed for {identifier}: {reason}")]
    ValidationFailed { identifier: String, reason: String },
    #[error("issuance failed: {0}")]
    IssuanceFailed(String),
    #[error("store failed: {0}")]
    StoreFailed(String),
    #[error("installation plugin {plugin} failed: {reason}")]
    InstallFailed { plugin: String, reason: String },
    #[error("{category} plugin not found: {id}")]
    PluginNotFound { category: PluginCategory, id: String },
    #[error("{category} plugin {id} is not usable for this renewal")]
    PluginInactive { category: PluginCategory, id: String },
    #[error("renewal definition invalid: {0}")]
    InvalidDefinition(String),
    #[error("renewal run cancelled before {0}")]
    Cancelled(String),
    #[error("renewal {0} is already running")]
    AlreadyRunning(String),
    #[error("renewal storage error: {0}")]
    Storage(String),
}

impl RenewalError {
    pub fn validation(identifier: impl Into<String>, reason: impl ToString) -> Self {
        RenewalError::ValidationFailed {
            identifier: identifier.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether retrying the same definition later can reasonably succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RenewalError::ValidationFailed { .. }
                | RenewalError::IssuanceFailed(_)
                | RenewalError::StoreFailed(_)
                | RenewalError::InstallFailed { .. }
                | RenewalError::Cancelled(_)
        )
    }
}

impl From<rusqlite::Error> for RenewalError {
    fn from(value: rusqlite::Error) -> Self {
        RenewalError::Storage(value.to_string())
    }
}
