use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use log::{info, warn};

use super::orchestrator::RenewalOrchestrator;
use crate::{
    core::{
        error::RenewalError,
        types::{CancelToken, RenewalDefinition, RenewalResult, RunLevel},
    },
    storage::RenewalRepository,
};

/// Holds the per-definition run lock for as long as it lives.
struct RunGuard<'a> {
    running: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut running = match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        running.remove(&self.id);
    }
}

/// Creates, renews and removes persisted renewal definitions.
pub struct RenewalManager {
    repository: Arc<dyn RenewalRepository>,
    orchestrator: RenewalOrchestrator,
    renewal_days: i64,
    running: Mutex<HashSet<String>>,
}

impl RenewalManager {
    pub fn new(
        repository: Arc<dyn RenewalRepository>,
        orchestrator: RenewalOrchestrator,
        renewal_days: i64,
    ) -> Self {
        Self {
            repository,
            orchestrator,
            renewal_days,
            running: Mutex::new(HashSet::new()),
        }
    }

    fn acquire(&self, id: &str) -> Result<RunGuard<'_>, RenewalError> {
        let mut running = match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !running.insert(id.to_string()) {
            return Err(RenewalError::AlreadyRunning(id.to_string()));
        }
        Ok(RunGuard {
            running: &self.running,
            id: id.to_string(),
        })
    }

    /// Runs the first issuance for a new definition. It is persisted only
    /// when the run succeeds.
    pub fn create(
        &self,
        mut definition: RenewalDefinition,
        run_level: RunLevel,
        cancel: &CancelToken,
    ) -> Result<RenewalResult, RenewalError> {
        definition.check_shape()?;
        let _guard = self.acquire(&definition.id)?;
        let result = self.orchestrator.run(&definition, run_level, cancel);
        if result.is_success() {
            self.record(&mut definition, &result)?;
            info!("[renewal] created {} ({})", definition.friendly_name, definition.id);
        }
        Ok(result)
    }

    pub fn renew(
        &self,
        id: &str,
        run_level: RunLevel,
        cancel: &CancelToken,
    ) -> Result<RenewalResult, RenewalError> {
        let _guard = self.acquire(id)?;
        let mut definition = self
            .repository
            .get(id)
            .map_err(storage)?
            .ok_or_else(|| RenewalError::InvalidDefinition(format!("renewal {id} not found")))?;
        let result = self.orchestrator.run(&definition, run_level, cancel);
        self.record(&mut definition, &result)?;
        Ok(result)
    }

    /// Renews every due definition one after another. Not-due definitions run
    /// only when forced; a cancelled token stops the sweep between definitions.
    pub fn renew_due(
        &self,
        run_level: RunLevel,
        cancel: &CancelToken,
    ) -> Result<Vec<RenewalResult>, RenewalError> {
        let now = Utc::now();
        let due: Vec<RenewalDefinition> = self
            .repository
            .list()
            .map_err(storage)?
            .into_iter()
            .filter(|definition| run_level.force || definition.is_due(now))
            .collect();
        info!("[renewal] {} renewal(s) due", due.len());

        let mut results = Vec::with_capacity(due.len());
        for definition in due {
            if cancel.is_cancelled() {
                info!("[renewal] sweep cancelled");
                break;
            }
            match self.renew(&definition.id, run_level, cancel) {
                Ok(result) => results.push(result),
                Err(err @ RenewalError::AlreadyRunning(_)) => {
                    warn!("[renewal] skipping {}: {}", definition.id, err);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(results)
    }

    pub fn remove(&self, id: &str) -> Result<bool, RenewalError> {
        let _guard = self.acquire(id)?;
        let removed = self.repository.delete(id).map_err(storage)?;
        if removed {
            info!("[renewal] removed {}", id);
        }
        Ok(removed)
    }

    /// When the scheduler should wake us next: the earliest due date, or now
    /// when some definition has never completed.
    pub fn next_run_at(&self) -> Result<Option<DateTime<Utc>>, RenewalError> {
        let definitions = self.repository.list().map_err(storage)?;
        let now = Utc::now();
        Ok(definitions
            .iter()
            .map(|definition| definition.next_due.unwrap_or(now))
            .min())
    }

    /// Applies the run outcome to the definition. The schedule only moves on success.
    fn record(
        &self,
        definition: &mut RenewalDefinition,
        result: &RenewalResult,
    ) -> Result<(), RenewalError> {
        let now = Utc::now();
        match (&result.certificate, &result.error) {
            (Some(certificate), None) => {
                let message = if result.warnings.is_empty() {
                    "renewed".to_string()
                } else {
                    format!("renewed with {} warning(s)", result.warnings.len())
                };
                definition.record_success(now, self.renewal_days, certificate, message);
            }
            (_, error) => {
                let message = error
                    .as_ref()
                    .map(|err| err.to_string())
                    .unwrap_or_else(|| "renewal failed".to_string());
                definition.record_failure(now, message);
            }
        }
        self.repository.save(definition).map_err(storage)?;
        if let Some(entry) = definition.history.last() {
            self.repository
                .append_history(&definition.id, entry)
                .map_err(storage)?;
        }
        Ok(())
    }
}

fn storage(err: anyhow::Error) -> RenewalError {
    RenewalError::Storage(format!("{err:#}"))
}
