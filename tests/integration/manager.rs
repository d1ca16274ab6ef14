use anyhow::{Result, anyhow};
use chrono::{Duration, Utc};

use acme_renewer::{
    core::{
        error::RenewalError,
        types::{CancelToken, RenewalStatus, RunLevel},
    },
    storage::RenewalRepository,
};

use super::support::{CaMode, Harness, install};

/// Creates one definition with a recording installation and returns its id.
fn created(harness: &Harness) -> Result<String> {
    let mut definition = harness.definition(&["www.example.com"]);
    definition.installations = vec![install(false)];
    let id = definition.id.clone();
    let result = harness
        .manager
        .create(definition, RunLevel::unattended(), &CancelToken::new())?;
    if !result.is_success() {
        return Err(anyhow!("initial issuance failed: {:?}", result.error));
    }
    Ok(id)
}

#[test]
fn renewal_hands_the_previous_certificate_to_installations() -> Result<()> {
    let harness = Harness::new();
    let id = created(&harness)?;
    let first = harness
        .repository
        .get(&id)?
        .and_then(|definition| definition.last_certificate)
        .ok_or_else(|| anyhow!("no certificate recorded"))?;

    let result = harness
        .manager
        .renew(&id, RunLevel::forced(), &CancelToken::new())?;

    assert_eq!(result.status, RenewalStatus::Succeeded, "{:?}", result.error);
    let installs = harness.events.starting_with("install ");
    assert_eq!(installs.len(), 2);
    assert!(installs[1].ends_with(&format!("old={}", first.thumbprint)));

    let stored = harness
        .repository
        .get(&id)?
        .ok_or_else(|| anyhow!("definition disappeared"))?;
    assert_eq!(stored.history.len(), 2);
    assert!(stored.history.iter().all(|entry| entry.success));
    Ok(())
}

#[test]
fn a_failed_renewal_keeps_the_schedule_and_logs_history() -> Result<()> {
    let harness = Harness::new();
    let id = created(&harness)?;
    let before = harness
        .repository
        .get(&id)?
        .ok_or_else(|| anyhow!("definition was not persisted"))?;

    harness.ca.set_mode(CaMode::Reject("www.example.com".into()));
    let result = harness
        .manager
        .renew(&id, RunLevel::forced(), &CancelToken::new())?;
    assert_eq!(result.status, RenewalStatus::Failed);

    let after = harness
        .repository
        .get(&id)?
        .ok_or_else(|| anyhow!("definition disappeared"))?;
    assert_eq!(after.next_due, before.next_due);
    assert_eq!(after.last_renewal, before.last_renewal);
    assert_eq!(after.history.len(), 2);
    let last = after
        .history
        .last()
        .ok_or_else(|| anyhow!("no history"))?;
    assert!(!last.success);
    assert!(last.message.contains("www.example.com"));
    Ok(())
}

#[test]
fn sweep_only_runs_due_definitions_unless_forced() -> Result<()> {
    let harness = Harness::new();
    created(&harness)?;

    let unattended = harness
        .manager
        .renew_due(RunLevel::unattended(), &CancelToken::new())?;
    assert!(unattended.is_empty());

    let forced = harness
        .manager
        .renew_due(RunLevel::forced(), &CancelToken::new())?;
    assert_eq!(forced.len(), 1);
    assert!(forced[0].is_success());
    Ok(())
}

#[test]
fn sweep_stops_when_cancelled() -> Result<()> {
    let harness = Harness::new();
    created(&harness)?;
    let cancel = CancelToken::new();
    cancel.cancel();

    let results = harness.manager.renew_due(RunLevel::forced(), &cancel)?;

    assert!(results.is_empty());
    Ok(())
}

#[test]
fn next_run_follows_the_earliest_due_definition() -> Result<()> {
    let harness = Harness::new();
    assert_eq!(harness.manager.next_run_at()?, None);

    let id = created(&harness)?;
    let next = harness
        .manager
        .next_run_at()?
        .ok_or_else(|| anyhow!("expected a next run"))?;
    let expected = Utc::now() + Duration::days(30);
    assert!((expected - next).num_minutes().abs() < 5);

    assert!(harness.manager.remove(&id)?);
    assert!(!harness.manager.remove(&id)?);
    assert_eq!(harness.manager.next_run_at()?, None);
    Ok(())
}

#[test]
fn renewing_an_unknown_id_is_rejected() {
    let harness = Harness::new();

    let err = harness
        .manager
        .renew("missing", RunLevel::forced(), &CancelToken::new())
        .unwrap_err();

    assert!(matches!(err, RenewalError::InvalidDefinition(_)));
}

#[test]
fn a_definition_without_stores_is_rejected_up_front() {
    let harness = Harness::new();
    let mut definition = harness.definition(&["www.example.com"]);
    definition.stores.clear();

    let err = harness
        .manager
        .create(definition, RunLevel::unattended(), &CancelToken::new())
        .unwrap_err();

    assert!(matches!(err, RenewalError::InvalidDefinition(_)));
    assert!(harness.ca.calls().is_empty());
}
