use std::{collections::BTreeSet, fs, sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use serde_json::json;

use acme_renewer::{
    core::{
        error::RenewalError,
        types::{CancelToken, PluginCategory, PluginSelection, RenewalStatus, RunLevel},
    },
    dns::{DnsRecord, QueryType, RecordData},
    issuance::PollPolicy,
    storage::RenewalRepository,
};

use super::support::{
    BROKEN_STORE, CaMode, Harness, HarnessOptions, ScriptedTransport, answers, install, ip,
    proof_for, resolver,
};

#[test]
fn issues_one_certificate_covering_every_identifier() -> Result<()> {
    let harness = Harness::new();
    let hosts = ["a.example.com", "b.example.com", "c.example.com"];
    let definition = harness.definition(&hosts);
    let id = definition.id.clone();

    let result = harness
        .manager
        .create(definition, RunLevel::unattended(), &CancelToken::new())?;

    assert_eq!(result.status, RenewalStatus::Succeeded, "{:?}", result.error);
    let certificate = result
        .certificate
        .ok_or_else(|| anyhow!("expected a certificate"))?;
    let covered: BTreeSet<_> = certificate.identifiers.iter().cloned().collect();
    let requested: BTreeSet<_> = hosts.iter().map(|host| host.to_string()).collect();
    assert_eq!(covered, requested);

    assert_eq!(harness.events.starting_with("create ").len(), 3);
    assert_eq!(harness.events.starting_with("delete ").len(), 3);
    assert!(
        harness
            .events
            .all()
            .contains(&format!("create a.example.com _acme-challenge.a.example.com {}", proof_for("a.example.com")))
    );

    let stored = harness.store_root().join("a.example.com");
    assert!(stored.join("cert.pem").exists());
    assert!(stored.join("fullchain.pem").exists());
    assert!(stored.join("privkey.pem").exists());

    let persisted = harness
        .repository
        .get(&id)?
        .ok_or_else(|| anyhow!("definition was not persisted"))?;
    assert!(persisted.next_due.is_some());
    assert_eq!(persisted.history.len(), 1);
    assert_eq!(
        persisted.history[0].thumbprint.as_deref(),
        Some(certificate.thumbprint.as_str())
    );
    Ok(())
}

#[test]
fn a_failing_store_is_a_warning_when_another_succeeds() -> Result<()> {
    let harness = Harness::new();
    let mut definition = harness.definition(&["www.example.com"]);
    definition.stores = vec![
        PluginSelection::new(BROKEN_STORE, json!({})),
        harness.pem_store(),
    ];
    definition.installations = vec![install(false)];

    let result = harness
        .manager
        .create(definition, RunLevel::unattended(), &CancelToken::new())?;

    assert_eq!(result.status, RenewalStatus::CompletedWithWarnings);
    assert_eq!(result.warnings.len(), 1);
    assert_eq!(result.warnings[0].category, PluginCategory::Store);
    assert_eq!(result.warnings[0].plugin, BROKEN_STORE);

    let installs = harness.events.starting_with("install ");
    assert_eq!(installs.len(), 1);
    assert!(installs[0].starts_with("install stores=pem-files "));
    assert!(installs[0].ends_with("old=none"));
    Ok(())
}

#[test]
fn installation_is_skipped_when_every_store_fails() -> Result<()> {
    let harness = Harness::new();
    let mut definition = harness.definition(&["www.example.com"]);
    definition.stores = vec![PluginSelection::new(BROKEN_STORE, json!({}))];
    definition.installations = vec![install(false)];
    let id = definition.id.clone();

    let result = harness
        .manager
        .create(definition, RunLevel::unattended(), &CancelToken::new())?;

    assert_eq!(result.status, RenewalStatus::CompletedWithWarnings);
    assert_eq!(result.error, None);
    let certificate = result
        .certificate
        .ok_or_else(|| anyhow!("expected a certificate"))?;
    assert!(certificate.store_locations.is_empty());
    assert!(harness.events.starting_with("install ").is_empty());

    let categories: Vec<_> = result.warnings.iter().map(|w| w.category).collect();
    assert_eq!(categories, vec![PluginCategory::Store, PluginCategory::Installation]);
    assert_eq!(result.warnings[1].plugin, "fake-install");
    assert!(result.warnings[1].message.contains("installation skipped"));

    let persisted = harness
        .repository
        .get(&id)?
        .ok_or_else(|| anyhow!("definition was not persisted"))?;
    assert_eq!(
        persisted
            .last_certificate
            .map(|last| last.thumbprint),
        Some(certificate.thumbprint)
    );
    assert!(persisted.next_due.is_some());
    Ok(())
}

#[test]
fn the_common_name_is_ordered_first_and_becomes_the_subject() -> Result<()> {
    let harness = Harness::new();
    let mut definition = harness.definition(&[]);
    definition.target = PluginSelection::new(
        "manual",
        json!({ "hosts": ["a.example.com", "b.example.com"], "common_name": "b.example.com" }),
    );

    let result = harness
        .manager
        .create(definition, RunLevel::unattended(), &CancelToken::new())?;

    assert_eq!(result.status, RenewalStatus::Succeeded, "{:?}", result.error);
    assert!(
        harness
            .ca
            .calls()
            .contains(&"new_order b.example.com,a.example.com".to_string())
    );
    let certificate = result
        .certificate
        .ok_or_else(|| anyhow!("expected a certificate"))?;
    assert_eq!(certificate.common_name, "b.example.com");
    Ok(())
}

#[test]
fn a_required_installation_failure_fails_the_run() -> Result<()> {
    let harness = Harness::new();
    let mut definition = harness.definition(&["www.example.com"]);
    definition.installations = vec![install(true).required()];
    let id = definition.id.clone();

    let result = harness
        .manager
        .create(definition, RunLevel::unattended(), &CancelToken::new())?;

    assert_eq!(result.status, RenewalStatus::Failed);
    match result.error {
        Some(RenewalError::InstallFailed { plugin, .. }) => assert_eq!(plugin, "fake-install"),
        other => return Err(anyhow!("expected InstallFailed, got {other:?}")),
    }
    assert!(harness.repository.get(&id)?.is_none());
    Ok(())
}

#[test]
fn an_optional_installation_failure_is_a_warning() -> Result<()> {
    let harness = Harness::new();
    let mut definition = harness.definition(&["www.example.com"]);
    definition.installations = vec![install(true), install(false)];

    let result = harness
        .manager
        .create(definition, RunLevel::unattended(), &CancelToken::new())?;

    assert_eq!(result.status, RenewalStatus::CompletedWithWarnings);
    assert_eq!(result.warnings.len(), 1);
    assert_eq!(result.warnings[0].category, PluginCategory::Installation);
    assert_eq!(harness.events.starting_with("install ").len(), 2);
    Ok(())
}

#[test]
fn an_unknown_plugin_fails_before_contacting_the_ca() -> Result<()> {
    let harness = Harness::new();
    let mut definition = harness.definition(&["www.example.com"]);
    definition.validation = PluginSelection::new("dns-nowhere", json!({}));

    let result = harness
        .manager
        .create(definition, RunLevel::unattended(), &CancelToken::new())?;

    assert_eq!(
        result.error,
        Some(RenewalError::PluginNotFound {
            category: PluginCategory::Validation,
            id: "dns-nowhere".into(),
        })
    );
    assert!(harness.ca.calls().is_empty());
    assert!(harness.events.all().is_empty());
    Ok(())
}

#[test]
fn a_cancelled_run_never_reaches_the_ca() -> Result<()> {
    let harness = Harness::new();
    let cancel = CancelToken::new();
    cancel.cancel();

    let result = harness.manager.create(
        harness.definition(&["www.example.com"]),
        RunLevel::unattended(),
        &cancel,
    )?;

    assert!(matches!(result.error, Some(RenewalError::Cancelled(_))));
    assert!(harness.ca.calls().is_empty());
    Ok(())
}

#[test]
fn pending_validation_backs_off_then_cleans_up() -> Result<()> {
    let harness = Harness::with(HarnessOptions {
        mode: CaMode::NeverValid,
        poll: PollPolicy::new(10, Duration::from_secs(2), Duration::from_secs(60)),
        ..HarnessOptions::default()
    });

    let result = harness.manager.create(
        harness.definition(&["www.example.com"]),
        RunLevel::unattended(),
        &CancelToken::new(),
    )?;

    match &result.error {
        Some(RenewalError::ValidationFailed { identifier, .. }) => {
            assert_eq!(identifier, "www.example.com")
        }
        other => return Err(anyhow!("expected ValidationFailed, got {other:?}")),
    }
    let slept: Vec<u64> = harness
        .recorded_sleeps()
        .iter()
        .map(Duration::as_secs)
        .collect();
    assert_eq!(slept, vec![2, 4, 8, 16, 32, 60, 60, 60, 60]);
    assert_eq!(harness.events.starting_with("delete ").len(), 1);
    assert!(!harness.ca.calls().iter().any(|call| call.starts_with("finalize")));
    Ok(())
}

#[test]
fn a_rejected_identifier_fails_validation_and_cleans_up_everything() -> Result<()> {
    let harness = Harness::with(HarnessOptions {
        mode: CaMode::Reject("b.example.com".into()),
        ..HarnessOptions::default()
    });

    let result = harness.manager.create(
        harness.definition(&["a.example.com", "b.example.com"]),
        RunLevel::unattended(),
        &CancelToken::new(),
    )?;

    match &result.error {
        Some(RenewalError::ValidationFailed { identifier, reason }) => {
            assert_eq!(identifier, "b.example.com");
            assert!(reason.contains("incorrect TXT record"));
        }
        other => return Err(anyhow!("expected ValidationFailed, got {other:?}")),
    }
    assert_eq!(harness.events.starting_with("delete ").len(), 2);
    assert_eq!(harness.ca.calls().last().map(String::as_str), Some("discard order-1"));
    Ok(())
}

#[test]
fn preflight_reads_the_record_from_the_delegated_zone() -> Result<()> {
    let resolver_ip = "192.0.2.1";
    let proof = proof_for("a.example.com");
    let transport = Arc::new(
        ScriptedTransport::default()
            .on(resolver_ip, "example.com", QueryType::Ns, answers(vec![
                DnsRecord::new("example.com", RecordData::Ns("ns1.example.com".into())),
            ]))
            .on(resolver_ip, "ns1.example.com", QueryType::A, answers(vec![
                DnsRecord::new("ns1.example.com", RecordData::Address(ip("198.51.100.1"))),
            ]))
            .on("198.51.100.1", "_acme-challenge.a.example.com", QueryType::Txt, answers(vec![
                DnsRecord::new(
                    "_acme-challenge.a.example.com",
                    RecordData::Cname("_acme-challenge.a.example.com.dns-provider.net".into()),
                ),
            ]))
            .on(resolver_ip, "dns-provider.net", QueryType::Ns, answers(vec![
                DnsRecord::new("dns-provider.net", RecordData::Ns("ns.dns-provider.net".into())),
            ]))
            .on(resolver_ip, "ns.dns-provider.net", QueryType::A, answers(vec![
                DnsRecord::new("ns.dns-provider.net", RecordData::Address(ip("203.0.113.7"))),
            ]))
            .on("203.0.113.7", "_acme-challenge.a.example.com.dns-provider.net", QueryType::Txt, answers(vec![
                DnsRecord::new(
                    "_acme-challenge.a.example.com.dns-provider.net",
                    RecordData::Txt(vec![proof]),
                ),
            ])),
    );
    let harness = Harness::with(HarnessOptions {
        resolver: Some(Arc::new(resolver(transport.clone(), &[resolver_ip]))),
        ..HarnessOptions::default()
    });

    let result = harness.manager.create(
        harness.definition(&["a.example.com"]),
        RunLevel::unattended(),
        &CancelToken::new(),
    )?;

    assert_eq!(result.status, RenewalStatus::Succeeded, "{:?}", result.error);
    let txt_queries: Vec<_> = transport
        .calls()
        .into_iter()
        .filter(|(_, _, query_type)| *query_type == QueryType::Txt)
        .collect();
    // the first attempt already sees the value, so there is no second round
    assert_eq!(txt_queries.len(), 2);
    assert_eq!(txt_queries[1].0, ip("203.0.113.7"));
    Ok(())
}

#[test]
fn a_preflight_miss_still_asks_the_ca() -> Result<()> {
    let transport = Arc::new(ScriptedTransport::default());
    let harness = Harness::with(HarnessOptions {
        resolver: Some(Arc::new(resolver(transport.clone(), &["192.0.2.1"]))),
        ..HarnessOptions::default()
    });

    let result = harness.manager.create(
        harness.definition(&["www.example.com"]),
        RunLevel::unattended(),
        &CancelToken::new(),
    )?;

    assert_eq!(result.status, RenewalStatus::Succeeded, "{:?}", result.error);
    assert!(
        harness
            .ca
            .calls()
            .contains(&"submit www.example.com dns-01".to_string())
    );
    assert!(!transport.calls().is_empty());
    Ok(())
}

#[test]
fn pem_store_writes_the_issued_key() -> Result<()> {
    let harness = Harness::new();
    let result = harness.manager.create(
        harness.definition(&["www.example.com"]),
        RunLevel::unattended(),
        &CancelToken::new(),
    )?;
    let certificate = result
        .certificate
        .ok_or_else(|| anyhow!("expected a certificate"))?;

    let written = fs::read_to_string(harness.store_root().join("www.example.com/privkey.pem"))?;
    assert_eq!(Some(written.as_str()), certificate.private_key_pem.as_deref());
    assert_eq!(certificate.store_locations.len(), 1);
    assert_eq!(certificate.store_locations[0].plugin, "pem-files");
    Ok(())
}
