use std::{path::PathBuf, sync::Arc};

use acme_renewer::{
    core::{
        config::Settings,
        types::{CancelToken, RunLevel, RenewalStatus},
    },
    dns::{DelegationResolver, LookupClientProvider, UdpTransport},
    domain::PublicSuffixParser,
    issuance::{AcmeLibProtocol, CertificateAuthorityClient, PollPolicy},
    plugins::{PluginRegistry, PluginServices},
    renewal::{RenewalManager, RenewalOrchestrator},
    storage::SqliteRenewalStore,
};
use anyhow::{Context, Result};
use log::{error, info, warn};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        error!("[renewal] {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let settings_path = std::env::var_os("ACME_RENEWER_CONFIG").map(PathBuf::from);
    let settings = Settings::load(settings_path.as_deref())?;

    let transport = Arc::new(UdpTransport::new(settings.dns_timeout()));
    let provider = LookupClientProvider::new(&settings.dns.servers, transport)
        .context("no usable DNS servers configured")?;
    let resolver = Arc::new(DelegationResolver::new(
        provider,
        Arc::new(PublicSuffixParser),
    ));
    let services = PluginServices::from_settings(&settings, Some(resolver));
    let registry = Arc::new(PluginRegistry::with_builtin());

    let protocol = Arc::new(AcmeLibProtocol::connect(&settings)?);
    let ca = CertificateAuthorityClient::new(protocol, PollPolicy::from_settings(&settings.polling));
    let orchestrator = RenewalOrchestrator::new(registry, services, ca);
    let repository = Arc::new(SqliteRenewalStore::open(&settings.database_path())?);
    let manager = RenewalManager::new(repository, orchestrator, settings.renewal_days);

    let run_level = if settings.force {
        RunLevel::forced()
    } else {
        RunLevel::unattended()
    };
    let results = manager.renew_due(run_level, &CancelToken::new())?;
    let mut failures = 0;
    for result in &results {
        match result.status {
            RenewalStatus::Succeeded => info!("[renewal] {} renewed", result.renewal_id),
            RenewalStatus::CompletedWithWarnings => {
                for warning in &result.warnings {
                    warn!(
                        "[renewal] {} {} plugin {}: {}",
                        result.renewal_id, warning.category, warning.plugin, warning.message
                    );
                }
            }
            RenewalStatus::Failed => failures += 1,
        }
    }
    info!(
        "[renewal] processed {} renewal(s), {} failed",
        results.len(),
        failures
    );
    if let Some(next) = manager.next_run_at()? {
        info!("[renewal] next run due at {}", next.to_rfc3339());
    }
    Ok(())
}
