//! One renewal run: target, validation, CSR, CA order, stores, installations.
//!
//! Every plugin is resolved and checked for eligibility before the first
//! network call. Target, validation, CSR and CA failures end the run; store
//! and installation failures are collected per plugin as warnings. Only a
//! failed required installation is fatal once the certificate exists. When no
//! store accepts the certificate, installation is skipped and the run still
//! completes with warnings so the issued certificate is recorded.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use log::{info, warn};

use crate::{
    core::{
        error::RenewalError,
        types::{
            CancelToken, CertificateInfo, PluginCategory, PluginFailure, PluginSelection,
            RenewalDefinition, RenewalResult, RunLevel, StoreLocation, Target,
        },
    },
    issuance::{CertificateAuthorityClient, certificate::certificate_info},
    plugins::{PluginFactory, PluginRegistry, PluginServices, ValidationPlugin},
    plugins::store::safe_file_stem,
};

/// Factories for every selection of a definition, resolved up front.
struct ResolvedPlugins {
    target: Arc<dyn PluginFactory>,
    validation: Arc<dyn PluginFactory>,
    csr: Arc<dyn PluginFactory>,
    stores: Vec<(PluginSelection, Arc<dyn PluginFactory>)>,
    installations: Vec<(PluginSelection, Arc<dyn PluginFactory>)>,
}

pub struct RenewalOrchestrator {
    registry: Arc<PluginRegistry>,
    services: PluginServices,
    ca: CertificateAuthorityClient,
}

impl RenewalOrchestrator {
    pub fn new(
        registry: Arc<PluginRegistry>,
        services: PluginServices,
        ca: CertificateAuthorityClient,
    ) -> Self {
        Self {
            registry,
            services,
            ca,
        }
    }

    pub fn run(
        &self,
        definition: &RenewalDefinition,
        run_level: RunLevel,
        cancel: &CancelToken,
    ) -> RenewalResult {
        info!(
            "[renewal] starting {} ({}){}",
            definition.friendly_name,
            definition.id,
            if run_level.force { " forced" } else { "" }
        );
        let mut warnings = Vec::new();
        match self.execute(definition, cancel, &mut warnings) {
            Ok(certificate) => {
                info!(
                    "[renewal] {} issued {} with {} warning(s)",
                    definition.id,
                    certificate.thumbprint,
                    warnings.len()
                );
                RenewalResult::completed(&definition.id, certificate, warnings)
            }
            Err((err, certificate)) => {
                warn!("[renewal] {} failed: {}", definition.id, err);
                let mut result = RenewalResult::failed(&definition.id, err, warnings);
                result.certificate = certificate;
                result
            }
        }
    }

    /// On failure after issuance the certificate is returned alongside the error.
    fn execute(
        &self,
        definition: &RenewalDefinition,
        cancel: &CancelToken,
        warnings: &mut Vec<PluginFailure>,
    ) -> Result<CertificateInfo, (RenewalError, Option<CertificateInfo>)> {
        let before_issue =
            |err: RenewalError| -> (RenewalError, Option<CertificateInfo>) { (err, None) };

        definition.check_shape().map_err(before_issue)?;
        let plugins = self.resolve(definition).map_err(before_issue)?;

        cancel.checkpoint("target resolution").map_err(before_issue)?;
        let target = self
            .generate_target(definition, &plugins)
            .map_err(before_issue)?;
        // The CA takes the first identifier of the order as the subject common name.
        let identifiers = order_identifiers(&target);

        let validators = self
            .validation_plugins(definition, &plugins, &target)
            .map_err(before_issue)?;

        let csr = plugins
            .csr
            .create(&definition.csr.options, &self.services)
            .and_then(|instance| instance.into_csr())
            .map_err(|err| before_issue(plugin_error("csr", &definition.csr.plugin, err)))?;
        let cache_file = self.key_cache_file(definition);
        let request = csr
            .generate_csr(&cache_file, &target.common_name, &identifiers)
            .map_err(|err| before_issue(plugin_error("csr", &definition.csr.plugin, err)))?;

        let order = self
            .ca
            .issue(&identifiers, &validators, &request, cancel)
            .map_err(before_issue)?;

        let friendly_name = if definition.friendly_name.trim().is_empty() {
            target.friendly_name.as_str()
        } else {
            definition.friendly_name.as_str()
        };
        let certificate =
            certificate_info(&definition.id, friendly_name, &identifiers, &order.certificate)
                .map_err(before_issue)?;
        let mut certificate = csr
            .post_process(certificate)
            .map_err(|err| before_issue(plugin_error("csr", &definition.csr.plugin, err)))?;

        // The order is complete; from here on the certificate always reaches the stores.
        let locations = self.store_all(&plugins, &certificate, warnings);
        if locations.is_empty() {
            let failed: Vec<String> = warnings
                .iter()
                .filter(|w| w.category == PluginCategory::Store)
                .map(|w| format!("{}: {}", w.plugin, w.message))
                .collect();
            let reason = RenewalError::StoreFailed(format!(
                "no store accepted the certificate ({}); installation skipped",
                failed.join("; ")
            ))
            .to_string();
            warn!("[renewal] {} {}", definition.id, reason);
            for (selection, _) in &plugins.installations {
                warnings.push(PluginFailure {
                    category: PluginCategory::Installation,
                    plugin: selection.plugin.clone(),
                    message: reason.clone(),
                });
            }
            return Ok(certificate);
        }
        certificate.store_locations = locations;

        let old = definition.last_certificate.as_ref();
        if let Err(err) = self.install_all(&plugins, &certificate, old, warnings) {
            return Err((err, Some(certificate)));
        }
        Ok(certificate)
    }

    /// Resolves every configured plugin and applies the activity predicates,
    /// so a bad definition fails before any I/O.
    fn resolve(&self, definition: &RenewalDefinition) -> Result<ResolvedPlugins, RenewalError> {
        let lookup = |category: PluginCategory,
                      selection: &PluginSelection|
         -> Result<Arc<dyn PluginFactory>, RenewalError> {
            let factory = self.registry.resolve(category, &selection.plugin)?;
            if !factory.is_active(&selection.options) {
                return Err(RenewalError::PluginInactive {
                    category,
                    id: selection.plugin.clone(),
                });
            }
            Ok(factory)
        };
        let many = |category: PluginCategory, selections: &[PluginSelection]| {
            selections
                .iter()
                .map(|selection| -> Result<_, RenewalError> {
                    Ok((selection.clone(), lookup(category, selection)?))
                })
                .collect::<Result<Vec<_>, RenewalError>>()
        };
        Ok(ResolvedPlugins {
            target: lookup(PluginCategory::Target, &definition.target)?,
            validation: lookup(PluginCategory::Validation, &definition.validation)?,
            csr: lookup(PluginCategory::Csr, &definition.csr)?,
            stores: many(PluginCategory::Store, &definition.stores)?,
            installations: many(PluginCategory::Installation, &definition.installations)?,
        })
    }

    fn generate_target(
        &self,
        definition: &RenewalDefinition,
        plugins: &ResolvedPlugins,
    ) -> Result<Target, RenewalError> {
        let plugin = plugins
            .target
            .create(&definition.target.options, &self.services)
            .and_then(|instance| instance.into_target())
            .map_err(|err| RenewalError::TargetUnavailable(format!("{err:#}")))?;
        let target = plugin
            .generate()
            .map_err(|err| RenewalError::TargetUnavailable(format!("{err:#}")))?
            .ok_or_else(|| {
                RenewalError::TargetUnavailable(format!(
                    "{} target produced nothing for renewal {}",
                    definition.target.plugin, definition.id
                ))
            })?;
        let target = target.normalized()?;
        info!(
            "[renewal] target {} covers {}",
            target.friendly_name,
            target.identifiers().join(", ")
        );
        Ok(target)
    }

    /// One validation plugin instance per identifier.
    fn validation_plugins(
        &self,
        definition: &RenewalDefinition,
        plugins: &ResolvedPlugins,
        target: &Target,
    ) -> Result<HashMap<String, Box<dyn ValidationPlugin>>, RenewalError> {
        if !plugins.validation.can_validate(target) {
            return Err(RenewalError::PluginInactive {
                category: PluginCategory::Validation,
                id: definition.validation.plugin.clone(),
            });
        }
        let mut validators = HashMap::new();
        for identifier in target.identifiers() {
            let plugin = plugins
                .validation
                .create(&definition.validation.options, &self.services)
                .and_then(|instance| instance.into_validation())
                .map_err(|err| RenewalError::validation(&identifier, format!("{err:#}")))?;
            validators.insert(identifier, plugin);
        }
        Ok(validators)
    }

    fn key_cache_file(&self, definition: &RenewalDefinition) -> PathBuf {
        self.services
            .key_cache_dir
            .join(format!("{}.key", safe_file_stem(&definition.id)))
    }

    /// Runs every store in order; failures become warnings.
    fn store_all(
        &self,
        plugins: &ResolvedPlugins,
        certificate: &CertificateInfo,
        warnings: &mut Vec<PluginFailure>,
    ) -> Vec<StoreLocation> {
        let mut locations = Vec::new();
        for (selection, factory) in &plugins.stores {
            let saved = factory
                .create(&selection.options, &self.services)
                .and_then(|instance| instance.into_store())
                .and_then(|store| store.save(certificate));
            match saved {
                Ok(location) => {
                    info!("[store] {} stored at {}", selection.plugin, location.location);
                    locations.push(location);
                }
                Err(err) => {
                    warn!("[store] {} failed: {:#}", selection.plugin, err);
                    warnings.push(PluginFailure {
                        category: PluginCategory::Store,
                        plugin: selection.plugin.clone(),
                        message: format!("{err:#}"),
                    });
                }
            }
        }
        locations
    }

    /// Runs every installation in order. Only a required installation's failure is returned.
    fn install_all(
        &self,
        plugins: &ResolvedPlugins,
        certificate: &CertificateInfo,
        old: Option<&CertificateInfo>,
        warnings: &mut Vec<PluginFailure>,
    ) -> Result<(), RenewalError> {
        for (selection, factory) in &plugins.installations {
            let installed = factory
                .create(&selection.options, &self.services)
                .and_then(|instance| instance.into_installation())
                .and_then(|plugin| plugin.install(&certificate.store_locations, certificate, old));
            match installed {
                Ok(()) => info!("[install] {} completed", selection.plugin),
                Err(err) if selection.required => {
                    return Err(RenewalError::InstallFailed {
                        plugin: selection.plugin.clone(),
                        reason: format!("{err:#}"),
                    });
                }
                Err(err) => {
                    warn!("[install] {} failed: {:#}", selection.plugin, err);
                    warnings.push(PluginFailure {
                        category: PluginCategory::Installation,
                        plugin: selection.plugin.clone(),
                        message: format!("{err:#}"),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Target identifiers with the common name moved to the front.
fn order_identifiers(target: &Target) -> Vec<String> {
    let mut identifiers = target.identifiers();
    if let Some(position) = identifiers.iter().position(|id| *id == target.common_name) {
        let common_name = identifiers.remove(position);
        identifiers.insert(0, common_name);
    }
    identifiers
}

fn plugin_error(stage: &str, plugin: &str, err: anyhow::Error) -> RenewalError {
    RenewalError::IssuanceFailed(format!("{stage} plugin {plugin} failed: {err:#}"))
}
