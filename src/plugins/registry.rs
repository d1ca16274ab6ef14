use std::{collections::HashMap, sync::Arc};

use log::debug;

use crate::{
    core::{error::RenewalError, types::PluginCategory},
    plugins::{
        PluginDescriptor, PluginFactory,
        csr::{EcCsrFactory, RsaCsrFactory},
        installation::ScriptInstallationFactory,
        store::{pem_files::PemFilesFactory, pfx_file::PfxFileFactory},
        target::{csr::CsrTargetFactory, manual::ManualFactory},
        validation::{
            cloudflare::CloudflareFactory, dns_script::DnsScriptFactory,
            http_webroot::HttpWebrootFactory,
        },
    },
};

/// Plugin factories keyed by category and identifier. Built once at startup
/// and shared read-only afterwards.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    factories: HashMap<(PluginCategory, String), Arc<dyn PluginFactory>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ManualFactory));
        registry.register(Arc::new(CsrTargetFactory));
        registry.register(Arc::new(DnsScriptFactory));
        registry.register(Arc::new(CloudflareFactory));
        registry.register(Arc::new(HttpWebrootFactory));
        registry.register(Arc::new(RsaCsrFactory));
        registry.register(Arc::new(EcCsrFactory));
        registry.register(Arc::new(PemFilesFactory));
        registry.register(Arc::new(PfxFileFactory));
        registry.register(Arc::new(ScriptInstallationFactory));
        registry
    }

    /// Adds a factory under its descriptor's category and id, replacing any previous one.
    pub fn register(&mut self, factory: Arc<dyn PluginFactory>) {
        let descriptor = factory.descriptor();
        debug!(
            "[plugins] registered {} plugin {}",
            descriptor.category, descriptor.id
        );
        self.factories
            .insert((descriptor.category, descriptor.id.to_string()), factory);
    }

    pub fn resolve(
        &self,
        category: PluginCategory,
        id: &str,
    ) -> Result<Arc<dyn PluginFactory>, RenewalError> {
        self.factories
            .get(&(category, id.to_string()))
            .cloned()
            .ok_or_else(|| RenewalError::PluginNotFound {
                category,
                id: id.to_string(),
            })
    }

    pub fn list_available(&self, category: PluginCategory) -> Vec<PluginDescriptor> {
        let mut descriptors: Vec<PluginDescriptor> = self
            .factories
            .iter()
            .filter(|((entry_category, _), _)| *entry_category == category)
            .map(|(_, factory)| factory.descriptor())
            .collect();
        descriptors.sort_by(|a, b| a.id.cmp(b.id));
        descriptors
    }
}
