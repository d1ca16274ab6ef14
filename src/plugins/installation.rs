use std::{collections::HashMap, path::PathBuf};

use anyhow::{Result, anyhow};
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    core::types::{CertificateInfo, PluginCategory, StoreLocation, Target},
    plugins::{
        InputService, InstallationPlugin, PluginDescriptor, PluginFactory, PluginInstance,
        PluginServices, parse_options,
        script::{build_arguments, run_script},
        to_value,
    },
};

pub const SCRIPT_ID: &str = "script";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptInstallOptions {
    pub script: PathBuf,
    #[serde(default)]
    pub arguments: String,
}

/// Runs an operator script after the certificate has been stored.
pub struct ScriptInstallation {
    options: ScriptInstallOptions,
}

/// Values for the `{Name}` placeholders of an installation argument template.
pub fn placeholder_values(
    stores: &[StoreLocation],
    new_certificate: &CertificateInfo,
    old_certificate: Option<&CertificateInfo>,
) -> HashMap<&'static str, String> {
    let first_store = stores.first();
    HashMap::from([
        ("CertThumbprint", new_certificate.thumbprint.clone()),
        (
            "OldCertThumbprint",
            old_certificate
                .map(|cert| cert.thumbprint.clone())
                .unwrap_or_default(),
        ),
        ("CertCommonName", new_certificate.common_name.clone()),
        ("CertFriendlyName", new_certificate.friendly_name.clone()),
        ("RenewalId", new_certificate.renewal_id.clone()),
        (
            "StorePath",
            first_store
                .map(|store| store.location.clone())
                .unwrap_or_default(),
        ),
        (
            "StoreType",
            first_store
                .map(|store| store.plugin.clone())
                .unwrap_or_default(),
        ),
    ])
}

impl InstallationPlugin for ScriptInstallation {
    fn install(
        &self,
        stores: &[StoreLocation],
        new_certificate: &CertificateInfo,
        old_certificate: Option<&CertificateInfo>,
    ) -> Result<()> {
        let values = placeholder_values(stores, new_certificate, old_certificate);
        let arguments = build_arguments(&self.options.arguments, &values);
        let output = run_script(&self.options.script, &arguments, &[])?;
        info!(
            "[install] script {} finished for {} ({} bytes of output)",
            self.options.script.display(),
            new_certificate.common_name,
            output.len()
        );
        Ok(())
    }
}

pub struct ScriptInstallationFactory;

impl PluginFactory for ScriptInstallationFactory {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            id: SCRIPT_ID,
            category: PluginCategory::Installation,
            description: "Run a script with the new certificate's details",
        }
    }

    fn default_options(&self, arguments: &Value) -> Result<Value> {
        let options: ScriptInstallOptions = parse_options(SCRIPT_ID, arguments)?;
        if options.script.as_os_str().is_empty() {
            return Err(anyhow!("script is required"));
        }
        to_value(SCRIPT_ID, &options)
    }

    fn acquire_options(&self, _target: Option<&Target>, input: &dyn InputService) -> Result<Value> {
        let script = input.request_string("Path to the installation script")?;
        let arguments = input.request_string(
            "Arguments ({CertThumbprint}, {OldCertThumbprint}, {CertCommonName}, {StorePath} ...)",
        )?;
        self.default_options(&to_value(
            SCRIPT_ID,
            &ScriptInstallOptions {
                script: PathBuf::from(script.trim()),
                arguments,
            },
        )?)
    }

    fn create(&self, options: &Value, _services: &PluginServices) -> Result<PluginInstance> {
        let options: ScriptInstallOptions = parse_options(SCRIPT_ID, options)?;
        Ok(PluginInstance::Installation(Box::new(ScriptInstallation {
            options,
        })))
    }
}
