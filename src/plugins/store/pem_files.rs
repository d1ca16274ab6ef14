use std::{fs, path::PathBuf};

use anyhow::{Context, Result, anyhow};
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{safe_file_stem, split_certificate_chain, write_secure_file};
use crate::{
    core::types::{CertificateInfo, PluginCategory, StoreLocation, Target},
    plugins::{
        InputService, PluginDescriptor, PluginFactory, PluginInstance, PluginServices, StorePlugin,
        parse_options, to_value,
    },
};

pub const ID: &str = "pem-files";
const CERT_FILENAME: &str = "cert.pem";
const CHAIN_FILENAME: &str = "chain.pem";
const FULLCHAIN_FILENAME: &str = "fullchain.pem";
const PRIVKEY_FILENAME: &str = "privkey.pem";

fn default_include_key() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PemFilesOptions {
    pub path: PathBuf,
    #[serde(default = "default_include_key")]
    pub include_private_key: bool,
}

/// Writes `cert.pem`, `chain.pem`, `fullchain.pem` and `privkey.pem` into
/// `<path>/<common name>/`, replacing the previous renewal's files.
pub struct PemFilesStore {
    options: PemFilesOptions,
}

impl StorePlugin for PemFilesStore {
    fn save(&self, certificate: &CertificateInfo) -> Result<StoreLocation> {
        let output_dir = self
            .options
            .path
            .join(safe_file_stem(&certificate.common_name));
        fs::create_dir_all(&output_dir)
            .with_context(|| format!("failed to create {}", output_dir.display()))?;

        let split = split_certificate_chain(&certificate.chain_pem)?;
        write_secure_file(&output_dir.join(CERT_FILENAME), split.leaf.as_bytes(), true)?;
        write_secure_file(
            &output_dir.join(FULLCHAIN_FILENAME),
            split.fullchain().as_bytes(),
            true,
        )?;
        let chain_path = output_dir.join(CHAIN_FILENAME);
        if split.intermediates.is_empty() {
            if chain_path.exists() {
                fs::remove_file(&chain_path)
                    .with_context(|| format!("failed to remove stale {}", chain_path.display()))?;
            }
        } else {
            write_secure_file(&chain_path, split.chain_only().as_bytes(), true)?;
        }

        if self.options.include_private_key {
            let key_pem = certificate.private_key_pem.as_deref().ok_or_else(|| {
                anyhow!("private key export requested but no key material was provided")
            })?;
            write_secure_file(&output_dir.join(PRIVKEY_FILENAME), key_pem.as_bytes(), true)?;
        }

        info!(
            "[store] wrote PEM files for {} to {}",
            certificate.common_name,
            output_dir.display()
        );
        Ok(StoreLocation {
            plugin: ID.to_string(),
            location: output_dir.display().to_string(),
        })
    }
}

pub struct PemFilesFactory;

impl PluginFactory for PemFilesFactory {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            id: ID,
            category: PluginCategory::Store,
            description: "PEM encoded files in a directory",
        }
    }

    fn default_options(&self, arguments: &Value) -> Result<Value> {
        let options: PemFilesOptions = parse_options(ID, arguments)?;
        if options.path.as_os_str().is_empty() {
            return Err(anyhow!("path is required"));
        }
        to_value(ID, &options)
    }

    fn acquire_options(&self, _target: Option<&Target>, input: &dyn InputService) -> Result<Value> {
        let path = input.request_string("Directory for the PEM files")?;
        let include_private_key = input.prompt_yes_no("Write the private key?", true)?;
        self.default_options(&to_value(
            ID,
            &PemFilesOptions {
                path: PathBuf::from(path.trim()),
                include_private_key,
            },
        )?)
    }

    fn create(&self, options: &Value, _services: &PluginServices) -> Result<PluginInstance> {
        let options: PemFilesOptions = parse_options(ID, options)?;
        Ok(PluginInstance::Store(Box::new(PemFilesStore { options })))
    }
}
