use std::{fs, path::PathBuf};

use anyhow::{Context, Result, anyhow};
use log::info;
use openssl::{pkcs12::Pkcs12, pkey::PKey, stack::Stack, x509::X509};
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

pub const ID: &str = "pfx-file";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PfxOptions {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// PKCS#12 archive with key, leaf and chain, named after the common name.
pub struct PfxFileStore {
    options: PfxOptions,
}

pub fn build_pkcs12(certificate: &CertificateInfo, password: &str) -> Result<Vec<u8>> {
    let key_pem = certificate
        .private_key_pem
        .as_deref()
        .ok_or_else(|| anyhow!("PFX export needs the private key"))?;
    let key = PKey::private_key_from_pem(key_pem.as_bytes())
        .map_err(|err| anyhow!("failed to load private key: {err}"))?;

    let split = split_certificate_chain(&certificate.chain_pem)?;
    let leaf = X509::from_pem(split.leaf.as_bytes())
        .map_err(|err| anyhow!("failed to load certificate: {err}"))?;
    let mut chain = Stack::new().map_err(|err| anyhow!("openssl stack: {err}"))?;
    for pem in &split.intermediates {
        let cert = X509::from_pem(pem.as_bytes())
            .map_err(|err| anyhow!("failed to load chain certificate: {err}"))?;
        chain
            .push(cert)
            .map_err(|err| anyhow!("openssl stack: {err}"))?;
    }

    let archive = Pkcs12::builder()
        .name(&certificate.friendly_name)
        .pkey(&key)
        .cert(&leaf)
        .ca(chain)
        .build2(password)
        .map_err(|err| anyhow!("failed to build PKCS#12: {err}"))?;
    archive
        .to_der()
        .map_err(|err| anyhow!("failed to encode PKCS#12: {err}"))
}

impl StorePlugin for PfxFileStore {
    fn save(&self, certificate: &CertificateInfo) -> Result<StoreLocation> {
        fs::create_dir_all(&self.options.path)
            .with_context(|| format!("failed to create {}", self.options.path.display()))?;
        let der = build_pkcs12(certificate, self.options.password.as_deref().unwrap_or(""))?;
        let path = self
            .options
            .path
            .join(format!("{}.pfx", safe_file_stem(&certificate.common_name)));
        write_secure_file(&path, &der, true)?;
        info!("[store] wrote {}", path.display());
        Ok(StoreLocation {
            plugin: ID.to_string(),
            location: path.display().to_string(),
        })
    }
}

pub struct PfxFileFactory;

impl PluginFactory for PfxFileFactory {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            id: ID,
            category: PluginCategory::Store,
            description: "PKCS#12 (.pfx) archive",
        }
    }

    fn default_options(&self, arguments: &Value) -> Result<Value> {
        let options: PfxOptions = parse_options(ID, arguments)?;
        if options.path.as_os_str().is_empty() {
            return Err(anyhow!("path is required"));
        }
        to_value(ID, &options)
    }

    fn acquire_options(&self, _target: Option<&Target>, input: &dyn InputService) -> Result<Value> {
        let path = input.request_string("Directory for the .pfx file")?;
        let password = input.request_string("Archive password (blank for none)")?;
        self.default_options(&to_value(
            ID,
            &PfxOptions {
                path: PathBuf::from(path.trim()),
                password: Some(password).filter(|p| !p.is_empty()),
            },
        )?)
    }

    fn create(&self, options: &Value, _services: &PluginServices) -> Result<PluginInstance> {
        let options: PfxOptions = parse_options(ID, options)?;
        Ok(PluginInstance::Store(Box::new(PfxFileStore { options })))
    }
}
