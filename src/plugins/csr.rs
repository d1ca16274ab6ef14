//! `rsa` and `ec` CSR plugins: key generation, optional key reuse through the
//! renewal's cache file, and PKCS#10 requests built with `rcgen`.

use std::{fs, path::Path, sync::Mutex};

use acme_lib::{create_p256_key, create_p384_key, create_rsa_key};
use anyhow::{Context, Result, anyhow};
use log::{debug, info};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    core::types::{PluginCategory, Target},
    issuance::issuer::SigningRequest,
    plugins::{
        CsrPlugin, InputService, PluginDescriptor, PluginFactory, PluginInstance, PluginServices,
        parse_options, to_value, store::write_secure_file,
    },
};

pub const RSA_ID: &str = "rsa";
pub const EC_ID: &str = "ec";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyCurve {
    #[serde(rename = "P-256")]
    P256,
    #[serde(rename = "P-384")]
    P384,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySpec {
    Rsa(u32),
    Ec(KeyCurve),
}

impl KeySpec {
    pub fn generate_pem(&self) -> Result<String> {
        let key = match self {
            KeySpec::Rsa(bits) => create_rsa_key(*bits),
            KeySpec::Ec(KeyCurve::P256) => create_p256_key(),
            KeySpec::Ec(KeyCurve::P384) => create_p384_key(),
        };
        let pem = key
            .private_key_to_pem_pkcs8()
            .map_err(|e| anyhow!("failed to serialize private key: {e}"))?;
        String::from_utf8(pem).map_err(|_| anyhow!("private key PEM contained invalid UTF-8"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RsaOptions {
    #[serde(default = "default_rsa_bits")]
    pub key_size: u32,
    #[serde(default)]
    pub reuse_key: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcOptions {
    #[serde(default = "default_curve")]
    pub curve: KeyCurve,
    #[serde(default)]
    pub reuse_key: bool,
}

fn default_rsa_bits() -> u32 {
    3072
}

fn default_curve() -> KeyCurve {
    KeyCurve::P256
}

fn check_rsa_bits(bits: u32) -> Result<()> {
    if matches!(bits, 2048 | 3072 | 4096) {
        Ok(())
    } else {
        Err(anyhow!("Unsupported RSA key size {bits}. Allowed: 2048, 3072, 4096"))
    }
}

pub struct KeyCsrPlugin {
    spec: KeySpec,
    reuse_key: bool,
    key: Mutex<Option<String>>,
}

impl KeyCsrPlugin {
    pub fn new(spec: KeySpec, reuse_key: bool) -> Self {
        Self {
            spec,
            reuse_key,
            key: Mutex::new(None),
        }
    }

    fn remember(&self, pem: &str) {
        if let Ok(mut key) = self.key.lock() {
            *key = Some(pem.to_string());
        }
    }

    /// Key for this request: the cached one when reuse is on and it exists,
    /// otherwise this instance's key, stored in the cache when reuse is on.
    fn key_for_request(&self, cache_file: &Path) -> Result<String> {
        if self.reuse_key && cache_file.exists() {
            let pem = fs::read_to_string(cache_file)
                .with_context(|| format!("failed to read cached key {}", cache_file.display()))?;
            KeyPair::from_pem(&pem)
                .map_err(|err| anyhow!("cached key {} is unusable: {err}", cache_file.display()))?;
            info!("[plugins] reusing private key from {}", cache_file.display());
            self.remember(&pem);
            return Ok(pem);
        }
        let pem = self.get_keys()?;
        if self.reuse_key {
            if let Some(parent) = cache_file.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            write_secure_file(cache_file, pem.as_bytes(), true)?;
            debug!("[plugins] cached private key at {}", cache_file.display());
        }
        Ok(pem)
    }
}

impl CsrPlugin for KeyCsrPlugin {
    fn get_keys(&self) -> Result<String> {
        let mut key = self
            .key
            .lock()
            .map_err(|_| anyhow!("key lock poisoned"))?;
        if let Some(pem) = key.as_ref() {
            return Ok(pem.clone());
        }
        let pem = self.spec.generate_pem()?;
        *key = Some(pem.clone());
        Ok(pem)
    }

    fn generate_csr(
        &self,
        cache_file: &Path,
        common_name: &str,
        identifiers: &[String],
    ) -> Result<SigningRequest> {
        if identifiers.is_empty() {
            return Err(anyhow!("a signing request needs at least one identifier"));
        }
        let private_key_pem = self.key_for_request(cache_file)?;
        let key_pair = KeyPair::from_pem(&private_key_pem)
            .map_err(|err| anyhow!("failed to load private key: {err}"))?;

        let mut params = CertificateParams::new(identifiers.to_vec())
            .map_err(|err| anyhow!("invalid identifiers for CSR: {err}"))?;
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, common_name);
        let csr = params
            .serialize_request(&key_pair)
            .map_err(|err| anyhow!("failed to build CSR: {err}"))?;
        let csr_pem = csr
            .pem()
            .map_err(|err| anyhow!("failed to encode CSR: {err}"))?;

        Ok(SigningRequest {
            common_name: common_name.to_string(),
            identifiers: identifiers.to_vec(),
            csr_der: csr.der().to_vec(),
            csr_pem,
            private_key_pem,
        })
    }
}

pub struct RsaCsrFactory;

impl PluginFactory for RsaCsrFactory {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            id: RSA_ID,
            category: PluginCategory::Csr,
            description: "RSA private key (2048, 3072 or 4096 bits)",
        }
    }

    fn default_options(&self, arguments: &Value) -> Result<Value> {
        let options: RsaOptions = parse_options(RSA_ID, arguments)?;
        check_rsa_bits(options.key_size)?;
        to_value(RSA_ID, &options)
    }

    fn acquire_options(&self, _target: Option<&Target>, input: &dyn InputService) -> Result<Value> {
        let size = input.request_string("RSA key size (2048, 3072, 4096)")?;
        let key_size = match size.trim() {
            "" => default_rsa_bits(),
            raw => raw
                .parse()
                .map_err(|_| anyhow!("key size must be a number"))?,
        };
        let reuse_key = input.prompt_yes_no("Reuse the private key on renewal?", false)?;
        self.default_options(&to_value(RSA_ID, &RsaOptions { key_size, reuse_key })?)
    }

    fn create(&self, options: &Value, _services: &PluginServices) -> Result<PluginInstance> {
        let options: RsaOptions = parse_options(RSA_ID, options)?;
        check_rsa_bits(options.key_size)?;
        Ok(PluginInstance::Csr(Box::new(KeyCsrPlugin::new(
            KeySpec::Rsa(options.key_size),
            options.reuse_key,
        ))))
    }
}

pub struct EcCsrFactory;

impl PluginFactory for EcCsrFactory {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            id: EC_ID,
            category: PluginCategory::Csr,
            description: "Elliptic curve private key (P-256 or P-384)",
        }
    }

    fn default_options(&self, arguments: &Value) -> Result<Value> {
        let options: EcOptions = parse_options(EC_ID, arguments)?;
        to_value(EC_ID, &options)
    }

    fn acquire_options(&self, _target: Option<&Target>, input: &dyn InputService) -> Result<Value> {
        let curve = match input.request_string("Curve (P-256, P-384)")?.trim() {
            "" | "P-256" | "p-256" => KeyCurve::P256,
            "P-384" | "p-384" => KeyCurve::P384,
            other => return Err(anyhow!("unsupported curve {other}")),
        };
        let reuse_key = input.prompt_yes_no("Reuse the private key on renewal?", false)?;
        to_value(EC_ID, &EcOptions { curve, reuse_key })
    }

    fn create(&self, options: &Value, _services: &PluginServices) -> Result<PluginInstance> {
        let options: EcOptions = parse_options(EC_ID, options)?;
        Ok(PluginInstance::Csr(Box::new(KeyCsrPlugin::new(
            KeySpec::Ec(options.curve),
            options.reuse_key,
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::target::csr::parse_csr_names;
    use serde_json::json;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn csr_covers_common_name_and_identifiers() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = KeyCsrPlugin::new(KeySpec::Ec(KeyCurve::P256), false);
        let request = plugin
            .generate_csr(
                &dir.path().join("r1.key"),
                "example.com",
                &ids(&["example.com", "*.example.com"]),
            )
            .unwrap();

        let (cn, sans) = parse_csr_names(&request.csr_pem).unwrap();
        assert_eq!(cn.as_deref(), Some("example.com"));
        assert_eq!(sans, ids(&["example.com", "*.example.com"]));
        assert!(!dir.path().join("r1.key").exists());
        assert_eq!(request.private_key_pem, plugin.get_keys().unwrap());
    }

    #[test]
    fn reused_key_survives_new_instances() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("keys").join("r1.key");
        let first = KeyCsrPlugin::new(KeySpec::Ec(KeyCurve::P384), true)
            .generate_csr(&cache, "a.example.com", &ids(&["a.example.com"]))
            .unwrap();
        let second = KeyCsrPlugin::new(KeySpec::Ec(KeyCurve::P384), true)
            .generate_csr(&cache, "a.example.com", &ids(&["a.example.com"]))
            .unwrap();
        assert_eq!(first.private_key_pem, second.private_key_pem);
    }

    #[test]
    fn fresh_key_without_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("r1.key");
        let first = KeyCsrPlugin::new(KeySpec::Ec(KeyCurve::P256), false)
            .generate_csr(&cache, "a.example.com", &ids(&["a.example.com"]))
            .unwrap();
        let second = KeyCsrPlugin::new(KeySpec::Ec(KeyCurve::P256), false)
            .generate_csr(&cache, "a.example.com", &ids(&["a.example.com"]))
            .unwrap();
        assert_ne!(first.private_key_pem, second.private_key_pem);
    }

    #[test]
    fn rsa_size_is_checked() {
        assert!(RsaCsrFactory.default_options(&json!({"key_size": 1024})).is_err());
        let options = RsaCsrFactory.default_options(&json!({})).unwrap();
        assert_eq!(options["key_size"], json!(3072));
    }

    #[test]
    fn ec_curve_names_round_trip() {
        let options = EcCsrFactory.default_options(&json!({"curve": "P-384"})).unwrap();
        assert_eq!(options["curve"], json!("P-384"));
    }
}
