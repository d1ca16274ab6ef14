use std::{fs, path::PathBuf};

use anyhow::{Context, Result, anyhow};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use x509_parser::{
    certification_request::X509CertificationRequest,
    extensions::{GeneralName, ParsedExtension},
    prelude::FromDer,
};

use crate::{
    core::types::{PluginCategory, Target, TargetPart},
    domain::normalize_identifiers,
    plugins::{
        InputService, PluginDescriptor, PluginFactory, PluginInstance, PluginServices,
        TargetPlugin, parse_options, to_value,
    },
};

pub const ID: &str = "csr";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CsrTargetOptions {
    pub csr_path: Option<PathBuf>,
}

/// Identifiers taken from an existing PEM certificate signing request.
pub struct CsrTarget {
    csr_path: PathBuf,
}

impl TargetPlugin for CsrTarget {
    fn generate(&self) -> Result<Option<Target>> {
        if !self.csr_path.exists() {
            warn!("[plugins] CSR file {} no longer exists", self.csr_path.display());
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.csr_path)
            .with_context(|| format!("failed to read {}", self.csr_path.display()))?;
        let (common_name, names) = parse_csr_names(&raw)?;
        let identifiers = normalize_identifiers(names.iter().chain(common_name.iter()))?;
        let common_name = match common_name {
            Some(cn) => normalize_identifiers([cn])?.remove(0),
            None => identifiers[0].clone(),
        };
        Ok(Some(Target {
            friendly_name: format!("[{ID}] {}", self.csr_path.display()),
            common_name,
            parts: vec![TargetPart {
                identifiers,
                site_id: None,
            }],
        }))
    }
}

/// Subject common name and DNS subject alternative names of a PEM CSR.
pub fn parse_csr_names(csr_pem: &str) -> Result<(Option<String>, Vec<String>)> {
    let block = pem::parse(csr_pem).map_err(|err| anyhow!("invalid CSR PEM: {err}"))?;
    if block.tag() != "CERTIFICATE REQUEST" && block.tag() != "NEW CERTIFICATE REQUEST" {
        return Err(anyhow!("expected a CERTIFICATE REQUEST block, found {}", block.tag()));
    }
    let (_, csr) = X509CertificationRequest::from_der(block.contents())
        .map_err(|err| anyhow!("failed to parse CSR: {err}"))?;

    let common_name = csr
        .certification_request_info
        .subject
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string);

    let mut names = Vec::new();
    if let Some(extensions) = csr.requested_extensions() {
        for extension in extensions {
            if let ParsedExtension::SubjectAlternativeName(san) = extension {
                for name in &san.general_names {
                    if let GeneralName::DNSName(dns) = name {
                        names.push(dns.to_string());
                    }
                }
            }
        }
    }
    if common_name.is_none() && names.is_empty() {
        return Err(anyhow!("CSR names no host"));
    }
    Ok((common_name, names))
}

pub struct CsrTargetFactory;

impl PluginFactory for CsrTargetFactory {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            id: ID,
            category: PluginCategory::Target,
            description: "Host names read from a certificate signing request",
        }
    }

    fn default_options(&self, arguments: &Value) -> Result<Value> {
        let options: CsrTargetOptions = parse_options(ID, arguments)?;
        let path = options
            .csr_path
            .as_ref()
            .ok_or_else(|| anyhow!("csr_path is required"))?;
        if !path.exists() {
            return Err(anyhow!("CSR file {} not found", path.display()));
        }
        to_value(ID, &options)
    }

    fn acquire_options(&self, _target: Option<&Target>, input: &dyn InputService) -> Result<Value> {
        let path = input.request_string("Path to the CSR (PEM)")?;
        self.default_options(&serde_json::json!({ "csr_path": path.trim() }))
    }

    fn is_active(&self, options: &Value) -> bool {
        parse_options::<CsrTargetOptions>(ID, options)
            .map(|options| options.csr_path.is_some())
            .unwrap_or(false)
    }

    fn create(&self, options: &Value, _services: &PluginServices) -> Result<PluginInstance> {
        let options: CsrTargetOptions = parse_options(ID, options)?;
        let csr_path = options.csr_path.ok_or_else(|| anyhow!("csr_path is required"))?;
        Ok(PluginInstance::Target(Box::new(CsrTarget { csr_path })))
    }
}
