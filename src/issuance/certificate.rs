use std::collections::BTreeSet;

use chrono::{TimeZone, Utc};
use sha2::{Digest, Sha256};
use x509_parser::{extensions::GeneralName, pem::parse_x509_pem};

use super::issuer::IssuedCertificate;
use crate::{
    core::{error::RenewalError, types::CertificateInfo},
    plugins::store::split_certificate_chain,
};

/// Names and validity read from an issued leaf certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafDetails {
    pub common_name: Option<String>,
    pub dns_names: Vec<String>,
    pub serial: String,
    pub thumbprint: String,
    pub not_before: chrono::DateTime<Utc>,
    pub not_after: chrono::DateTime<Utc>,
}

pub fn read_leaf(chain_pem: &str) -> Result<LeafDetails, RenewalError> {
    let split = split_certificate_chain(chain_pem)
        .map_err(|err| RenewalError::IssuanceFailed(format!("{err:#}")))?;
    let (_, pem_block) = parse_x509_pem(split.leaf.as_bytes()).map_err(|err| {
        RenewalError::IssuanceFailed(format!("failed to parse issued certificate PEM: {err}"))
    })?;
    let cert = pem_block
        .parse_x509()
        .map_err(|err| RenewalError::IssuanceFailed(format!("invalid issued certificate: {err}")))?;

    let not_before = Utc
        .timestamp_opt(cert.validity().not_before.timestamp(), 0)
        .single()
        .unwrap_or_else(Utc::now);
    let not_after = Utc
        .timestamp_opt(cert.validity().not_after.timestamp(), 0)
        .single()
        .unwrap_or_else(Utc::now);
    let thumbprint = {
        let mut hasher = Sha256::new();
        hasher.update(&pem_block.contents);
        hex::encode(hasher.finalize())
    };
    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|cn| cn.to_lowercase());
    let dns_names = match cert.subject_alternative_name() {
        Ok(Some(san)) => san
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_lowercase()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    Ok(LeafDetails {
        common_name,
        dns_names,
        serial: cert.raw_serial_as_string(),
        thumbprint,
        not_before,
        not_after,
    })
}

/// Builds the certificate record for a renewal, rejecting certificates whose
/// SAN set differs from the requested identifiers.
pub fn certificate_info(
    renewal_id: &str,
    friendly_name: &str,
    requested: &[String],
    issued: &IssuedCertificate,
) -> Result<CertificateInfo, RenewalError> {
    let leaf = read_leaf(&issued.chain_pem)?;

    let wanted: BTreeSet<String> = requested.iter().map(|id| id.to_lowercase()).collect();
    let covered: BTreeSet<String> = leaf.dns_names.iter().cloned().collect();
    if wanted != covered {
        let missing: Vec<&String> = wanted.difference(&covered).collect();
        let extra: Vec<&String> = covered.difference(&wanted).collect();
        return Err(RenewalError::IssuanceFailed(format!(
            "issued certificate does not match the order (missing {missing:?}, unexpected {extra:?})"
        )));
    }

    let common_name = leaf
        .common_name
        .filter(|cn| wanted.contains(cn))
        .or_else(|| requested.first().cloned())
        .unwrap_or_default();

    Ok(CertificateInfo {
        renewal_id: renewal_id.to_string(),
        friendly_name: friendly_name.to_string(),
        common_name,
        identifiers: requested.to_vec(),
        serial: leaf.serial,
        thumbprint: leaf.thumbprint,
        not_before: leaf.not_before,
        not_after: leaf.not_after,
        chain_pem: issued.chain_pem.clone(),
        private_key_pem: Some(issued.private_key_pem.clone()),
        store_locations: Vec::new(),
    })
}
