use anyhow::{Result, anyhow};

/// Normalizes a certificate identifier: trailing dot stripped, IDNA ASCII form, lower-cased.
pub fn normalize_identifier(input: &str) -> Result<String> {
    let trimmed = input.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return Err(anyhow!("domain name is required"));
    }
    // Wildcard labels are not valid IDNA input; normalize the remainder only.
    let (prefix, rest) = match trimmed.strip_prefix("*.") {
        Some(rest) => ("*.", rest),
        None => ("", trimmed),
    };
    let ascii =
        idna::domain_to_ascii(rest).map_err(|err| anyhow!("invalid domain name: {err}"))?;
    Ok(format!("{prefix}{}", ascii.to_lowercase()))
}

/// Normalizes a list of identifiers, dropping blanks and duplicates while keeping order.
pub fn normalize_identifiers<I, S>(inputs: I) -> Result<Vec<String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut normalized: Vec<String> = Vec::new();
    for input in inputs {
        if input.as_ref().trim().trim_end_matches('.').is_empty() {
            continue;
        }
        let identifier = normalize_identifier(input.as_ref())?;
        if !normalized.contains(&identifier) {
            normalized.push(identifier);
        }
    }
    if normalized.is_empty() {
        return Err(anyhow!("No valid domains provided"));
    }
    Ok(normalized)
}

pub fn normalize_domain_for_display(input: &str) -> String {
    let trimmed = input.trim().trim_end_matches('.');
    let (unicode, _) = idna::domain_to_unicode(trimmed);
    unicode.to_lowercase()
}

/// Maps a host name to the registrable domain that owns it.
pub trait DomainParser: Send + Sync {
    fn registrable_domain(&self, hostname: &str) -> Option<String>;
}

/// Registrable-domain lookups backed by the compiled-in public suffix list.
#[derive(Debug, Default, Clone, Copy)]
pub struct PublicSuffixParser;

impl DomainParser for PublicSuffixParser {
    fn registrable_domain(&self, hostname: &str) -> Option<String> {
        let host = hostname.trim().trim_end_matches('.').to_lowercase();
        psl::domain_str(&host).map(|domain| domain.to_string())
    }
}

pub fn zone_contains(zone: &str, hostname: &str) -> bool {
    let zone = zone.trim_end_matches('.').to_lowercase();
    let hostname = hostname.trim_end_matches('.').to_lowercase();
    hostname == zone || hostname.ends_with(&format!(".{zone}"))
}
