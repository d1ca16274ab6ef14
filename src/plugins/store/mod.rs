use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::Path,
};

use anyhow::{Context, Result, anyhow};
use pem::Pem;

#[cfg(not(unix))]
use log::warn;
#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

pub mod pem_files;
pub mod pfx_file;

/// Leaf, intermediates and the full chain, each PEM encoded.
#[derive(Debug, Clone)]
pub struct SplitChain {
    pub leaf: String,
    pub intermediates: Vec<String>,
}

impl SplitChain {
    pub fn chain_only(&self) -> String {
        self.intermediates.concat()
    }

    pub fn fullchain(&self) -> String {
        format!("{}{}", self.leaf, self.chain_only())
    }
}

pub fn split_certificate_chain(chain_pem: &str) -> Result<SplitChain> {
    let blocks = pem::parse_many(chain_pem)
        .map_err(|err| anyhow!("failed to parse certificate chain PEM: {err}"))?;
    let mut encoded = blocks
        .into_iter()
        .filter(|block| block.tag() == "CERTIFICATE")
        .map(|block: Pem| pem::encode(&block));
    let leaf = encoded
        .next()
        .ok_or_else(|| anyhow!("no certificate PEM blocks found"))?;
    Ok(SplitChain {
        leaf,
        intermediates: encoded.collect(),
    })
}

/// Single path segment derived from a certificate name; wildcards become `_`.
pub fn safe_file_stem(name: &str) -> String {
    let stem: String = name
        .trim()
        .replace("*.", "_.")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let stem = stem.trim_matches('.').to_string();
    if stem.is_empty() {
        "certificate".to_string()
    } else {
        stem
    }
}

/// Writes a file readable only by its owner.
pub(crate) fn write_secure_file(path: &Path, content: &[u8], overwrite: bool) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true);
    if overwrite {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    #[cfg(unix)]
    {
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(content)
        .with_context(|| format!("failed to write {}", path.display()))?;
    file.flush()
        .with_context(|| format!("failed to flush {}", path.display()))?;
    ensure_permissions(path)
}

fn ensure_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let metadata = fs::metadata(path)?;
        if metadata.permissions().mode() & 0o777 != 0o600 {
            fs::set_permissions(path, fs::Permissions::from_mode(0o600)).with_context(|| {
                format!("failed to set restrictive permissions on {}", path.display())
            })?;
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(err) = fs::metadata(path) {
            warn!(
                "[store] unable to confirm permissions for {}: {}",
                path.display(),
                err
            );
        }
    }
    Ok(())
}
