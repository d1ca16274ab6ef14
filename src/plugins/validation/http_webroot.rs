use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    sync::Mutex,
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    core::types::{PluginCategory, Target},
    issuance::issuer::{ChallengeKind, ChallengeOffer},
    plugins::{
        InputService, PluginDescriptor, PluginFactory, PluginInstance, PluginServices,
        ValidationPlugin, parse_options, to_value,
    },
};

pub const ID: &str = "http-webroot";
const CHALLENGE_DIR: &str = ".well-known/acme-challenge";

fn default_self_check() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebrootOptions {
    pub path: PathBuf,
    #[serde(default = "default_self_check")]
    pub self_check: bool,
}

/// HTTP-01 by dropping the key authorization into a served directory.
pub struct HttpWebrootValidation {
    root: PathBuf,
    self_check: bool,
    timeout: Duration,
    written: Mutex<HashMap<String, PathBuf>>,
}

impl HttpWebrootValidation {
    fn challenge_path(&self, token: &str) -> Result<PathBuf> {
        if token.is_empty() || !token.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(anyhow!("refusing unexpected challenge token {token:?}"));
        }
        Ok(self.root.join(CHALLENGE_DIR).join(token))
    }

    fn check_served(&self, identifier: &str, offer: &ChallengeOffer) {
        let url = format!("http://{identifier}/{CHALLENGE_DIR}/{}", offer.token);
        let agent = ureq::AgentBuilder::new().timeout(self.timeout).build();
        match agent.get(&url).call().map(|resp| resp.into_string()) {
            Ok(Ok(body)) if body.trim() == offer.proof => {
                debug!("[http] {} serves the expected content", url);
            }
            Ok(Ok(body)) => warn!(
                "[http] {} served unexpected content ({} bytes); the CA check may fail",
                url,
                body.len()
            ),
            Ok(Err(err)) => warn!("[http] failed to read {}: {}", url, err),
            Err(err) => warn!("[http] self-check of {} failed: {}", url, err),
        }
    }
}

impl ValidationPlugin for HttpWebrootValidation {
    fn challenge_kind(&self) -> ChallengeKind {
        ChallengeKind::Http01
    }

    fn prepare_challenge(&self, identifier: &str, offer: &ChallengeOffer) -> Result<()> {
        let path = self.challenge_path(&offer.token)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&path, offer.proof.as_bytes())
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!("[http] wrote challenge for {} to {}", identifier, path.display());
        if let Ok(mut written) = self.written.lock() {
            written.insert(identifier.to_string(), path);
        }
        if self.self_check {
            self.check_served(identifier, offer);
        }
        Ok(())
    }

    fn clean_up(&self, identifier: &str) {
        let path = match self.written.lock() {
            Ok(mut written) => written.remove(identifier),
            Err(poisoned) => poisoned.into_inner().remove(identifier),
        };
        let Some(path) = path else {
            return;
        };
        if let Err(err) = fs::remove_file(&path) {
            warn!("[http] failed to remove {}: {}", path.display(), err);
        }
    }
}

pub struct HttpWebrootFactory;

impl PluginFactory for HttpWebrootFactory {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            id: ID,
            category: PluginCategory::Validation,
            description: "HTTP-01 by writing files into a web root",
        }
    }

    fn default_options(&self, arguments: &Value) -> Result<Value> {
        let options: WebrootOptions = parse_options(ID, arguments)?;
        if !options.path.is_dir() {
            return Err(anyhow!("web root {} is not a directory", options.path.display()));
        }
        to_value(ID, &options)
    }

    fn acquire_options(&self, _target: Option<&Target>, input: &dyn InputService) -> Result<Value> {
        let path = input.request_string("Web root path")?;
        let self_check = input.prompt_yes_no("Check the challenge is reachable before validating?", true)?;
        self.default_options(&to_value(
            ID,
            &WebrootOptions {
                path: PathBuf::from(path.trim()),
                self_check,
            },
        )?)
    }

    /// HTTP-01 cannot prove wildcard names.
    fn can_validate(&self, target: &Target) -> bool {
        target
            .identifiers()
            .iter()
            .all(|identifier| !identifier.starts_with("*."))
    }

    fn create(&self, options: &Value, services: &PluginServices) -> Result<PluginInstance> {
        let options: WebrootOptions = parse_options(ID, options)?;
        Ok(PluginInstance::Validation(Box::new(HttpWebrootValidation {
            root: options.path,
            self_check: options.self_check,
            timeout: services.http_timeout,
            written: Mutex::new(HashMap::new()),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TargetPart;
    use crate::plugins::test_support::services;
    use serde_json::json;
    use std::path::Path;

    fn plugin(root: &Path) -> Box<dyn ValidationPlugin> {
        HttpWebrootFactory
            .create(
                &json!({"path": root, "self_check": false}),
                &services(root),
            )
            .unwrap()
            .into_validation()
            .unwrap()
    }

    fn offer(token: &str) -> ChallengeOffer {
        ChallengeOffer {
            kind: ChallengeKind::Http01,
            token: token.into(),
            proof: format!("{token}.thumbprint"),
        }
    }

    #[test]
    fn writes_and_removes_challenge_file() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = plugin(dir.path());
        plugin.prepare_challenge("example.com", &offer("abc_DEF-1")).unwrap();

        let path = dir.path().join(CHALLENGE_DIR).join("abc_DEF-1");
        assert_eq!(fs::read_to_string(&path).unwrap(), "abc_DEF-1.thumbprint");

        plugin.clean_up("example.com");
        assert!(!path.exists());
        plugin.clean_up("example.com");
    }

    #[test]
    fn rejects_path_traversal_tokens() {
        let dir = tempfile::tempdir().unwrap();
        assert!(plugin(dir.path()).prepare_challenge("example.com", &offer("../evil")).is_err());
    }

    #[test]
    fn wildcards_cannot_be_validated() {
        let target = Target {
            friendly_name: "t".into(),
            common_name: "example.com".into(),
            parts: vec![TargetPart {
                identifiers: vec!["example.com".into(), "*.example.com".into()],
                site_id: None,
            }],
        };
        assert!(!HttpWebrootFactory.can_validate(&target));
    }

    #[test]
    fn self_check_defaults_on() {
        let dir = tempfile::tempdir().unwrap();
        let options = HttpWebrootFactory
            .default_options(&json!({"path": dir.path()}))
            .unwrap();
        assert_eq!(options["self_check"], json!(true));
    }
}
