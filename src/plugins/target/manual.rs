use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    core::types::{PluginCategory, Target, TargetPart},
    domain::{normalize_domain_for_display, normalize_identifier, normalize_identifiers},
    plugins::{
        InputService, PluginDescriptor, PluginFactory, PluginInstance, PluginServices,
        TargetPlugin, parse_options, to_value,
    },
};

pub const ID: &str = "manual";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManualOptions {
    pub hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_name: Option<String>,
}

impl ManualOptions {
    fn normalized(self) -> Result<Self> {
        let hosts = normalize_identifiers(&self.hosts)?;
        let common_name = match self.common_name.as_deref().map(str::trim) {
            Some(cn) if !cn.is_empty() => {
                let cn = normalize_identifier(cn)?;
                if !hosts.contains(&cn) {
                    return Err(anyhow!("common name {cn} is not one of the hosts"));
                }
                Some(cn)
            }
            _ => None,
        };
        Ok(Self { hosts, common_name })
    }
}

pub struct ManualTarget {
    options: ManualOptions,
}

impl TargetPlugin for ManualTarget {
    fn generate(&self) -> Result<Option<Target>> {
        let options = self.options.clone().normalized()?;
        let common_name = options
            .common_name
            .clone()
            .or_else(|| options.hosts.first().cloned())
            .ok_or_else(|| anyhow!("no hosts configured"))?;
        Ok(Some(Target {
            friendly_name: format!("[{ID}] {}", normalize_domain_for_display(&common_name)),
            common_name,
            parts: vec![TargetPart {
                identifiers: options.hosts,
                site_id: None,
            }],
        }))
    }
}

pub struct ManualFactory;

impl PluginFactory for ManualFactory {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            id: ID,
            category: PluginCategory::Target,
            description: "Manually entered host names",
        }
    }

    fn default_options(&self, arguments: &Value) -> Result<Value> {
        let mut options: ManualOptions = match arguments.get("host").and_then(Value::as_str) {
            // comma-separated form used on command lines
            Some(hosts) => ManualOptions {
                hosts: hosts.split(',').map(str::to_string).collect(),
                common_name: arguments
                    .get("common_name")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            None => parse_options(ID, arguments)?,
        };
        options = options.normalized()?;
        to_value(ID, &options)
    }

    fn acquire_options(&self, _target: Option<&Target>, input: &dyn InputService) -> Result<Value> {
        let hosts = input.request_string("Host names, comma separated")?;
        let common_name = input.request_string("Common name (blank for the first host)")?;
        let options = ManualOptions {
            hosts: hosts.split(',').map(str::to_string).collect(),
            common_name: Some(common_name),
        }
        .normalized()?;
        to_value(ID, &options)
    }

    fn is_active(&self, options: &Value) -> bool {
        parse_options::<ManualOptions>(ID, options)
            .map(|options| !options.hosts.is_empty())
            .unwrap_or(false)
    }

    fn create(&self, options: &Value, _services: &PluginServices) -> Result<PluginInstance> {
        let options: ManualOptions = parse_options(ID, options)?;
        Ok(PluginInstance::Target(Box::new(ManualTarget { options })))
    }
}
