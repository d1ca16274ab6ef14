use std::{collections::HashMap, path::PathBuf};

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Dns01Validation, RecordPublisher};
use crate::{
    core::types::{PluginCategory, Target},
    plugins::{
        InputService, PluginDescriptor, PluginFactory, PluginInstance, PluginServices,
        parse_options,
        script::{build_arguments, run_script},
        to_value,
    },
};

pub const ID: &str = "dns-script";
const DEFAULT_CREATE_ARGUMENTS: &str = "create {Identifier} {RecordName} {Token}";
const DEFAULT_DELETE_ARGUMENTS: &str = "delete {Identifier} {RecordName} {Token}";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DnsScriptOptions {
    pub create_script: PathBuf,
    /// Falls back to `create_script` with the delete arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_script: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_arguments: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_arguments: Option<String>,
}

pub struct ScriptPublisher {
    options: DnsScriptOptions,
}

impl ScriptPublisher {
    fn values(identifier: &str, record_name: &str, value: &str) -> HashMap<&'static str, String> {
        HashMap::from([
            ("Identifier", identifier.to_string()),
            ("RecordName", record_name.to_string()),
            ("Token", value.to_string()),
        ])
    }
}

impl RecordPublisher for ScriptPublisher {
    fn name(&self) -> &'static str {
        ID
    }

    fn create_record(&self, identifier: &str, record_name: &str, value: &str) -> Result<()> {
        let template = self
            .options
            .create_arguments
            .as_deref()
            .unwrap_or(DEFAULT_CREATE_ARGUMENTS);
        let args = build_arguments(template, &Self::values(identifier, record_name, value));
        run_script(&self.options.create_script, &args, &[])?;
        Ok(())
    }

    fn delete_record(&self, identifier: &str, record_name: &str, value: &str) -> Result<()> {
        let script = self
            .options
            .delete_script
            .as_ref()
            .unwrap_or(&self.options.create_script);
        let template = self
            .options
            .delete_arguments
            .as_deref()
            .unwrap_or(DEFAULT_DELETE_ARGUMENTS);
        let args = build_arguments(template, &Self::values(identifier, record_name, value));
        run_script(script, &args, &[])?;
        Ok(())
    }
}

pub struct DnsScriptFactory;

impl PluginFactory for DnsScriptFactory {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            id: ID,
            category: PluginCategory::Validation,
            description: "DNS-01 through user-provided create/delete scripts",
        }
    }

    fn default_options(&self, arguments: &Value) -> Result<Value> {
        let options: DnsScriptOptions = parse_options(ID, arguments)?;
        if !options.create_script.exists() {
            return Err(anyhow!(
                "create script {} not found",
                options.create_script.display()
            ));
        }
        if let Some(delete) = &options.delete_script
            && !delete.exists()
        {
            return Err(anyhow!("delete script {} not found", delete.display()));
        }
        to_value(ID, &options)
    }

    fn acquire_options(&self, _target: Option<&Target>, input: &dyn InputService) -> Result<Value> {
        let create = input.request_string("Path to the script that creates the TXT record")?;
        let delete = input.request_string("Path to the delete script (blank to reuse)")?;
        let options = DnsScriptOptions {
            create_script: PathBuf::from(create.trim()),
            delete_script: Some(delete.trim())
                .filter(|path| !path.is_empty())
                .map(PathBuf::from),
            create_arguments: None,
            delete_arguments: None,
        };
        self.default_options(&to_value(ID, &options)?)
    }

    fn create(&self, options: &Value, services: &PluginServices) -> Result<PluginInstance> {
        let options: DnsScriptOptions = parse_options(ID, options)?;
        Ok(PluginInstance::Validation(Box::new(Dns01Validation::new(
            Box::new(ScriptPublisher { options }),
            services,
        ))))
    }
}
