use std::{
    collections::HashMap,
    sync::Mutex,
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use log::{debug, info};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Dns01Validation, RecordPublisher, http};
use crate::{
    core::types::{PluginCategory, Target},
    domain::zone_contains,
    plugins::{
        InputService, PluginDescriptor, PluginFactory, PluginInstance, PluginServices,
        parse_options, to_value,
    },
};

pub const ID: &str = "dns-cloudflare";
const API_BASE: &str = "https://api.cloudflare.com/client/v4";
/// Cloudflare's "identical record already exists" error code.
const DUPLICATE_RECORD: u32 = 81058;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudflareOptions {
    pub api_token: String,
    /// Zone name; discovered from the account's zones when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
}

#[derive(Deserialize)]
struct Zone {
    id: String,
    name: String,
}

#[derive(Deserialize)]
struct ListResponse<T> {
    result: Vec<T>,
    success: bool,
}

#[derive(Serialize)]
struct NewTxtRecord<'a> {
    #[serde(rename = "type")]
    record_type: &'static str,
    name: &'a str,
    content: String,
    ttl: u32,
}

#[derive(Deserialize)]
struct RecordResponse {
    result: Option<RecordResult>,
    success: bool,
    errors: Option<Vec<ApiError>>,
}

#[derive(Deserialize)]
struct RecordResult {
    id: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    code: u32,
    message: String,
}

fn describe_errors(errors: Option<Vec<ApiError>>) -> String {
    errors
        .map(|errors| {
            errors
                .iter()
                .map(|err| format!("{}: {}", err.code, err.message))
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_else(|| "Unknown error".to_string())
}

pub fn format_txt_content(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.starts_with('"') && trimmed.ends_with('"') && trimmed.len() >= 2 {
        trimmed.to_string()
    } else {
        format!("\"{}\"", trimmed.trim_matches('"'))
    }
}

/// Picks the most specific zone containing `record_name`, or the configured one.
fn select_zone<'a>(zones: &'a [Zone], record_name: &str, preferred: Option<&str>) -> Option<&'a Zone> {
    match preferred {
        Some(name) => zones
            .iter()
            .find(|zone| zone.name.eq_ignore_ascii_case(name.trim_end_matches('.'))),
        None => zones
            .iter()
            .filter(|zone| zone_contains(&zone.name, record_name))
            .max_by_key(|zone| zone.name.len()),
    }
}

pub struct CloudflarePublisher {
    api_token: String,
    zone: Option<String>,
    client: Client,
    zone_ids: Mutex<HashMap<String, String>>,
}

impl CloudflarePublisher {
    pub fn new(options: CloudflareOptions, timeout: Duration) -> Self {
        Self {
            api_token: options.api_token,
            zone: options.zone,
            client: http::build_client(timeout),
            zone_ids: Mutex::new(HashMap::new()),
        }
    }

    fn zone_id(&self, record_name: &str) -> Result<String> {
        if let Ok(cache) = self.zone_ids.lock()
            && let Some(id) = cache.get(record_name)
        {
            return Ok(id.clone());
        }

        let response = self
            .client
            .get(format!("{API_BASE}/zones?per_page=50"))
            .bearer_auth(&self.api_token)
            .send()
            .context("Failed to list Cloudflare zones")?;
        if !response.status().is_success() {
            return Err(http::status_error("Cloudflare", response.status(), None));
        }
        let zones: ListResponse<Zone> = response
            .json()
            .context("Failed to parse Cloudflare zone list response")?;
        if !zones.success {
            return Err(anyhow!("Cloudflare API returned unsuccessful response"));
        }

        let zone = select_zone(&zones.result, record_name, self.zone.as_deref())
            .ok_or_else(|| anyhow!("No Cloudflare zone found for {record_name}"))?;
        debug!("[cloudflare] {} is in zone {} ({})", record_name, zone.name, zone.id);
        if let Ok(mut cache) = self.zone_ids.lock() {
            cache.insert(record_name.to_string(), zone.id.clone());
        }
        Ok(zone.id.clone())
    }

    fn list_txt_records(&self, zone_id: &str, record_name: &str) -> Result<Vec<RecordResult>> {
        let response = self
            .client
            .get(format!("{API_BASE}/zones/{zone_id}/dns_records"))
            .query(&[("type", "TXT"), ("name", record_name)])
            .bearer_auth(&self.api_token)
            .send()
            .context("Failed to list Cloudflare DNS records")?;
        if !response.status().is_success() {
            return Err(http::status_error("Cloudflare", response.status(), None));
        }
        let list: ListResponse<RecordResult> = response
            .json()
            .context("Failed to parse Cloudflare DNS record list")?;
        if !list.success {
            return Err(anyhow!("Cloudflare API returned unsuccessful response"));
        }
        Ok(list.result)
    }

    fn verify_record_content(&self, zone_id: &str, record_id: &str, expected: &str) -> Result<()> {
        http::retry_until(
            &format!("Cloudflare record {record_id}"),
            Duration::from_secs(2),
            Duration::from_millis(300),
            || {
                let response = self
                    .client
                    .get(format!("{API_BASE}/zones/{zone_id}/dns_records/{record_id}"))
                    .bearer_auth(&self.api_token)
                    .send()
                    .context("Failed to fetch Cloudflare DNS record")?;
                if !response.status().is_success() {
                    return Ok(false);
                }
                let record: RecordResponse = response
                    .json()
                    .context("Failed to parse Cloudflare DNS record response")?;
                Ok(record
                    .result
                    .and_then(|record| record.content)
                    .is_some_and(|content| content == expected))
            },
        )
    }
}

impl RecordPublisher for CloudflarePublisher {
    fn name(&self) -> &'static str {
        ID
    }

    fn create_record(&self, _identifier: &str, record_name: &str, value: &str) -> Result<()> {
        let zone_id = self.zone_id(record_name)?;
        let content = format_txt_content(value);

        let existing = self.list_txt_records(&zone_id, record_name)?;
        if existing
            .iter()
            .any(|record| record.content.as_deref() == Some(content.as_str()))
        {
            info!("[cloudflare] {} already holds the expected value", record_name);
            return Ok(());
        }

        let response = self
            .client
            .post(format!("{API_BASE}/zones/{zone_id}/dns_records"))
            .bearer_auth(&self.api_token)
            .json(&NewTxtRecord {
                record_type: "TXT",
                name: record_name,
                content: content.clone(),
                ttl: 120,
            })
            .send()
            .context("Failed to create Cloudflare DNS record")?;
        let status = response.status();
        let body = response.text().unwrap_or_default();
        let parsed = serde_json::from_str::<RecordResponse>(&body).ok();

        let duplicate = parsed
            .as_ref()
            .and_then(|parsed| parsed.errors.as_ref())
            .is_some_and(|errors| errors.iter().any(|err| err.code == DUPLICATE_RECORD));
        if duplicate {
            info!("[cloudflare] {} already exists", record_name);
            return Ok(());
        }
        if !status.is_success() {
            return Err(http::status_error("Cloudflare", status, Some(body)));
        }

        let parsed = parsed.ok_or_else(|| anyhow!("Failed to parse Cloudflare DNS record response"))?;
        if !parsed.success {
            return Err(anyhow!("Cloudflare API error: {}", describe_errors(parsed.errors)));
        }
        let record_id = parsed
            .result
            .map(|record| record.id)
            .ok_or_else(|| anyhow!("Cloudflare API did not return record ID"))?;
        self.verify_record_content(&zone_id, &record_id, &content)
    }

    fn delete_record(&self, _identifier: &str, record_name: &str, value: &str) -> Result<()> {
        let zone_id = self.zone_id(record_name)?;
        let content = format_txt_content(value);
        let records = self.list_txt_records(&zone_id, record_name)?;

        let mut failures = Vec::new();
        for record in records
            .iter()
            .filter(|record| record.content.as_deref() == Some(content.as_str()))
        {
            let response = self
                .client
                .delete(format!("{API_BASE}/zones/{zone_id}/dns_records/{}", record.id))
                .bearer_auth(&self.api_token)
                .send();
            match response {
                Ok(resp) if resp.status().is_success() || resp.status().as_u16() == 404 => {
                    debug!("[cloudflare] deleted record {}", record.id);
                }
                Ok(resp) => failures.push(format!("{}: status {}", record.id, resp.status())),
                Err(err) => failures.push(format!("{}: {}", record.id, err)),
            }
        }
        if !failures.is_empty() {
            return Err(anyhow!(
                "Failed to delete {} record(s): {}",
                failures.len(),
                failures.join("; ")
            ));
        }
        Ok(())
    }
}

pub struct CloudflareFactory;

impl PluginFactory for CloudflareFactory {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            id: ID,
            category: PluginCategory::Validation,
            description: "DNS-01 through the Cloudflare API",
        }
    }

    fn default_options(&self, arguments: &Value) -> Result<Value> {
        let options: CloudflareOptions = parse_options(ID, arguments)?;
        if options.api_token.trim().is_empty() {
            return Err(anyhow!("api_token is required"));
        }
        to_value(ID, &options)
    }

    fn acquire_options(&self, _target: Option<&Target>, input: &dyn InputService) -> Result<Value> {
        let api_token = input.request_string("Cloudflare API token")?;
        let zone = input.request_string("Zone name (blank to discover)")?;
        let zone = Some(zone.trim().to_string()).filter(|zone| !zone.is_empty());
        self.default_options(&to_value(ID, &CloudflareOptions { api_token, zone })?)
    }

    fn is_active(&self, options: &Value) -> bool {
        parse_options::<CloudflareOptions>(ID, options)
            .map(|options| !options.api_token.trim().is_empty())
            .unwrap_or(false)
    }

    fn create(&self, options: &Value, services: &PluginServices) -> Result<PluginInstance> {
        let options: CloudflareOptions = parse_options(ID, options)?;
        let publisher = CloudflarePublisher::new(options, services.http_timeout);
        Ok(PluginInstance::Validation(Box::new(Dns01Validation::new(
            Box::new(publisher),
            services,
        ))))
    }
}
