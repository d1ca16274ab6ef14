use std::{env, thread, time::Duration};

use anyhow::{Context, Result, anyhow};
use reqwest::blocking::Client;
use serde::Deserialize;

use acme_renewer::plugins::validation::{
    RecordPublisher,
    cloudflare::{CloudflareOptions, CloudflarePublisher, format_txt_content},
};

const API_BASE: &str = "https://api.cloudflare.com/client/v4";

#[derive(Clone)]
struct CloudflareTestConfig {
    token: String,
    zone: String,
}

fn load_config() -> Result<CloudflareTestConfig> {
    let token =
        env::var("DNS_TEST_CLOUDFLARE_TOKEN").context("DNS_TEST_CLOUDFLARE_TOKEN not set")?;
    let zone = env::var("DNS_TEST_CLOUDFLARE_ZONE").context("DNS_TEST_CLOUDFLARE_ZONE not set")?;
    Ok(CloudflareTestConfig { token, zone })
}

fn publisher(config: &CloudflareTestConfig) -> CloudflarePublisher {
    CloudflarePublisher::new(
        CloudflareOptions {
            api_token: config.token.clone(),
            zone: Some(config.zone.clone()),
        },
        Duration::from_secs(30),
    )
}

#[derive(Deserialize)]
struct Zone {
    id: String,
}

#[derive(Deserialize)]
struct TxtRecord {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ListResponse<T> {
    result: Vec<T>,
    success: bool,
}

fn list_txt_contents(config: &CloudflareTestConfig, name: &str) -> Result<Vec<String>> {
    let client = Client::new();
    let zones: ListResponse<Zone> = client
        .get(format!("{API_BASE}/zones"))
        .query(&[("name", config.zone.as_str())])
        .bearer_auth(&config.token)
        .send()?
        .json()?;
    let zone = zones
        .result
        .first()
        .filter(|_| zones.success)
        .ok_or_else(|| anyhow!("zone {} not found", config.zone))?;
    let records: ListResponse<TxtRecord> = client
        .get(format!("{API_BASE}/zones/{}/dns_records", zone.id))
        .query(&[("type", "TXT"), ("name", name)])
        .bearer_auth(&config.token)
        .send()?
        .json()?;
    if !records.success {
        return Err(anyhow!("Cloudflare API returned unsuccessful response"));
    }
    Ok(records
        .result
        .into_iter()
        .filter_map(|record| record.content)
        .collect())
}

/// Removes the test record even when an assertion fails.
struct CleanupRecord {
    config: CloudflareTestConfig,
    name: String,
    value: String,
}

impl Drop for CleanupRecord {
    fn drop(&mut self) {
        let _ = publisher(&self.config).delete_record("", &self.name, &self.value);
    }
}

#[test]
fn cloudflare_publishes_and_removes_a_challenge_record() -> Result<()> {
    let config = load_config()?;
    let name = format!("_acme-challenge.integration-test.{}", config.zone);
    let value = "integration-test-txt";
    let _cleanup = CleanupRecord {
        config: config.clone(),
        name: name.clone(),
        value: value.to_string(),
    };

    let publisher = publisher(&config);
    publisher.create_record(&config.zone, &name, value)?;
    // a second publication of the same value is accepted
    publisher.create_record(&config.zone, &name, value)?;

    let expected = format_txt_content(value);
    let contents = list_txt_contents(&config, &name)?;
    if contents.iter().filter(|content| **content == expected).count() != 1 {
        return Err(anyhow!("expected one record with {expected}, got {contents:?}"));
    }

    publisher.delete_record(&config.zone, &name, value)?;
    for _ in 0..5 {
        if !list_txt_contents(&config, &name)?.contains(&expected) {
            return Ok(());
        }
        thread::sleep(Duration::from_secs(1));
    }
    Err(anyhow!("record {name} still present after delete"))
}
