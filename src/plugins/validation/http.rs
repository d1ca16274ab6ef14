use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use log::{debug, warn};
use reqwest::StatusCode;
use reqwest::blocking::Client;

/// Blocking client for provider APIs.
pub fn build_client(timeout: Duration) -> Client {
    Client::builder().timeout(timeout).build().unwrap_or_else(|err| {
        warn!("[http] failed to build client: {err}");
        Client::new()
    })
}

pub fn status_error(provider: &str, status: StatusCode, body: Option<String>) -> anyhow::Error {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return anyhow!("{provider} authentication failed");
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return anyhow!("{provider} rate limit exceeded");
    }
    if let Some(body) = body {
        return anyhow!("{provider} API error: {body}");
    }
    anyhow!("{provider} API error: {status}")
}

/// Re-runs `verify` until it reports `Ok(true)` or `timeout` passes.
/// `Err` stops immediately.
pub fn retry_until<F>(
    subject: &str,
    timeout: Duration,
    interval: Duration,
    mut verify: F,
) -> Result<()>
where
    F: FnMut() -> Result<bool>,
{
    let started = Instant::now();
    let mut attempt = 0;
    loop {
        attempt += 1;
        match verify() {
            Ok(true) => {
                debug!(
                    "[http] {} verified after {}ms (attempt {})",
                    subject,
                    started.elapsed().as_millis(),
                    attempt
                );
                return Ok(());
            }
            Ok(false) if started.elapsed() >= timeout => {
                warn!(
                    "[http] {} not verified after {}ms",
                    subject,
                    started.elapsed().as_millis()
                );
                return Err(anyhow!(
                    "{} verification failed: timeout after {}ms",
                    subject,
                    started.elapsed().as_millis()
                ));
            }
            Ok(false) => std::thread::sleep(interval),
            Err(err) => {
                warn!("[http] {} verification failed: {}", subject, err);
                return Err(err);
            }
        }
    }
}
