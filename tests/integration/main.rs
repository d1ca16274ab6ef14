mod support;

mod manager;
mod renewal_flow;

// Talks to the real Cloudflare API; needs DNS_TEST_CLOUDFLARE_TOKEN and DNS_TEST_CLOUDFLARE_ZONE.
#[cfg(feature = "integration-tests")]
mod cloudflare_live;
