/// Candidate validation: protocol probing plus an end-to-end reachability
/// check through the candidate acting as a proxy.
use crate::fetch;
use crate::probe;
use crate::record::ProxyRecord;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use reqwest::StatusCode;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

/// Connectivity-check endpoints; all answer 204 with an empty body.
pub const TEST_URLS: &[&str] = &[
    "https://www.google.com/generate_204",
    "http://www.gstatic.com/generate_204",
    "https://connectivitycheck.gstatic.com/generate_204",
    "http://edge-http.microsoft.com/captiveportal/generate_204",
    "http://cp.cloudflare.com/generate_204",
];

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_JITTER_MS: u64 = 1000;

/// Validation seam between the extractors/maintenance passes and the network.
///
/// The real implementation probes and fetches; tests substitute stubs with
/// canned outcomes.
#[async_trait]
pub trait Validate: Send + Sync {
    /// Fill in the candidate's protocol and confirm it can actually carry a
    /// request. Mutates `disable`/`updated` to reflect the outcome.
    async fn validate(&self, record: &mut ProxyRecord) -> bool;
}

#[derive(Debug, Default)]
pub struct NetValidator;

#[async_trait]
impl Validate for NetValidator {
    async fn validate(&self, record: &mut ProxyRecord) -> bool {
        if record.ip.is_empty() || record.ip == "0.0.0.0" || record.ip == "127.0.0.1" {
            return false;
        }

        match probe::detect_protocol(&record.ip, &record.port).await {
            Ok(protocol) => record.protocol = Some(protocol),
            Err(e) => {
                debug!("probe failed for {}: {}", record.address(), e);
                record.disable = true;
                return false;
            }
        }

        // Spread simultaneous validations so the check endpoints are not hit
        // in a burst.
        let jitter = rand::thread_rng().gen_range(0..MAX_JITTER_MS);
        sleep(Duration::from_millis(jitter)).await;

        let valid = match request_generate_204(record).await {
            Ok(valid) => valid,
            Err(e) => {
                debug!("reachability check failed for {}: {}", record, e);
                false
            }
        };

        if valid {
            record.updated = Some(Utc::now());
            record.disable = false;
            info!("validated upstream: {}", record);
        } else {
            record.disable = true;
        }
        valid
    }
}

/// Fetch a random `generate_204` endpoint through the candidate; only an
/// exact 204 counts. A missing or error response is a plain failure.
async fn request_generate_204(record: &ProxyRecord) -> Result<bool> {
    let client = reqwest::Client::builder()
        .user_agent(fetch::USER_AGENT)
        .proxy(reqwest::Proxy::all(record.key())?)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| anyhow!("failed to build check client: {}", e))?;

    let url = TEST_URLS[rand::thread_rng().gen_range(0..TEST_URLS.len())];
    let response = client.get(url).send().await?;
    Ok(response.status() == StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
