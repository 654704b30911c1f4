/// Shared HTTP client for discovery egress.
use anyhow::{anyhow, Result};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info};

/// Fixed mobile Safari user agent used for every discovery fetch and
/// validator probe. Listing sites serve different markup to desktop UAs.
pub const USER_AGENT: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 16_6 like Mac OS X) \
AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.6 Mobile/15E148 Safari/604.1";

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the shared discovery client. robots.txt is not consulted; the
/// listing endpoints are fetched the way a browser would.
pub fn discovery_client() -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(FETCH_TIMEOUT)
        .build()
        .map_err(|e| anyhow!("failed to build discovery client: {}", e))
}

/// Fetch one listing page and return its decoded body.
pub async fn fetch_page(client: &Client, url: &str) -> Result<String> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| anyhow!("request failed for {}: {}", url, e))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| anyhow!("failed to read body of {}: {}", url, e))?;
    info!("{} response status: {}", url, status);
    debug!("response body length: {}", body.len());
    Ok(body)
}
