/// The discovery run: fetch every configured listing, extract and validate
/// candidates, and funnel survivors through one store writer.
use crate::extract;
use crate::fetch;
use crate::record::ProxyRecord;
use crate::store::ProxyStore;
use crate::validator::{NetValidator, Validate};
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Public listing endpoints scanned by default.
pub const DEFAULT_SOURCES: &[&str] = &[
    // free-proxy-list mirrors
    "https://free-proxy-list.net/en/",
    "https://free-proxy-list.net/en/socks-proxy.html",
    "https://free-proxy-list.net/en/uk-proxy.html",
    "https://free-proxy-list.net/en/ssl-proxy.html",
    "https://free-proxy-list.net/en/anonymous-proxy.html",
    "https://free-proxy-list.net/en/google-proxy.html",
    // JSON APIs
    "https://api.proxyscrape.com/v4/free-proxy-list/get?request=get_proxies&proxy_format=protocolipport&format=json",
    "https://proxylist.geonode.com/api/proxy-list?limit=500&page=1&sort_by=lastChecked&sort_type=desc",
    "https://cdn.jsdelivr.net/gh/proxifly/free-proxy-list@main/proxies/all/data.json",
];

const CHANNEL_CAPACITY: usize = 500;
const PER_HOST_PARALLELISM: usize = 3;

#[derive(Debug, Default)]
pub struct GatherReport {
    pub new: u64,
    pub updated: u64,
}

/// Run one discovery pass with the live network validator.
pub async fn gather(store: Arc<ProxyStore>, sources: &[&str]) -> Result<GatherReport> {
    gather_with(store, sources, Arc::new(NetValidator)).await
}

/// Discovery pass with an injected validator (tests substitute stubs).
///
/// One writer task drains the bounded channel and performs every store
/// mutation, so write effects are serialized regardless of how wide the
/// validation fan-out gets. The channel is closed only after every fetch
/// task, and therefore every extractor, has finished.
pub async fn gather_with(
    store: Arc<ProxyStore>,
    sources: &[&str],
    validator: Arc<dyn Validate>,
) -> Result<GatherReport> {
    let (tx, mut rx) = mpsc::channel::<ProxyRecord>(CHANNEL_CAPACITY);

    let writer_store = Arc::clone(&store);
    let writer = tokio::spawn(async move {
        let mut report = GatherReport::default();
        while let Some(record) = rx.recv().await {
            match writer_store.upsert(&record) {
                Ok(true) => {
                    debug!("added new upstream: {}", record);
                    report.new += 1;
                }
                Ok(false) => {
                    debug!("refreshed known upstream: {}", record);
                    report.updated += 1;
                }
                Err(e) => error!("dropping candidate {}: {}", record, e),
            }
        }
        report
    });

    let client = fetch::discovery_client()?;
    let mut limiters: HashMap<String, Arc<Semaphore>> = HashMap::new();
    let mut fetches = JoinSet::new();

    for url in sources {
        let host = reqwest::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        let limiter = Arc::clone(
            limiters
                .entry(host)
                .or_insert_with(|| Arc::new(Semaphore::new(PER_HOST_PARALLELISM))),
        );
        let client = client.clone();
        let tx = tx.clone();
        let validator = Arc::clone(&validator);
        let url = url.to_string();

        fetches.spawn(async move {
            let _permit = limiter.acquire_owned().await.ok();
            info!("visiting {}", url);
            match fetch::fetch_page(&client, &url).await {
                Ok(body) => {
                    if let Err(e) = extract::extract(&body, &tx, validator).await {
                        error!("extractor failed for {}: {}", url, e);
                    }
                }
                Err(e) => error!("{}", e),
            }
        });
    }
    drop(tx);

    // Join barrier over every producer; only then can the writer see the
    // channel close.
    while fetches.join_next().await.is_some() {}

    let report = writer
        .await
        .map_err(|e| anyhow!("store writer task failed: {}", e))?;
    info!(
        "discovery run complete, new: {}, updated: {}",
        report.new, report.updated
    );
    Ok(report)
}
