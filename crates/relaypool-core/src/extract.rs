/// Candidate extraction from fetched listing payloads.
///
/// Two extractors run in order; the first to produce at least one validated
/// survivor short-circuits the rest for that payload. Both fan their
/// candidates into the validator concurrently and wait for the whole batch
/// before reporting.
use crate::record::{Protocol, ProxyRecord};
use crate::validator::Validate;
use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc::Sender;
use tokio::task::JoinSet;
use tracing::{debug, info};

const OCTET: &str = r"(?:25[0-5]|2[0-4]\d|[01]?\d{1,2})";

/// `scheme://ip:port` with the scheme optional.
static SCHEME_IP_PORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)(?:(?P<protocol>socks[45a]?|http|https)://)?(?P<ip>{oct}\.{oct}\.{oct}\.{oct}):(?P<port>\d{{1,5}})",
        oct = OCTET
    ))
    .expect("scheme/ip/port pattern compiles")
});

/// IP and port merely adjacent, separated by punctuation or whitespace.
static LOOSE_IP_PORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"({oct}\.{oct}\.{oct}\.{oct})[:\s,;\|\(\[\{{]+(\d{{1,5}})(?:\D|$)",
        oct = OCTET
    ))
    .expect("loose ip/port pattern compiles")
});

/// `"ip": "...", ... "port": "..."` object form used by JSON listings.
static JSON_IP_PORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\s*"\s*ip\s*"\s*:\s*"\s*((?:\d{1,3}\.){3}\d{1,3})\s*"[\s\S]*?"\s*port\s*"\s*:\s*"\s*(\d+)\s*""#,
    )
    .expect("json ip/port pattern compiles")
});

static IP_CELL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,3}\.){3}\d{1,3}$").expect("ip cell pattern compiles"));
static PORT_CELL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{2,5}$").expect("port cell pattern compiles"));

/// Containers whose text content must not leak into table-cell matching.
static STRIP_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    let mut patterns = Vec::new();
    for tag in ["script", "style", "noscript", "iframe", "head", "textarea", "nav"] {
        patterns.push(
            Regex::new(&format!(r"(?is)<{tag}\b[^>]*>.*?</{tag}\s*>"))
                .expect("strip pattern compiles"),
        );
    }
    for tag in ["meta", "link"] {
        patterns.push(
            Regex::new(&format!(r"(?i)</?{tag}\b[^>]*>")).expect("strip pattern compiles"),
        );
    }
    patterns
});

/// Run the extractor chain over one payload, emitting validated records.
pub async fn extract(
    body: &str,
    out: &Sender<ProxyRecord>,
    validator: Arc<dyn Validate>,
) -> Result<()> {
    debug!("extractor called, body length: {}", body.len());
    if extract_from_text(body, out, Arc::clone(&validator)).await? {
        return Ok(());
    }
    extract_from_html_table(body, out, validator).await?;
    Ok(())
}

/// Regex scan over the raw payload; handles plain-text and JSON listings.
async fn extract_from_text(
    body: &str,
    out: &Sender<ProxyRecord>,
    validator: Arc<dyn Validate>,
) -> Result<bool> {
    let mut seen = HashSet::new();
    let mut candidates = Vec::new();

    for caps in SCHEME_IP_PORT.captures_iter(body) {
        let ip = caps.name("ip").map(|m| m.as_str()).unwrap_or_default();
        let port = caps.name("port").map(|m| m.as_str()).unwrap_or_default();
        if !valid_port(port) || !seen.insert(format!("{}:{}", ip, port)) {
            continue;
        }
        let scheme = caps
            .name("protocol")
            .map(|m| m.as_str().to_lowercase())
            .unwrap_or_default();
        let mut candidate = ProxyRecord::new(ip, port);
        candidate.protocol = Some(protocol_hint(&scheme));
        candidates.push(candidate);
    }

    for pattern in [&*LOOSE_IP_PORT, &*JSON_IP_PORT] {
        for caps in pattern.captures_iter(body) {
            let ip = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            let port = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
            if !valid_port(port) || !seen.insert(format!("{}:{}", ip, port)) {
                continue;
            }
            let mut candidate = ProxyRecord::new(ip, port);
            candidate.protocol = Some(Protocol::Http);
            candidates.push(candidate);
        }
    }

    let survivors = validate_and_emit(candidates, out, validator).await;
    info!("text extractor finished, survivors: {}", survivors);
    Ok(survivors > 0)
}

/// Row scan over `<tr>` elements: first cell that looks like an IPv4, then
/// the next cell that looks like a port.
async fn extract_from_html_table(
    body: &str,
    out: &Sender<ProxyRecord>,
    validator: Arc<dyn Validate>,
) -> Result<bool> {
    let cleaned = strip_noise(body);

    // `Html` is not Send; collect candidates before the first await.
    let candidates = {
        let doc = Html::parse_document(&cleaned);
        let row_selector = Selector::parse("tr").expect("tr selector parses");
        let cell_selector = Selector::parse("td").expect("td selector parses");

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for row in doc.select(&row_selector) {
            let mut ip: Option<String> = None;
            let mut port: Option<String> = None;
            for cell in row.select(&cell_selector) {
                let text = cell.text().collect::<String>().trim().to_string();
                if ip.is_none() && IP_CELL.is_match(&text) {
                    ip = Some(text);
                } else if ip.is_some() && port.is_none() && PORT_CELL.is_match(&text) {
                    port = Some(text);
                }
                if ip.is_some() && port.is_some() {
                    break;
                }
            }
            if let (Some(ip), Some(port)) = (ip, port) {
                if valid_port(&port) && seen.insert(format!("{}:{}", ip, port)) {
                    candidates.push(ProxyRecord::new(ip, port));
                }
            }
        }
        candidates
    };

    let survivors = validate_and_emit(candidates, out, validator).await;
    info!("html table extractor finished, survivors: {}", survivors);
    Ok(survivors > 0)
}

/// Validate candidates concurrently, forwarding survivors; returns how many
/// survived. Waits for the whole batch.
async fn validate_and_emit(
    candidates: Vec<ProxyRecord>,
    out: &Sender<ProxyRecord>,
    validator: Arc<dyn Validate>,
) -> usize {
    let mut tasks = JoinSet::new();
    for mut candidate in candidates {
        let out = out.clone();
        let validator = Arc::clone(&validator);
        tasks.spawn(async move {
            if validator.validate(&mut candidate).await {
                let _ = out.send(candidate).await;
                1usize
            } else {
                0
            }
        });
    }

    let mut survivors = 0;
    while let Some(result) = tasks.join_next().await {
        survivors += result.unwrap_or(0);
    }
    survivors
}

fn strip_noise(body: &str) -> String {
    let mut cleaned = body.to_string();
    for pattern in STRIP_PATTERNS.iter() {
        cleaned = pattern.replace_all(&cleaned, "").into_owned();
    }
    cleaned
}

fn valid_port(port: &str) -> bool {
    matches!(port.parse::<u32>(), Ok(p) if p > 0 && p <= 65535)
}

fn protocol_hint(scheme: &str) -> Protocol {
    if scheme.starts_with("socks") {
        Protocol::Socks5
    } else if scheme == "https" {
        Protocol::Https
    } else {
        // missing scheme defaults to plain http
        Protocol::Http
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
