//! End-to-end discovery runs against local listing sources, with validation
//! stubbed so no external network is touched.

use async_trait::async_trait;
use chrono::Utc;
use relaypool_core::pipeline;
use relaypool_core::record::{Protocol, ProxyRecord};
use relaypool_core::store::ProxyStore;
use relaypool_core::validator::Validate;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Accepts every candidate as-is, keeping its protocol hint.
struct AcceptAll;

#[async_trait]
impl Validate for AcceptAll {
    async fn validate(&self, record: &mut ProxyRecord) -> bool {
        if record.protocol.is_none() {
            record.protocol = Some(Protocol::Http);
        }
        record.updated = Some(Utc::now());
        record.disable = false;
        true
    }
}

/// Mimics a probe that finds SOCKS5 on every candidate.
struct ProbesToSocks5;

#[async_trait]
impl Validate for ProbesToSocks5 {
    async fn validate(&self, record: &mut ProxyRecord) -> bool {
        record.protocol = Some(Protocol::Socks5);
        record.updated = Some(Utc::now());
        record.disable = false;
        true
    }
}

/// Serve `body` to any HTTP request; returns the source URL.
async fn spawn_source(body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let reply = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(reply.as_bytes()).await;
            });
        }
    });
    format!("http://{}/", addr)
}

#[tokio::test]
async fn test_plain_text_listing_lands_in_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ProxyStore::open(dir.path()).unwrap());
    let source = spawn_source("1.2.3.4:8080 5.6.7.8:3128").await;

    let report = pipeline::gather_with(Arc::clone(&store), &[&source], Arc::new(AcceptAll))
        .await
        .unwrap();
    assert_eq!(report.new, 2);
    assert_eq!(report.updated, 0);

    for key in ["http://1.2.3.4:8080", "http://5.6.7.8:3128"] {
        let record = store.get(key.as_bytes()).unwrap().expect(key);
        assert!(record.is_selectable());
        assert_eq!(record.key(), key);
    }
}

#[tokio::test]
async fn test_rerun_counts_existing_records_as_updated() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ProxyStore::open(dir.path()).unwrap());
    let source = spawn_source("9.8.7.6:1080").await;

    let first = pipeline::gather_with(Arc::clone(&store), &[&source], Arc::new(AcceptAll))
        .await
        .unwrap();
    assert_eq!((first.new, first.updated), (1, 0));

    let second = pipeline::gather_with(Arc::clone(&store), &[&source], Arc::new(AcceptAll))
        .await
        .unwrap();
    assert_eq!((second.new, second.updated), (0, 1));
}

#[tokio::test]
async fn test_json_listing_stored_under_probed_protocol() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ProxyStore::open(dir.path()).unwrap());
    let source = spawn_source(r#"{"ip":"9.9.9.9","port":"1080","protocol":"socks5"}"#).await;

    let report = pipeline::gather_with(Arc::clone(&store), &[&source], Arc::new(ProbesToSocks5))
        .await
        .unwrap();
    assert_eq!(report.new, 1);

    let record = store
        .get(b"socks5://9.9.9.9:1080".as_slice())
        .unwrap()
        .expect("socks5 record present");
    assert_eq!(record.protocol, Some(Protocol::Socks5));
}

#[tokio::test]
async fn test_unreachable_source_yields_empty_run() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ProxyStore::open(dir.path()).unwrap());

    // Bind then drop to get a dead port.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/", listener.local_addr().unwrap());
    drop(listener);

    let report = pipeline::gather_with(Arc::clone(&store), &[&url], Arc::new(AcceptAll))
        .await
        .unwrap();
    assert_eq!(report.new + report.updated, 0);
    assert!(store.list().unwrap().is_empty());
}
