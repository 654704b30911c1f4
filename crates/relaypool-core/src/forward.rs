/// The listening side: an HTTP/1.1 forward proxy that serves plain
/// absolute-form requests and CONNECT tunnels, routing every request
/// through a freshly selected upstream.
use crate::record::ProxyRecord;
use crate::select::{self, SelectError, WeightedPool};
use crate::stats::{ServerStats, TunnelInfo};
use crate::store::ProxyStore;
use crate::upstream;
use anyhow::{anyhow, bail, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_CONNECT_ATTEMPTS: usize = 3;
const MAX_HEAD_BYTES: usize = 32 * 1024;

/// Hop headers that must not travel past this proxy.
const HOP_HEADERS: &[&str] = &["proxy-connection", "proxy-authenticate", "proxy-authorization"];

/// Out-of-band tunnel deadline, in whole seconds, supplied by the client on
/// the CONNECT request.
const TUNNEL_TIMEOUT_HEADER: &str = "x-tunnel-timeout";

static TUNNEL_SEQ: AtomicU64 = AtomicU64::new(0);

pub struct ForwardServer {
    listen_addr: String,
    request_timeout: Duration,
    store: Arc<ProxyStore>,
    pool: Arc<RwLock<WeightedPool>>,
    stats: Arc<ServerStats>,
}

impl ForwardServer {
    pub fn new(
        listen_addr: impl Into<String>,
        store: Arc<ProxyStore>,
        pool: Arc<RwLock<WeightedPool>>,
    ) -> Self {
        ForwardServer {
            listen_addr: listen_addr.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            store,
            pool,
            stats: ServerStats::new(),
        }
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    /// Bind the configured address and serve forever. A bind failure is
    /// fatal and propagates to the caller.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(&self.listen_addr)
            .await
            .map_err(|e| anyhow!("failed to bind {}: {}", self.listen_addr, e))?;
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener. Each connection runs in
    /// its own task; the task boundary is the fault recovery boundary, so a
    /// misbehaving connection can never take the server down.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("forward proxy listening on {}", listener.local_addr()?);
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, peer).await {
                            debug!("connection from {} ended: {}", peer, e);
                        }
                    });
                }
                Err(e) => error!("accept error: {}", e),
            }
        }
    }

    async fn handle_connection(&self, mut client: TcpStream, peer: SocketAddr) -> Result<()> {
        let raw = read_request_head(&mut client).await?;
        let mut head = parse_request_head(&raw)?;
        head.strip_hop_headers();

        if head.method.eq_ignore_ascii_case("CONNECT") {
            self.handle_connect(client, peer, head).await
        } else {
            self.handle_regular(client, peer, head).await
        }
    }

    // -----------------------------------------------------------------------
    // Plain requests
    // -----------------------------------------------------------------------

    async fn handle_regular(
        &self,
        mut client: TcpStream,
        peer: SocketAddr,
        head: RequestHead,
    ) -> Result<()> {
        let (host, port, path) = match parse_absolute_uri(&head.target) {
            Ok(parts) => parts,
            Err(e) => {
                respond(&mut client, "400 Bad Request").await;
                return Err(e);
            }
        };

        let selected = match select::pick_from_store(&self.store) {
            Ok(record) => record,
            Err(SelectError::Empty) => {
                warn!("no available proxies for {} {}", head.method, head.target);
                respond(&mut client, "503 Service Unavailable").await;
                return Ok(());
            }
            Err(SelectError::Store(e)) => {
                error!("upstream selection failed: {}", e);
                respond(&mut client, "500 Internal Server Error").await;
                return Ok(());
            }
        };
        info!("selected upstream {} for {} {}", selected, head.method, head.target);

        let mut tunnel_stream = match timeout(
            self.request_timeout,
            upstream::connect_through(&selected, &host, port, None),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!("upstream {} failed: {}", selected, e);
                let _ = self.store.adjust_health(&selected.address(), false);
                respond(&mut client, "502 Bad Gateway").await;
                return Ok(());
            }
            Err(_) => {
                warn!("upstream {} timed out", selected);
                let _ = self.store.adjust_health(&selected.address(), false);
                respond(&mut client, "502 Bad Gateway").await;
                return Ok(());
            }
        };

        let request = build_origin_request(&head, &host, port, &peer);
        tunnel_stream.write_all(request.as_bytes()).await?;
        forward_request_body(&mut client, &mut tunnel_stream, &head).await?;

        // Stream status line, headers and body straight back.
        match timeout(
            self.request_timeout,
            tokio::io::copy(&mut tunnel_stream, &mut client),
        )
        .await
        {
            Ok(Ok(n)) => {
                debug!("relayed {} response bytes for {}", n, head.target);
                self.stats.count_request();
                self.record_success(&selected);
            }
            Ok(Err(e)) => debug!("response relay for {} ended: {}", head.target, e),
            Err(_) => debug!("response relay for {} hit the request timeout", head.target),
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // CONNECT tunnels
    // -----------------------------------------------------------------------

    async fn handle_connect(
        &self,
        mut client: TcpStream,
        peer: SocketAddr,
        head: RequestHead,
    ) -> Result<()> {
        let (host, port) = parse_connect_target(&head.target);
        let deadline = head
            .header(TUNNEL_TIMEOUT_HEADER)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        // Acquire a working upstream, retrying selection a bounded number of times.
        let mut acquired: Option<(ProxyRecord, TcpStream)> = None;
        let mut saw_candidate = false;
        for attempt in 1..=MAX_CONNECT_ATTEMPTS {
            let Some(candidate) = self.pick_for_connect() else {
                break;
            };
            saw_candidate = true;
            match upstream::connect_through(&candidate, &host, port, None).await {
                Ok(stream) => {
                    acquired = Some((candidate, stream));
                    break;
                }
                Err(e) => {
                    warn!(
                        "connect attempt {}/{} via {} failed: {}",
                        attempt, MAX_CONNECT_ATTEMPTS, candidate, e
                    );
                    let _ = self.store.adjust_health(&candidate.address(), false);
                }
            }
        }

        let (selected, tunnel_stream) = match acquired {
            Some(pair) => pair,
            None => {
                let status = if saw_candidate {
                    "502 Bad Gateway"
                } else {
                    warn!("no available proxies for CONNECT {}", head.target);
                    "503 Service Unavailable"
                };
                respond(&mut client, status).await;
                return Ok(());
            }
        };

        client.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await?;
        debug!("tunnel open: {} -> {} via {}", peer, head.target, selected);

        let id = format!("tunnel-{}", TUNNEL_SEQ.fetch_add(1, Ordering::Relaxed));
        self.stats.open_tunnel(TunnelInfo {
            id: id.clone(),
            client: peer.to_string(),
            target: format!("{}:{}", host, port),
            upstream: selected.key(),
            started_at: chrono::Utc::now(),
            bytes_up: 0,
            bytes_down: 0,
        });
        self.record_success(&selected);

        // Failures past this point are silent; the tunnel simply closes.
        let (bytes_up, bytes_down) = splice(client, tunnel_stream, deadline).await;
        self.stats.add_transfer(&id, bytes_up, bytes_down);
        self.stats.close_tunnel(&id);
        debug!(
            "tunnel closed: {} ({} bytes up, {} bytes down)",
            head.target, bytes_up, bytes_down
        );
        Ok(())
    }

    /// CONNECT selection: prefer the in-memory weighted pool, fall back to a
    /// fresh store read when the pool has nothing.
    fn pick_for_connect(&self) -> Option<ProxyRecord> {
        if let Ok(pool) = self.pool.read() {
            if let Some(record) = pool.pick() {
                return Some(record);
            }
        }
        select::pick_from_store(&self.store).ok()
    }

    fn record_success(&self, selected: &ProxyRecord) {
        if let Err(e) = self.store.bump_use_count(&selected.address()) {
            warn!("use counter update failed: {}", e);
        }
        if let Err(e) = self.store.adjust_health(&selected.address(), true) {
            warn!("health update failed: {}", e);
        }
        if let Ok(mut pool) = self.pool.write() {
            pool.record_use(&selected.key());
        }
    }
}

// ---------------------------------------------------------------------------
// Tunnel splice
// ---------------------------------------------------------------------------

/// Copy bytes in both directions until both sides are done. Each copier
/// half-closes its destination on EOF, which drives the opposite copier to
/// completion; both sockets are then dropped exactly once.
async fn splice(
    client: TcpStream,
    upstream_stream: TcpStream,
    deadline: Option<Duration>,
) -> (u64, u64) {
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream_stream);

    let up = async move {
        let n = tokio::io::copy(&mut client_read, &mut upstream_write)
            .await
            .unwrap_or(0);
        let _ = upstream_write.shutdown().await;
        n
    };
    let down = async move {
        let n = tokio::io::copy(&mut upstream_read, &mut client_write)
            .await
            .unwrap_or(0);
        let _ = client_write.shutdown().await;
        n
    };

    match deadline {
        Some(limit) => timeout(limit, async { tokio::join!(up, down) })
            .await
            .unwrap_or((0, 0)),
        None => tokio::join!(up, down),
    }
}

// ---------------------------------------------------------------------------
// Request parsing
// ---------------------------------------------------------------------------

struct RequestHead {
    method: String,
    target: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn strip_hop_headers(&mut self) {
        self.headers
            .retain(|(name, _)| !HOP_HEADERS.contains(&name.to_lowercase().as_str()));
    }
}

async fn read_request_head(stream: &mut TcpStream) -> Result<String> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
        if buf.len() > MAX_HEAD_BYTES {
            bail!("request head too large");
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn parse_request_head(raw: &str) -> Result<RequestHead> {
    let mut lines = raw.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .filter(|m| !m.is_empty())
        .ok_or_else(|| anyhow!("empty request line"))?
        .to_string();
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("missing request target"))?
        .to_string();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    Ok(RequestHead {
        method,
        target,
        headers,
    })
}

/// Split an absolute-form `http://host[:port]/path` request target.
fn parse_absolute_uri(target: &str) -> Result<(String, u16, String)> {
    let rest = target
        .strip_prefix("http://")
        .ok_or_else(|| anyhow!("expected absolute http request target, got {:?}", target))?;
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], rest[i..].to_string()),
        None => (rest, "/".to_string()),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => (
            h.to_string(),
            p.parse::<u16>()
                .map_err(|_| anyhow!("bad port in request target {:?}", target))?,
        ),
        None => (authority.to_string(), 80),
    };
    if host.is_empty() {
        bail!("empty host in request target {:?}", target);
    }
    Ok((host, port, path))
}

/// `host:port` from a CONNECT target; a missing port means 443.
fn parse_connect_target(target: &str) -> (String, u16) {
    match target.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (target.to_string(), 443),
        },
        None => (target.to_string(), 443),
    }
}

/// Rebuild the request in origin form for the tunneled target.
fn build_origin_request(head: &RequestHead, host: &str, port: u16, peer: &SocketAddr) -> String {
    let authority = if port == 80 {
        host.to_string()
    } else {
        format!("{}:{}", host, port)
    };

    let mut request = format!("{} {} HTTP/1.1\r\n", head.method, head_path(head));
    let mut has_host = false;
    for (name, value) in &head.headers {
        if name.eq_ignore_ascii_case("connection") {
            continue;
        }
        if name.eq_ignore_ascii_case("host") {
            has_host = true;
        }
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    if !has_host {
        request.push_str(&format!("Host: {}\r\n", authority));
    }
    request.push_str(&format!("X-Forwarded-For: {}\r\n", peer));
    request.push_str("Connection: close\r\n\r\n");
    request
}

fn head_path(head: &RequestHead) -> String {
    parse_absolute_uri(&head.target)
        .map(|(_, _, path)| path)
        .unwrap_or_else(|_| "/".to_string())
}

/// Copy a `Content-Length` body from the client to the upstream.
async fn forward_request_body(
    client: &mut TcpStream,
    tunnel_stream: &mut TcpStream,
    head: &RequestHead,
) -> Result<()> {
    let content_length = head
        .header("content-length")
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    let mut remaining = content_length;
    let mut buf = [0u8; 8192];
    while remaining > 0 {
        let to_read = remaining.min(buf.len());
        let n = client.read(&mut buf[..to_read]).await?;
        if n == 0 {
            break;
        }
        tunnel_stream.write_all(&buf[..n]).await?;
        remaining -= n;
    }
    Ok(())
}

async fn respond(stream: &mut TcpStream, status: &str) {
    let reply = format!("HTTP/1.1 {}\r\n\r\n", status);
    let _ = stream.write_all(reply.as_bytes()).await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
