/// Dialing a target through a discovered upstream.
///
/// HTTP(S) upstreams get a CONNECT; SOCKS5 upstreams get the RFC 1928
/// handshake (RFC 1929 user/pass when credentials are supplied); a record
/// with no determined protocol is dialed around, straight to the target.
use crate::record::{Protocol, ProxyRecord};
use anyhow::{anyhow, bail, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::net::IpAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

// SOCKS5 constants (RFC 1928)
pub const SOCKS_VERSION: u8 = 5;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_USER_PASS: u8 = 0x02;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;
pub const CMD_CONNECT: u8 = 0x01;
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;
pub const REP_SUCCESS: u8 = 0x00;

/// Optional credentials for the upstream hop.
#[derive(Debug, Clone)]
pub struct UpstreamAuth {
    pub username: String,
    pub password: String,
}

/// Open a TCP stream to `target_host:target_port` through `upstream`.
pub async fn connect_through(
    upstream: &ProxyRecord,
    target_host: &str,
    target_port: u16,
    auth: Option<&UpstreamAuth>,
) -> Result<TcpStream> {
    match upstream.protocol {
        Some(Protocol::Http) | Some(Protocol::Https) => {
            let mut stream = dial(&upstream.address()).await?;
            http_connect(&mut stream, target_host, target_port, auth).await?;
            Ok(stream)
        }
        Some(Protocol::Socks5) => {
            let mut stream = dial(&upstream.address()).await?;
            socks5_connect(&mut stream, target_host, target_port, auth).await?;
            Ok(stream)
        }
        None => {
            debug!(
                "upstream {} has no determined protocol, dialing target directly",
                upstream.address()
            );
            dial(&format!("{}:{}", target_host, target_port)).await
        }
    }
}

async fn dial(addr: &str) -> Result<TcpStream> {
    timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| anyhow!("dial {} timed out", addr))?
        .map_err(|e| anyhow!("dial {} failed: {}", addr, e))
}

// ---------------------------------------------------------------------------
// HTTP CONNECT
// ---------------------------------------------------------------------------

/// Issue a CONNECT on an established upstream stream. The reply must carry
/// `200 connection established` in any case; free proxies are loose about
/// the rest of the status line.
pub async fn http_connect(
    stream: &mut TcpStream,
    host: &str,
    port: u16,
    auth: Option<&UpstreamAuth>,
) -> Result<()> {
    let target = format!("{}:{}", host, port);
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some(auth) = auth {
        request.push_str(&format!(
            "Proxy-Authorization: {}\r\n",
            basic_auth_header(&auth.username, &auth.password)
        ));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    let reply = read_response_head(stream).await?;
    if !reply.to_lowercase().contains("200 connection established") {
        let first = reply.lines().next().unwrap_or_default();
        bail!("upstream refused CONNECT: {}", first);
    }
    Ok(())
}

/// `Proxy-Authorization` value for Basic credentials.
fn basic_auth_header(username: &str, password: &str) -> String {
    format!(
        "Basic {}",
        STANDARD.encode(format!("{}:{}", username, password))
    )
}

/// Read HTTP response headers up to the blank line.
async fn read_response_head(stream: &mut TcpStream) -> Result<String> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
        if buf.len() > 16 * 1024 {
            bail!("response header too large");
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

// ---------------------------------------------------------------------------
// SOCKS5
// ---------------------------------------------------------------------------

/// Full SOCKS5 CONNECT on an established upstream stream.
pub async fn socks5_connect(
    stream: &mut TcpStream,
    host: &str,
    port: u16,
    auth: Option<&UpstreamAuth>,
) -> Result<()> {
    // Greeting: offer exactly the method we intend to complete.
    let method = if auth.is_some() {
        METHOD_USER_PASS
    } else {
        METHOD_NO_AUTH
    };
    stream.write_all(&[SOCKS_VERSION, 1, method]).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS_VERSION {
        bail!("unexpected version byte {}", choice[0]);
    }
    match choice[1] {
        METHOD_NO_AUTH => {}
        METHOD_USER_PASS => {
            let auth = auth.ok_or_else(|| {
                anyhow!("upstream requires authentication but none was provided")
            })?;
            socks5_user_pass(stream, &auth.username, &auth.password).await?;
        }
        METHOD_NO_ACCEPTABLE => bail!("no acceptable authentication methods"),
        m => bail!("unknown auth method 0x{:02X}", m),
    }

    // CONNECT request with the address type matching the target.
    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            if host.len() > 255 {
                bail!("hostname too long ({} bytes)", host.len());
            }
            request.push(ATYP_DOMAIN);
            request.push(host.len() as u8);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    // Reply: VER REP RSV ATYP, then the bound address.
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        bail!("unexpected version in reply {}", head[0]);
    }
    if head[1] != REP_SUCCESS {
        bail!(
            "connect failed with code 0x{:02X} ({})",
            head[1],
            rep_description(head[1])
        );
    }
    consume_bound_address(stream, head[3]).await
}

/// RFC 1929 username/password sub-negotiation.
async fn socks5_user_pass(stream: &mut TcpStream, username: &str, password: &str) -> Result<()> {
    if username.len() > 255 || password.len() > 255 {
        bail!("credentials too long");
    }
    let mut negotiation = vec![0x01, username.len() as u8];
    negotiation.extend_from_slice(username.as_bytes());
    negotiation.push(password.len() as u8);
    negotiation.extend_from_slice(password.as_bytes());
    stream.write_all(&negotiation).await?;

    let mut status = [0u8; 2];
    stream.read_exact(&mut status).await?;
    if status[1] != 0x00 {
        bail!("authentication failed (status {})", status[1]);
    }
    Ok(())
}

/// Drain the BND.ADDR / BND.PORT portion of a SOCKS5 reply.
async fn consume_bound_address(stream: &mut TcpStream, atyp: u8) -> Result<()> {
    match atyp {
        ATYP_IPV4 => {
            let mut buf = [0u8; 6];
            stream.read_exact(&mut buf).await?;
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 18];
            stream.read_exact(&mut buf).await?;
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut buf = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut buf).await?;
        }
        t => bail!("unknown address type in reply 0x{:02X}", t),
    }
    Ok(())
}

fn rep_description(code: u8) -> &'static str {
    match code {
        0x00 => "success",
        0x01 => "general failure",
        0x02 => "connection not allowed",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn record(addr: std::net::SocketAddr, protocol: Protocol) -> ProxyRecord {
        ProxyRecord {
            ip: addr.ip().to_string(),
            port: addr.port().to_string(),
            protocol: Some(protocol),
            disable: false,
            updated: Some(chrono::Utc::now()),
        }
    }

    /// Fake HTTP proxy: accepts CONNECT, then echoes everything.
    async fn spawn_http_connect_echo() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut byte = [0u8; 1];
                    while !buf.ends_with(b"\r\n\r\n") {
                        if stream.read_exact(&mut byte).await.is_err() {
                            return;
                        }
                        buf.push(byte[0]);
                    }
                    let _ = stream
                        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                        .await;
                    let mut chunk = [0u8; 1024];
                    while let Ok(n) = stream.read(&mut chunk).await {
                        if n == 0 || stream.write_all(&chunk[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    /// Fake SOCKS5 proxy: no-auth greeting, IPv4 CONNECT reply, then echo.
    async fn spawn_socks5_echo() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut greeting = [0u8; 3];
                    if stream.read_exact(&mut greeting).await.is_err() {
                        return;
                    }
                    assert_eq!(greeting[0], SOCKS_VERSION);
                    let _ = stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await;

                    let mut head = [0u8; 4];
                    if stream.read_exact(&mut head).await.is_err() {
                        return;
                    }
                    assert_eq!(head[1], CMD_CONNECT);
                    let addr_len = match head[3] {
                        ATYP_IPV4 => 4,
                        ATYP_IPV6 => 16,
                        ATYP_DOMAIN => {
                            let mut len = [0u8; 1];
                            let _ = stream.read_exact(&mut len).await;
                            len[0] as usize
                        }
                        _ => return,
                    };
                    let mut rest = vec![0u8; addr_len + 2];
                    if stream.read_exact(&mut rest).await.is_err() {
                        return;
                    }
                    let _ = stream
                        .write_all(&[SOCKS_VERSION, REP_SUCCESS, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
                        .await;
                    let mut chunk = [0u8; 1024];
                    while let Ok(n) = stream.read(&mut chunk).await {
                        if n == 0 || stream.write_all(&chunk[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_http_connect_tunnel() {
        let addr = spawn_http_connect_echo().await;
        let upstream = record(addr, Protocol::Http);
        let mut stream = connect_through(&upstream, "example.com", 443, None)
            .await
            .unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");
    }

    #[tokio::test]
    async fn test_socks5_tunnel_with_domain_target() {
        let addr = spawn_socks5_echo().await;
        let upstream = record(addr, Protocol::Socks5);
        let mut stream = connect_through(&upstream, "example.com", 80, None)
            .await
            .unwrap();
        stream.write_all(b"hello").await.unwrap();
        let mut reply = [0u8; 5];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"hello");
    }

    #[tokio::test]
    async fn test_socks5_tunnel_with_ipv4_target() {
        let addr = spawn_socks5_echo().await;
        let upstream = record(addr, Protocol::Socks5);
        // ATYP must be IPv4; the fake asserts the request shape
        let mut stream = connect_through(&upstream, "93.184.216.34", 80, None)
            .await
            .unwrap();
        stream.write_all(b"x").await.unwrap();
        let mut reply = [0u8; 1];
        stream.read_exact(&mut reply).await.unwrap();
    }

    #[tokio::test]
    async fn test_http_connect_refusal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = Vec::new();
                let mut byte = [0u8; 1];
                while !buf.ends_with(b"\r\n\r\n") {
                    if stream.read_exact(&mut byte).await.is_err() {
                        return;
                    }
                    buf.push(byte[0]);
                }
                let _ = stream.write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n").await;
            }
        });

        let upstream = record(addr, Protocol::Http);
        let err = connect_through(&upstream, "example.com", 443, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("refused CONNECT"));
    }

    #[test]
    fn test_basic_auth_header() {
        assert_eq!(
            basic_auth_header("user", "pass"),
            format!("Basic {}", STANDARD.encode("user:pass"))
        );
    }
}
