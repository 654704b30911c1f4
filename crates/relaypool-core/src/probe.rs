/// Speculative wire-protocol detection for a bare `ip:port` candidate.
///
/// A quick TCP dial gates the whole attempt; after that three probers run in
/// parallel, one per protocol, each on its own connection. Every success is
/// reported with a priority and the lowest priority wins, so a peer that
/// answers both the SOCKS5 greeting and HTTP CONNECT is classified SOCKS5.
use crate::record::Protocol;
use anyhow::{anyhow, bail, Result};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::trace;

const TCP_PRECHECK_TIMEOUT: Duration = Duration::from_secs(5);
const OVERALL_TIMEOUT: Duration = Duration::from_secs(20);
const DIAL_TIMEOUT: Duration = Duration::from_secs(8);
const READ_TIMEOUT: Duration = Duration::from_secs(8);

/// How long a handshake that already dialed may keep running after another
/// probe succeeded. Without this window a fast high-priority-number probe
/// would cancel a slower SOCKS5 handshake and steal the tie-break.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Determine which proxy protocol the peer speaks.
///
/// Returns an error only when the peer is not TCP-reachable at all. A
/// reachable peer that matches no probe is reported as plain HTTP, the
/// least-wrong assumption for listing-sourced candidates.
pub async fn detect_protocol(ip: &str, port: &str) -> Result<Protocol> {
    let addr = format!("{}:{}", ip, port);

    let precheck = timeout(TCP_PRECHECK_TIMEOUT, TcpStream::connect(&addr)).await;
    match precheck {
        Err(_) => bail!("connection failed: dial {} timed out", addr),
        Ok(Err(e)) => bail!("connection failed: {}", e),
        Ok(Ok(stream)) => drop(stream),
    }

    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel::<(Protocol, u8)>(3);

    for (protocol, priority) in [
        (Protocol::Socks5, 1u8),
        (Protocol::Http, 2),
        (Protocol::Https, 3),
    ] {
        let addr = addr.clone();
        let cancel = cancel.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            // The dial races cancellation directly.
            let stream = tokio::select! {
                _ = cancel.cancelled() => return,
                dialed = timeout(DIAL_TIMEOUT, TcpStream::connect(&addr)) => match dialed {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => {
                        trace!("[{}] dial {} failed: {}", protocol, addr, e);
                        return;
                    }
                    Err(_) => {
                        trace!("[{}] dial {} timed out", protocol, addr);
                        return;
                    }
                },
            };

            // Once dialed, the handshake gets a grace window past any
            // cancellation so its result can still enter the tie-break.
            let handshake = run_handshake(stream, &addr, protocol);
            let cancelled = async {
                cancel.cancelled().await;
                tokio::time::sleep(CANCEL_GRACE).await;
            };
            tokio::select! {
                succeeded = handshake => {
                    if succeeded {
                        let _ = tx.send((protocol, priority)).await;
                        // short-circuit the remaining probers
                        cancel.cancel();
                    }
                }
                _ = cancelled => {
                    trace!("[{}] probe of {} abandoned after cancellation", protocol, addr);
                }
            }
        });
    }
    drop(tx);

    // Collect every reported success until the probers are done, keeping the
    // lowest priority. Draining the channel rather than taking the first
    // receive is what preserves the tie-break.
    let mut best: Option<(Protocol, u8)> = None;
    let _ = timeout(OVERALL_TIMEOUT, async {
        while let Some((protocol, priority)) = rx.recv().await {
            if best.map_or(true, |(_, current)| priority < current) {
                best = Some((protocol, priority));
            }
        }
    })
    .await;
    cancel.cancel();

    match best {
        Some((protocol, _)) => Ok(protocol),
        None => {
            trace!("no probe matched {}, falling back to http", addr);
            Ok(Protocol::Http)
        }
    }
}

async fn run_handshake(mut stream: TcpStream, addr: &str, protocol: Protocol) -> bool {
    let outcome = match protocol {
        Protocol::Socks5 => probe_socks5(&mut stream).await,
        Protocol::Http => probe_http(&mut stream).await,
        Protocol::Https => probe_https(&mut stream).await,
    };
    match outcome {
        Ok(()) => true,
        Err(e) => {
            trace!("[{}] probe of {} failed: {}", protocol, addr, e);
            false
        }
    }
}

/// SOCKS5: no-auth greeting, then a CONNECT to 8.8.8.8:53 whose reply must
/// parse cleanly (RFC 1928 reply, any address type).
async fn probe_socks5(stream: &mut TcpStream) -> Result<()> {
    stream.write_all(&[0x05, 0x01, 0x00]).await?;

    let mut greeting = [0u8; 2];
    timeout(READ_TIMEOUT, stream.read_exact(&mut greeting)).await??;
    if greeting != [0x05, 0x00] {
        bail!("unexpected greeting reply {:?}", greeting);
    }

    // VER CMD RSV ATYP=IPv4 8.8.8.8 port 53
    stream
        .write_all(&[0x05, 0x01, 0x00, 0x01, 8, 8, 8, 8, 0, 53])
        .await?;

    let mut head = [0u8; 4];
    timeout(READ_TIMEOUT, stream.read_exact(&mut head)).await??;
    if head[0] != 0x05 {
        bail!("bad reply version {}", head[0]);
    }
    if head[1] != 0x00 {
        bail!("connect refused, reply code {}", head[1]);
    }

    let remaining = match head[3] {
        0x01 => 6, // 4 addr + 2 port
        0x03 => {
            let mut len = [0u8; 1];
            timeout(READ_TIMEOUT, stream.read_exact(&mut len)).await??;
            len[0] as usize + 2
        }
        0x04 => 18, // 16 addr + 2 port
        t => bail!("unknown address type {}", t),
    };
    let mut bound = vec![0u8; remaining];
    timeout(READ_TIMEOUT, stream.read_exact(&mut bound)).await??;
    Ok(())
}

/// Plain HTTP proxying: absolute-form GET; any 2xx/3xx status counts.
async fn probe_http(stream: &mut TcpStream) -> Result<()> {
    let request = "GET http://www.gstatic.com/generate_204 HTTP/1.1\r\n\
                   Host: www.gstatic.com\r\n\
                   User-Agent: Mozilla/5.0\r\n\
                   Proxy-Connection: close\r\n\r\n";
    stream.write_all(request.as_bytes()).await?;

    let status = read_status_code(stream).await?;
    if status.starts_with('2') || status.starts_with('3') {
        Ok(())
    } else {
        bail!("non-success status {}", status)
    }
}

/// HTTPS tunneling: CONNECT must come back exactly 200.
async fn probe_https(stream: &mut TcpStream) -> Result<()> {
    let request = "CONNECT www.google.com:443 HTTP/1.1\r\n\
                   Host: www.google.com:443\r\n\
                   User-Agent: Mozilla/5.0\r\n\
                   Proxy-Connection: keep-alive\r\n\r\n";
    stream.write_all(request.as_bytes()).await?;

    let status = read_status_code(stream).await?;
    if status == "200" {
        Ok(())
    } else {
        bail!("non-200 status {}", status)
    }
}

/// Read the first response line and extract a three-digit status code.
async fn read_status_code(stream: &mut TcpStream) -> Result<String> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    timeout(READ_TIMEOUT, reader.read_line(&mut line)).await??;
    let line = line.trim();

    if !line.starts_with("HTTP/1.1 ") && !line.starts_with("HTTP/1.0 ") {
        bail!("not an HTTP status line: {:?}", line);
    }
    let status = line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow!("malformed status line: {:?}", line))?;
    if status.len() != 3 || !status.chars().all(|c| c.is_ascii_digit()) {
        bail!("malformed status code: {:?}", status);
    }
    Ok(status.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
