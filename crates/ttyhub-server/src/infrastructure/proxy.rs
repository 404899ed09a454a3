//! Raw TCP proxy listener for tunnelled HTTP.
//!
//! A browser arrives here after a proxy redirect.  The connection is bound
//! to a device and destination by the cookies on its first request; from
//! then on bytes are shuffled blindly in both directions:
//!
//! ```text
//!  read head (≤ 8 KiB) ──► cookies ──► affinity ──► circuit
//!  socket bytes  ──► send_upstream (WebData chunks)
//!  circuit.recv() ──► socket bytes
//! ```
//!
//! Only the first request is inspected.  Keep-alive requests that follow
//! on the same connection ride the circuit that was opened for the first.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use ttyhub_core::protocol::messages::MAX_WEB_PAYLOAD;

use crate::application::tunnel::{Circuit, ProxyCookies, ProxyRedirect, TunnelError, TunnelMux};

/// Largest request head the listener will buffer.
pub const MAX_HEAD_LEN: usize = 8 * 1024;

/// Time a browser has to send its request head.
pub const HEAD_TIMEOUT: Duration = Duration::from_secs(10);

const HEAD_END: &[u8] = b"\r\n\r\n";

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("request head larger than {MAX_HEAD_LEN} bytes")]
    HeadTooLarge,

    #[error("malformed request head")]
    Malformed,

    #[error("connection closed before the request head was complete")]
    Incomplete,

    #[error("no request head within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// The status line to answer with, or `None` when the browser is gone.
    fn status(&self) -> Option<&'static str> {
        match self {
            ProxyError::HeadTooLarge | ProxyError::Malformed => Some("400 Bad Request"),
            ProxyError::Timeout(_) => Some("408 Request Timeout"),
            ProxyError::Tunnel(TunnelError::NoSession | TunnelError::CookieMismatch) => {
                Some("401 Unauthorized")
            }
            ProxyError::Tunnel(TunnelError::DeviceOffline(_)) => Some("502 Bad Gateway"),
            ProxyError::Tunnel(_) => Some("400 Bad Request"),
            ProxyError::Incomplete | ProxyError::Io(_) => None,
        }
    }
}

/// Builds the `302` response an HTTP front end sends after
/// [`TunnelMux::issue_redirect`].
pub fn redirect_response(redirect: &ProxyRedirect) -> String {
    let mut response = format!("HTTP/1.1 302 Found\r\nLocation: {}\r\n", redirect.location);
    for cookie in &redirect.cookies {
        response.push_str("Set-Cookie: ");
        response.push_str(&cookie.header_value());
        response.push_str("\r\n");
    }
    response.push_str("Content-Length: 0\r\n\r\n");
    response
}

/// Entry point for each accepted proxy connection.
pub async fn handle_proxy<S>(stream: S, peer: SocketAddr, tunnels: Arc<TunnelMux>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    match serve_proxy(stream, peer, &tunnels).await {
        Ok(()) => debug!("proxy connection {peer} closed"),
        Err(e) => info!("proxy connection {peer} closed: {e}"),
    }
}

async fn serve_proxy<S>(stream: S, peer: SocketAddr, tunnels: &TunnelMux) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buf = BytesMut::with_capacity(MAX_HEAD_LEN);

    // ── Step 1: Bind the connection ───────────────────────────────────────────
    let bound = match timeout(HEAD_TIMEOUT, read_head(&mut reader, &mut buf)).await {
        Ok(Ok(cookies)) => tunnels
            .resolve_affinity(&cookies)
            .and_then(|affinity| tunnels.open_circuit(&affinity, peer))
            .map_err(ProxyError::from),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ProxyError::Timeout(HEAD_TIMEOUT)),
    };
    let mut circuit = match bound {
        Ok(circuit) => circuit,
        Err(e) => {
            if let Some(status) = e.status() {
                let response = format!("HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
                let _ = writer.write_all(response.as_bytes()).await;
                let _ = writer.shutdown().await;
            }
            return Err(e);
        }
    };
    debug!(%peer, device = %circuit.key().device, dst = %circuit.key().dst, "proxy connection bound");

    // ── Step 2: Pump until either side stops ──────────────────────────────────
    let result = pump(&mut reader, &mut writer, &mut circuit, buf).await;
    let _ = writer.shutdown().await;
    tunnels.close_circuit(circuit);
    result
}

enum Step {
    Downstream(Option<Bytes>),
    Upstream(io::Result<usize>),
}

async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    circuit: &mut Circuit,
    mut buf: BytesMut,
) -> Result<(), ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    forward_upstream(circuit, &mut buf)?;

    loop {
        let step = tokio::select! {
            chunk = circuit.recv() => Step::Downstream(chunk),
            read = reader.read_buf(&mut buf) => Step::Upstream(read),
        };
        match step {
            Step::Downstream(Some(chunk)) => writer.write_all(&chunk).await?,
            Step::Downstream(None) => return Ok(()),
            Step::Upstream(Ok(0)) => return Ok(()),
            Step::Upstream(Ok(_)) => forward_upstream(circuit, &mut buf)?,
            Step::Upstream(Err(e)) => return Err(e.into()),
        }
    }
}

/// Sends everything in `buf` upstream, split to fit WebData frames.
fn forward_upstream(circuit: &Circuit, buf: &mut BytesMut) -> Result<(), ProxyError> {
    while !buf.is_empty() {
        let take = buf.len().min(MAX_WEB_PAYLOAD);
        circuit.send_upstream(buf.split_to(take).freeze())?;
    }
    buf.reserve(MAX_HEAD_LEN);
    Ok(())
}

/// Reads until the blank line that ends the request head and returns the
/// proxy cookies found in it.  Bytes past the head stay in `buf`.
async fn read_head<R>(reader: &mut R, buf: &mut BytesMut) -> Result<ProxyCookies, ProxyError>
where
    R: AsyncRead + Unpin,
{
    let head_len = loop {
        if let Some(pos) = find_head_end(buf) {
            break pos;
        }
        if buf.len() >= MAX_HEAD_LEN {
            return Err(ProxyError::HeadTooLarge);
        }
        if reader.read_buf(buf).await? == 0 {
            return Err(ProxyError::Incomplete);
        }
    };
    if head_len > MAX_HEAD_LEN {
        return Err(ProxyError::HeadTooLarge);
    }
    parse_head(&buf[..head_len])
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_END.len())
        .position(|w| w == HEAD_END)
        .map(|pos| pos + HEAD_END.len())
}

fn parse_head(head: &[u8]) -> Result<ProxyCookies, ProxyError> {
    let text = std::str::from_utf8(head).map_err(|_| ProxyError::Malformed)?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().ok_or(ProxyError::Malformed)?;
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() != 3 || !parts[2].starts_with("HTTP/") {
        return Err(ProxyError::Malformed);
    }

    let mut cookies = ProxyCookies::default();
    for line in lines.take_while(|l| !l.is_empty()) {
        let Some((name, value)) = line.split_once(':') else {
            warn!("header line without a colon");
            return Err(ProxyError::Malformed);
        };
        if name.trim().eq_ignore_ascii_case("cookie") {
            cookies.merge_header(value);
        }
    }
    Ok(cookies)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::endpoint::{DeviceEndpoint, OutboundQueue};
    use crate::application::registry::{DeviceRecord, DeviceRegistry};
    use crate::domain::DeviceKey;
    use tokio::io::{duplex, DuplexStream};
    use ttyhub_core::protocol::messages::WebDataMessage;
    use ttyhub_core::Frame;

    const PEER: ([u8; 4], u16) = ([10, 0, 0, 7], 40123);

    struct Fixture {
        tunnels: Arc<TunnelMux>,
        registry: Arc<DeviceRegistry>,
        device: DeviceKey,
        queue: OutboundQueue<Frame>,
        conn_id: crate::domain::ConnId,
    }

    fn fixture() -> Fixture {
        use crate::application::endpoint::Endpoint;

        let registry = Arc::new(DeviceRegistry::new());
        let device = DeviceKey::new("", "gw");
        let (endpoint, queue) = DeviceEndpoint::new(device.clone(), 16);
        let conn_id = endpoint.conn_id();
        registry
            .insert(DeviceRecord::new(endpoint, String::new(), 1))
            .unwrap();
        let tunnels = Arc::new(TunnelMux::new(
            Arc::clone(&registry),
            Duration::from_secs(60),
            8,
            "http://proxy/".to_string(),
        ));
        Fixture {
            tunnels,
            registry,
            device,
            queue,
            conn_id,
        }
    }

    fn cookie_header(redirect: &ProxyRedirect) -> String {
        redirect
            .cookies
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn connect(f: &Fixture) -> (DuplexStream, tokio::task::JoinHandle<()>) {
        let (server, client) = duplex(64 * 1024);
        let task = tokio::spawn(handle_proxy(server, SocketAddr::from(PEER), Arc::clone(&f.tunnels)));
        (client, task)
    }

    async fn read_all(mut client: DuplexStream) -> String {
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    async fn next_web_data(queue: &mut OutboundQueue<Frame>) -> WebDataMessage {
        match queue.next().await {
            Some(Frame::WebData(msg)) => msg,
            other => panic!("expected web data, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_head_picks_cookies_case_insensitively() {
        let head = b"GET / HTTP/1.1\r\nHost: x\r\nCOOKIE: a=1; ttyhub-proxy-sid=abc\r\n\r\n";

        let cookies = parse_head(head).unwrap();

        assert_eq!(cookies.session_id.as_deref(), Some("abc"));
    }

    #[test]
    fn test_parse_head_rejects_garbage() {
        assert!(matches!(parse_head(b"hello\r\n\r\n"), Err(ProxyError::Malformed)));
        assert!(matches!(
            parse_head(b"GET / HTTP/1.1\r\nno colon here\r\n\r\n"),
            Err(ProxyError::Malformed)
        ));
    }

    #[test]
    fn test_redirect_response_sets_all_cookies() {
        let f = fixture();
        let redirect = f.tunnels.issue_redirect(None, f.device.clone(), "192.168.1.1").unwrap();

        let response = redirect_response(&redirect);

        assert!(response.starts_with("HTTP/1.1 302 Found\r\nLocation: http://proxy/\r\n"));
        assert_eq!(response.matches("Set-Cookie: ").count(), 3);
        assert!(response.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_request_without_cookies_gets_401() {
        // Arrange
        let f = fixture();
        let (mut client, task) = connect(&f);

        // Act
        client.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();

        // Assert
        task.await.unwrap();
        assert!(read_all(client).await.starts_with("HTTP/1.1 401"));
    }

    #[tokio::test]
    async fn test_garbage_gets_400() {
        let f = fixture();
        let (mut client, task) = connect(&f);

        client.write_all(b"\x16\x03\x01 not http\r\n\r\n").await.unwrap();

        task.await.unwrap();
        assert!(read_all(client).await.starts_with("HTTP/1.1 400"));
    }

    #[tokio::test]
    async fn test_offline_device_gets_502() {
        let f = fixture();
        let redirect = f.tunnels.issue_redirect(None, f.device.clone(), "192.168.1.1:8080").unwrap();
        f.registry.remove(&f.device, f.conn_id);
        let (mut client, task) = connect(&f);

        let request = format!("GET / HTTP/1.1\r\nCookie: {}\r\n\r\n", cookie_header(&redirect));
        client.write_all(request.as_bytes()).await.unwrap();

        task.await.unwrap();
        assert!(read_all(client).await.starts_with("HTTP/1.1 502"));
    }

    #[tokio::test]
    async fn test_round_trip_through_device() {
        // Arrange
        let mut f = fixture();
        let redirect = f.tunnels.issue_redirect(None, f.device.clone(), "192.168.1.1").unwrap();
        let (mut client, task) = connect(&f);
        let request = format!("GET / HTTP/1.1\r\nCookie: {}\r\n\r\n", cookie_header(&redirect));

        // Act: the head reaches the device.
        client.write_all(request.as_bytes()).await.unwrap();
        let upstream = next_web_data(&mut f.queue).await;
        assert_eq!(&upstream.payload[..], request.as_bytes());
        assert_eq!(upstream.dst.to_string(), "192.168.1.1:80");

        // Act: the device answers, then closes its end.
        let answer = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi";
        assert!(f.tunnels.deliver(
            &f.device,
            WebDataMessage {
                src: upstream.src,
                dst: upstream.dst,
                payload: Bytes::from_static(answer),
            },
        ));
        assert!(f.tunnels.deliver(&f.device, WebDataMessage::close(upstream.src, upstream.dst)));

        // Assert
        task.await.unwrap();
        assert_eq!(read_all(client).await.as_bytes(), answer);
        assert_eq!(f.tunnels.circuit_count(), 0);
    }

    #[tokio::test]
    async fn test_browser_close_notifies_device() {
        let mut f = fixture();
        let redirect = f.tunnels.issue_redirect(None, f.device.clone(), "192.168.1.1").unwrap();
        let (mut client, task) = connect(&f);
        let request = format!("GET / HTTP/1.1\r\nCookie: {}\r\n\r\n", cookie_header(&redirect));
        client.write_all(request.as_bytes()).await.unwrap();
        let upstream = next_web_data(&mut f.queue).await;

        drop(client);
        task.await.unwrap();

        let close = next_web_data(&mut f.queue).await;
        assert!(close.is_close());
        assert_eq!(close.src, upstream.src);
    }

    #[tokio::test]
    async fn test_new_redirect_closes_running_connection() {
        let mut f = fixture();
        let first = f.tunnels.issue_redirect(None, f.device.clone(), "192.168.1.1").unwrap();
        let (mut client, task) = connect(&f);
        let request = format!("GET / HTTP/1.1\r\nCookie: {}\r\n\r\n", cookie_header(&first));
        client.write_all(request.as_bytes()).await.unwrap();
        next_web_data(&mut f.queue).await;

        f.tunnels
            .issue_redirect(Some(&first.session_id), f.device.clone(), "192.168.1.2")
            .unwrap();

        task.await.unwrap();
        assert_eq!(read_all(client).await, "");
    }

    #[tokio::test]
    async fn test_new_redirect_closes_connection_mid_transfer() {
        // Arrange: a bound connection that has started receiving an answer.
        let mut f = fixture();
        let first = f.tunnels.issue_redirect(None, f.device.clone(), "192.168.1.1").unwrap();
        let (mut client, task) = connect(&f);
        let request = format!("GET /big HTTP/1.1\r\nCookie: {}\r\n\r\n", cookie_header(&first));
        client.write_all(request.as_bytes()).await.unwrap();
        let upstream = next_web_data(&mut f.queue).await;
        let chunk = || WebDataMessage {
            src: upstream.src,
            dst: upstream.dst,
            payload: Bytes::from_static(b"0123456789"),
        };
        assert!(f.tunnels.deliver(&f.device, chunk()));
        let mut received = [0u8; 10];
        client.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"0123456789");

        // Act: supersede while the device is still streaming.
        f.tunnels
            .issue_redirect(Some(&first.session_id), f.device.clone(), "192.168.1.2")
            .unwrap();
        for _ in 0..3 {
            assert!(!f.tunnels.deliver(&f.device, chunk()));
        }

        // Assert: the browser sees EOF with nothing more, the device is told
        // to close its end exactly once.
        task.await.unwrap();
        assert_eq!(read_all(client).await, "");
        let close = next_web_data(&mut f.queue).await;
        assert!(close.is_close());
        assert_eq!((close.src, close.dst), (upstream.src, upstream.dst));
        assert!(tokio::time::timeout(Duration::from_millis(10), f.queue.next())
            .await
            .is_err());
        assert_eq!(f.tunnels.circuit_count(), 0);
    }
}
