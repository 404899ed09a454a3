//! One browser WebSocket, from upgrade to teardown.
//!
//! The browser must log in first: a `{"type":"login", ...}` text frame
//! within `login_timeout`.  After that two loops run side by side:
//!
//! - **reader** (this task): WebSocket frames → [`UserInput`] events for the
//!   broker.  Binary frames are terminal data, `[kind:1][bytes]`.
//! - **writer** (spawned): [`UserOutbound`] queue → WebSocket frames.
//!
//! Whichever side stops first cancels the other through the endpoint's
//! cancellation token.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, info, warn};
use ttyhub_core::protocol::messages::{DataKind, FileOp};

use crate::application::broker::{BrokerHandle, UserInput};
use crate::application::endpoint::{Endpoint, OutboundQueue, UserEndpoint, UserOutbound};
use crate::domain::{BrowserMsg, ConnId, DeviceKey, LoginError, ServerConfig, ServerMsg};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

type WsSink<S> = SplitSink<WebSocketStream<S>, WsMessage>;
type WsSource<S> = SplitStream<WebSocketStream<S>>;

/// Everything a browser connection task needs.
#[derive(Clone)]
pub struct UserContext {
    pub config: Arc<ServerConfig>,
    pub broker: BrokerHandle,
}

/// Entry point for each accepted browser connection.
pub async fn handle_user<S>(stream: S, peer: SocketAddr, ctx: UserContext)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    match serve_user(stream, peer, ctx).await {
        Ok(()) => info!("browser {peer} closed"),
        Err(e) => warn!("browser {peer} closed: {e:#}"),
    }
}

/// What the first message of a connection turned out to be.
enum FirstMessage {
    Login(DeviceKey),
    Invalid(String),
    Gone,
}

async fn serve_user<S>(stream: S, peer: SocketAddr, ctx: UserContext) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    // ── Step 1: WebSocket handshake ───────────────────────────────────────────
    let ws = accept_async(stream)
        .await
        .with_context(|| format!("WebSocket handshake failed with {peer}"))?;
    let (mut sink, mut source) = ws.split();

    // ── Step 2: Login ─────────────────────────────────────────────────────────
    let device = match timeout(ctx.config.login_timeout(), first_message(&mut source)).await {
        Ok(FirstMessage::Login(device)) => device,
        Ok(FirstMessage::Gone) => return Ok(()),
        Ok(FirstMessage::Invalid(why)) => {
            refuse(&mut sink, LoginError::Invalid).await;
            anyhow::bail!("bad login from {peer}: {why}");
        }
        Err(_) => {
            refuse(&mut sink, LoginError::Timeout).await;
            anyhow::bail!("no login from {peer} within {:?}", ctx.config.login_timeout());
        }
    };

    let (endpoint, queue) = UserEndpoint::new(ctx.config.user_queue_capacity);
    let user = endpoint.conn_id();
    info!(%user, %peer, %device, "browser login");

    // ── Step 3: Writer task ───────────────────────────────────────────────────
    let mut writer = tokio::spawn(write_messages(sink, queue, user));

    // ── Step 4: Hand the login to the broker, then read ───────────────────────
    let result = match ctx.broker.login(endpoint.clone(), device).await {
        Ok(()) => read_messages(&mut source, &endpoint, &ctx).await,
        Err(e) => Err(e).context("broker unavailable"),
    };

    // ── Step 5: Teardown ──────────────────────────────────────────────────────
    ctx.broker.user_closed(user).await;
    endpoint.close();
    if timeout(FLUSH_TIMEOUT, &mut writer).await.is_err() {
        endpoint.abort();
        writer.abort();
    }
    result
}

/// Waits for the login message.  Control frames are skipped.
async fn first_message<S>(source: &mut WsSource<S>) -> FirstMessage
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let msg = match source.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(_)) | None => return FirstMessage::Gone,
        };
        match msg {
            WsMessage::Text(text) => {
                return match serde_json::from_str::<BrowserMsg>(&text) {
                    Ok(BrowserMsg::Login { devid, group }) if !devid.is_empty() => {
                        FirstMessage::Login(DeviceKey::new(group, devid))
                    }
                    Ok(BrowserMsg::Login { .. }) => FirstMessage::Invalid("empty device id".into()),
                    Ok(_) => FirstMessage::Invalid("first message must be a login".into()),
                    Err(e) => FirstMessage::Invalid(e.to_string()),
                };
            }
            WsMessage::Binary(_) => return FirstMessage::Invalid("data before login".into()),
            WsMessage::Close(_) => return FirstMessage::Gone,
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
        }
    }
}

async fn refuse<S>(sink: &mut WsSink<S>, err: LoginError)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Ok(json) = serde_json::to_string(&ServerMsg::login_failed(err)) {
        let _ = sink.send(WsMessage::Text(json)).await;
    }
    let _ = sink.close().await;
}

async fn read_messages<S>(
    source: &mut WsSource<S>,
    endpoint: &UserEndpoint,
    ctx: &UserContext,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let cancel = endpoint.cancellation();
    let user = endpoint.conn_id();
    let limit = ctx.config.backpressure_timeout();

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            msg = source.next() => match msg {
                Some(Ok(msg)) => msg,
                Some(Err(WsError::ConnectionClosed | WsError::Protocol(_))) | None => return Ok(()),
                Some(Err(e)) => return Err(e).context("reading from browser"),
            },
        };

        let input = match msg {
            WsMessage::Binary(bytes) => match data_input(&bytes) {
                Some(input) => input,
                None => {
                    debug!(%user, len = bytes.len(), "unusable binary frame ignored");
                    continue;
                }
            },
            WsMessage::Text(text) => match serde_json::from_str::<BrowserMsg>(&text) {
                Ok(BrowserMsg::Winsize { cols, rows }) => UserInput::WindowSize { cols, rows },
                Ok(BrowserMsg::File { op, name, size }) => match FileOp::try_from(op) {
                    Ok(op) => UserInput::File { op, name, size },
                    Err(()) => {
                        warn!(%user, op, "unknown file operation ignored");
                        continue;
                    }
                },
                Ok(BrowserMsg::Logout) => {
                    ctx.broker.logout(user).await;
                    return Ok(());
                }
                Ok(BrowserMsg::Login { .. }) => {
                    warn!(%user, "repeated login ignored");
                    continue;
                }
                Err(e) => {
                    warn!(%user, "invalid JSON from browser: {e}");
                    continue;
                }
            },
            WsMessage::Close(_) => return Ok(()),
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
        };

        ctx.broker
            .user_input(user, input, limit)
            .await
            .context("forwarding browser input")?;
    }
}

/// `[kind:1][bytes]` → terminal or file data.
fn data_input(frame: &[u8]) -> Option<UserInput> {
    let (&kind, data) = frame.split_first()?;
    let kind = DataKind::try_from(kind).ok()?;
    Some(UserInput::Data {
        kind,
        data: Bytes::copy_from_slice(data),
    })
}

async fn write_messages<S>(mut sink: WsSink<S>, mut queue: OutboundQueue<UserOutbound>, user: ConnId)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(out) = queue.next().await {
        let msg = match out {
            UserOutbound::Data(bytes) => WsMessage::Binary(bytes.to_vec()),
            UserOutbound::Control(control) => match serde_json::to_string(&control) {
                Ok(json) => WsMessage::Text(json),
                Err(e) => {
                    warn!(%user, "JSON serialization error: {e}");
                    continue;
                }
            },
        };
        if let Err(e) = sink.send(msg).await {
            debug!(%user, "WebSocket send failed: {e}");
            break;
        }
    }
    let _ = sink.close().await;
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::broker::Broker;
    use crate::application::registry::DeviceRegistry;
    use crate::application::tunnel::TunnelMux;
    use tokio::io::{duplex, DuplexStream};
    use tokio_tungstenite::client_async;
    use tokio_util::sync::CancellationToken;

    type Client = WebSocketStream<DuplexStream>;

    struct Fixture {
        ctx: UserContext,
        _shutdown: CancellationToken,
    }

    fn fixture() -> Fixture {
        let config = ServerConfig::default();
        let registry = Arc::new(DeviceRegistry::new());
        let tunnels = Arc::new(TunnelMux::new(
            Arc::clone(&registry),
            config.proxy_session_ttl(),
            config.circuit_queue_capacity,
            config.proxy_redirect_location(config.proxy_bind_addr),
        ));
        let (broker, handle) = Broker::new(&config, registry, tunnels);
        let shutdown = CancellationToken::new();
        tokio::spawn(broker.run(shutdown.clone()));
        Fixture {
            ctx: UserContext {
                config: Arc::new(config),
                broker: handle,
            },
            _shutdown: shutdown,
        }
    }

    async fn connect(f: &Fixture) -> (Client, tokio::task::JoinHandle<()>) {
        let (server, client) = duplex(64 * 1024);
        let peer = SocketAddr::from(([127, 0, 0, 1], 40000));
        let task = tokio::spawn(handle_user(server, peer, f.ctx.clone()));
        let (ws, _) = client_async("ws://localhost/", client).await.unwrap();
        (ws, task)
    }

    async fn next_json(ws: &mut Client) -> ServerMsg {
        loop {
            match ws.next().await.unwrap().unwrap() {
                WsMessage::Text(text) => return serde_json::from_str(&text).unwrap(),
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_data_input_splits_kind() {
        assert_eq!(
            data_input(&[0, b'l', b's']),
            Some(UserInput::Data {
                kind: DataKind::Terminal,
                data: Bytes::from_static(b"ls"),
            })
        );
        assert_eq!(data_input(&[]), None);
        assert_eq!(data_input(&[9, 1]), None);
    }

    #[tokio::test]
    async fn test_login_to_offline_device_fails() {
        // Arrange
        let f = fixture();
        let (mut ws, _task) = connect(&f).await;

        // Act
        ws.send(WsMessage::Text(r#"{"type":"login","devid":"nope"}"#.into()))
            .await
            .unwrap();

        // Assert
        assert_eq!(next_json(&mut ws).await, ServerMsg::login_failed(LoginError::Offline));
    }

    #[tokio::test]
    async fn test_first_message_must_be_login() {
        let f = fixture();
        let (mut ws, task) = connect(&f).await;

        ws.send(WsMessage::Text(r#"{"type":"logout"}"#.into()))
            .await
            .unwrap();

        assert_eq!(next_json(&mut ws).await, ServerMsg::login_failed(LoginError::Invalid));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_login_is_invalid() {
        let f = fixture();
        let (mut ws, _task) = connect(&f).await;

        ws.send(WsMessage::Text("not json".into())).await.unwrap();

        assert_eq!(next_json(&mut ws).await, ServerMsg::login_failed(LoginError::Invalid));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_browser_gets_timeout() {
        // Arrange
        let f = fixture();
        let (mut ws, task) = connect(&f).await;

        // Act: send nothing and let the login timer run out.
        let reply = next_json(&mut ws).await;

        // Assert
        assert_eq!(reply, ServerMsg::login_failed(LoginError::Timeout));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_closing_before_login_is_quiet() {
        let f = fixture();
        let (mut ws, task) = connect(&f).await;

        ws.close(None).await.unwrap();

        task.await.unwrap();
        let snapshot = f.ctx.broker.snapshot().await.unwrap();
        assert_eq!(snapshot.users, 0);
    }
}
