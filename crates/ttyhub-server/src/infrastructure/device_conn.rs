//! One device link, from handshake to teardown.
//!
//! # Lifecycle (for beginners)
//!
//! ```text
//!  accept ──► Register (first frame, within register_timeout)
//!         ──► token check (DeviceAuthenticator)
//!         ──► broker.register_device ──► RegisterAck(accepted)
//!         ──► writer task + read loop
//!         ──► teardown: endpoint closed, broker told exactly once
//! ```
//!
//! The read loop owns liveness.  Every inbound frame counts as a sign of
//! life; after `keepalive × keepalive_miss_factor` of silence the device is
//! considered dead even if TCP still looks open.
//!
//! Heartbeats and tunnel data never reach the broker: heartbeats are
//! answered here and tunnel bytes go straight to the [`TunnelMux`].  All
//! other frames are forwarded to the broker with bounded backpressure.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use ttyhub_core::protocol::messages::{
    HeartbeatMessage, RegisterAckMessage, RegisterCode, RegisterMessage,
};
use ttyhub_core::Frame;

use crate::application::auth::DeviceAuthenticator;
use crate::application::broker::{BrokerHandle, DeviceRegistration, RegisterRejection};
use crate::application::endpoint::{DeviceEndpoint, Endpoint, OutboundQueue};
use crate::application::registry::DeviceRegistry;
use crate::application::tunnel::TunnelMux;
use crate::domain::{DeviceKey, ServerConfig};
use crate::infrastructure::framed::{write_frame, FrameReader};

/// How long queued frames may take to flush once a link is closing.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a device connection task needs.
#[derive(Clone)]
pub struct DeviceContext {
    pub config: Arc<ServerConfig>,
    pub broker: BrokerHandle,
    pub registry: Arc<DeviceRegistry>,
    pub tunnels: Arc<TunnelMux>,
    pub auth: Arc<dyn DeviceAuthenticator>,
}

/// Entry point for each accepted device connection.
pub async fn handle_device<S>(stream: S, peer: SocketAddr, ctx: DeviceContext)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    match serve_device(stream, peer, ctx).await {
        Ok(()) => info!("device link {peer} closed"),
        Err(e) => warn!("device link {peer} closed: {e:#}"),
    }
}

async fn serve_device<S>(stream: S, peer: SocketAddr, ctx: DeviceContext) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read_half);

    // ── Step 1: Register must come first ──────────────────────────────────────
    let registration = match timeout(ctx.config.register_timeout(), reader.next_frame()).await {
        Err(_) => bail!("no register frame within {:?}", ctx.config.register_timeout()),
        Ok(Ok(Some(Frame::Register(reg)))) => reg,
        Ok(Ok(Some(other))) => bail!("expected register, got {:?}", other.message_type()),
        Ok(Ok(None)) => bail!("closed before registering"),
        Ok(Err(e)) => return Err(e).context("reading register frame"),
    };
    let key = DeviceKey::new(registration.group.clone(), registration.device_id.clone());
    debug!(device = %key, %peer, proto = registration.proto_version, "register received");

    // ── Step 2: Admission ─────────────────────────────────────────────────────
    if !ctx.auth.authenticate(&registration).await {
        reject(&mut write_half, RegisterRejection::InvalidToken).await;
        bail!("device {key} presented an invalid token");
    }

    let (endpoint, queue) = DeviceEndpoint::new(key.clone(), ctx.config.device_queue_capacity);
    let admitted = ctx
        .broker
        .register_device(registration_of(&key, &registration), endpoint.clone())
        .await;
    if let Err(rejection) = admitted {
        reject(&mut write_half, rejection.clone()).await;
        bail!("device {key} rejected: {rejection}");
    }

    let accepted = Frame::RegisterAck(RegisterAckMessage {
        code: RegisterCode::Accepted,
        reason: String::new(),
    });
    if let Err(e) = write_frame(&mut write_half, &accepted).await {
        endpoint.abort();
        ctx.broker.device_closed(key.clone(), endpoint.conn_id()).await;
        return Err(e).context("writing register ack");
    }

    let keepalive = ctx.config.keepalive_for(registration.keepalive);
    let dead_after = ctx.config.dead_peer_after(keepalive);
    info!(device = %key, %peer, conn = %endpoint.conn_id(), ?keepalive, "device online");

    // ── Step 3: Writer task ───────────────────────────────────────────────────
    let mut writer = tokio::spawn(write_frames(write_half, queue, key.clone()));

    // ── Step 4: Read loop ─────────────────────────────────────────────────────
    let result = read_frames(&mut reader, &endpoint, &ctx, dead_after).await;

    // ── Step 5: Teardown ──────────────────────────────────────────────────────
    endpoint.close();
    ctx.broker.device_closed(key.clone(), endpoint.conn_id()).await;
    if timeout(FLUSH_TIMEOUT, &mut writer).await.is_err() {
        endpoint.abort();
        writer.abort();
    }
    result
}

fn registration_of(key: &DeviceKey, register: &RegisterMessage) -> DeviceRegistration {
    DeviceRegistration {
        key: key.clone(),
        description: register.description.clone(),
        proto_version: register.proto_version,
    }
}

async fn reject<W>(writer: &mut WriteHalf<W>, rejection: RegisterRejection)
where
    W: AsyncRead + AsyncWrite,
{
    if let Err(e) = write_frame(writer, &rejection.reply_frame()).await {
        debug!("could not send rejection: {e}");
    }
    let _ = writer.shutdown().await;
}

async fn read_frames<R>(
    reader: &mut FrameReader<R>,
    endpoint: &DeviceEndpoint,
    ctx: &DeviceContext,
    dead_after: Duration,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
{
    let cancel = endpoint.cancellation();
    let key = endpoint.key();
    let conn_id = endpoint.conn_id();

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(device = %key, "link closed by the hub");
                return Ok(());
            }
            read = timeout(dead_after, reader.next_frame()) => match read {
                Err(_) => bail!("device {key} silent for {dead_after:?}"),
                Ok(Ok(Some(frame))) => frame,
                Ok(Ok(None)) => return Ok(()),
                Ok(Err(e)) => return Err(e.into()),
            },
        };

        match frame {
            Frame::Heartbeat(HeartbeatMessage { uptime }) => {
                if let Some(uptime) = uptime {
                    ctx.registry.set_uptime(key, conn_id, uptime);
                }
                if let Err(e) = endpoint.send(Frame::Heartbeat(HeartbeatMessage { uptime: None })) {
                    debug!(device = %key, "heartbeat reply not queued: {e}");
                }
            }
            Frame::WebData(msg) => {
                ctx.tunnels.deliver(key, msg);
            }
            Frame::Register(_) => {
                warn!(device = %key, "repeated register ignored");
            }
            other => {
                ctx.broker
                    .device_frame(key.clone(), conn_id, other, ctx.config.backpressure_timeout())
                    .await
                    .with_context(|| format!("forwarding frame from {key}"))?;
            }
        }
    }
}

/// Drains the endpoint queue into the socket.
async fn write_frames<W>(mut writer: WriteHalf<W>, mut queue: OutboundQueue<Frame>, key: DeviceKey)
where
    W: AsyncRead + AsyncWrite,
{
    while let Some(frame) = queue.next().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            debug!(device = %key, "write failed: {e}");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

// ── Tests ─────────────────────────────────────────────────────────────────────
