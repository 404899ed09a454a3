//! Shared fixtures for the hub integration tests: a hub on loopback ports, a
//! scripted device and a scripted browser.

#![allow(dead_code)]

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use ttyhub_core::protocol::messages::{RegisterCode, RegisterMessage};
use ttyhub_core::Frame;
use ttyhub_server::domain::{ServerConfig, ServerMsg};
use ttyhub_server::infrastructure::framed::{write_frame, FrameReader};
use ttyhub_server::infrastructure::Hub;

pub const STEP: Duration = Duration::from_secs(5);

pub fn loopback_config() -> ServerConfig {
    ServerConfig {
        device_bind_addr: "127.0.0.1:0".parse().unwrap(),
        user_bind_addr: "127.0.0.1:0".parse().unwrap(),
        proxy_bind_addr: "127.0.0.1:0".parse().unwrap(),
        ..ServerConfig::default()
    }
}

pub async fn start_hub() -> Hub {
    Hub::start(loopback_config()).await.unwrap()
}

// ── Scripted device ───────────────────────────────────────────────────────────

pub struct FakeDevice {
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl FakeDevice {
    /// Connects and sends Register without waiting for the answer.
    pub async fn dial(hub: &Hub, group: &str, id: &str, token: Option<&str>) -> Self {
        let stream = TcpStream::connect(hub.device_addr()).await.unwrap();
        let (read, write) = stream.into_split();
        let mut device = Self {
            reader: FrameReader::new(read),
            writer: write,
        };
        device
            .send(Frame::Register(RegisterMessage {
                device_id: id.to_string(),
                group: group.to_string(),
                token: token.map(str::to_string),
                description: format!("fake {id}"),
                proto_version: 1,
                keepalive: None,
            }))
            .await;
        device
    }

    /// Connects, registers and expects to be accepted.
    pub async fn online(hub: &Hub, group: &str, id: &str) -> Self {
        let mut device = Self::dial(hub, group, id, None).await;
        match device.recv().await {
            Frame::RegisterAck(ack) => assert_eq!(ack.code, RegisterCode::Accepted),
            other => panic!("expected register ack, got {other:?}"),
        }
        device
    }

    pub async fn send(&mut self, frame: Frame) {
        write_frame(&mut self.writer, &frame).await.unwrap();
    }

    pub async fn recv(&mut self) -> Frame {
        timeout(STEP, self.reader.next_frame())
            .await
            .expect("device waited too long")
            .unwrap()
            .expect("hub closed the device link")
    }

    /// Reads until the hub closes the link, returning what arrived first.
    pub async fn drain_until_closed(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(Ok(Some(frame))) = timeout(STEP, self.reader.next_frame()).await {
            frames.push(frame);
        }
        frames
    }
}

// ── Scripted browser ──────────────────────────────────────────────────────────

pub type Browser = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub async fn browser(hub: &Hub) -> Browser {
    let (ws, _) = connect_async(format!("ws://{}/", hub.user_addr()))
        .await
        .unwrap();
    ws
}

/// Opens a browser and logs in to `group/id`, returning the login reply.
pub async fn browser_login(hub: &Hub, group: &str, id: &str) -> (Browser, ServerMsg) {
    let mut ws = browser(hub).await;
    let login = serde_json::json!({"type": "login", "devid": id, "group": group});
    ws.send(WsMessage::Text(login.to_string())).await.unwrap();
    let reply = next_json(&mut ws).await;
    (ws, reply)
}

pub async fn next_message(ws: &mut Browser) -> WsMessage {
    loop {
        let msg = timeout(STEP, ws.next())
            .await
            .expect("browser waited too long")
            .expect("browser stream ended")
            .unwrap();
        if !matches!(msg, WsMessage::Ping(_) | WsMessage::Pong(_)) {
            return msg;
        }
    }
}

pub async fn next_json(ws: &mut Browser) -> ServerMsg {
    match next_message(ws).await {
        WsMessage::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected JSON text frame, got {other:?}"),
    }
}

pub async fn next_binary(ws: &mut Browser) -> Vec<u8> {
    match next_message(ws).await {
        WsMessage::Binary(bytes) => bytes,
        other => panic!("expected binary frame, got {other:?}"),
    }
}
