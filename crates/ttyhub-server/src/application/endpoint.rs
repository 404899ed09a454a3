//! Connection endpoints: the broker's handle on a live socket.
//!
//! # How it works (for beginners)
//!
//! The broker never touches a socket.  Each accepted connection gets a
//! bounded outbound queue; the broker pushes messages into the queue with
//! [`Endpoint::send`] and a dedicated writer task drains it into the socket.
//!
//! ```text
//!  Broker ──try_send──► [ bounded mpsc ] ──► writer task ──► TCP / WebSocket
//!                            │
//!                      Close marker / CancellationToken
//! ```
//!
//! `send` never waits.  A full queue means the peer is not keeping up, and
//! that connection alone is torn down instead of stalling the broker.
//!
//! Closing comes in two strengths:
//!
//! - [`Endpoint::close`] queues a close marker behind everything already
//!   queued, so a final "you were logged out" message still reaches the peer.
//! - [`ConnectionEndpoint::abort`] cancels the connection's token, which stops
//!   both the reader and the writer straight away.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use ttyhub_core::Frame;

use crate::domain::{ConnId, DeviceKey, ServerMsg};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EndpointError {
    #[error("endpoint is closed")]
    Closed,

    #[error("outbound queue is full; connection dropped")]
    QueueFull,
}

/// Operations the broker needs from any connection, device or browser.
pub trait Endpoint: Send + Sync {
    type Outbound: Send + 'static;

    fn conn_id(&self) -> ConnId;

    fn is_device(&self) -> bool;

    /// Queues `msg` without waiting.
    fn send(&self, msg: Self::Outbound) -> Result<(), EndpointError>;

    /// Closes after everything already queued has been written.
    /// Calling it more than once has no further effect.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

// ── Generic connection plumbing ───────────────────────────────────────────────

#[derive(Debug)]
enum Outbound<T> {
    Message(T),
    Close,
}

#[derive(Debug)]
struct Shared<T> {
    conn_id: ConnId,
    tx: mpsc::Sender<Outbound<T>>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

/// Cloneable sending half of one connection.
#[derive(Debug)]
pub struct ConnectionEndpoint<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for ConnectionEndpoint<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> ConnectionEndpoint<T> {
    /// Creates an endpoint and the queue its writer task will drain.
    pub fn new(capacity: usize) -> (Self, OutboundQueue<T>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let cancel = CancellationToken::new();
        let endpoint = Self {
            shared: Arc::new(Shared {
                conn_id: ConnId::new(),
                tx,
                closed: AtomicBool::new(false),
                cancel: cancel.clone(),
            }),
        };
        (endpoint, OutboundQueue { rx, cancel })
    }

    pub fn conn_id(&self) -> ConnId {
        self.shared.conn_id
    }

    pub fn send(&self, msg: T) -> Result<(), EndpointError> {
        if self.is_closed() {
            return Err(EndpointError::Closed);
        }
        match self.shared.tx.try_send(Outbound::Message(msg)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.abort();
                Err(EndpointError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => {
                self.shared.closed.store(true, Ordering::Release);
                Err(EndpointError::Closed)
            }
        }
    }

    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.shared.tx.try_send(Outbound::Close).is_err() {
            self.shared.cancel.cancel();
        }
    }

    /// Stops the connection immediately, discarding anything still queued.
    pub fn abort(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire) || self.shared.cancel.is_cancelled()
    }

    /// Token cancelled when the connection must stop.  Reader loops select
    /// on it.
    pub fn cancellation(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }
}

/// Receiving half, owned by the connection's writer task.
///
/// Dropping the queue (the writer exited, usually because the socket broke)
/// cancels the connection so its reader stops too.
#[derive(Debug)]
pub struct OutboundQueue<T> {
    rx: mpsc::Receiver<Outbound<T>>,
    cancel: CancellationToken,
}

impl<T> OutboundQueue<T> {
    /// The next message to write, or `None` once the connection is closing.
    pub async fn next(&mut self) -> Option<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            msg = self.rx.recv() => match msg {
                Some(Outbound::Message(msg)) => Some(msg),
                Some(Outbound::Close) | None => None,
            },
        }
    }
}

impl<T> Drop for OutboundQueue<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ── Device endpoint ───────────────────────────────────────────────────────────

/// A registered device's link.  Carries wire frames.
#[derive(Debug, Clone)]
pub struct DeviceEndpoint {
    key: DeviceKey,
    conn: ConnectionEndpoint<Frame>,
}

impl DeviceEndpoint {
    pub fn new(key: DeviceKey, capacity: usize) -> (Self, OutboundQueue<Frame>) {
        let (conn, queue) = ConnectionEndpoint::new(capacity);
        (Self { key, conn }, queue)
    }

    pub fn key(&self) -> &DeviceKey {
        &self.key
    }

    pub fn abort(&self) {
        self.conn.abort();
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.conn.cancellation()
    }
}

impl Endpoint for DeviceEndpoint {
    type Outbound = Frame;

    fn conn_id(&self) -> ConnId {
        self.conn.conn_id()
    }

    fn is_device(&self) -> bool {
        true
    }

    fn send(&self, msg: Frame) -> Result<(), EndpointError> {
        self.conn.send(msg)
    }

    fn close(&self) {
        self.conn.close();
    }

    fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }
}

// ── User endpoint ─────────────────────────────────────────────────────────────

/// What the browser writer task turns into WebSocket frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserOutbound {
    /// A JSON text frame.
    Control(ServerMsg),
    /// A binary frame, already prefixed with its one-byte data kind.
    Data(Bytes),
}

/// A browser's WebSocket link.
#[derive(Debug, Clone)]
pub struct UserEndpoint {
    conn: ConnectionEndpoint<UserOutbound>,
}

impl UserEndpoint {
    pub fn new(capacity: usize) -> (Self, OutboundQueue<UserOutbound>) {
        let (conn, queue) = ConnectionEndpoint::new(capacity);
        (Self { conn }, queue)
    }

    pub fn abort(&self) {
        self.conn.abort();
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.conn.cancellation()
    }
}

impl Endpoint for UserEndpoint {
    type Outbound = UserOutbound;

    fn conn_id(&self) -> ConnId {
        self.conn.conn_id()
    }

    fn is_device(&self) -> bool {
        false
    }

    fn send(&self, msg: UserOutbound) -> Result<(), EndpointError> {
        self.conn.send(msg)
    }

    fn close(&self) {
        self.conn.close();
    }

    fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }
}
