//! Web tunnel multiplexer.
//!
//! # How it works (for beginners)
//!
//! A browser wants to open `http://192.168.1.1/` *as seen from a device*.
//! The hub cannot dial that address itself, so every byte travels through the
//! device's one link, wrapped in `WebData` frames:
//!
//! ```text
//!  browser TCP ──► proxy listener ──► WebData{src, dst, bytes} ──► device ──► 192.168.1.1:80
//!  browser TCP ◄── circuit queue  ◄── WebData{src, dst, bytes} ◄── device ◄──
//! ```
//!
//! - `src` is the browser connection's own peer address, so it is unique for
//!   as long as that connection is open.
//! - `dst` is the destination the user picked.
//! - The pair `(device, src, dst)` is a **circuit**; answers from the device
//!   carry the same pair and are routed back to exactly that connection.
//!
//! Which device and destination a browser connection belongs to is decided
//! by three cookies set when a redirect is issued.  The cookies point at an
//! affinity entry in an [`ExpiringCache`].  Traffic on a bound circuit keeps
//! the entry alive; an idle entry ages out and cancels its context on the way.
//! Issuing a new redirect for the same browser cancels the previous entry's
//! context too, which closes every circuit still running under it, busy or
//! not.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use ttyhub_core::protocol::messages::WebDataMessage;
use ttyhub_core::{AddrDescriptor, AddrError, Frame};
use uuid::Uuid;

use crate::application::cache::ExpiringCache;
use crate::application::endpoint::{DeviceEndpoint, Endpoint};
use crate::application::registry::DeviceRegistry;
use crate::domain::DeviceKey;

pub const SESSION_COOKIE: &str = "ttyhub-proxy-sid";
pub const DEVICE_COOKIE: &str = "ttyhub-proxy-devid";
pub const DESTINATION_COOKIE: &str = "ttyhub-proxy-dest";

#[derive(Debug, PartialEq, Eq, Error)]
pub enum TunnelError {
    #[error("invalid destination: {0}")]
    InvalidDestination(#[from] AddrError),

    #[error("device {0} is offline")]
    DeviceOffline(DeviceKey),

    #[error("no proxy session, or it has expired")]
    NoSession,

    #[error("proxy cookies do not match the session")]
    CookieMismatch,

    #[error("peer address {0} cannot be tunnelled")]
    UnsupportedPeer(SocketAddr),
}

// ── Affinity ──────────────────────────────────────────────────────────────────

/// Where a browser's proxy session points.
#[derive(Debug, Clone)]
pub struct ProxyAffinity {
    pub device: DeviceKey,
    pub destination: AddrDescriptor,
    session: Arc<str>,
    context: CancellationToken,
}

impl ProxyAffinity {
    /// Cancelled when the session is superseded, ended or expires.
    pub fn context(&self) -> &CancellationToken {
        &self.context
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyCookie {
    pub name: &'static str,
    pub value: String,
}

impl ProxyCookie {
    /// Value for a `Set-Cookie` header.
    pub fn header_value(&self) -> String {
        format!("{}={}; Path=/; HttpOnly", self.name, self.value)
    }
}

/// What an HTTP front end needs to send the browser to the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRedirect {
    pub session_id: String,
    pub cookies: [ProxyCookie; 3],
    pub location: String,
}

/// The proxy cookies found on a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyCookies {
    pub session_id: Option<String>,
    pub device: Option<String>,
    pub destination: Option<String>,
}

impl ProxyCookies {
    /// Picks the proxy cookies out of one `Cookie:` header value.  Other
    /// cookies are ignored; earlier values win over later duplicates.
    pub fn merge_header(&mut self, header: &str) {
        for pair in header.split(';') {
            let Some((name, value)) = pair.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"');
            let slot = match name.trim() {
                SESSION_COOKIE => &mut self.session_id,
                DEVICE_COOKIE => &mut self.device,
                DESTINATION_COOKIE => &mut self.destination,
                _ => continue,
            };
            if slot.is_none() && !value.is_empty() {
                *slot = Some(value.to_string());
            }
        }
    }

    pub fn from_header(header: &str) -> Self {
        let mut cookies = Self::default();
        cookies.merge_header(header);
        cookies
    }
}

fn is_session_id(candidate: &str) -> bool {
    candidate.len() == 32 && candidate.bytes().all(|b| b.is_ascii_hexdigit())
}

// ── Circuits ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CircuitKey {
    pub device: DeviceKey,
    pub src: AddrDescriptor,
    pub dst: AddrDescriptor,
}

type AffinityCache = ExpiringCache<String, ProxyAffinity>;

#[derive(Debug)]
struct CircuitHandle {
    id: u64,
    session: Arc<str>,
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

/// One browser connection's end of a circuit.
#[derive(Debug)]
pub struct Circuit {
    key: CircuitKey,
    id: u64,
    rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    device: DeviceEndpoint,
    session: Arc<str>,
    affinity: Arc<AffinityCache>,
}

impl Circuit {
    pub fn key(&self) -> &CircuitKey {
        &self.key
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Sends browser bytes towards the destination and refreshes the proxy
    /// session's TTL.
    pub fn send_upstream(&self, payload: Bytes) -> Result<(), TunnelError> {
        if self.cancel.is_cancelled() {
            return Err(TunnelError::NoSession);
        }
        self.affinity.active(&*self.session);
        let frame = Frame::WebData(WebDataMessage {
            src: self.key.src,
            dst: self.key.dst,
            payload,
        });
        self.device
            .send(frame)
            .map_err(|_| TunnelError::DeviceOffline(self.key.device.clone()))
    }

    /// Next chunk from the destination; `None` once the circuit is closed.
    ///
    /// A close from the device still hands out the chunks queued ahead of
    /// it.  Supersession, expiry, device loss and overflow end the circuit
    /// at once, even with data pending.
    pub async fn recv(&mut self) -> Option<Bytes> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            chunk = self.rx.recv() => chunk,
        }
    }
}

// ── Multiplexer ───────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct TunnelMux {
    registry: Arc<DeviceRegistry>,
    affinity: Arc<AffinityCache>,
    circuits: DashMap<CircuitKey, CircuitHandle>,
    next_circuit: AtomicU64,
    session_ttl: Duration,
    circuit_capacity: usize,
    location: String,
}

impl TunnelMux {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        session_ttl: Duration,
        circuit_capacity: usize,
        location: String,
    ) -> Self {
        Self {
            registry,
            affinity: Arc::new(ExpiringCache::with_expiry_hook(session_ttl, |affinity: &ProxyAffinity| {
                debug!(session = %affinity.session, device = %affinity.device, "proxy session expired");
                affinity.context.cancel();
            })),
            circuits: DashMap::new(),
            next_circuit: AtomicU64::new(1),
            session_ttl,
            circuit_capacity: circuit_capacity.max(1),
            location,
        }
    }

    /// The affinity store, for the owner to attach a sweeper to.
    pub fn affinity_cache(&self) -> &Arc<AffinityCache> {
        &self.affinity
    }

    /// Points a browser's proxy session at `device` / `destination`.
    ///
    /// `existing` is the browser's current session cookie, if any.  A valid
    /// one is reused and whatever it pointed at before is cancelled.
    pub fn issue_redirect(
        &self,
        existing: Option<&str>,
        device: DeviceKey,
        destination: &str,
    ) -> Result<ProxyRedirect, TunnelError> {
        let destination = AddrDescriptor::parse_destination(destination)?;
        if !self.registry.contains(&device) {
            return Err(TunnelError::DeviceOffline(device));
        }

        let session_id = existing
            .filter(|sid| is_session_id(sid))
            .map(str::to_owned)
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

        let affinity = ProxyAffinity {
            device: device.clone(),
            destination,
            session: Arc::from(session_id.as_str()),
            context: CancellationToken::new(),
        };
        if let Some(previous) =
            self.affinity
                .replace(session_id.clone(), affinity, Some(self.session_ttl))
        {
            debug!(session = %session_id, previous = %previous.device, "proxy session superseded");
            previous.context.cancel();
        }

        debug!(session = %session_id, %device, %destination, "proxy redirect issued");
        Ok(ProxyRedirect {
            cookies: [
                ProxyCookie {
                    name: SESSION_COOKIE,
                    value: session_id.clone(),
                },
                ProxyCookie {
                    name: DEVICE_COOKIE,
                    value: device.to_string(),
                },
                ProxyCookie {
                    name: DESTINATION_COOKIE,
                    value: destination.to_string(),
                },
            ],
            session_id,
            location: self.location.clone(),
        })
    }

    /// Looks up the session named by `cookies` and refreshes its TTL.
    pub fn resolve_affinity(&self, cookies: &ProxyCookies) -> Result<ProxyAffinity, TunnelError> {
        let sid = cookies.session_id.as_deref().ok_or(TunnelError::NoSession)?;
        let affinity = self.affinity.get_touch(sid).ok_or(TunnelError::NoSession)?;
        if affinity.context.is_cancelled() {
            return Err(TunnelError::NoSession);
        }

        let device_matches = cookies.device.as_deref() == Some(affinity.device.to_string().as_str());
        let destination_matches =
            cookies.destination.as_deref() == Some(affinity.destination.to_string().as_str());
        if !device_matches || !destination_matches {
            return Err(TunnelError::CookieMismatch);
        }

        if !self.registry.contains(&affinity.device) {
            return Err(TunnelError::DeviceOffline(affinity.device));
        }
        Ok(affinity)
    }

    /// Ends a proxy session and closes its circuits.
    pub fn end_session(&self, session_id: &str) -> bool {
        match self.affinity.del(session_id) {
            Some(affinity) => {
                affinity.context.cancel();
                true
            }
            None => false,
        }
    }

    /// Registers a circuit for the browser connection from `peer`.
    pub fn open_circuit(&self, affinity: &ProxyAffinity, peer: SocketAddr) -> Result<Circuit, TunnelError> {
        if affinity.context.is_cancelled() {
            return Err(TunnelError::NoSession);
        }
        let src = AddrDescriptor::from_socket_addr(peer).ok_or(TunnelError::UnsupportedPeer(peer))?;
        let device = self
            .registry
            .endpoint(&affinity.device)
            .ok_or_else(|| TunnelError::DeviceOffline(affinity.device.clone()))?;

        let key = CircuitKey {
            device: affinity.device.clone(),
            src,
            dst: affinity.destination,
        };
        let id = self.next_circuit.fetch_add(1, Ordering::Relaxed);
        let cancel = affinity.context.child_token();
        let (tx, rx) = mpsc::channel(self.circuit_capacity);

        let handle = CircuitHandle {
            id,
            session: Arc::clone(&affinity.session),
            tx,
            cancel: cancel.clone(),
        };
        if let Some(stale) = self.circuits.insert(key.clone(), handle) {
            stale.cancel.cancel();
        }

        debug!(device = %key.device, src = %key.src, dst = %key.dst, "circuit opened");
        Ok(Circuit {
            key,
            id,
            rx,
            cancel,
            device,
            session: Arc::clone(&affinity.session),
            affinity: Arc::clone(&self.affinity),
        })
    }

    /// Routes a `WebData` frame that arrived from `device`.
    ///
    /// Returns `false` when no live circuit matched.  Data for a circuit
    /// whose session was superseded or ended tears that circuit down.
    pub fn deliver(&self, device: &DeviceKey, msg: WebDataMessage) -> bool {
        let key = CircuitKey {
            device: device.clone(),
            src: msg.src,
            dst: msg.dst,
        };

        if msg.is_close() {
            // Dropping the sender lets the browser side drain what is queued.
            return match self.circuits.remove(&key) {
                Some(_) => {
                    debug!(%device, src = %key.src, "circuit closed by device");
                    true
                }
                None => false,
            };
        }

        let routed = self.circuits.get(&key).map(|handle| {
            let outcome = if handle.cancel.is_cancelled() {
                None
            } else {
                Some(handle.tx.try_send(msg.payload))
            };
            (handle.id, Arc::clone(&handle.session), outcome)
        });
        let Some((id, session, outcome)) = routed else {
            debug!(%device, src = %key.src, dst = %key.dst, "web data for unknown circuit dropped");
            return false;
        };

        match outcome {
            Some(Ok(())) => {
                self.affinity.active(&*session);
                true
            }
            None => {
                debug!(%device, src = %key.src, "web data for a cancelled circuit; closing it");
                self.tear_down(&key, id, true);
                false
            }
            Some(Err(TrySendError::Full(_))) => {
                warn!(%device, src = %key.src, "circuit queue full; closing circuit");
                self.tear_down(&key, id, true);
                false
            }
            Some(Err(TrySendError::Closed(_))) => {
                self.tear_down(&key, id, true);
                false
            }
        }
    }

    /// Browser side is done with `circuit`.  The device is told to close its
    /// end unless the circuit was already closed from there.
    pub fn close_circuit(&self, circuit: Circuit) {
        circuit.cancel.cancel();
        let removed = self
            .circuits
            .remove_if(&circuit.key, |_, handle| handle.id == circuit.id)
            .is_some();
        if removed {
            let _ = circuit
                .device
                .send(Frame::WebData(WebDataMessage::close(circuit.key.src, circuit.key.dst)));
            debug!(device = %circuit.key.device, src = %circuit.key.src, "circuit closed by browser");
        }
    }

    /// Cancels every circuit addressed to `device`.
    pub fn device_gone(&self, device: &DeviceKey) -> usize {
        let mut closed = 0;
        self.circuits.retain(|key, handle| {
            if key.device == *device {
                handle.cancel.cancel();
                closed += 1;
                false
            } else {
                true
            }
        });
        if closed > 0 {
            debug!(%device, closed, "circuits closed after device loss");
        }
        closed
    }

    pub fn circuit_count(&self) -> usize {
        self.circuits.len()
    }

    fn tear_down(&self, key: &CircuitKey, id: u64, notify_device: bool) {
        let Some((_, handle)) = self.circuits.remove_if(key, |_, handle| handle.id == id) else {
            return;
        };
        handle.cancel.cancel();
        if notify_device {
            if let Some(device) = self.registry.endpoint(&key.device) {
                let _ = device.send(Frame::WebData(WebDataMessage::close(key.src, key.dst)));
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
