//! The broker: single owner of all session state.
//!
//! # How it works (for beginners)
//!
//! Every connection task (device, browser) talks to the broker by sending a
//! [`BrokerEvent`] down one bounded channel.  The broker handles events one
//! at a time, so the device table, the session table and the command table
//! need no locks at all: only this task ever touches them.
//!
//! ```text
//!  device conn ──┐                              ┌──► DeviceEndpoint queue ──► device
//!  device conn ──┼──► mpsc<BrokerEvent> ──► Broker ─┤
//!  browser conn ─┘        (+ timers)            └──► UserEndpoint queue   ──► browser
//! ```
//!
//! Handlers never wait.  Anything the broker wants to say to a peer is pushed
//! into that peer's endpoint queue with a non-blocking `send`; a peer that
//! cannot keep up is disconnected instead of slowing everyone down.
//!
//! # Sessions
//!
//! A browser logs in to a device and gets one of the device's slots.  The
//! wire session id is the device id followed by the slot digit (`gw-013` is
//! slot 3 of `gw-01`).  The broker tells the device to open the terminal and
//! starts a confirmation timer; if the device does not acknowledge in time
//! the session is torn down again.
//!
//! # Commands
//!
//! Out-of-band commands are correlated by token through a
//! [`CommandTable`], whose expiry timers are polled by the same loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, info, warn};
use ttyhub_core::protocol::messages::{
    AnnounceCode, AnnounceMessage, CommandMessage, DataKind, FileMessage, FileOp, LoginAckMessage,
    LoginMessage, LogoutMessage, RegisterAckMessage, RegisterCode, TermDataMessage,
    WindowSizeMessage,
};
use ttyhub_core::{Frame, SessionId};

use crate::application::commands::{CommandError, CommandPoll, CommandResult, CommandTable, CommandToken};
use crate::application::endpoint::{DeviceEndpoint, Endpoint, UserEndpoint, UserOutbound};
use crate::application::registry::{DeviceRecord, DeviceRegistry};
use crate::application::tunnel::TunnelMux;
use crate::domain::{ConnId, DeviceKey, LoginError, ServerConfig, ServerMsg, SessionKey, SlotTable};

const MAX_NAME_LEN: usize = 64;

// ── Public types ──────────────────────────────────────────────────────────────

/// Why a device registration was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegisterRejection {
    #[error("device id is already registered in this group")]
    IdConflict,

    #[error("invalid device id: {0}")]
    InvalidId(String),

    #[error("invalid device token")]
    InvalidToken,

    #[error("hub is shutting down")]
    ShuttingDown,
}

impl RegisterRejection {
    /// The frame that tells the device it was turned away.
    pub fn reply_frame(&self) -> Frame {
        let code = match self {
            RegisterRejection::IdConflict => RegisterCode::IdConflict,
            RegisterRejection::InvalidId(_) => RegisterCode::InvalidId,
            RegisterRejection::InvalidToken => RegisterCode::InvalidToken,
            RegisterRejection::ShuttingDown => {
                return Frame::Announce(AnnounceMessage {
                    code: AnnounceCode::Shutdown,
                    reason: self.to_string(),
                })
            }
        };
        Frame::RegisterAck(RegisterAckMessage {
            code,
            reason: self.to_string(),
        })
    }
}

/// What a device said about itself when registering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRegistration {
    pub key: DeviceKey,
    pub description: String,
    pub proto_version: u8,
}

/// Input from a logged-in browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserInput {
    Data { kind: DataKind, data: Bytes },
    WindowSize { cols: u16, rows: u16 },
    File {
        op: FileOp,
        name: Option<String>,
        size: Option<u32>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("broker has stopped")]
    Stopped,

    #[error("broker did not accept the event within {0:?}")]
    Backpressure(Duration),
}

/// Point-in-time view of the broker's tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerSnapshot {
    pub devices: usize,
    pub users: usize,
    /// Open sessions, sorted by their display form.
    pub sessions: Vec<SessionKey>,
    pub unconfirmed_sessions: usize,
    pub pending_commands: usize,
}

#[derive(Debug)]
pub enum BrokerEvent {
    Register {
        registration: DeviceRegistration,
        endpoint: DeviceEndpoint,
        reply: oneshot::Sender<Result<(), RegisterRejection>>,
    },
    DeviceFrame {
        key: DeviceKey,
        conn_id: ConnId,
        frame: Frame,
    },
    DeviceClosed {
        key: DeviceKey,
        conn_id: ConnId,
    },
    Evict {
        key: DeviceKey,
        reason: String,
    },
    Login {
        endpoint: UserEndpoint,
        device: DeviceKey,
    },
    UserInput {
        user: ConnId,
        input: UserInput,
    },
    Logout {
        user: ConnId,
    },
    UserClosed {
        user: ConnId,
    },
    SubmitCommand {
        device: DeviceKey,
        payload: Bytes,
        reply: oneshot::Sender<Result<CommandToken, CommandError>>,
    },
    PollCommand {
        token: String,
        reply: oneshot::Sender<CommandPoll>,
    },
    WaitCommand {
        token: String,
        reply: oneshot::Sender<CommandResult>,
    },
    Snapshot {
        reply: oneshot::Sender<BrokerSnapshot>,
    },
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Cloneable front door to the broker.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    tx: mpsc::Sender<BrokerEvent>,
}

impl BrokerHandle {
    async fn dispatch(&self, event: BrokerEvent) -> Result<(), DispatchError> {
        self.tx.send(event).await.map_err(|_| DispatchError::Stopped)
    }

    async fn dispatch_within(&self, event: BrokerEvent, limit: Duration) -> Result<(), DispatchError> {
        match self.tx.send_timeout(event, limit).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(DispatchError::Backpressure(limit)),
            Err(SendTimeoutError::Closed(_)) => Err(DispatchError::Stopped),
        }
    }

    /// Admits a device whose token has already been checked.
    pub async fn register_device(
        &self,
        registration: DeviceRegistration,
        endpoint: DeviceEndpoint,
    ) -> Result<(), RegisterRejection> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(BrokerEvent::Register {
            registration,
            endpoint,
            reply,
        })
        .await
        .map_err(|_| RegisterRejection::ShuttingDown)?;
        rx.await.unwrap_or(Err(RegisterRejection::ShuttingDown))
    }

    /// Forwards a frame read from a device link.  Waits at most `limit` for
    /// room in the broker queue.
    pub async fn device_frame(
        &self,
        key: DeviceKey,
        conn_id: ConnId,
        frame: Frame,
        limit: Duration,
    ) -> Result<(), DispatchError> {
        self.dispatch_within(BrokerEvent::DeviceFrame { key, conn_id, frame }, limit)
            .await
    }

    pub async fn device_closed(&self, key: DeviceKey, conn_id: ConnId) {
        let _ = self.dispatch(BrokerEvent::DeviceClosed { key, conn_id }).await;
    }

    /// Disconnects a device administratively.
    pub async fn evict_device(&self, key: DeviceKey, reason: impl Into<String>) -> Result<(), DispatchError> {
        self.dispatch(BrokerEvent::Evict {
            key,
            reason: reason.into(),
        })
        .await
    }

    /// Asks for a session on `device`.  The answer arrives on the endpoint.
    pub async fn login(&self, endpoint: UserEndpoint, device: DeviceKey) -> Result<(), DispatchError> {
        self.dispatch(BrokerEvent::Login { endpoint, device }).await
    }

    pub async fn user_input(&self, user: ConnId, input: UserInput, limit: Duration) -> Result<(), DispatchError> {
        self.dispatch_within(BrokerEvent::UserInput { user, input }, limit)
            .await
    }

    pub async fn logout(&self, user: ConnId) {
        let _ = self.dispatch(BrokerEvent::Logout { user }).await;
    }

    pub async fn user_closed(&self, user: ConnId) {
        let _ = self.dispatch(BrokerEvent::UserClosed { user }).await;
    }

    /// Sends a command to `device` and returns the token to collect the
    /// answer with.
    pub async fn submit_command(&self, device: DeviceKey, payload: Bytes) -> Result<CommandToken, CommandError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(BrokerEvent::SubmitCommand { device, payload, reply })
            .await
            .map_err(|_| CommandError::Offline)?;
        rx.await.unwrap_or(Err(CommandError::Offline))
    }

    pub async fn poll_command(&self, token: &str) -> CommandPoll {
        let (reply, rx) = oneshot::channel();
        let event = BrokerEvent::PollCommand {
            token: token.to_string(),
            reply,
        };
        if self.dispatch(event).await.is_err() {
            return CommandPoll::Failed(CommandError::InvalidToken);
        }
        rx.await.unwrap_or(CommandPoll::Failed(CommandError::InvalidToken))
    }

    /// Blocks until the command resolves.  The command's own timeout bounds
    /// the wait.
    pub async fn wait_command(&self, token: &str) -> CommandResult {
        let (reply, rx) = oneshot::channel();
        let event = BrokerEvent::WaitCommand {
            token: token.to_string(),
            reply,
        };
        self.dispatch(event).await.map_err(|_| CommandError::Offline)?;
        rx.await.unwrap_or(Err(CommandError::Offline))
    }

    /// Submit and wait in one call.
    pub async fn execute_command(&self, device: DeviceKey, payload: Bytes) -> CommandResult {
        let token = self.submit_command(device, payload).await?;
        self.wait_command(token.as_str()).await
    }

    pub async fn snapshot(&self) -> Option<BrokerSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(BrokerEvent::Snapshot { reply }).await.ok()?;
        rx.await.ok()
    }
}

// ── Broker state ──────────────────────────────────────────────────────────────

#[derive(Debug)]
struct DeviceState {
    endpoint: DeviceEndpoint,
    slots: SlotTable,
}

#[derive(Debug)]
struct ActiveSession {
    key: SessionKey,
    /// Armed until the device acknowledges the login.
    confirm_timer: Option<delay_queue::Key>,
}

#[derive(Debug)]
struct UserState {
    endpoint: UserEndpoint,
    session: Option<ActiveSession>,
}

pub struct Broker {
    events: mpsc::Receiver<BrokerEvent>,
    registry: Arc<DeviceRegistry>,
    tunnels: Arc<TunnelMux>,
    devices: HashMap<DeviceKey, DeviceState>,
    users: HashMap<ConnId, UserState>,
    sessions: HashMap<SessionKey, ConnId>,
    confirmations: DelayQueue<SessionKey>,
    commands: CommandTable,
    max_sessions: usize,
    confirm_timeout: Duration,
}

impl Broker {
    /// Creates the broker and the handle used to reach it.  Nothing runs
    /// until [`Broker::run`] is spawned.
    pub fn new(
        config: &ServerConfig,
        registry: Arc<DeviceRegistry>,
        tunnels: Arc<TunnelMux>,
    ) -> (Self, BrokerHandle) {
        let (tx, events) = mpsc::channel(config.broker_queue_capacity.max(1));
        let broker = Self {
            events,
            registry,
            tunnels,
            devices: HashMap::new(),
            users: HashMap::new(),
            sessions: HashMap::new(),
            confirmations: DelayQueue::new(),
            commands: CommandTable::new(
                config.command_timeout(),
                config.max_pending_commands_per_device,
            ),
            max_sessions: usize::from(config.max_sessions_per_device),
            confirm_timeout: config.login_timeout(),
        };
        (broker, BrokerHandle { tx })
    }

    /// Processes events until `shutdown` fires or every handle is dropped.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(max_sessions = self.max_sessions, "broker started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                Some(expired) = self.confirmations.next(), if !self.confirmations.is_empty() => {
                    let timer = expired.key();
                    self.on_confirmation_expired(expired.into_inner(), timer);
                }
                Some(token) = self.commands.next_expired(), if self.commands.has_timers() => {
                    self.commands.expire(&token);
                }
            }
        }

        self.shut_down();
        info!("broker stopped");
    }

    fn handle(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::Register {
                registration,
                endpoint,
                reply,
            } => self.on_register(registration, endpoint, reply),
            BrokerEvent::DeviceFrame { key, conn_id, frame } => self.on_device_frame(key, conn_id, frame),
            BrokerEvent::DeviceClosed { key, conn_id } => self.device_lost(&key, conn_id, "device disconnected"),
            BrokerEvent::Evict { key, reason } => self.on_evict(&key, &reason),
            BrokerEvent::Login { endpoint, device } => self.on_login(endpoint, device),
            BrokerEvent::UserInput { user, input } => self.on_user_input(user, input),
            BrokerEvent::Logout { user } => self.on_user_gone(user, "logged out"),
            BrokerEvent::UserClosed { user } => self.on_user_gone(user, "browser disconnected"),
            BrokerEvent::SubmitCommand { device, payload, reply } => self.on_submit_command(device, payload, reply),
            BrokerEvent::PollCommand { token, reply } => {
                let _ = reply.send(self.commands.poll(&token));
            }
            BrokerEvent::WaitCommand { token, reply } => self.commands.wait(&token, reply),
            BrokerEvent::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    // ── Devices ───────────────────────────────────────────────────────────

    fn on_register(
        &mut self,
        registration: DeviceRegistration,
        endpoint: DeviceEndpoint,
        reply: oneshot::Sender<Result<(), RegisterRejection>>,
    ) {
        let key = registration.key.clone();
        let conn_id = endpoint.conn_id();

        if let Err(reason) = validate_device_key(&key) {
            warn!(device = %key, %reason, "registration rejected");
            let _ = reply.send(Err(RegisterRejection::InvalidId(reason)));
            return;
        }
        if self.devices.contains_key(&key) {
            warn!(device = %key, conn = %conn_id, "registration rejected: id already online");
            let _ = reply.send(Err(RegisterRejection::IdConflict));
            return;
        }

        let record = DeviceRecord::new(
            endpoint.clone(),
            registration.description,
            registration.proto_version,
        );
        if let Err(err) = self.registry.insert(record) {
            warn!(device = %key, %err, "registration rejected");
            let _ = reply.send(Err(RegisterRejection::IdConflict));
            return;
        }
        self.devices.insert(
            key.clone(),
            DeviceState {
                endpoint,
                slots: SlotTable::new(self.max_sessions),
            },
        );
        info!(device = %key, conn = %conn_id, proto = registration.proto_version, "device registered");

        if reply.send(Ok(())).is_err() {
            self.device_lost(&key, conn_id, "registration abandoned");
        }
    }

    fn on_evict(&mut self, key: &DeviceKey, reason: &str) {
        let Some(state) = self.devices.get(key) else {
            debug!(device = %key, "evict for unknown device ignored");
            return;
        };
        let conn_id = state.endpoint.conn_id();
        deliver(
            &state.endpoint,
            Frame::Announce(AnnounceMessage {
                code: AnnounceCode::Evicted,
                reason: reason.to_string(),
            }),
        );
        info!(device = %key, reason, "evicting device");
        self.device_lost(key, conn_id, reason);
    }

    /// Removes a device and everything that hangs off it.
    fn device_lost(&mut self, key: &DeviceKey, conn_id: ConnId, reason: &str) {
        match self.devices.get(key) {
            Some(state) if state.endpoint.conn_id() == conn_id => {}
            _ => {
                debug!(device = %key, conn = %conn_id, "close from stale connection ignored");
                return;
            }
        }
        let Some(state) = self.devices.remove(key) else {
            return;
        };
        self.registry.remove(key, conn_id);
        state.endpoint.close();

        let mut sessions = 0;
        for slot in state.slots.occupied() {
            let session = SessionKey::new(key.clone(), slot);
            if let Some(user_id) = self.sessions.remove(&session) {
                self.drop_user(user_id, reason);
                sessions += 1;
            }
        }
        let commands = self.commands.device_gone(key);
        let circuits = self.tunnels.device_gone(key);

        info!(device = %key, conn = %conn_id, reason, sessions, commands, circuits, "device removed");
    }

    fn on_device_frame(&mut self, key: DeviceKey, conn_id: ConnId, frame: Frame) {
        match self.devices.get(&key) {
            Some(state) if state.endpoint.conn_id() == conn_id => {}
            _ => {
                debug!(device = %key, kind = ?frame.message_type(), "frame from unregistered connection dropped");
                return;
            }
        }

        match frame {
            Frame::LoginAck(ack) => self.on_login_ack(&key, ack),
            Frame::Logout(LogoutMessage { sid }) => match self.session_on(&key, &sid) {
                Some(session) => self.end_session(&session, false, "session closed by device"),
                None => debug!(device = %key, %sid, "logout for unknown session dropped"),
            },
            Frame::TermData(msg) => self.route_term_data(&key, msg),
            Frame::File(msg) => self.route_file_control(&key, msg),
            Frame::CommandResponse(CommandMessage { token, payload }) => {
                if !self.commands.resolve(&key, &token, payload) {
                    debug!(device = %key, %token, "response for unknown or expired command dropped");
                }
            }
            other => {
                debug!(device = %key, kind = ?other.message_type(), "unexpected frame from device dropped");
            }
        }
    }

    fn on_login_ack(&mut self, device: &DeviceKey, ack: LoginAckMessage) {
        let Some(session) = self.session_on(device, &ack.sid) else {
            debug!(device = %device, sid = %ack.sid, "login ack for unknown session dropped");
            return;
        };
        if ack.code != 0 {
            warn!(%session, code = ack.code, "device refused session");
            self.end_session(&session, false, "device refused the session");
            return;
        }
        let timer = self
            .active_session_mut(&session)
            .and_then(|active| active.confirm_timer.take());
        if let Some(timer) = timer {
            self.confirmations.try_remove(&timer);
        }
        debug!(%session, "session confirmed");
    }

    fn route_term_data(&self, device: &DeviceKey, msg: TermDataMessage) {
        let Some(user) = self.session_on(device, &msg.sid).and_then(|s| self.user_of(&s)) else {
            debug!(device = %device, sid = %msg.sid, "terminal data for unknown session dropped");
            return;
        };
        let mut frame = BytesMut::with_capacity(1 + msg.data.len());
        frame.put_u8(msg.kind as u8);
        frame.put_slice(&msg.data);
        deliver(&user.endpoint, UserOutbound::Data(frame.freeze()));
    }

    fn route_file_control(&self, device: &DeviceKey, msg: FileMessage) {
        let Some(user) = self.session_on(device, &msg.sid).and_then(|s| self.user_of(&s)) else {
            debug!(device = %device, sid = %msg.sid, "file control for unknown session dropped");
            return;
        };
        deliver(
            &user.endpoint,
            UserOutbound::Control(ServerMsg::File {
                op: msg.op as u8,
                name: msg.name,
                size: msg.size,
            }),
        );
    }

    // ── Users ─────────────────────────────────────────────────────────────

    fn on_login(&mut self, endpoint: UserEndpoint, device_key: DeviceKey) {
        let user_id = endpoint.conn_id();
        if self.users.contains_key(&user_id) {
            warn!(user = %user_id, "second login on the same connection ignored");
            return;
        }

        let Some(device) = self.devices.get_mut(&device_key) else {
            info!(user = %user_id, device = %device_key, "login failed: device offline");
            reject_login(&endpoint, LoginError::Offline);
            return;
        };
        let Some(slot) = device.slots.allocate() else {
            info!(user = %user_id, device = %device_key, "login failed: no free slot");
            reject_login(&endpoint, LoginError::Busy);
            return;
        };

        let session = SessionKey::new(device_key, slot);
        let sid = session.session_id();
        if device.endpoint.send(Frame::Login(LoginMessage { sid: sid.clone() })).is_err() {
            device.slots.release(slot);
            reject_login(&endpoint, LoginError::Offline);
            return;
        }

        let timer = self.confirmations.insert(session.clone(), self.confirm_timeout);
        deliver(&endpoint, UserOutbound::Control(ServerMsg::login_ok(&sid)));
        self.sessions.insert(session.clone(), user_id);
        self.users.insert(
            user_id,
            UserState {
                endpoint,
                session: Some(ActiveSession {
                    key: session.clone(),
                    confirm_timer: Some(timer),
                }),
            },
        );
        info!(user = %user_id, %session, "session opened");
    }

    fn on_user_input(&mut self, user_id: ConnId, input: UserInput) {
        let Some(active) = self.users.get(&user_id).and_then(|u| u.session.as_ref()) else {
            debug!(user = %user_id, "input without a session dropped");
            return;
        };
        let Some(device) = self.devices.get(&active.key.device) else {
            return;
        };

        let sid = active.key.session_id();
        let frame = match input {
            UserInput::Data { kind, data } => Frame::TermData(TermDataMessage { sid, kind, data }),
            UserInput::WindowSize { cols, rows } => Frame::WindowSize(WindowSizeMessage { sid, cols, rows }),
            UserInput::File { op, name, size } => Frame::File(FileMessage { sid, op, name, size }),
        };
        deliver(&device.endpoint, frame);
    }

    /// Explicit logout or a dropped browser connection.
    fn on_user_gone(&mut self, user_id: ConnId, reason: &str) {
        let session = self
            .users
            .get(&user_id)
            .and_then(|u| u.session.as_ref())
            .map(|s| s.key.clone());
        match session {
            Some(session) => self.end_session(&session, true, reason),
            None => {
                if let Some(user) = self.users.remove(&user_id) {
                    user.endpoint.close();
                }
            }
        }
    }

    fn on_confirmation_expired(&mut self, session: SessionKey, timer: delay_queue::Key) {
        let Some(active) = self.active_session_mut(&session) else {
            return;
        };
        if active.confirm_timer != Some(timer) {
            return;
        }
        active.confirm_timer = None;
        warn!(%session, "device did not confirm session");
        self.end_session(&session, true, "device did not confirm the session");
    }

    /// Tears one session down: frees the slot, optionally tells the device,
    /// and closes the browser with `reason`.
    fn end_session(&mut self, session: &SessionKey, notify_device: bool, reason: &str) {
        let Some(user_id) = self.sessions.remove(session) else {
            return;
        };
        if let Some(device) = self.devices.get_mut(&session.device) {
            device.slots.release(session.slot);
            if notify_device {
                deliver(
                    &device.endpoint,
                    Frame::Logout(LogoutMessage {
                        sid: session.session_id(),
                    }),
                );
            }
        }
        self.drop_user(user_id, reason);
        info!(%session, reason, "session closed");
    }

    fn drop_user(&mut self, user_id: ConnId, reason: &str) {
        let Some(user) = self.users.remove(&user_id) else {
            return;
        };
        if let Some(timer) = user.session.and_then(|s| s.confirm_timer) {
            self.confirmations.try_remove(&timer);
        }
        deliver(&user.endpoint, UserOutbound::Control(ServerMsg::logout(reason)));
        user.endpoint.close();
    }

    // ── Commands ──────────────────────────────────────────────────────────

    fn on_submit_command(
        &mut self,
        device: DeviceKey,
        payload: Bytes,
        reply: oneshot::Sender<Result<CommandToken, CommandError>>,
    ) {
        let Some(state) = self.devices.get(&device) else {
            let _ = reply.send(Err(CommandError::Offline));
            return;
        };
        let token = match self.commands.submit(device.clone()) {
            Ok(token) => token,
            Err(err) => {
                debug!(%device, %err, "command refused");
                let _ = reply.send(Err(err));
                return;
            }
        };

        let request = Frame::CommandRequest(CommandMessage {
            token: token.to_string(),
            payload,
        });
        if state.endpoint.send(request).is_err() {
            self.commands.cancel(&token);
            let _ = reply.send(Err(CommandError::Offline));
            return;
        }
        debug!(%device, %token, "command sent");
        let _ = reply.send(Ok(token));
    }

    // ── Helpers ───────────────────────────────────────────────────────────

    /// The open session a wire id names, as seen from `device`'s own link.
    fn session_on(&self, device: &DeviceKey, sid: &SessionId) -> Option<SessionKey> {
        let key = SessionKey::from_wire(device, sid)?;
        self.sessions.contains_key(&key).then_some(key)
    }

    fn user_of(&self, session: &SessionKey) -> Option<&UserState> {
        self.sessions.get(session).and_then(|id| self.users.get(id))
    }

    fn active_session_mut(&mut self, session: &SessionKey) -> Option<&mut ActiveSession> {
        let user_id = self.sessions.get(session)?;
        self.users
            .get_mut(user_id)?
            .session
            .as_mut()
            .filter(|active| active.key == *session)
    }

    fn snapshot(&self) -> BrokerSnapshot {
        let mut sessions: Vec<SessionKey> = self.sessions.keys().cloned().collect();
        sessions.sort_by_cached_key(|s| s.to_string());
        BrokerSnapshot {
            devices: self.devices.len(),
            users: self.users.len(),
            sessions,
            unconfirmed_sessions: self.confirmations.len(),
            pending_commands: self.commands.pending(),
        }
    }

    fn shut_down(&mut self) {
        for user_id in self.users.keys().copied().collect::<Vec<_>>() {
            self.drop_user(user_id, "server shutting down");
        }
        self.sessions.clear();

        for (key, state) in self.devices.drain() {
            deliver(
                &state.endpoint,
                Frame::Announce(AnnounceMessage {
                    code: AnnounceCode::Shutdown,
                    reason: "server shutting down".to_string(),
                }),
            );
            self.registry.remove(&key, state.endpoint.conn_id());
            state.endpoint.close();
            self.commands.device_gone(&key);
            self.tunnels.device_gone(&key);
        }
    }
}

fn deliver<E: Endpoint>(endpoint: &E, msg: E::Outbound) {
    if let Err(err) = endpoint.send(msg) {
        debug!(conn = %endpoint.conn_id(), device = endpoint.is_device(), %err, "message not delivered");
    }
}

fn reject_login(endpoint: &UserEndpoint, err: LoginError) {
    deliver(endpoint, UserOutbound::Control(ServerMsg::login_failed(err)));
    endpoint.close();
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')
}

/// Device ids and group names: short, printable, no separators.
fn validate_device_key(key: &DeviceKey) -> Result<(), String> {
    if key.id.is_empty() {
        return Err("device id is empty".to_string());
    }
    for (what, value) in [("device id", &key.id), ("group", &key.group)] {
        if value.len() > MAX_NAME_LEN {
            return Err(format!("{what} is longer than {MAX_NAME_LEN} bytes"));
        }
        if let Some(bad) = value.chars().find(|c| !is_name_char(*c)) {
            return Err(format!("{what} contains {bad:?}"));
        }
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
