//! Correlation table for remote commands.
//!
//! A caller submits a command for a device and gets back an opaque token.
//! The device answers later with a `CommandResponse` carrying that token.
//! The result is then either handed to a waiting caller or kept until it is
//! collected with [`CommandTable::poll`].
//!
//! Every command lives for at most `timeout` while pending.  An unanswered
//! command fails with [`CommandError::Timeout`]; a device disconnect fails
//! its commands with [`CommandError::Offline`].  A resolved result nobody
//! collects is dropped after one more `timeout`.
//!
//! The table is owned by the broker loop, which drives
//! [`CommandTable::next_expired`] from its `select!`.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::debug;
use uuid::Uuid;

use crate::domain::DeviceKey;

/// Why a command produced no output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unknown or already collected command token")]
    InvalidToken,

    #[error("device is offline")]
    Offline,

    #[error("device did not answer in time")]
    Timeout,

    #[error("too many commands pending for this device")]
    Busy,
}

impl CommandError {
    /// Stable numeric code for API consumers.
    pub fn code(self) -> u16 {
        match self {
            CommandError::InvalidToken => 1001,
            CommandError::Offline => 1002,
            CommandError::Timeout => 1003,
            CommandError::Busy => 1004,
        }
    }
}

pub type CommandResult = Result<Bytes, CommandError>;

/// Outcome of a non-blocking status check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandPoll {
    Pending,
    Ready(Bytes),
    Failed(CommandError),
}

/// Opaque correlation token (32 hex digits).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommandToken(String);

impl CommandToken {
    fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CommandToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
enum CommandState {
    Pending,
    Resolved(CommandResult),
}

#[derive(Debug)]
struct CommandEntry {
    device: DeviceKey,
    state: CommandState,
    timer: delay_queue::Key,
    waiter: Option<oneshot::Sender<CommandResult>>,
}

#[derive(Debug)]
pub struct CommandTable {
    entries: HashMap<String, CommandEntry>,
    pending_by_device: HashMap<DeviceKey, HashSet<String>>,
    timers: DelayQueue<String>,
    timeout: Duration,
    per_device_limit: usize,
}

impl CommandTable {
    pub fn new(timeout: Duration, per_device_limit: usize) -> Self {
        Self {
            entries: HashMap::new(),
            pending_by_device: HashMap::new(),
            timers: DelayQueue::new(),
            timeout,
            per_device_limit: per_device_limit.max(1),
        }
    }

    /// Opens a pending command for `device` and returns its token.
    pub fn submit(&mut self, device: DeviceKey) -> Result<CommandToken, CommandError> {
        let in_flight = self.pending_by_device.get(&device).map_or(0, HashSet::len);
        if in_flight >= self.per_device_limit {
            return Err(CommandError::Busy);
        }

        let token = CommandToken::generate();
        let timer = self.timers.insert(token.0.clone(), self.timeout);
        self.pending_by_device
            .entry(device.clone())
            .or_default()
            .insert(token.0.clone());
        self.entries.insert(
            token.0.clone(),
            CommandEntry {
                device,
                state: CommandState::Pending,
                timer,
                waiter: None,
            },
        );
        Ok(token)
    }

    /// Drops a command that could not be delivered to its device.
    pub fn cancel(&mut self, token: &CommandToken) {
        if let Some(entry) = self.entries.remove(token.as_str()) {
            self.timers.try_remove(&entry.timer);
            self.forget_pending(&entry.device, token.as_str());
        }
    }

    /// Stores the device's answer.
    ///
    /// Returns `false` when the token is unknown, already resolved, or owned
    /// by a different device; such responses are dropped.
    pub fn resolve(&mut self, device: &DeviceKey, token: &str, output: Bytes) -> bool {
        match self.entries.get(token) {
            Some(entry) if entry.device == *device && matches!(entry.state, CommandState::Pending) => {}
            _ => return false,
        }
        self.settle(token, Ok(output), false);
        true
    }

    pub fn poll(&mut self, token: &str) -> CommandPoll {
        let Some(entry) = self.entries.get(token) else {
            return CommandPoll::Failed(CommandError::InvalidToken);
        };
        if matches!(entry.state, CommandState::Pending) {
            return CommandPoll::Pending;
        }

        let Some(entry) = self.entries.remove(token) else {
            return CommandPoll::Failed(CommandError::InvalidToken);
        };
        self.timers.try_remove(&entry.timer);
        match entry.state {
            CommandState::Resolved(Ok(output)) => CommandPoll::Ready(output),
            CommandState::Resolved(Err(err)) => CommandPoll::Failed(err),
            CommandState::Pending => CommandPoll::Pending,
        }
    }

    /// Registers `waiter` to receive the result.
    ///
    /// A result that is already in is delivered at once.  Only one waiter
    /// per command; a second one is told the token is invalid.
    pub fn wait(&mut self, token: &str, waiter: oneshot::Sender<CommandResult>) {
        let Some(entry) = self.entries.get_mut(token) else {
            let _ = waiter.send(Err(CommandError::InvalidToken));
            return;
        };

        if matches!(entry.state, CommandState::Pending) {
            if entry.waiter.as_ref().is_some_and(|w| !w.is_closed()) {
                let _ = waiter.send(Err(CommandError::InvalidToken));
            } else {
                entry.waiter = Some(waiter);
            }
            return;
        }

        if let Some(entry) = self.entries.remove(token) {
            self.timers.try_remove(&entry.timer);
            if let CommandState::Resolved(result) = entry.state {
                let _ = waiter.send(result);
            }
        }
    }

    /// Fails every pending command of `device` as offline.
    pub fn device_gone(&mut self, device: &DeviceKey) -> usize {
        let Some(tokens) = self.pending_by_device.remove(device) else {
            return 0;
        };
        let count = tokens.len();
        for token in tokens {
            self.settle(&token, Err(CommandError::Offline), false);
        }
        count
    }

    /// Waits for the next command timer to fire.
    ///
    /// Returns `None` immediately when no timers are armed; callers guard
    /// with [`CommandTable::has_timers`].
    pub async fn next_expired(&mut self) -> Option<String> {
        self.timers.next().await.map(|expired| expired.into_inner())
    }

    pub fn has_timers(&self) -> bool {
        !self.timers.is_empty()
    }

    /// Handles a fired timer: a pending command times out, an uncollected
    /// result is discarded.
    pub fn expire(&mut self, token: &str) {
        let pending = match self.entries.get(token) {
            Some(entry) => matches!(entry.state, CommandState::Pending),
            None => return,
        };
        if pending {
            debug!(token, "command timed out");
            self.settle(token, Err(CommandError::Timeout), true);
        } else {
            debug!(token, "discarding uncollected command result");
            self.entries.remove(token);
        }
    }

    /// Commands not yet answered.
    pub fn pending(&self) -> usize {
        self.pending_by_device.values().map(HashSet::len).sum()
    }

    /// All tracked commands, answered or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn forget_pending(&mut self, device: &DeviceKey, token: &str) {
        if let Some(tokens) = self.pending_by_device.get_mut(device) {
            tokens.remove(token);
            if tokens.is_empty() {
                self.pending_by_device.remove(device);
            }
        }
    }

    /// Moves a pending command to its final result.  `timer_fired` is set
    /// when the entry's own timer has already been consumed.
    fn settle(&mut self, token: &str, result: CommandResult, timer_fired: bool) {
        let Some(entry) = self.entries.get_mut(token) else {
            return;
        };
        let device = entry.device.clone();
        if !timer_fired {
            self.timers.try_remove(&entry.timer);
        }

        let undelivered = match entry.waiter.take() {
            Some(waiter) => waiter.send(result).err(),
            None => Some(result),
        };

        match undelivered {
            None => {
                self.entries.remove(token);
            }
            Some(result) => {
                entry.state = CommandState::Resolved(result);
                entry.timer = self.timers.insert(token.to_string(), self.timeout);
            }
        }
        self.forget_pending(&device, token);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
