//! Terminal session identifiers.
//!
//! On the wire a session id is the device id with a single slot digit
//! appended: device `gw-17`, slot 3 is `gw-173`.  Routing only needs the last
//! character, so the broker can find the slot in O(1).
//!
//! The packed string is a wire format only.  [`SessionId::parse`] splits it
//! into a `(device_id, slot)` pair immediately and the rest of the system
//! never does character arithmetic on it again.

use std::fmt;

use thiserror::Error;

/// Number of distinct slot digits (`0`–`9`).
pub const MAX_SLOTS: usize = 10;

/// A per-device terminal slot number in `0..MAX_SLOTS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Slot(u8);

impl Slot {
    /// Creates a slot, returning `None` when `index` is not a single digit.
    pub fn new(index: u8) -> Option<Self> {
        ((index as usize) < MAX_SLOTS).then_some(Self(index))
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    fn as_digit(self) -> char {
        char::from(b'0' + self.0)
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors produced when a packed session id cannot be split.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionIdError {
    #[error("session id is empty")]
    Empty,

    #[error("session id '{0}' does not end in a slot digit")]
    MissingSlot(String),

    #[error("session id '{0}' has no device id before the slot digit")]
    MissingDevice(String),
}

/// Structured terminal session id: which device, which slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId {
    device_id: String,
    slot: Slot,
}

impl SessionId {
    pub fn new(device_id: impl Into<String>, slot: Slot) -> Self {
        Self {
            device_id: device_id.into(),
            slot,
        }
    }

    /// Splits a packed wire id into device id and slot.
    ///
    /// # Errors
    ///
    /// Returns [`SessionIdError`] when the string is empty, does not end in an
    /// ASCII digit, or is nothing but the digit.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use ttyhub_core::{SessionId, Slot};
    ///
    /// let sid = SessionId::parse("gw-173").unwrap();
    /// assert_eq!(sid.device_id(), "gw-17");
    /// assert_eq!(sid.slot(), Slot::new(3).unwrap());
    /// assert_eq!(sid.to_wire(), "gw-173");
    /// ```
    pub fn parse(wire: &str) -> Result<Self, SessionIdError> {
        let last = wire.chars().last().ok_or(SessionIdError::Empty)?;
        let digit = last
            .to_digit(10)
            .ok_or_else(|| SessionIdError::MissingSlot(wire.to_string()))?;
        // A decimal digit is always one byte, so this slice is on a char boundary.
        let device_id = &wire[..wire.len() - 1];
        if device_id.is_empty() {
            return Err(SessionIdError::MissingDevice(wire.to_string()));
        }
        let slot = Slot::new(digit as u8).ok_or_else(|| SessionIdError::MissingSlot(wire.to_string()))?;
        Ok(Self::new(device_id, slot))
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    /// Returns the packed form: device id followed by the slot digit.
    pub fn to_wire(&self) -> String {
        let mut wire = String::with_capacity(self.device_id.len() + 1);
        wire.push_str(&self.device_id);
        wire.push(self.slot.as_digit());
        wire
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.device_id, self.slot)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
