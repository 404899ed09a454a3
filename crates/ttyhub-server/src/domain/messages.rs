//! JSON message types for the browser-facing WebSocket.
//!
//! Terminal bytes travel as binary WebSocket frames (`[kind:1][bytes]`).
//! Everything else is a small JSON object in a text frame, discriminated by
//! its `"type"` field:
//!
//! ```text
//! Browser → Server:  {"type":"login","devid":"gw-01","group":"lab"}
//!                    {"type":"winsize","cols":120,"rows":40}
//!                    {"type":"file","op":1}
//!                    {"type":"logout"}
//! Server  → Browser: {"type":"login","sid":"gw-013","err":0}
//!                    {"type":"login","err":1}
//!                    {"type":"logout","reason":"device offline"}
//! ```

use serde::{Deserialize, Serialize};
use ttyhub_core::SessionId;

/// Numeric failure codes in a login reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoginError {
    /// No device with that id is connected.
    Offline = 1,
    /// Every session slot on the device is taken.
    Busy = 2,
    /// The browser did not send its login in time.
    Timeout = 3,
    /// The login request itself was unusable.
    Invalid = 4,
}

/// All messages a browser can send as text frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BrowserMsg {
    /// Must be the first message on a new connection.
    Login {
        devid: String,
        #[serde(default)]
        group: String,
    },

    Winsize { cols: u16, rows: u16 },

    /// File-transfer control, relayed to the device unchanged.
    File {
        op: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<u32>,
    },

    Logout,
}

/// All messages the server sends as text frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMsg {
    /// `err == 0` means success and `sid` is present.
    Login {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sid: Option<String>,
        err: u8,
    },

    /// Sent right before the server closes the connection.
    Logout { reason: String },

    File {
        op: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<u32>,
    },
}

impl ServerMsg {
    pub fn login_ok(sid: &SessionId) -> Self {
        ServerMsg::Login {
            sid: Some(sid.to_wire()),
            err: 0,
        }
    }

    pub fn login_failed(err: LoginError) -> Self {
        ServerMsg::Login {
            sid: None,
            err: err as u8,
        }
    }

    pub fn logout(reason: impl Into<String>) -> Self {
        ServerMsg::Logout {
            reason: reason.into(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
