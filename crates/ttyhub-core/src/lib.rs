//! # ttyhub-core
//!
//! Shared library for the ttyhub reverse-tunnel broker containing the device
//! link wire protocol and the small addressing types that ride inside it.
//!
//! It has zero dependencies on sockets, async runtimes, or the broker's
//! state.  Both the server and any device-side agent written in Rust can use
//! it to speak the same bytes.
//!
//! # Architecture overview (for beginners)
//!
//! A ttyhub device (a router, a sensor gateway, any embedded box) cannot be
//! reached directly from the internet.  Instead it dials *out* to the broker
//! and keeps that single TCP connection open.  Everything the broker wants
//! from the device (terminal sessions, remote commands, tunnelled HTTP) is
//! multiplexed over that one link.
//!
//! This crate defines:
//!
//! - **`protocol`** – How bytes travel over the device link.  Control
//!   messages use a self-describing tag-length-value body; the two hot paths
//!   (terminal bytes and tunnelled web bytes) use a raw body with a tiny
//!   fixed prefix instead.
//!
//! - **`domain`** – The compact identifiers carried in frames: the terminal
//!   [`SessionId`] (device id + slot digit) and the 6-byte
//!   [`AddrDescriptor`] used to address tunnel circuits.

pub mod domain;
pub mod protocol;

pub use domain::addr::{AddrDescriptor, AddrError};
pub use domain::session_id::{SessionId, SessionIdError, Slot, MAX_SLOTS};
pub use protocol::codec::{decode_frame, encode_frame, frame_len, ProtocolError};
pub use protocol::messages::Frame;
