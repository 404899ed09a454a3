//! Infrastructure layer for ttyhub-server.
//!
//! Everything that touches a socket:
//!
//! - [`framed`] – buffered frame reading/writing on the device link.
//! - [`device_conn`] – one device connection: register, keepalive, routing.
//! - [`user_conn`] – one browser WebSocket: login, terminal I/O.
//! - [`proxy`] – one tunnelled HTTP connection.
//! - [`server`] – the three listeners and the [`Hub`] that owns them.
//!
//! # What does NOT belong here?
//!
//! - Session, command and circuit bookkeeping (application layer).
//! - Message and configuration types (domain layer).

pub mod device_conn;
pub mod framed;
pub mod proxy;
pub mod server;
pub mod user_conn;

pub use server::Hub;
