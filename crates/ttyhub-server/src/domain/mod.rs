//! Domain layer for ttyhub-server.
//!
//! Pure types with no dependencies on I/O, sockets, or the async runtime:
//! configuration, the browser JSON messages, identity keys, and the
//! per-device slot table.

pub mod config;
pub mod ids;
pub mod messages;
pub mod slots;

pub use config::{ConfigError, ServerConfig};
pub use ids::{ConnId, DeviceKey, SessionKey};
pub use messages::{BrowserMsg, LoginError, ServerMsg};
pub use slots::SlotTable;
