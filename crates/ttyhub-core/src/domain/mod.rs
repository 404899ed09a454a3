//! Addressing types carried inside device link frames.
//!
//! Nothing here touches I/O.  Both types keep a compact wire form for
//! compatibility with small C agents on the device side, but callers work
//! with the structured form as soon as bytes are parsed.

pub mod addr;
pub mod session_id;

pub use addr::{AddrDescriptor, AddrError};
pub use session_id::{SessionId, SessionIdError, Slot, MAX_SLOTS};
