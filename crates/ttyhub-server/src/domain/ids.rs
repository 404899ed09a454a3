//! Identity types used as map keys across the broker.

use std::fmt;

use ttyhub_core::{SessionId, Slot};
use uuid::Uuid;

/// A device is unique by id *within* its group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    pub group: String,
    pub id: String,
}

impl DeviceKey {
    pub fn new(group: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.id)
        } else {
            write!(f, "{}/{}", self.group, self.id)
        }
    }
}

/// One terminal session: a slot on a specific device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub device: DeviceKey,
    pub slot: Slot,
}

impl SessionKey {
    pub fn new(device: DeviceKey, slot: Slot) -> Self {
        Self { device, slot }
    }

    /// Resolves a wire session id that arrived on `device`'s own link.
    ///
    /// Returns `None` when the id names a different device; a device can
    /// only address its own sessions.
    pub fn from_wire(device: &DeviceKey, sid: &SessionId) -> Option<Self> {
        (sid.device_id() == device.id).then(|| Self::new(device.clone(), sid.slot()))
    }

    pub fn session_id(&self) -> SessionId {
        SessionId::new(self.device.id.clone(), self.slot)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.device, self.slot)
    }
}

/// Identity of one accepted connection (device or browser).
///
/// A device that reconnects under the same id gets a new `ConnId`, which is
/// how late events from the old connection are told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(Uuid);

impl ConnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The first 8 hex digits are plenty to follow a connection in logs.
        let simple = self.0.simple().to_string();
        f.write_str(&simple[..8])
    }
}
