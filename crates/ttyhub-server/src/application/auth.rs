//! Device admission.

use async_trait::async_trait;
use ttyhub_core::protocol::messages::RegisterMessage;

/// Decides whether a registering device may join.
///
/// Called once per device connection, before the broker sees the device.
/// Implementations may do I/O (look a token up in a database, call an
/// identity service); they run on the connection's own task.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceAuthenticator: Send + Sync {
    async fn authenticate(&self, registration: &RegisterMessage) -> bool;
}

/// Accepts devices that present the one configured shared token.
///
/// With no token configured every device is accepted.
#[derive(Debug, Clone, Default)]
pub struct SharedTokenAuthenticator {
    token: Option<String>,
}

impl SharedTokenAuthenticator {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.is_empty()),
        }
    }
}

#[async_trait]
impl DeviceAuthenticator for SharedTokenAuthenticator {
    async fn authenticate(&self, registration: &RegisterMessage) -> bool {
        match &self.token {
            None => true,
            Some(expected) => registration.token.as_deref() == Some(expected.as_str()),
        }
    }
}
