//! Application layer for ttyhub-server.
//!
//! The state and rules of the hub, with no socket code:
//!
//! - [`broker`] – the single-owner actor for devices, sessions and commands.
//! - [`registry`] – the concurrently readable device directory.
//! - [`commands`] – token correlation for remote commands.
//! - [`tunnel`] – web tunnel circuits and proxy session affinity.
//! - [`cache`] – the expiring key/value store behind proxy affinity.
//! - [`endpoint`] – the bounded queues the broker writes to.
//! - [`auth`] – device admission.

pub mod auth;
pub mod broker;
pub mod cache;
pub mod commands;
pub mod endpoint;
pub mod registry;
pub mod tunnel;

pub use auth::{DeviceAuthenticator, SharedTokenAuthenticator};
pub use broker::{
    Broker, BrokerEvent, BrokerHandle, BrokerSnapshot, DeviceRegistration, DispatchError,
    RegisterRejection, UserInput,
};
pub use cache::{ExpiringCache, SweeperHandle};
pub use commands::{CommandError, CommandPoll, CommandResult, CommandTable, CommandToken};
pub use endpoint::{
    ConnectionEndpoint, DeviceEndpoint, Endpoint, EndpointError, OutboundQueue, UserEndpoint,
    UserOutbound,
};
pub use registry::{DeviceRecord, DeviceRegistry, DeviceSummary, GroupListing, RegistryError};
pub use tunnel::{
    Circuit, CircuitKey, ProxyAffinity, ProxyCookie, ProxyCookies, ProxyRedirect, TunnelError,
    TunnelMux,
};
