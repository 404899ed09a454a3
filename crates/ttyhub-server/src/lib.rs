//! ttyhub-server library crate.
//!
//! A reverse-tunnel broker.  Devices that can only dial out keep one TCP link
//! open to the hub; browsers reach a device's terminal and its local network
//! through that link.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! Devices (binary frames over TCP)     Browsers (WebSocket + raw HTTP)
//!         ↕                                      ↕
//! [ttyhub-server]
//!   ├── domain/           Pure types: ServerConfig, browser JSON, keys, slots
//!   ├── application/      Broker actor, registry, commands, tunnels, cache
//!   └── infrastructure/
//!         ├── device_conn/ Device link handler (ttyhub-core codec)
//!         ├── user_conn/   Browser WebSocket handler (tokio-tungstenite)
//!         ├── proxy/       Tunnelled HTTP listener
//!         └── server/      Listener wiring (Hub)
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no I/O and no async runtime.
//! - `application` owns all shared state; it talks to connections only
//!   through bounded endpoint queues.
//! - `infrastructure` depends on both and is the only layer with sockets.
//!
//! # For beginners: who owns what?
//!
//! Session slots, user bindings and pending commands belong to one task, the
//! [`application::Broker`].  Connection tasks never touch that state; they
//! send events through a [`application::BrokerHandle`] and receive outbound
//! messages on their endpoint queue.  The device directory and the tunnel
//! circuit table live in concurrent maps instead, because they are read on
//! every proxied packet and every device listing.

/// Domain layer: configuration, message and identity types.
pub mod domain;

/// Application layer: the broker and the state it coordinates.
pub mod application;

/// Infrastructure layer: connection handlers and listeners.
pub mod infrastructure;
