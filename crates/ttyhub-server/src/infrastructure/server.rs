//! Listener wiring: binds the three sockets and runs the hub's tasks.
//!
//! ```text
//!            ┌──────────────── Hub ────────────────┐
//!  devices ──► device listener ──► handle_device ─┐ │
//!  browsers ─► user listener   ──► handle_user   ─┼─► Broker (one task)
//!  proxy ────► proxy listener  ──► handle_proxy ──► TunnelMux
//!            │  affinity sweeper                   │
//!            └─────────────────────────────────────┘
//! ```
//!
//! Every accepted connection runs in its own task, so one slow peer never
//! delays the accept loop.  [`Hub::shutdown`] cancels one token that every
//! loop selects on.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::application::auth::{DeviceAuthenticator, SharedTokenAuthenticator};
use crate::application::broker::{Broker, BrokerHandle};
use crate::application::cache::SweeperHandle;
use crate::application::registry::DeviceRegistry;
use crate::application::tunnel::TunnelMux;
use crate::domain::ServerConfig;
use crate::infrastructure::device_conn::{handle_device, DeviceContext};
use crate::infrastructure::proxy::handle_proxy;
use crate::infrastructure::user_conn::{handle_user, UserContext};

/// A running hub.
pub struct Hub {
    broker: BrokerHandle,
    registry: Arc<DeviceRegistry>,
    tunnels: Arc<TunnelMux>,
    device_addr: SocketAddr,
    user_addr: SocketAddr,
    proxy_addr: SocketAddr,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    sweeper: SweeperHandle,
}

impl Hub {
    /// Binds all listeners and starts serving, accepting devices that pass
    /// the configured shared token.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid or a listener cannot be bound.
    pub async fn start(config: ServerConfig) -> anyhow::Result<Self> {
        let auth = Arc::new(SharedTokenAuthenticator::new(config.device_token.clone()));
        Self::start_with_auth(config, auth).await
    }

    /// Like [`Hub::start`] with a custom device authenticator.
    pub async fn start_with_auth(
        config: ServerConfig,
        auth: Arc<dyn DeviceAuthenticator>,
    ) -> anyhow::Result<Self> {
        config.validate().context("invalid configuration")?;

        // ── Step 1: Bind ──────────────────────────────────────────────────────
        let device_listener = bind(config.device_bind_addr, "device").await?;
        let user_listener = bind(config.user_bind_addr, "browser").await?;
        let proxy_listener = bind(config.proxy_bind_addr, "proxy").await?;
        let device_addr = device_listener.local_addr()?;
        let user_addr = user_listener.local_addr()?;
        let proxy_addr = proxy_listener.local_addr()?;

        let location = config.proxy_redirect_location(proxy_addr);

        // ── Step 2: Shared state and the broker ───────────────────────────────
        let registry = Arc::new(DeviceRegistry::new());
        let tunnels = Arc::new(TunnelMux::new(
            Arc::clone(&registry),
            config.proxy_session_ttl(),
            config.circuit_queue_capacity,
            location,
        ));
        let (broker, handle) = Broker::new(&config, Arc::clone(&registry), Arc::clone(&tunnels));
        let sweeper = tunnels
            .affinity_cache()
            .spawn_sweeper(config.cache_sweep_interval());

        let shutdown = CancellationToken::new();
        let config = Arc::new(config);
        let mut tasks = vec![tokio::spawn(broker.run(shutdown.clone()))];

        // ── Step 3: Accept loops ──────────────────────────────────────────────
        let device_ctx = DeviceContext {
            config: Arc::clone(&config),
            broker: handle.clone(),
            registry: Arc::clone(&registry),
            tunnels: Arc::clone(&tunnels),
            auth,
        };
        tasks.push(tokio::spawn(accept_loop(
            device_listener,
            "device",
            shutdown.clone(),
            move |stream, peer| handle_device(stream, peer, device_ctx.clone()),
        )));

        let user_ctx = UserContext {
            config: Arc::clone(&config),
            broker: handle.clone(),
        };
        tasks.push(tokio::spawn(accept_loop(
            user_listener,
            "browser",
            shutdown.clone(),
            move |stream, peer| handle_user(stream, peer, user_ctx.clone()),
        )));

        let proxy_tunnels = Arc::clone(&tunnels);
        tasks.push(tokio::spawn(accept_loop(
            proxy_listener,
            "proxy",
            shutdown.clone(),
            move |stream, peer| handle_proxy(stream, peer, Arc::clone(&proxy_tunnels)),
        )));

        info!(%device_addr, %user_addr, %proxy_addr, "hub started");
        Ok(Self {
            broker: handle,
            registry,
            tunnels,
            device_addr,
            user_addr,
            proxy_addr,
            shutdown,
            tasks,
            sweeper,
        })
    }

    pub fn broker(&self) -> &BrokerHandle {
        &self.broker
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn tunnels(&self) -> &Arc<TunnelMux> {
        &self.tunnels
    }

    pub fn device_addr(&self) -> SocketAddr {
        self.device_addr
    }

    pub fn user_addr(&self) -> SocketAddr {
        self.user_addr
    }

    pub fn proxy_addr(&self) -> SocketAddr {
        self.proxy_addr
    }

    /// A token that fires when the hub stops.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops accepting, tells every device and browser the hub is going
    /// away, and waits for the broker and listeners to finish.
    pub async fn shutdown(self) {
        info!("hub shutting down");
        self.shutdown.cancel();
        self.sweeper.shutdown().await;
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("hub task failed: {e}");
            }
        }
        info!("hub stopped");
    }
}

async fn bind(addr: SocketAddr, role: &str) -> anyhow::Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {role} listener on {addr}"))?;
    info!("{role} listener on {}", listener.local_addr()?);
    Ok(listener)
}

async fn accept_loop<F, Fut>(listener: TcpListener, role: &'static str, shutdown: CancellationToken, handler: F)
where
    F: Fn(TcpStream, SocketAddr) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    tokio::spawn(handler(stream, peer));
                }
                // Transient (e.g. out of file descriptors); keep serving.
                Err(e) => error!("{role} accept error: {e}"),
            },
        }
    }
    info!("{role} listener stopped");
}
