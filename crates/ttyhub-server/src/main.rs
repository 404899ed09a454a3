//! ttyhub: reverse-tunnel broker entry point.
//!
//! # Usage
//!
//! ```text
//! ttyhub [OPTIONS]
//!
//! Options:
//!   -c, --config       <FILE>  TOML configuration file
//!       --bind         <IP>    Address all three listeners bind to
//!       --device-port  <PORT>  Device listener port      [default: 5912]
//!       --user-port    <PORT>  Browser WebSocket port    [default: 5913]
//!       --proxy-port   <PORT>  HTTP tunnel proxy port    [default: 5914]
//!       --token        <TOKEN> Shared device token
//!       --proxy-url    <URL>   Public URL of the proxy listener
//! ```
//!
//! # Precedence
//!
//! Built-in defaults, then the TOML file, then environment variables and
//! flags (a flag wins over its environment variable).
//!
//! | Variable             | Flag             |
//! |----------------------|------------------|
//! | `TTYHUB_CONFIG`      | `--config`       |
//! | `TTYHUB_BIND`        | `--bind`         |
//! | `TTYHUB_DEVICE_PORT` | `--device-port`  |
//! | `TTYHUB_USER_PORT`   | `--user-port`    |
//! | `TTYHUB_PROXY_PORT`  | `--proxy-port`   |
//! | `TTYHUB_TOKEN`       | `--token`        |
//! | `TTYHUB_PROXY_URL`   | `--proxy-url`    |

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ttyhub_server::domain::ServerConfig;
use ttyhub_server::infrastructure::Hub;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Reverse-tunnel broker for terminals and HTTP on outbound-only devices.
#[derive(Debug, Parser)]
#[command(name = "ttyhub", version)]
struct Cli {
    /// TOML configuration file.  Missing keys take their defaults.
    #[arg(short, long, env = "TTYHUB_CONFIG")]
    config: Option<PathBuf>,

    /// IP address all three listeners bind to.
    #[arg(long, env = "TTYHUB_BIND")]
    bind: Option<IpAddr>,

    #[arg(long, env = "TTYHUB_DEVICE_PORT")]
    device_port: Option<u16>,

    #[arg(long, env = "TTYHUB_USER_PORT")]
    user_port: Option<u16>,

    #[arg(long, env = "TTYHUB_PROXY_PORT")]
    proxy_port: Option<u16>,

    /// Shared secret devices must present when registering.
    #[arg(long, env = "TTYHUB_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// URL browsers are redirected to for tunnelled HTTP.
    #[arg(long, env = "TTYHUB_PROXY_URL")]
    proxy_url: Option<String>,
}

impl Cli {
    /// Builds the effective [`ServerConfig`].
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read or parsed, or if
    /// the merged configuration is invalid.
    fn into_server_config(self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("cannot read config file {}", path.display()))?;
                ServerConfig::from_toml_str(&text)
                    .with_context(|| format!("invalid config file {}", path.display()))?
            }
            None => ServerConfig::default(),
        };

        if let Some(ip) = self.bind {
            config.device_bind_addr.set_ip(ip);
            config.user_bind_addr.set_ip(ip);
            config.proxy_bind_addr.set_ip(ip);
        }
        override_port(&mut config.device_bind_addr, self.device_port);
        override_port(&mut config.user_bind_addr, self.user_port);
        override_port(&mut config.proxy_bind_addr, self.proxy_port);
        if self.token.is_some() {
            config.device_token = self.token;
        }
        if self.proxy_url.is_some() {
            config.proxy_public_url = self.proxy_url;
        }

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

fn override_port(addr: &mut SocketAddr, port: Option<u16>) {
    if let Some(port) = port {
        addr.set_port(port);
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Logging setup ─────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Cli::parse().into_server_config()?;
    info!(
        "ttyhub starting: devices={}, browsers={}, proxy={}",
        config.device_bind_addr, config.user_bind_addr, config.proxy_bind_addr
    );

    let hub = Hub::start(config).await?;

    // ── Run until Ctrl+C ──────────────────────────────────────────────────────
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl+C, shutting down"),
        Err(e) => tracing::error!("failed to listen for Ctrl+C signal: {e}"),
    }
    hub.shutdown().await;

    info!("ttyhub stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_produce_default_config() {
        // Arrange: parse with no arguments (all defaults apply)
        let cli = Cli::parse_from(["ttyhub"]);

        // Act
        let config = cli.into_server_config().unwrap();

        // Assert
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn test_bind_and_ports_override_listeners() {
        let cli = Cli::parse_from([
            "ttyhub",
            "--bind",
            "127.0.0.1",
            "--device-port",
            "7000",
            "--proxy-port",
            "7002",
        ]);

        let config = cli.into_server_config().unwrap();

        assert_eq!(config.device_bind_addr, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(config.user_bind_addr, "127.0.0.1:5913".parse().unwrap());
        assert_eq!(config.proxy_bind_addr, "127.0.0.1:7002".parse().unwrap());
    }

    #[test]
    fn test_token_flag_sets_device_token() {
        let cli = Cli::parse_from(["ttyhub", "--token", "s3cret"]);

        let config = cli.into_server_config().unwrap();

        assert_eq!(config.device_token.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_bad_proxy_url_is_rejected() {
        let cli = Cli::parse_from(["ttyhub", "--proxy-url", "proxy.example.net"]);

        assert!(cli.into_server_config().is_err());
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let cli = Cli::parse_from(["ttyhub", "--config", "/nonexistent/ttyhub.toml"]);

        let err = cli.into_server_config().unwrap_err();

        assert!(format!("{err:#}").contains("cannot read config file"));
    }

    #[test]
    fn test_invalid_bind_address_fails_to_parse() {
        assert!(Cli::try_parse_from(["ttyhub", "--bind", "not-an-ip"]).is_err());
    }
}
