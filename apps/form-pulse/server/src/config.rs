use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{ensure, Context};
use clap::Parser;

use crate::gateway::GatewayConfig;
use crate::retry::RetryPolicy;

#[derive(Debug, Parser)]
#[command(
    name = "form-pulse-server",
    author,
    version,
    about = "Real-time form analytics over WebSocket"
)]
pub struct Cli {
    /// Address to bind the HTTP and websocket listener to.
    #[arg(long, env = "FORM_PULSE_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Redis connection URI for the durable metrics store.
    #[arg(
        long,
        env = "FORM_PULSE_REDIS_URL",
        default_value = "redis://127.0.0.1:6379"
    )]
    pub redis_url: String,

    /// Keep metrics in process memory instead of Redis (development only).
    #[arg(long, env = "FORM_PULSE_IN_MEMORY_STORE", default_value_t = false)]
    pub in_memory_store: bool,

    /// Total attempts per store call, including the first.
    #[arg(long, env = "FORM_PULSE_STORE_MAX_ATTEMPTS", default_value_t = 4)]
    pub store_max_attempts: u32,

    #[arg(long, env = "FORM_PULSE_STORE_BACKOFF_BASE_MS", default_value_t = 50)]
    pub store_backoff_base_ms: u64,

    #[arg(long, env = "FORM_PULSE_STORE_BACKOFF_MAX_MS", default_value_t = 1000)]
    pub store_backoff_max_ms: u64,

    /// Outbound events buffered per connection before broadcasts are dropped.
    #[arg(long, env = "FORM_PULSE_OUTBOUND_BUFFER", default_value_t = 64)]
    pub outbound_buffer: usize,

    /// Grace period applied during shutdown.
    #[arg(long, env = "FORM_PULSE_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Redis { url: String },
    Memory,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub store: StoreBackend,
    pub retry: RetryPolicy,
    pub gateway: GatewayConfig,
    pub shutdown_grace: Duration,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        ensure!(
            cli.store_max_attempts >= 1,
            "store max attempts must be at least 1"
        );
        ensure!(cli.outbound_buffer >= 1, "outbound buffer must be at least 1");
        ensure!(
            cli.store_backoff_base_ms <= cli.store_backoff_max_ms,
            "store backoff base ({}ms) exceeds its cap ({}ms)",
            cli.store_backoff_base_ms,
            cli.store_backoff_max_ms
        );

        let store = if cli.in_memory_store {
            StoreBackend::Memory
        } else {
            StoreBackend::Redis { url: cli.redis_url }
        };
        Ok(ServerConfig {
            listen_addr,
            store,
            retry: RetryPolicy {
                base_delay: Duration::from_millis(cli.store_backoff_base_ms),
                max_delay: Duration::from_millis(cli.store_backoff_max_ms),
                max_attempts: cli.store_max_attempts,
            },
            gateway: GatewayConfig {
                outbound_buffer: cli.outbound_buffer,
            },
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<ServerConfig> {
        let mut argv = vec!["form-pulse-server"];
        argv.extend_from_slice(args);
        ServerConfig::try_from(Cli::try_parse_from(argv)?)
    }

    #[test]
    fn memory_store_switch_selects_backend() {
        let config = parse(&["--in-memory-store", "--listen-addr", "127.0.0.1:9000"]).unwrap();
        assert_eq!(config.store, StoreBackend::Memory);
        assert_eq!(config.listen_addr.port(), 9000);
    }

    #[test]
    fn retry_settings_flow_into_policy() {
        let config = parse(&[
            "--store-max-attempts",
            "6",
            "--store-backoff-base-ms",
            "10",
            "--store-backoff-max-ms",
            "80",
        ])
        .unwrap();
        assert_eq!(config.retry.max_attempts, 6);
        assert_eq!(config.retry.base_delay, Duration::from_millis(10));
        assert_eq!(config.retry.max_delay, Duration::from_millis(80));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(parse(&["--listen-addr", "nowhere"]).is_err());
        assert!(parse(&["--store-max-attempts", "0"]).is_err());
        assert!(parse(&["--store-backoff-base-ms", "500", "--store-backoff-max-ms", "100"]).is_err());
    }
}
