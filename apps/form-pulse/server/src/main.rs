use anyhow::Result;
use clap::Parser;
use form_pulse_server::config::{Cli, ServerConfig, StoreBackend};
use form_pulse_server::telemetry::Telemetry;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    let store = match &config.store {
        StoreBackend::Redis { url } => url.as_str(),
        StoreBackend::Memory => "memory",
    };
    info!(
        listen_addr = %config.listen_addr,
        store,
        max_attempts = config.retry.max_attempts,
        "starting form-pulse server"
    );

    form_pulse_server::run(config, telemetry.metrics_handle()).await
}
