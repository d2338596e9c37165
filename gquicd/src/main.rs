mod config;
mod server;
mod telemetry;

use anyhow::Context;
use tracing::info;

fn main() -> anyhow::Result<()> {
    let config = config::load_config()?;

    telemetry::init_logging(config.logging.level)?;
    info!(
        host = %config.network.host,
        port = config.network.port,
        sni = ?config.sni,
        "Configuration loaded successfully"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("gquicd-worker")
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(server::run(config))?;

    info!("Shutdown complete");
    Ok(())
}
