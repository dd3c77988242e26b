use std::sync::Arc;

use anyhow::Context;
use sriov_dp::host::SysfsHost;
use sriov_dp::manager::ResourceManager;
use sriov_dp::Config;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::new_from_flags(env!("CARGO_PKG_VERSION"));

    // Initialize the logger, defaulting to info
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(config_file = ?config.config_file, "Starting SR-IOV device plugin");
    let mut manager = ResourceManager::new(Arc::new(SysfsHost::default()), config);
    manager.run().await?;

    let mut interrupt = signal(SignalKind::interrupt()).context("unable to listen for SIGINT")?;
    let mut terminate = signal(SignalKind::terminate()).context("unable to listen for SIGTERM")?;
    let mut quit = signal(SignalKind::quit()).context("unable to listen for SIGQUIT")?;
    tokio::select! {
        _ = interrupt.recv() => info!("Received SIGINT"),
        _ = terminate.recv() => info!("Received SIGTERM"),
        _ = quit.recv() => info!("Received SIGQUIT"),
    }

    manager.stop_all_servers().await;
    Ok(())
}
