use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use tracing::info;

use crate::{Configuration, Controller, LoggingTransport};

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_dir = std::env::var("HEATING_CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./config"));
    let prefix = std::env::var("HEATING_CONFIG_PREFIX").unwrap_or_default();

    let configuration = Configuration::open(&config_dir, &prefix).with_context(|| {
        format!("failed to load configuration from {}", config_dir.display())
    })?;
    info!(
        path = %configuration.path().display(),
        devices = configuration.devices().len(),
        "configuration loaded"
    );

    let controller = Controller::start(configuration, Arc::new(LoggingTransport));
    // The logging transport has no connection state to wait for.
    let names = controller.device_names();
    controller.on_devices_connect(&names);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");
    controller.stop().await;
    Ok(())
}
