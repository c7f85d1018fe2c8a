// SPDX-License-Identifier: GPL-3.0-only
use anyhow::Context;

use crate::config::Config;
use crate::randr::XrandrCommand;
use crate::service::ModeService;

#[macro_use]
extern crate tracing;

mod config;
mod error;
mod hotplug;
mod mode;
mod randr;
mod reconciler;
mod selector;
mod service;

fn setup_logs() {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let fmt_layer = fmt::layer().with_target(false);
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or(EnvFilter::new(format!(
        "warn,{}=info",
        env!("CARGO_CRATE_NAME")
    )));

    if let Ok(journal_layer) = tracing_journald::layer() {
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .with(journal_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .init();
    }
}

async fn wait_for_shutdown() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for ctrl-c")?,
        _ = terminate.recv() => {}
    }

    info!("Shutdown requested");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_logs();

    let config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            error!("errors loading config: {}", err);
            Config::default()
        }
    };
    debug!("Using config: {:?}", config);

    let backend = XrandrCommand::from_command_line(&config.randr_command, config.query_timeout)
        .context("randr-command is empty")?;

    let mut service = ModeService::new(config, backend);
    service
        .start()
        .context("Failed to start display mode service")?;

    wait_for_shutdown().await?;
    service.stop().await;

    Ok(())
}
