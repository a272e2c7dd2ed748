use std::{process::ExitCode, sync::Arc};

use clap::Parser;
use tracing::{error, info};

use crate::{
    cli::Cli,
    config::Config,
    controller::{Controller, ControllerStatus},
    log::Logger,
    trace::init_tracing_subscriber,
};

mod cli;
mod config;
mod controller;
mod log;
mod session;
mod signals;
mod task;
mod trace;

#[cfg(feature = "metrics")]
mod metrics;
#[cfg(feature = "ui")]
mod ui;

include!(concat!(env!("OUT_DIR"), "/features.rs"));

#[tokio::main]
async fn main() -> eyre::Result<ExitCode> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => config::load(path).await?,
        None => Config::default(),
    };

    let min_severity = cli.min_severity.unwrap_or(config.log.min_severity);
    init_tracing_subscriber(min_severity);

    info!(features = ?ENABLED_FEATURES, "relay starting");

    let controller = Arc::new(Controller::with_options(
        cli.listen_port,
        cli.destination(),
        config.relay,
        Logger::tracing(min_severity),
    ));

    #[cfg(feature = "ui")]
    if let Some(ui_config) = config.ui {
        #[cfg(feature = "metrics")]
        let registry = Arc::new(metrics::create_registry(controller.metrics()));

        let ui = ui::listen(
            ui_config,
            controller.clone(),
            #[cfg(feature = "metrics")]
            registry,
        );
        task::spawn("ui", async move {
            if let Err(error) = ui.await {
                error!(%error, "UI server stopped");
            }
        });
    }

    controller.start().await;
    if controller.status() != ControllerStatus::Running {
        return Ok(ExitCode::FAILURE);
    }

    let exit_code = tokio::select! {
        signal = signals::shutdown_signal() => match signal {
            Ok(signal) => {
                info!(signal, "shutting down");
                ExitCode::SUCCESS
            }
            Err(error) => {
                error!(%error, "unable to listen for shutdown signals");
                ExitCode::FAILURE
            }
        },
        () = controller.wait() => ExitCode::FAILURE,
    };

    controller.stop().await;

    Ok(exit_code)
}
