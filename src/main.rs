use std::sync::Arc;

use clap::Parser;
use color_eyre::Result;
use radar_helm::{
    cli,
    config::Config,
    connection::DeviceFactory,
    logging,
    manager::ConnectionManager,
    server,
    store::FileStore,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Level};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[cfg(windows)]
use tokio::signal::windows::{signal, SignalKind};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    if let Some(command) = cli.command {
        cli::handle_command(command);

        return Ok(());
    }

    let file_logging = cli.log_dir.map(|dir| (Level::DEBUG, dir));
    logging::init(Level::INFO, file_logging).await;

    let config = if let Some(config_path) = &cli.config {
        debug!(?config_path, "Config from path");
        Config::new_from_path(config_path).map_err(|e| color_eyre::eyre::eyre!("{e}"))?
    } else {
        debug!("Default config");
        Config::default()
    };
    config
        .validate()
        .map_err(|e| color_eyre::eyre::eyre!("{e}"))?;

    let factory =
        Arc::new(DeviceFactory::new().with_init_commands(config.init_commands.clone()));

    let mut builder = ConnectionManager::builder()
        .factory(factory)
        .queue_capacity(config.subscriber_queue_capacity);

    if let Some(config_path) = &cli.config {
        builder = builder.store(Arc::new(FileStore::new(config_path)));
    }

    let manager = builder.build();

    let cancel = CancellationToken::new();

    // A failure here is not fatal; the service stays up and a later reload
    // can heal it once the hardware or the configuration is in shape.
    match manager.reload_config(&cancel).await {
        Ok(outcome) => info!(%outcome, "initial configuration applied"),
        Err(e) => warn!(%e, "initial reload failed, continuing without a connection"),
    }

    let monitor_manager = manager.clone();
    let monitor_cancel = cancel.clone();
    tokio::spawn(
        async move {
            if let Err(e) = monitor_manager.monitor(monitor_cancel).await {
                info!(%e, "monitor stopped");
            }
        }
        .instrument(info_span!("Monitor")),
    );

    let mut hangup = signal(SignalKind::hangup())?;

    let port = cli.port.unwrap_or(server::DEFAULT_PORT);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C, quitting")
        }
        _ = hangup.recv() => {
            info!("Told to hang up, quitting")
        }
        _ = server::run_on_port(config, Some(manager.clone()), port) => {
            error!("Server returned");
            return Err(color_eyre::eyre::eyre!("Server stopped unexpectedly"));
        }
    }

    cancel.cancel();

    if let Err(e) = manager.close().await {
        warn!(%e, "closing manager during shutdown failed");
    }

    Ok(())
}
