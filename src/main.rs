pub mod bridge;
pub mod cli;
pub mod config;
pub mod mapping;
pub mod mqtt;

use crate::bridge::Bridge;
use crate::cli::Cli;
use crate::config::{default_config_path, load_config};
use crate::mqtt::transport::RumqttTransport;
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup(cli.verbose)?;

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = load_config(&config_path)
        .await
        .map_err(|e| eyre!("Failed to load config from {}: {}", config_path.display(), e))?;

    let endpoint = cli.endpoint();
    info!("Using {:?} ingest broker {}", endpoint, endpoint.broker());

    let bridge = Bridge::create(
        &config,
        endpoint.broker(),
        Box::new(RumqttTransport::new()),
        Box::new(RumqttTransport::new()),
    )?;
    let bridge = bridge
        .start()
        .await
        .map_err(|e| eyre!("Failed to start bridge: {}", e))?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let ingest_loss = CancellationToken::new();
    if cli.exit_on_ingest_loss {
        let mut status = bridge.subscribe_status();
        let shutdown = shutdown.clone();
        let ingest_loss = ingest_loss.clone();
        tokio::spawn(async move {
            if status.wait_for(|s| s.ingest_lost).await.is_ok() {
                ingest_loss.cancel();
                shutdown.cancel();
            }
        });
    }

    let stopped = bridge.run_until_shutdown(shutdown).await.shutdown().await;
    let status = stopped.status();
    info!(
        "Mapped {} tables, sent {} batches ({} failed), forwarded {} selections",
        status.tables_mapped, status.batches_sent, status.batches_failed, status.selections_forwarded
    );

    if ingest_loss.is_cancelled() {
        return Err(eyre!("Ingest connection lost"));
    }
    Ok(())
}

fn setup(verbose: bool) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    setup_logging(if verbose { Level::DEBUG } else { Level::INFO });
    Ok(())
}

fn setup_logging(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
            _ = terminate => info!("Received SIGTERM, shutting down"),
        }
        shutdown.cancel();
    });
}
