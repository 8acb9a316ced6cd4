//! Central Brain daemon: ingests edge batches, fans them out to the
//! downstream stores, and serves the query surface. Optional argument:
//! path to a YAML configuration file.

use tokio_util::sync::CancellationToken;
use tracing::info;

use sidra_telemetry::config::CentralConfig;
use sidra_telemetry::ingest_api::{self, AppState};
use sidra_telemetry::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config_path = std::env::args().nth(1);
    let config = CentralConfig::load(config_path.as_deref())?;

    let _log_guard = logging::init(&config.log_level, config.log_file.as_deref())?;
    info!(
        "starting sidra central brain (tsdb: {}, event store: {})",
        config.tsdb_url, config.event_store_url
    );

    let state = AppState::from_config(&config)?;
    let cancel = CancellationToken::new();

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        signal_cancel.cancel();
    });

    ingest_api::serve(&config.bind_address, state, cancel).await?;
    info!("central brain stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
