//! # Dash Bridge
//!
//! Bridge racing-sim telemetry to a Wi-Fi dashboard display.
//!
//! The binary is the reference supervising layer: it loads configuration,
//! starts the telemetry broadcaster and the heartbeat monitor against the
//! configured device endpoint, and tears both down on Ctrl+C. Provisioning
//! (flashing, Wi-Fi credentials) is driven through the library by whatever
//! front end embeds it.

use anyhow::Result;
use std::env;
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use dash_bridge::config::{Config, LoggingConfig};
use dash_bridge::heartbeat::HeartbeatMonitor;
use dash_bridge::telemetry::{BroadcastStatus, Broadcaster, SharedMemorySource};

/// Configuration file consulted when no path is given on the command line
const DEFAULT_CONFIG_PATH: &str = "dash-bridge.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let config = match env::args().nth(1) {
        Some(path) => Config::load(&path)?,
        None => Config::load_or_default(DEFAULT_CONFIG_PATH)?,
    };

    let _guard = init_logging(&config.logging);

    info!("dash-bridge v{} starting", env!("CARGO_PKG_VERSION"));

    let endpoint = config.device.endpoint()?;
    let source = Arc::new(SharedMemorySource::new(
        &config.telemetry.shared_memory_name,
        &config.telemetry.sim_process,
    ));

    let broadcaster = Broadcaster::start(source, endpoint, config.telemetry.high_frequency);
    let heartbeat = HeartbeatMonitor::start(endpoint);
    let mut status_rx = broadcaster.subscribe_status();

    info!("bridging telemetry to {endpoint}, press Ctrl+C to exit");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received Ctrl+C, shutting down");
                break;
            }
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = status_rx.borrow_and_update().clone();
                info!("telemetry status: {status}");
                if matches!(status, BroadcastStatus::Error(_)) {
                    // Session-fatal; a restart of the binary starts a new session
                    break;
                }
            }
        }
    }

    match serde_json::to_string(&heartbeat.status()) {
        Ok(status) => info!("device link at shutdown: {status}"),
        Err(e) => info!("device link status unavailable: {e}"),
    }

    broadcaster.stop();
    heartbeat.stop();
    broadcaster.join().await;
    heartbeat.join().await;

    Ok(())
}

/// Initialize tracing output; the guard keeps the file writer alive
fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());

    if config.file {
        let appender = tracing_appender::rolling::daily(&config.dir, "dash-bridge.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        None
    }
}
