//! OBD Monitor - Main Entry Point

use anyhow::Context;
use obd_monitor::{init_logging, run_monitor, MonitorConfig};
use obd_protocol::{SerialTransport, SimulatedElm327, SimulatorConfig};
use tracing::info;

/// Config file looked up when no path is given (any format the loader knows)
const DEFAULT_CONFIG: &str = "obd-monitor";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let config = MonitorConfig::load(&path).with_context(|| format!("loading {}", path))?;
    init_logging(&config.log_level, config.log_format)?;

    info!("=== OBD Monitor v{} ===", env!("CARGO_PKG_VERSION"));

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let stats = if config.uses_simulator() {
        info!("Using simulated adapter");
        run_monitor(SimulatedElm327::new(SimulatorConfig::demo()), config, shutdown).await?
    } else {
        run_monitor(SerialTransport::new(), config, shutdown).await?
    };

    info!(
        "Sent {} commands: {} answered, {} timed out, {} rejected",
        stats.sent, stats.completed, stats.timed_out, stats.rejected
    );
    Ok(())
}
