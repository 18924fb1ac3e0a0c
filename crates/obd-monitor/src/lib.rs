//! OBD-II Monitor
//!
//! Headless stand-in for a dashboard: loads configuration, opens the adapter
//! link, runs the rotation poller and logs every decoded value.

use obd_protocol::{
    CatalogDefinition, CommandCatalog, EngineConfig, EngineEvent, ObdEngine, ObdError, Transport,
};
use obd_scheduler::{PollStats, PollerConfig, RotationPoller};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Port name that selects the simulated adapter
pub const SIMULATOR_PORT: &str = "sim";

/// Prefix for environment overrides, e.g. `OBD_MONITOR__ENGINE__WATCHDOG_MS`
pub const ENV_PREFIX: &str = "OBD_MONITOR";

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Monitor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Serial device path, or `sim`
    pub port: String,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
    /// Protocol engine settings
    pub engine: EngineConfig,
    /// Poller settings
    pub poller: PollerConfig,
    /// Catalog to poll; the standard catalog when absent
    pub catalog: Option<CatalogDefinition>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            port: SIMULATOR_PORT.to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            engine: EngineConfig::default(),
            poller: PollerConfig::default(),
            catalog: None,
        }
    }
}

impl MonitorConfig {
    /// Load from an optional config file plus `OBD_MONITOR__*` variables
    pub fn load(path: &str) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        settings.try_deserialize()
    }

    /// Parse a TOML document
    pub fn from_toml(toml: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    /// Build the validated catalog
    pub fn catalog(&self) -> Result<CommandCatalog, ObdError> {
        match &self.catalog {
            None => Ok(CommandCatalog::standard()),
            Some(def) => {
                let init = if def.init.is_empty() {
                    CommandCatalog::default_init()
                } else {
                    def.init.clone()
                };
                CommandCatalog::new(init, def.commands.clone())
            }
        }
    }

    /// Whether the simulated adapter was requested
    pub fn uses_simulator(&self) -> bool {
        self.port.eq_ignore_ascii_case(SIMULATOR_PORT)
    }
}

/// Initialize logging
pub fn init_logging(
    level: &str,
    format: LogFormat,
) -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
    let level = Level::from_str(level).unwrap_or(Level::INFO);
    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true);

    match format {
        LogFormat::Text => tracing::subscriber::set_global_default(builder.finish()),
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish()),
    }
}

/// Log engine events until the engine goes away
async fn log_events(engine: ObdEngine) {
    let mut events = engine.subscribe();
    drop(engine);

    loop {
        match events.recv().await {
            Ok(EngineEvent::Decoded(value)) => {
                info!(
                    channel = %value.channel,
                    value = value.value.as_f64(),
                    units = %value.units,
                    "decoded"
                );
            }
            Ok(EngineEvent::StateChanged(state)) => info!("Link {}", state),
            Ok(EngineEvent::Initialized { baud_rate }) => {
                info!("Adapter initialized at {} baud", baud_rate)
            }
            Ok(EngineEvent::Failed(e)) => warn!("Link failure: {}", e),
            Ok(EngineEvent::CommandCompleted { .. }) => {}
            Err(RecvError::Lagged(n)) => warn!("Logger skipped {} events", n),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Wait for the outcome of an open request
async fn wait_until_ready(
    events: &mut tokio::sync::broadcast::Receiver<EngineEvent>,
) -> Result<u32, ObdError> {
    loop {
        match events.recv().await {
            Ok(EngineEvent::Initialized { baud_rate }) => return Ok(baud_rate),
            Ok(EngineEvent::Failed(e)) => return Err(e),
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => return Err(ObdError::EngineStopped),
        }
    }
}

/// Open the link over `transport` and poll until `shutdown` resolves
pub async fn run_monitor<T, F>(
    transport: T,
    config: MonitorConfig,
    shutdown: F,
) -> anyhow::Result<PollStats>
where
    T: Transport,
    F: Future<Output = ()> + Send + 'static,
{
    let catalog = Arc::new(config.catalog()?);
    info!("Polling {} channels on {}", catalog.len(), config.port);

    let engine = ObdEngine::spawn(transport, catalog, config.engine.clone());
    let mut events = engine.subscribe();
    tokio::spawn(log_events(engine.clone()));

    engine.open(&config.port).await?;
    wait_until_ready(&mut events).await?;
    drop(events);

    let mut poller = RotationPoller::new(engine.clone(), config.poller.clone());
    let stop = poller.stop_handle();
    tokio::spawn(async move {
        shutdown.await;
        stop.stop();
    });

    let stats = poller.run().await?;
    engine.close().await?;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::{SimulatedElm327, SimulatorConfig};
    use std::time::Duration;

    #[test]
    fn test_default_config() {
        let config = MonitorConfig::default();
        assert!(config.uses_simulator());
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.catalog().unwrap(), CommandCatalog::standard());
    }

    #[test]
    fn test_parse_toml() {
        let config = MonitorConfig::from_toml(
            r#"
            port = "/dev/ttyUSB0"
            log_level = "debug"
            log_format = "json"

            [engine]
            upgrade_baud = false
            watchdog_ms = 500
            expected_identity = "ELM327"

            [poller]
            cycle_interval_ms = 250

            [[catalog.commands]]
            name = "rpm"
            send = "010C"
            reply_length = 2
            conversion = "(B0*256+B1)/4"
            units = "rpm"
            "#,
        )
        .unwrap();

        assert_eq!(config.port, "/dev/ttyUSB0");
        assert!(!config.uses_simulator());
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(!config.engine.upgrade_baud);
        assert_eq!(config.engine.watchdog_ms, 500);
        assert_eq!(config.engine.expected_identity.as_deref(), Some("ELM327"));
        // Unset fields keep their defaults
        assert_eq!(config.engine.probe_timeout_ms, 100);
        assert_eq!(config.poller.cycle_interval_ms, 250);
        assert_eq!(config.poller.completion_timeout_ms, 2000);

        let catalog = config.catalog().unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.init_commands(), CommandCatalog::default_init().as_slice());
        assert_eq!(catalog.find_by_pid("0c").map(|c| c.name()), Some("rpm"));
    }

    #[test]
    fn test_invalid_catalog_rejected() {
        let config = MonitorConfig::from_toml(
            r#"
            [[catalog.commands]]
            name = "rpm"
            send = "010C"
            conversion = "B0 +"
            "#,
        )
        .unwrap();
        assert!(matches!(config.catalog(), Err(ObdError::InvalidCatalog(_))));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = MonitorConfig::load("does-not-exist-obd-monitor").unwrap();
        assert_eq!(config.port, MonitorConfig::default().port);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_against_simulator() {
        let config = MonitorConfig {
            engine: EngineConfig {
                upgrade_baud: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let sim = SimulatedElm327::new(SimulatorConfig::demo());

        // The deadline starts once polling begins
        let shutdown = async { tokio::time::sleep(Duration::from_secs(2)).await };
        let stats = run_monitor(sim, config, shutdown).await.unwrap();
        assert!(stats.completed > 0);
        assert_eq!(stats.timed_out, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_fails_without_adapter() {
        let config = MonitorConfig::default();
        let sim = SimulatedElm327::new(SimulatorConfig {
            adapter_baud: 12_345,
            ..SimulatorConfig::demo()
        });

        let result = run_monitor(sim, config, std::future::pending()).await;
        assert!(result.is_err());
    }
}
