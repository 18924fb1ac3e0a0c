//! Engine Configuration

use crate::wire::BAUD_CANDIDATES;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing and negotiation settings for the protocol engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Baud rates probed during discovery, in order
    pub baud_candidates: Vec<u32>,
    /// Try to move the adapter to a faster baud rate after discovery
    pub upgrade_baud: bool,
    /// Fastest rate considered by the upgrade
    pub max_baud: u32,
    /// Wait for a prompt per discovery candidate (ms)
    pub probe_timeout_ms: u64,
    /// Per-read window for synchronous commands (ms)
    pub command_timeout_ms: u64,
    /// Per-read window for init commands and `ATZ` (ms)
    pub init_timeout_ms: u64,
    /// Wait for the identity echo after switching baud (ms)
    pub baud_switch_timeout_ms: u64,
    /// Window the adapter waits for confirmation after `ATBRD` (ms, 5 ms steps)
    pub baud_change_window_ms: u64,
    /// Async command watchdog (ms)
    pub watchdog_ms: u64,
    /// Longest single wait for incoming bytes while listening (ms)
    pub listen_slice_ms: u64,
    /// Send `ATZ` after discovery
    pub reset_on_open: bool,
    /// Token the `ATI` reply must contain; `None` accepts any adapter
    pub expected_identity: Option<String>,
    /// Capacity of the executor work queue
    pub request_queue: usize,
    /// Capacity of the event channel
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            baud_candidates: BAUD_CANDIDATES.to_vec(),
            upgrade_baud: true,
            max_baud: 2_000_000,
            probe_timeout_ms: 100,
            command_timeout_ms: 200,
            init_timeout_ms: 1000,
            baud_switch_timeout_ms: 200,
            baud_change_window_ms: 500,
            watchdog_ms: 1000,
            listen_slice_ms: 50,
            reset_on_open: true,
            expected_identity: Some("ELM327".to_string()),
            request_queue: 32,
            event_capacity: 256,
        }
    }
}

impl EngineConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn baud_switch_timeout(&self) -> Duration {
        Duration::from_millis(self.baud_switch_timeout_ms)
    }

    pub fn baud_change_window(&self) -> Duration {
        Duration::from_millis(self.baud_change_window_ms)
    }

    pub fn watchdog(&self) -> Duration {
        Duration::from_millis(self.watchdog_ms)
    }

    pub fn listen_slice(&self) -> Duration {
        Duration::from_millis(self.listen_slice_ms.max(1))
    }

    /// `ATBRT` argument: the confirmation window in 5 ms units
    pub fn baud_change_window_units(&self) -> u8 {
        (self.baud_change_window_ms / 5).clamp(1, 255) as u8
    }
}
