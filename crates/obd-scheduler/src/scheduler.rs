//! Rotation Poller Implementation

use obd_protocol::{CompletionOutcome, EngineEvent, ObdEngine, ObdError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Configuration for the rotation poller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Interval between poll cycles in milliseconds
    pub cycle_interval_ms: u64,
    /// Longest wait for a command's completion event in milliseconds
    pub completion_timeout_ms: u64,
    /// Wait before checking again while the link is not ready
    pub not_ready_backoff_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            cycle_interval_ms: 100,
            completion_timeout_ms: 2000,
            not_ready_backoff_ms: 250,
        }
    }
}

/// Per-channel poll cadence: poll once, then skip `skip` cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollCadence {
    skip: u32,
    countdown: u32,
}

impl PollCadence {
    /// Cadence that is due on the first cycle
    pub fn new(skip: u32) -> Self {
        Self { skip, countdown: 0 }
    }

    /// Advance one cycle; true if the channel is due
    pub fn tick(&mut self) -> bool {
        if self.countdown == 0 {
            self.countdown = self.skip;
            true
        } else {
            self.countdown -= 1;
            false
        }
    }

    /// Make the channel due on the next cycle
    pub fn reset(&mut self) {
        self.countdown = 0;
    }
}

/// Counters kept by the poller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollStats {
    /// Commands accepted by the engine
    pub sent: u64,
    /// Commands answered by the adapter
    pub completed: u64,
    /// Commands resolved by the watchdog, or never resolved
    pub timed_out: u64,
    /// Commands cancelled by a closing link
    pub cancelled: u64,
    /// Commands the engine refused
    pub rejected: u64,
}

#[derive(Debug, Clone)]
struct PolledChannel {
    name: String,
    send: String,
    cadence: PollCadence,
}

/// Stops a running poller from another task
#[derive(Debug, Clone)]
pub struct PollerHandle {
    running: Arc<AtomicBool>,
}

impl PollerHandle {
    /// Ask the poller to stop after the current cycle
    pub fn stop(&self) {
        info!("Stopping rotation poller");
        self.running.store(false, Ordering::Release);
    }
}

/// Walks the catalog in order, one async command at a time
pub struct RotationPoller {
    engine: ObdEngine,
    config: PollerConfig,
    channels: Vec<PolledChannel>,
    running: Arc<AtomicBool>,
    stats: PollStats,
}

impl RotationPoller {
    /// Create a poller over every channel in the engine's catalog
    pub fn new(engine: ObdEngine, config: PollerConfig) -> Self {
        let channels: Vec<PolledChannel> = engine
            .catalog()
            .commands()
            .iter()
            .map(|c| PolledChannel {
                name: c.name().to_string(),
                send: c.send().to_string(),
                cadence: PollCadence::new(c.skip_count()),
            })
            .collect();

        info!("Rotation poller created with {} channels", channels.len());

        Self {
            engine,
            config,
            channels,
            running: Arc::new(AtomicBool::new(true)),
            stats: PollStats::default(),
        }
    }

    /// Handle for stopping [`run`](Self::run)
    pub fn stop_handle(&self) -> PollerHandle {
        PollerHandle {
            running: Arc::clone(&self.running),
        }
    }

    /// Whether the poller has not been stopped
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Counters so far
    pub fn stats(&self) -> PollStats {
        self.stats
    }

    /// Number of polled channels
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Poll every due channel once.
    ///
    /// `events` must be subscribed before the call so no completion is missed.
    /// Returns the number of commands that were sent.
    pub async fn run_cycle(
        &mut self,
        events: &mut broadcast::Receiver<EngineEvent>,
    ) -> Result<usize, ObdError> {
        let completion_timeout = Duration::from_millis(self.config.completion_timeout_ms);
        let mut sent = 0;

        for index in 0..self.channels.len() {
            if !self.channels[index].cadence.tick() {
                continue;
            }

            let send = self.channels[index].send.clone();
            if !self.engine.send_async(&send) {
                debug!("{} rejected by engine", self.channels[index].name);
                self.stats.rejected += 1;
                // Retry on the next cycle instead of waiting out the skip
                self.channels[index].cadence.reset();
                if !self.engine.status().accepts_commands() {
                    break;
                }
                continue;
            }
            self.stats.sent += 1;
            sent += 1;

            match tokio::time::timeout(completion_timeout, wait_for_completion(events, &send)).await
            {
                Ok(Ok(CompletionOutcome::Replied)) => self.stats.completed += 1,
                Ok(Ok(CompletionOutcome::TimedOut)) => {
                    debug!("{} timed out", self.channels[index].name);
                    self.stats.timed_out += 1;
                }
                Ok(Ok(CompletionOutcome::Cancelled)) => {
                    self.stats.cancelled += 1;
                    break;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    warn!("No completion for {} within {:?}", send, completion_timeout);
                    self.stats.timed_out += 1;
                }
            }
        }

        Ok(sent)
    }

    /// Poll until stopped or the engine goes away
    pub async fn run(&mut self) -> Result<PollStats, ObdError> {
        info!("Starting rotation poller");
        let mut events = self.engine.subscribe();
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.cycle_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.is_running() {
            ticker.tick().await;

            if !self.engine.status().accepts_commands() {
                tokio::time::sleep(Duration::from_millis(self.config.not_ready_backoff_ms)).await;
                continue;
            }

            self.run_cycle(&mut events).await?;
        }

        info!("Rotation poller stopped: {:?}", self.stats);
        Ok(self.stats)
    }
}

/// Wait for the completion of `command`, skipping unrelated events
async fn wait_for_completion(
    events: &mut broadcast::Receiver<EngineEvent>,
    command: &str,
) -> Result<CompletionOutcome, ObdError> {
    loop {
        match events.recv().await {
            Ok(EngineEvent::CommandCompleted {
                command: completed,
                outcome,
            }) if completed == command => return Ok(outcome),
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => warn!("Poller missed {} engine events", n),
            Err(RecvError::Closed) => return Err(ObdError::EngineStopped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::{
        CommandCatalog, CommandDefinition, EngineConfig, SimulatedElm327, SimulatorConfig,
    };
    use std::collections::HashMap;

    #[test]
    fn test_cadence_every_cycle() {
        let mut cadence = PollCadence::new(0);
        assert!((0..5).all(|_| cadence.tick()));
    }

    #[test]
    fn test_cadence_skips() {
        let mut cadence = PollCadence::new(2);
        let due: Vec<bool> = (0..7).map(|_| cadence.tick()).collect();
        assert_eq!(due, vec![true, false, false, true, false, false, true]);
    }

    #[test]
    fn test_cadence_reset() {
        let mut cadence = PollCadence::new(3);
        assert!(cadence.tick());
        assert!(!cadence.tick());
        cadence.reset();
        assert!(cadence.tick());
    }

    async fn ready_engine(sim: SimulatorConfig, commands: Vec<CommandDefinition>) -> ObdEngine {
        let catalog = CommandCatalog::new(CommandCatalog::default_init(), commands).unwrap();
        let config = EngineConfig {
            upgrade_baud: false,
            ..Default::default()
        };
        let engine = ObdEngine::spawn(SimulatedElm327::new(sim), Arc::new(catalog), config);
        let mut events = engine.subscribe();
        engine.open("sim").await.unwrap();
        loop {
            match events.recv().await.unwrap() {
                EngineEvent::Initialized { .. } => break,
                EngineEvent::Failed(e) => panic!("open failed: {}", e),
                _ => {}
            }
        }
        engine
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_counts_control_poll_rate() {
        let sim = SimulatorConfig::default()
            .respond("0D", "40")
            .respond("0C", "1AF8");
        let engine = ready_engine(
            sim,
            vec![
                CommandDefinition::new("speed", "010D", 1),
                CommandDefinition::new("rpm", "010C", 2).with_skip_count(1),
            ],
        )
        .await;

        let mut values = engine.subscribe();
        let mut poller = RotationPoller::new(engine.clone(), PollerConfig::default());
        let mut events = engine.subscribe();
        for _ in 0..4 {
            poller.run_cycle(&mut events).await.unwrap();
        }

        let mut counts: HashMap<String, usize> = HashMap::new();
        while let Ok(event) = values.try_recv() {
            if let EngineEvent::Decoded(value) = event {
                *counts.entry(value.channel).or_default() += 1;
            }
        }
        assert_eq!(counts.get("speed"), Some(&4));
        assert_eq!(counts.get("rpm"), Some(&2));

        let stats = poller.stats();
        assert_eq!(stats.sent, 6);
        assert_eq!(stats.completed, 6);
        assert_eq!(stats.timed_out, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_channel_does_not_stall_rotation() {
        let sim = SimulatorConfig::default()
            .respond("0C", "1AF8")
            .silent("0D");
        let engine = ready_engine(
            sim,
            vec![
                CommandDefinition::new("speed", "010D", 1),
                CommandDefinition::new("rpm", "010C", 2),
            ],
        )
        .await;

        let mut poller = RotationPoller::new(engine.clone(), PollerConfig::default());
        let mut events = engine.subscribe();
        assert_eq!(poller.run_cycle(&mut events).await.unwrap(), 2);

        let stats = poller.stats();
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_engine_rejects() {
        let engine = ObdEngine::spawn(
            SimulatedElm327::new(SimulatorConfig::default()),
            Arc::new(CommandCatalog::standard()),
            EngineConfig::default(),
        );
        let mut poller = RotationPoller::new(engine.clone(), PollerConfig::default());
        let mut events = engine.subscribe();

        assert_eq!(poller.run_cycle(&mut events).await.unwrap(), 0);
        assert_eq!(poller.stats().rejected, 1);
        assert_eq!(poller.stats().sent, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_stopped() {
        let sim = SimulatorConfig::default().respond("0D", "40");
        let engine = ready_engine(sim, vec![CommandDefinition::new("speed", "010D", 1)]).await;

        let mut poller = RotationPoller::new(engine, PollerConfig::default());
        let handle = poller.stop_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            handle.stop();
        });

        let stats = poller.run().await.unwrap();
        assert!(!poller.is_running());
        assert!(stats.sent >= 5);
        assert_eq!(stats.sent, stats.completed);
    }
}
