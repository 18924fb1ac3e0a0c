//! Protocol Engine
//!
//! [`ObdEngine`] is a cheap, cloneable handle. The work it is asked to do runs
//! on a single I/O executor task that owns the transport, the frame buffer and
//! the decoder; requests reach it over a FIFO queue and results come back as
//! [`EngineEvent`]s, a [`LinkStatus`] watch and, for synchronous commands, a
//! direct reply.

mod executor;
mod negotiate;

use crate::catalog::CommandCatalog;
use crate::config::EngineConfig;
use crate::decode::DecodedValue;
use crate::error::ObdError;
use crate::transport::Transport;
use executor::{Executor, Request};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::debug;

/// Lifecycle of the adapter link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No port open
    #[default]
    Closed,
    /// Opening the physical port
    Opening,
    /// Probing baud rate candidates
    DetectingBaud,
    /// Negotiating a faster baud rate
    UpgradingBaud,
    /// Sending the init command list
    Initializing,
    /// Listening and accepting commands
    Ready,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Closed => "closed",
            ConnectionState::Opening => "opening",
            ConnectionState::DetectingBaud => "detecting baud",
            ConnectionState::UpgradingBaud => "upgrading baud",
            ConnectionState::Initializing => "initializing",
            ConnectionState::Ready => "ready",
        };
        f.write_str(name)
    }
}

/// Snapshot of the link published by the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LinkStatus {
    /// Connection state
    pub state: ConnectionState,
    /// Adapter is still searching for a vehicle protocol
    pub searching: bool,
    /// Negotiated baud rate while a port is open
    pub baud_rate: Option<u32>,
}

impl LinkStatus {
    /// Whether an async command would currently be accepted by the link
    pub fn accepts_commands(&self) -> bool {
        self.state == ConnectionState::Ready && !self.searching
    }
}

/// How an async command was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionOutcome {
    /// A reply for the command's PID was decoded
    Replied,
    /// The watchdog expired first
    TimedOut,
    /// The link closed, or the executor refused the command
    Cancelled,
}

/// Notifications from the engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Connection state transition
    StateChanged(ConnectionState),
    /// An open completed; fires once per successful open
    Initialized { baud_rate: u32 },
    /// An open failed or an established link was lost
    Failed(ObdError),
    /// A response frame decoded against the catalog
    Decoded(DecodedValue),
    /// The pending async command was resolved
    CommandCompleted {
        command: String,
        outcome: CompletionOutcome,
    },
}

/// Handle to a running protocol engine
#[derive(Clone)]
pub struct ObdEngine {
    requests: mpsc::Sender<Request>,
    status: watch::Receiver<LinkStatus>,
    events: broadcast::Sender<EngineEvent>,
    in_flight: Arc<AtomicBool>,
    catalog: Arc<CommandCatalog>,
}

impl ObdEngine {
    /// Start an executor task owning `transport`.
    ///
    /// Must be called inside a tokio runtime. The executor stops once every
    /// handle has been dropped.
    pub fn spawn<T: Transport>(
        transport: T,
        catalog: Arc<CommandCatalog>,
        config: EngineConfig,
    ) -> Self {
        let (request_tx, request_rx) = mpsc::channel(config.request_queue.max(1));
        let (status_tx, status_rx) = watch::channel(LinkStatus::default());
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let in_flight = Arc::new(AtomicBool::new(false));

        let executor = Executor::new(
            transport,
            Arc::clone(&catalog),
            config,
            status_tx,
            event_tx.clone(),
            Arc::clone(&in_flight),
        );
        tokio::spawn(executor.run(request_rx));

        Self {
            requests: request_tx,
            status: status_rx,
            events: event_tx,
            in_flight,
            catalog,
        }
    }

    /// Open `port` and bring the adapter up.
    ///
    /// Returns once the request is queued; progress is reported through
    /// [`EngineEvent::StateChanged`], then `Initialized` or `Failed`.
    pub async fn open(&self, port: &str) -> Result<(), ObdError> {
        self.submit(Request::Open {
            port: port.to_string(),
        })
        .await
    }

    /// Close the link, cancelling any pending async command
    pub async fn close(&self) -> Result<(), ObdError> {
        self.submit(Request::Close).await
    }

    /// Send a command and wait for its reply.
    ///
    /// Reads repeat until `timeout` passes without new bytes; whatever arrived
    /// is returned without trailing terminators or prompts, possibly empty.
    pub async fn send_sync(&self, command: &str, timeout: Duration) -> Result<String, ObdError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(Request::SendSync {
            command: command.to_string(),
            timeout,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| ObdError::EngineStopped)?
    }

    /// Submit an async command without waiting.
    ///
    /// Returns `false` if the link is not ready, the adapter is searching, or
    /// another async command is still pending. An accepted command is
    /// resolved by exactly one [`EngineEvent::CommandCompleted`].
    pub fn send_async(&self, command: &str) -> bool {
        if !self.status.borrow().accepts_commands() {
            return false;
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let request = Request::SendAsync {
            command: command.to_string(),
        };
        if self.requests.try_send(request).is_err() {
            self.in_flight.store(false, Ordering::Release);
            debug!("Executor queue unavailable, rejecting {}", command);
            return false;
        }
        true
    }

    /// Whether an async command is awaiting completion
    pub fn has_pending(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Current link status
    pub fn status(&self) -> LinkStatus {
        *self.status.borrow()
    }

    /// Watch channel for link status changes
    pub fn watch_status(&self) -> watch::Receiver<LinkStatus> {
        self.status.clone()
    }

    /// Catalog the engine decodes with
    pub fn catalog(&self) -> &Arc<CommandCatalog> {
        &self.catalog
    }

    async fn submit(&self, request: Request) -> Result<(), ObdError> {
        self.requests
            .send(request)
            .await
            .map_err(|_| ObdError::EngineStopped)
    }
}
