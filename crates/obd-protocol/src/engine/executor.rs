//! I/O Executor
//!
//! The only code that touches the transport. Requests are handled strictly in
//! arrival order; while the link is ready the loop also listens for incoming
//! bytes and watches the pending async command's deadline.

use super::negotiate;
use super::{CompletionOutcome, ConnectionState, EngineEvent, LinkStatus};
use crate::catalog::{normalize_pid, CommandCatalog};
use crate::config::EngineConfig;
use crate::decode::{Decoder, FrameOutcome};
use crate::error::ObdError;
use crate::frame::FrameBuffer;
use crate::transport::Transport;
use crate::wire::TERMINATOR;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Work items accepted by the executor
pub(crate) enum Request {
    Open {
        port: String,
    },
    Close,
    SendSync {
        command: String,
        timeout: Duration,
        reply: oneshot::Sender<Result<String, ObdError>>,
    },
    SendAsync {
        command: String,
    },
}

/// The single outstanding async command
#[derive(Debug)]
struct PendingCommand {
    command: String,
    pid: String,
    deadline: Instant,
}

pub(crate) struct Executor<T: Transport> {
    transport: T,
    frames: FrameBuffer,
    decoder: Decoder,
    catalog: Arc<CommandCatalog>,
    config: EngineConfig,
    state: ConnectionState,
    pending: Option<PendingCommand>,
    status: watch::Sender<LinkStatus>,
    events: broadcast::Sender<EngineEvent>,
    in_flight: Arc<AtomicBool>,
}

impl<T: Transport> Executor<T> {
    pub(crate) fn new(
        transport: T,
        catalog: Arc<CommandCatalog>,
        config: EngineConfig,
        status: watch::Sender<LinkStatus>,
        events: broadcast::Sender<EngineEvent>,
        in_flight: Arc<AtomicBool>,
    ) -> Self {
        Self {
            transport,
            frames: FrameBuffer::new(),
            decoder: Decoder::new(Arc::clone(&catalog)),
            catalog,
            config,
            state: ConnectionState::Closed,
            pending: None,
            status,
            events,
            in_flight,
        }
    }

    pub(crate) async fn run(mut self, mut requests: mpsc::Receiver<Request>) {
        debug!("I/O executor started");
        loop {
            let listening = self.state == ConnectionState::Ready;
            let deadline = self.pending.as_ref().map(|p| p.deadline);
            let slice = self.config.listen_slice();

            tokio::select! {
                biased;
                request = requests.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.expire_pending();
                }
                read = self.transport.read_available(slice), if listening => {
                    self.on_read(read);
                }
            }
        }

        if self.transport.is_open() {
            self.close_link();
        }
        debug!("I/O executor stopped");
    }

    async fn handle(&mut self, request: Request) {
        match request {
            Request::Open { port } => self.open(&port).await,
            Request::Close => {
                if self.transport.is_open() || self.state != ConnectionState::Closed {
                    info!("Closing adapter link");
                    self.close_link();
                }
            }
            Request::SendSync {
                command,
                timeout,
                reply,
            } => {
                let result = self.send_sync(&command, timeout).await;
                // Caller may have given up waiting
                let _ = reply.send(result);
            }
            Request::SendAsync { command } => self.send_async(command).await,
        }
    }

    async fn open(&mut self, port: &str) {
        if self.transport.is_open() {
            self.close_link();
        }

        match self.connect(port).await {
            Ok(baud_rate) => {
                self.frames.clear();
                self.decoder.reset();
                self.set_state(ConnectionState::Ready);
                info!("Adapter ready on {} at {} baud", port, baud_rate);
                self.emit(EngineEvent::Initialized { baud_rate });
            }
            Err(e) => {
                warn!("Failed to open {}: {}", port, e);
                self.close_link();
                self.emit(EngineEvent::Failed(e));
            }
        }
    }

    /// Open, discover, optionally reset and upgrade, then initialize
    async fn connect(&mut self, port: &str) -> Result<u32, ObdError> {
        self.set_state(ConnectionState::Opening);
        self.transport.open(port)?;

        self.set_state(ConnectionState::DetectingBaud);
        let mut baud_rate = negotiate::discover(
            &mut self.transport,
            &self.config.baud_candidates,
            self.config.probe_timeout(),
        )
        .await?;
        self.publish_baud(Some(baud_rate));

        if self.config.reset_on_open {
            let reply =
                negotiate::send_text(&mut self.transport, "ATZ", self.config.init_timeout()).await?;
            if negotiate::reply_lines(&reply, "ATZ").is_empty() {
                warn!("Adapter did not answer ATZ");
                return Err(ObdError::AdapterNotFound);
            }
        }

        let identity =
            negotiate::identify(&mut self.transport, self.config.command_timeout()).await?;
        if let Some(expected) = self.config.expected_identity.as_deref() {
            if !identity.contains(expected) {
                warn!("Adapter identifies as {:?}, expected {:?}", identity, expected);
                return Err(ObdError::AdapterNotFound);
            }
        }
        debug!("Adapter identity: {}", identity);

        if self.config.upgrade_baud {
            self.set_state(ConnectionState::UpgradingBaud);
            match negotiate::upgrade(&mut self.transport, &self.config, &identity).await {
                Ok(rate) => {
                    baud_rate = rate;
                    self.publish_baud(Some(rate));
                }
                Err(ObdError::BaudUpgradeFailed(reason)) => {
                    warn!("Staying at {} baud: {}", baud_rate, reason);
                }
                Err(e) => return Err(e),
            }
        }

        self.set_state(ConnectionState::Initializing);
        let init = self.catalog.init_commands().to_vec();
        for command in &init {
            let reply =
                negotiate::send_text(&mut self.transport, command, self.config.init_timeout())
                    .await?;
            if !negotiate::acknowledged(&reply, command) {
                return Err(ObdError::InitializationFailed {
                    command: command.clone(),
                    reply,
                });
            }
            debug!("Init {} acknowledged", command);
        }

        Ok(baud_rate)
    }

    async fn send_sync(&mut self, command: &str, timeout: Duration) -> Result<String, ObdError> {
        if !self.transport.is_open() {
            return Err(ObdError::NotConnected);
        }
        match negotiate::send_text(&mut self.transport, command, timeout).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                self.lose_link(e.clone());
                Err(e)
            }
        }
    }

    async fn send_async(&mut self, command: String) {
        let accepted = self.state == ConnectionState::Ready
            && !self.decoder.is_searching()
            && self.pending.is_none();
        if !accepted {
            debug!("Dropping async command {} ({})", command, self.state);
            self.finish(command, CompletionOutcome::Cancelled);
            return;
        }

        let mut line = command.clone().into_bytes();
        line.push(TERMINATOR);

        self.pending = Some(PendingCommand {
            pid: normalize_pid(&command),
            command,
            deadline: Instant::now() + self.config.watchdog(),
        });

        if let Err(e) = self.transport.write(&line).await {
            self.lose_link(e);
        }
    }

    fn expire_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            debug!("Watchdog expired for {}", pending.command);
            self.finish(pending.command, CompletionOutcome::TimedOut);
        }
    }

    fn on_read(&mut self, read: Result<Vec<u8>, ObdError>) {
        match read {
            Ok(bytes) => {
                for frame in self.frames.push(&bytes) {
                    self.dispatch(&frame);
                }
            }
            Err(e) => self.lose_link(e),
        }
    }

    fn dispatch(&mut self, frame: &str) {
        let outcome = self.decoder.decode(frame);
        self.publish_searching(self.decoder.is_searching());

        match outcome {
            Ok(FrameOutcome::Searching) => trace!("Adapter searching for protocol"),
            Ok(FrameOutcome::Decoded(value)) => {
                let pid = value.pid.clone();
                self.emit(EngineEvent::Decoded(value));
                self.complete_pending(&pid);
            }
            Ok(FrameOutcome::Rejected { pid, error }) => {
                debug!("Dropping value for PID {}: {}", pid, error);
                self.complete_pending(&pid);
            }
            Ok(FrameOutcome::Unmatched { pid }) => trace!("Ignoring reply for PID {}", pid),
            Err(e) => debug!("Dropping frame: {}", e),
        }
    }

    /// Resolve the pending async command if the adapter answered its PID
    fn complete_pending(&mut self, pid: &str) {
        if self.pending.as_ref().is_some_and(|pending| pending.pid == pid) {
            if let Some(pending) = self.pending.take() {
                self.finish(pending.command, CompletionOutcome::Replied);
            }
        }
    }

    /// Release the async slot and report the completion
    fn finish(&mut self, command: String, outcome: CompletionOutcome) {
        self.in_flight.store(false, Ordering::Release);
        self.emit(EngineEvent::CommandCompleted { command, outcome });
    }

    fn lose_link(&mut self, error: ObdError) {
        warn!("Adapter link lost: {}", error);
        self.close_link();
        self.emit(EngineEvent::Failed(error));
    }

    /// Close the transport and forget everything tied to the open link
    fn close_link(&mut self) {
        if let Some(pending) = self.pending.take() {
            self.finish(pending.command, CompletionOutcome::Cancelled);
        }
        self.transport.close();
        self.frames.clear();
        self.decoder.reset();
        self.publish_baud(None);
        self.publish_searching(false);
        self.set_state(ConnectionState::Closed);
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        debug!("Connection state {} -> {}", self.state, state);
        self.state = state;
        self.status.send_modify(|status| status.state = state);
        self.emit(EngineEvent::StateChanged(state));
    }

    fn publish_searching(&self, searching: bool) {
        self.status.send_if_modified(|status| {
            let changed = status.searching != searching;
            status.searching = searching;
            changed
        });
    }

    fn publish_baud(&self, baud_rate: Option<u32>) {
        self.status.send_modify(|status| status.baud_rate = baud_rate);
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
