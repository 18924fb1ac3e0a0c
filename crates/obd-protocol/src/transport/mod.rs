//! Byte-Stream Transports
//!
//! A transport owns the physical link to the adapter and knows nothing about
//! the protocol spoken over it. Every method is called from the I/O executor
//! task only; the engine never shares a transport between tasks.

mod serial;
mod simulated;

pub use serial::SerialTransport;
pub use simulated::{SimulatedElm327, SimulatorConfig, SimulatorProbe};

use crate::error::ObdError;
use std::future::Future;
use std::time::Duration;

/// Physical link to an ELM327 adapter
pub trait Transport: Send + 'static {
    /// Open the named port (8N1, no flow control) at the current baud rate
    fn open(&mut self, port: &str) -> Result<(), ObdError>;

    /// Close the port; a no-op when already closed
    fn close(&mut self);

    /// Whether the port is open
    fn is_open(&self) -> bool;

    /// Change the local baud rate, in place if the port is open
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), ObdError>;

    /// Current local baud rate
    fn baud_rate(&self) -> u32;

    /// Write all bytes to the link
    fn write(&mut self, bytes: &[u8]) -> impl Future<Output = Result<(), ObdError>> + Send;

    /// Wait up to `timeout` for data and return what arrived.
    ///
    /// Returns an empty vector on timeout. Must be cancel-safe: dropping the
    /// future before it completes loses no received bytes.
    fn read_available(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<u8>, ObdError>> + Send;

    /// Bytes that can be read without waiting
    fn bytes_available(&self) -> usize;
}
