//! ELM327 OBD-II Driver
//!
//! This crate drives ELM327-compatible OBD-II adapters over a serial link. It
//! finds the adapter's baud rate, negotiates a faster one where the link allows
//! it, runs the init sequence and then exchanges mode 01 requests whose
//! replies are decoded through a configurable command catalog.
//!
//! All transport access happens on a single I/O executor task; callers talk to
//! it through the cloneable [`ObdEngine`] handle.

mod catalog;
mod config;
mod decode;
mod engine;
mod error;
mod expr;
mod filter;
mod frame;
pub mod transport;

pub use catalog::{
    normalize_pid, CatalogDefinition, CommandCatalog, CommandDefinition, CommandDescriptor,
};
pub use config::EngineConfig;
pub use decode::{ChannelValue, DecodedValue, Decoder, FrameOutcome};
pub use engine::{CompletionOutcome, ConnectionState, EngineEvent, LinkStatus, ObdEngine};
pub use error::ObdError;
pub use expr::{ExprError, Expression, Payload, Variable};
pub use filter::ExponentialFilter;
pub use frame::FrameBuffer;
pub use transport::{SerialTransport, SimulatedElm327, SimulatorConfig, SimulatorProbe, Transport};

/// Baud rate ELM327 adapters ship with
pub const DEFAULT_BAUD_RATE: u32 = 38_400;

/// ELM327 wire constants
pub mod wire {
    /// Command terminator
    pub const TERMINATOR: u8 = crate::frame::TERMINATOR;
    /// Ready prompt
    pub const PROMPT: u8 = crate::frame::PROMPT;
    /// Non-command bytes sent while probing a baud rate; the adapter answers `?`
    pub const PROBE: [u8; 3] = [0x7F, 0x7F, TERMINATOR];
    /// Token every acknowledged AT command replies with
    pub const ACK: &str = "OK";
    /// Clock divided by the `ATBRD` argument
    pub const BASE_CLOCK: u32 = 4_000_000;
    /// Baud rates tried during discovery, fastest first
    pub const BAUD_CANDIDATES: [u32; 9] = [
        2_000_000, 1_000_000, 500_000, 230_400, 115_200, 57_600, 38_400, 19_200, 9_600,
    ];
}
