//! OBD-II Error Types

use crate::expr::ExprError;
use thiserror::Error;

/// Errors that can occur while driving an ELM327 adapter
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ObdError {
    /// Serial port I/O error on an open link
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// The physical port could not be opened
    #[error("Failed to open serial port {port}: {reason}")]
    TransportOpenFailed { port: String, reason: String },

    /// No baud rate candidate produced an adapter prompt
    #[error("OBD adapter not responding")]
    AdapterNotFound,

    /// The adapter could not be moved to a faster baud rate
    #[error("Baud rate upgrade failed: {0}")]
    BaudUpgradeFailed(String),

    /// An init command was not acknowledged with OK
    #[error("Adapter rejected init command {command}: {reply:?}")]
    InitializationFailed { command: String, reply: String },

    /// Response frame too short or missing the mode response prefix
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Operation requires an open link
    #[error("Not connected to OBD adapter")]
    NotConnected,

    /// Catalog failed validation
    #[error("Invalid command catalog: {0}")]
    InvalidCatalog(String),

    /// Conversion expression failed to parse or evaluate
    #[error("Conversion error: {0}")]
    Conversion(#[from] ExprError),

    /// The I/O executor is no longer running
    #[error("OBD engine stopped")]
    EngineStopped,
}

impl From<std::io::Error> for ObdError {
    fn from(err: std::io::Error) -> Self {
        ObdError::SerialError(err.to_string())
    }
}

impl From<tokio_serial::Error> for ObdError {
    fn from(err: tokio_serial::Error) -> Self {
        ObdError::SerialError(err.to_string())
    }
}
