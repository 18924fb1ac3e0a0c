//! Serial Port Transport

use super::Transport;
use crate::error::ObdError;
use crate::DEFAULT_BAUD_RATE;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, info};

/// Read chunk size
const READ_CHUNK: usize = 256;

/// Transport over a native serial port
pub struct SerialTransport {
    /// Open port, if any
    stream: Option<SerialStream>,
    /// Device path of the open port (e.g., "/dev/ttyUSB0" or "COM3")
    port_name: Option<String>,
    /// Local baud rate
    baud_rate: u32,
}

impl SerialTransport {
    /// Create a closed transport at the default baud rate
    pub fn new() -> Self {
        Self {
            stream: None,
            port_name: None,
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }

    /// Device path of the open port
    pub fn port_name(&self) -> Option<&str> {
        self.port_name.as_deref()
    }
}

impl Default for SerialTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SerialTransport {
    fn open(&mut self, port: &str) -> Result<(), ObdError> {
        self.close();
        info!("Opening serial port {} at {} baud", port, self.baud_rate);

        let stream = tokio_serial::new(port, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| ObdError::TransportOpenFailed {
                port: port.to_string(),
                reason: e.to_string(),
            })?;

        self.stream = Some(stream);
        self.port_name = Some(port.to_string());
        Ok(())
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            info!(
                "Closed serial port {}",
                self.port_name.as_deref().unwrap_or("?")
            );
        }
        self.port_name = None;
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), ObdError> {
        if let Some(stream) = self.stream.as_mut() {
            stream.set_baud_rate(baud_rate)?;
        }
        debug!("Local baud rate set to {}", baud_rate);
        self.baud_rate = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), ObdError> {
        let stream = self.stream.as_mut().ok_or(ObdError::NotConnected)?;
        stream.write_all(bytes).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn read_available(&mut self, timeout: Duration) -> Result<Vec<u8>, ObdError> {
        let stream = self.stream.as_mut().ok_or(ObdError::NotConnected)?;
        let mut buf = [0u8; READ_CHUNK];
        match tokio::time::timeout(timeout, stream.read(&mut buf)).await {
            Err(_) => Ok(Vec::new()),
            Ok(Ok(0)) => Err(ObdError::SerialError("serial port closed".to_string())),
            Ok(Ok(n)) => Ok(buf[..n].to_vec()),
            Ok(Err(e)) => Err(e.into()),
        }
    }

    fn bytes_available(&self) -> usize {
        self.stream
            .as_ref()
            .and_then(|s| s.bytes_to_read().ok())
            .map(|n| n as usize)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closed_transport() {
        let mut transport = SerialTransport::new();
        assert!(!transport.is_open());
        assert_eq!(transport.bytes_available(), 0);
        assert_eq!(
            transport.write(b"ATI\r").await,
            Err(ObdError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_baud_rate_kept_while_closed() {
        let mut transport = SerialTransport::new();
        transport.set_baud_rate(115_200).unwrap();
        assert_eq!(transport.baud_rate(), 115_200);
    }

    #[tokio::test]
    async fn test_open_missing_port_fails() {
        let mut transport = SerialTransport::new();
        let result = transport.open("/dev/does-not-exist-obd");
        assert!(matches!(
            result,
            Err(ObdError::TransportOpenFailed { .. })
        ));
        assert!(!transport.is_open());
    }
}
