//! Response Frame Decoding
//!
//! Turns cleaned response lines into channel values using the catalog.

use crate::catalog::{CommandCatalog, CommandDescriptor};
use crate::error::ObdError;
use crate::expr::Payload;
use crate::filter::ExponentialFilter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// Prefix of a positive mode 01 response
pub const RESPONSE_PREFIX: &str = "41";

/// Token the adapter prints while it probes for a vehicle protocol
pub const SEARCHING_TOKEN: &str = "SEARCHING";

/// Prefix, PID and at least one payload byte
const MIN_FRAME_LEN: usize = 6;

/// A decoded channel value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ChannelValue {
    /// Payload read as a plain hex integer
    Raw(u64),
    /// Result of a conversion formula or smoothing
    Scaled(f64),
}

impl ChannelValue {
    /// Value as a float
    pub fn as_f64(&self) -> f64 {
        match self {
            ChannelValue::Raw(v) => *v as f64,
            ChannelValue::Scaled(v) => *v,
        }
    }
}

/// A value decoded from one response frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedValue {
    /// Catalog channel name
    pub channel: String,
    /// Normalized PID the value was decoded from
    pub pid: String,
    /// Decoded value
    pub value: ChannelValue,
    /// Unit label from the catalog
    pub units: String,
    /// Timestamp when the frame was decoded (Unix ms)
    pub timestamp_ms: u64,
}

/// What a frame turned out to be
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// Adapter is still searching for a vehicle protocol
    Searching,
    /// Frame matched a catalog entry
    Decoded(DecodedValue),
    /// Well-formed response for a PID the catalog does not list
    Unmatched { pid: String },
    /// Frame matched a catalog entry but its payload could not be converted
    Rejected { pid: String, error: ObdError },
}

/// Decodes frames against a catalog; owned by the I/O executor
pub struct Decoder {
    catalog: Arc<CommandCatalog>,
    searching: bool,
    filters: HashMap<String, ExponentialFilter>,
}

impl Decoder {
    /// Create a decoder for a catalog
    pub fn new(catalog: Arc<CommandCatalog>) -> Self {
        Self {
            catalog,
            searching: false,
            filters: HashMap::new(),
        }
    }

    /// Whether the last frame reported a protocol search
    pub fn is_searching(&self) -> bool {
        self.searching
    }

    /// Clear the searching flag and all smoothing state
    pub fn reset(&mut self) {
        self.searching = false;
        self.filters.clear();
    }

    /// Decode one cleaned frame
    pub fn decode(&mut self, frame: &str) -> Result<FrameOutcome, ObdError> {
        let frame: String = frame.chars().filter(|c| !c.is_whitespace()).collect();

        if frame.contains(SEARCHING_TOKEN) {
            self.searching = true;
            return Ok(FrameOutcome::Searching);
        }
        self.searching = false;

        if !frame.is_ascii() || !frame.starts_with(RESPONSE_PREFIX) || frame.len() < MIN_FRAME_LEN
        {
            return Err(ObdError::MalformedFrame(frame));
        }

        let pid = frame[2..4].to_ascii_lowercase();
        let catalog = Arc::clone(&self.catalog);
        let Some(descriptor) = catalog.find_by_pid(&pid) else {
            trace!("No catalog entry for PID {}", pid);
            return Ok(FrameOutcome::Unmatched { pid });
        };

        let value = match self.convert(descriptor, &frame[4..]) {
            Ok(value) => value,
            Err(error) => return Ok(FrameOutcome::Rejected { pid, error }),
        };

        Ok(FrameOutcome::Decoded(DecodedValue {
            channel: descriptor.name().to_string(),
            pid,
            value,
            units: descriptor.units().to_string(),
            timestamp_ms: now_ms(),
        }))
    }

    fn convert(
        &mut self,
        descriptor: &CommandDescriptor,
        data: &str,
    ) -> Result<ChannelValue, ObdError> {
        let hex = match descriptor.reply_length() {
            0 => data,
            n => &data[..(2 * n).min(data.len())],
        };
        let whole = u64::from_str_radix(hex, 16)
            .map_err(|_| ObdError::MalformedFrame(format!("payload '{}' is not hex", hex)))?;

        let value = match descriptor.conversion() {
            None => ChannelValue::Raw(whole),
            Some(expr) => {
                let bytes = hex_bytes(hex);
                ChannelValue::Scaled(expr.evaluate(&Payload::new(&bytes, whole))?)
            }
        };

        if descriptor.is_bit() {
            return Ok(ChannelValue::Raw((value.as_f64() as i64 & 1) as u64));
        }

        match descriptor.smoothing() {
            Some(alpha) => {
                let filter = self
                    .filters
                    .entry(descriptor.name().to_string())
                    .or_insert_with(|| ExponentialFilter::new(alpha));
                Ok(ChannelValue::Scaled(filter.filter(value.as_f64())))
            }
            None => Ok(value),
        }
    }
}

/// Split a hex string into bytes; a trailing odd digit is ignored
fn hex_bytes(hex: &str) -> Vec<u8> {
    hex.as_bytes()
        .chunks_exact(2)
        .filter_map(|pair| std::str::from_utf8(pair).ok())
        .filter_map(|pair| u8::from_str_radix(pair, 16).ok())
        .collect()
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CommandDefinition;

    fn decoder(commands: Vec<CommandDefinition>) -> Decoder {
        Decoder::new(Arc::new(CommandCatalog::new(vec![], commands).unwrap()))
    }

    fn decoded(outcome: FrameOutcome) -> DecodedValue {
        match outcome {
            FrameOutcome::Decoded(value) => value,
            other => panic!("expected a decoded value, got {:?}", other),
        }
    }

    #[test]
    fn test_raw_two_byte_value() {
        let mut decoder = decoder(vec![CommandDefinition::new("rpm", "0C", 2)]);
        let value = decoded(decoder.decode("41 0C 1A F8").unwrap());
        assert_eq!(value.channel, "rpm");
        assert_eq!(value.pid, "0c");
        assert_eq!(value.value, ChannelValue::Raw(6904));
    }

    #[test]
    fn test_raw_one_byte_value() {
        let mut decoder = decoder(vec![CommandDefinition::new("speed", "0D", 1)]);
        let value = decoded(decoder.decode("410D40").unwrap());
        assert_eq!(value.value, ChannelValue::Raw(64));
    }

    #[test]
    fn test_conversion_formula() {
        let mut decoder = decoder(vec![
            CommandDefinition::new("rpm", "010C", 2).with_conversion("(B0*256+B1)/4")
        ]);
        let value = decoded(decoder.decode("41 0C 1A F8").unwrap());
        assert_eq!(value.value, ChannelValue::Scaled(1726.0));
    }

    #[test]
    fn test_payload_sliced_to_reply_length() {
        // Trailing bytes beyond replyLength are ignored
        let mut decoder = decoder(vec![CommandDefinition::new("speed", "010D", 1)]);
        let value = decoded(decoder.decode("410D40FFFF").unwrap());
        assert_eq!(value.value, ChannelValue::Raw(0x40));
    }

    #[test]
    fn test_zero_reply_length_takes_rest() {
        let mut decoder = decoder(vec![CommandDefinition::new("raw", "0110", 0)]);
        let value = decoded(decoder.decode("41100102").unwrap());
        assert_eq!(value.value, ChannelValue::Raw(0x0102));
    }

    #[test]
    fn test_searching_sets_flag() {
        let mut decoder = decoder(vec![CommandDefinition::new("speed", "010D", 1)]);
        assert_eq!(decoder.decode("SEARCHING...").unwrap(), FrameOutcome::Searching);
        assert!(decoder.is_searching());

        decoder.decode("410D40").unwrap();
        assert!(!decoder.is_searching());
    }

    #[test]
    fn test_malformed_frames() {
        let mut decoder = decoder(vec![CommandDefinition::new("speed", "010D", 1)]);
        for frame in ["NODATA", "410D", "7F0112", "OK"] {
            assert!(
                matches!(decoder.decode(frame), Err(ObdError::MalformedFrame(_))),
                "{} should be malformed",
                frame
            );
        }
        assert!(matches!(
            decoder.decode("410DZZ"),
            Ok(FrameOutcome::Rejected { pid, error: ObdError::MalformedFrame(_) }) if pid == "0d"
        ));
    }

    #[test]
    fn test_malformed_frame_clears_searching() {
        let mut decoder = decoder(vec![]);
        decoder.decode("SEARCHING...").unwrap();
        assert!(decoder.decode("UNABLETOCONNECT").is_err());
        assert!(!decoder.is_searching());
    }

    #[test]
    fn test_unknown_pid_is_not_an_error() {
        let mut decoder = decoder(vec![CommandDefinition::new("speed", "010D", 1)]);
        assert_eq!(
            decoder.decode("410C1AF8").unwrap(),
            FrameOutcome::Unmatched {
                pid: "0c".to_string()
            }
        );
    }

    #[test]
    fn test_bit_unit_keeps_lowest_bit() {
        let mut decoder = decoder(vec![
            CommandDefinition::new("mil", "0101", 1).with_units("bit")
        ]);
        assert_eq!(
            decoded(decoder.decode("410183").unwrap()).value,
            ChannelValue::Raw(1)
        );
        assert_eq!(
            decoded(decoder.decode("410182").unwrap()).value,
            ChannelValue::Raw(0)
        );
    }

    #[test]
    fn test_smoothing_is_per_channel_and_resettable() {
        let mut decoder = decoder(vec![
            CommandDefinition::new("speed", "010D", 1).with_smoothing(0.5),
            CommandDefinition::new("rpm", "010C", 2),
        ]);
        decoder.decode("410D10").unwrap();
        let smoothed = decoded(decoder.decode("410D20").unwrap());
        assert_eq!(smoothed.value, ChannelValue::Scaled(24.0));

        // Unsmoothed channels are untouched
        let rpm = decoded(decoder.decode("410C0010").unwrap());
        assert_eq!(rpm.value, ChannelValue::Raw(16));

        decoder.reset();
        let fresh = decoded(decoder.decode("410D20").unwrap());
        assert_eq!(fresh.value, ChannelValue::Scaled(32.0));
    }

    #[test]
    fn test_division_by_zero_is_reported() {
        let mut decoder = decoder(vec![
            CommandDefinition::new("ratio", "0110", 2).with_conversion("B0/B1")
        ]);
        assert!(matches!(
            decoder.decode("41100100"),
            Ok(FrameOutcome::Rejected { pid, error: ObdError::Conversion(_) }) if pid == "10"
        ));
    }
}
