//! Command Catalog
//!
//! The catalog tells the engine which AT commands bring the adapter up and how
//! each PID reply decodes. It is built once from configuration, validated, and
//! shared read-only between the I/O executor, pollers and any UI layer.

use crate::error::ObdError;
use crate::expr::Expression;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Largest reply payload that still fits the whole-value integer
pub const MAX_REPLY_LENGTH: usize = 8;

/// Mode prefix of current-data requests
pub const CURRENT_DATA_PREFIX: &str = "01";

/// Unit label that reduces a value to its lowest bit
pub const BIT_UNIT: &str = "bit";

/// Normalize a send code or reply PID for matching.
///
/// Whitespace is removed, hex is lower-cased and a leading `01` mode prefix is
/// stripped, so `"010C"`, `"01 0c"` and `"0C"` all become `"0c"`.
pub fn normalize_pid(code: &str) -> String {
    let code: String = code
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();
    match code.strip_prefix(CURRENT_DATA_PREFIX) {
        Some(rest) if !rest.is_empty() => rest.to_string(),
        _ => code,
    }
}

/// One catalog entry as written in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandDefinition {
    /// Channel name shown by consumers
    pub name: String,
    /// Command sent to the adapter, e.g. `010C`
    pub send: String,
    /// Reply payload length in bytes (0 takes everything after the PID)
    #[serde(default)]
    pub reply_length: usize,
    /// Number of poll cycles skipped between requests
    #[serde(default)]
    pub skip_count: u32,
    /// Conversion formula over `B0..B3` and `V`
    #[serde(default)]
    pub conversion: Option<String>,
    /// Unit label
    #[serde(default)]
    pub units: String,
    /// Exponential smoothing factor in (0, 1]
    #[serde(default)]
    pub smoothing: Option<f64>,
}

impl CommandDefinition {
    /// Create a definition with no conversion
    pub fn new(name: &str, send: &str, reply_length: usize) -> Self {
        Self {
            name: name.to_string(),
            send: send.to_string(),
            reply_length,
            skip_count: 0,
            conversion: None,
            units: String::new(),
            smoothing: None,
        }
    }

    /// Set the conversion formula
    pub fn with_conversion(mut self, conversion: &str) -> Self {
        self.conversion = Some(conversion.to_string());
        self
    }

    /// Set the unit label
    pub fn with_units(mut self, units: &str) -> Self {
        self.units = units.to_string();
        self
    }

    /// Set the skip count
    pub fn with_skip_count(mut self, skip_count: u32) -> Self {
        self.skip_count = skip_count;
        self
    }

    /// Set the smoothing factor
    pub fn with_smoothing(mut self, alpha: f64) -> Self {
        self.smoothing = Some(alpha);
        self
    }
}

/// Catalog contents as written in configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogDefinition {
    /// AT commands sent in order after baud negotiation
    #[serde(default)]
    pub init: Vec<String>,
    /// Decode rules in poll order
    #[serde(default)]
    pub commands: Vec<CommandDefinition>,
}

/// A validated catalog entry
#[derive(Debug, Clone, PartialEq)]
pub struct CommandDescriptor {
    name: String,
    send: String,
    reply_pid: String,
    reply_length: usize,
    skip_count: u32,
    conversion: Option<Expression>,
    units: String,
    smoothing: Option<f64>,
}

impl CommandDescriptor {
    fn from_definition(def: CommandDefinition) -> Result<Self, ObdError> {
        let send: String = def.send.chars().filter(|c| !c.is_whitespace()).collect();
        if send.is_empty() {
            return Err(ObdError::InvalidCatalog(format!(
                "command '{}' has an empty send code",
                def.name
            )));
        }
        if def.reply_length > MAX_REPLY_LENGTH {
            return Err(ObdError::InvalidCatalog(format!(
                "command '{}' reply length {} exceeds {} bytes",
                def.name, def.reply_length, MAX_REPLY_LENGTH
            )));
        }
        if let Some(alpha) = def.smoothing {
            if !(alpha > 0.0 && alpha <= 1.0) {
                return Err(ObdError::InvalidCatalog(format!(
                    "command '{}' smoothing factor {} not in (0, 1]",
                    def.name, alpha
                )));
            }
        }

        let conversion = match def.conversion.as_deref().map(str::trim) {
            Some(src) if !src.is_empty() => Some(Expression::parse(src).map_err(|e| {
                ObdError::InvalidCatalog(format!("command '{}': {}", def.name, e))
            })?),
            _ => None,
        };

        Ok(Self {
            reply_pid: normalize_pid(&send),
            name: def.name,
            send,
            reply_length: def.reply_length,
            skip_count: def.skip_count,
            conversion,
            units: def.units,
            smoothing: def.smoothing,
        })
    }

    /// Channel name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Command sent to the adapter
    pub fn send(&self) -> &str {
        &self.send
    }

    /// Normalized PID used to match replies
    pub fn reply_pid(&self) -> &str {
        &self.reply_pid
    }

    /// Expected reply payload length in bytes
    pub fn reply_length(&self) -> usize {
        self.reply_length
    }

    /// Number of poll cycles skipped between requests
    pub fn skip_count(&self) -> u32 {
        self.skip_count
    }

    /// Conversion formula, if any
    pub fn conversion(&self) -> Option<&Expression> {
        self.conversion.as_ref()
    }

    /// Unit label
    pub fn units(&self) -> &str {
        &self.units
    }

    /// Whether only the lowest bit of the value is reported
    pub fn is_bit(&self) -> bool {
        self.units.eq_ignore_ascii_case(BIT_UNIT)
    }

    /// Smoothing factor, if smoothing is enabled
    pub fn smoothing(&self) -> Option<f64> {
        self.smoothing
    }
}

/// Validated, immutable command catalog
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(try_from = "CatalogDefinition")]
pub struct CommandCatalog {
    init: Vec<String>,
    commands: Vec<CommandDescriptor>,
}

impl CommandCatalog {
    /// Build a catalog, rejecting duplicate reply PIDs and bad formulas
    pub fn new(init: Vec<String>, commands: Vec<CommandDefinition>) -> Result<Self, ObdError> {
        let mut seen = HashSet::new();
        let mut descriptors = Vec::with_capacity(commands.len());

        for def in commands {
            let descriptor = CommandDescriptor::from_definition(def)?;
            if !seen.insert(descriptor.reply_pid.clone()) {
                return Err(ObdError::InvalidCatalog(format!(
                    "duplicate PID '{}' ({})",
                    descriptor.reply_pid, descriptor.name
                )));
            }
            descriptors.push(descriptor);
        }

        let init = init
            .into_iter()
            .map(|cmd| cmd.trim().to_string())
            .filter(|cmd| !cmd.is_empty())
            .collect();

        Ok(Self {
            init,
            commands: descriptors,
        })
    }

    /// Default init sequence: linefeeds off, echo off, long messages, auto protocol
    pub fn default_init() -> Vec<String> {
        ["ATL0", "ATE0", "ATAL", "ATSP0"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    /// Catalog of common mode 01 PIDs with SAE J1979 formulas
    pub fn standard() -> Self {
        let commands = vec![
            CommandDefinition::new("speed", "010D", 1).with_units("km/h"),
            CommandDefinition::new("rpm", "010C", 2)
                .with_conversion("(B0*256+B1)/4")
                .with_units("rpm"),
            CommandDefinition::new("coolant_temp", "0105", 1)
                .with_conversion("B0-40")
                .with_units("C")
                .with_skip_count(4),
            CommandDefinition::new("intake_air_temp", "010F", 1)
                .with_conversion("B0-40")
                .with_units("C")
                .with_skip_count(4),
            CommandDefinition::new("ambient_air_temp", "0146", 1)
                .with_conversion("B0-40")
                .with_units("C")
                .with_skip_count(9),
            CommandDefinition::new("fuel_level", "012F", 1)
                .with_conversion("B0*100/255")
                .with_units("%")
                .with_skip_count(9),
            CommandDefinition::new("engine_load", "0104", 1)
                .with_conversion("B0*100/255")
                .with_units("%")
                .with_skip_count(1),
            CommandDefinition::new("maf", "0110", 2)
                .with_conversion("(B0*256+B1)/100")
                .with_units("g/s")
                .with_skip_count(1),
            CommandDefinition::new("throttle", "0111", 1)
                .with_conversion("B0*100/255")
                .with_units("%")
                .with_skip_count(1),
            CommandDefinition::new("short_fuel_trim", "0106", 1)
                .with_conversion("(B0-128)*100/128")
                .with_units("%")
                .with_skip_count(4),
        ];

        // Every entry above is well-formed; fall back to an empty catalog
        // rather than panicking if that ever changes.
        Self::new(Self::default_init(), commands).unwrap_or_default()
    }

    /// Init commands in send order
    pub fn init_commands(&self) -> &[String] {
        &self.init
    }

    /// Descriptors in poll order
    pub fn commands(&self) -> &[CommandDescriptor] {
        &self.commands
    }

    /// Find the descriptor whose reply PID matches `pid` (any case, optional `01` prefix)
    pub fn find_by_pid(&self, pid: &str) -> Option<&CommandDescriptor> {
        let pid = normalize_pid(pid);
        self.commands.iter().find(|c| c.reply_pid == pid)
    }

    /// Number of descriptors
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether the catalog has no descriptors
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl TryFrom<CatalogDefinition> for CommandCatalog {
    type Error = ObdError;

    fn try_from(def: CatalogDefinition) -> Result<Self, Self::Error> {
        CommandCatalog::new(def.init, def.commands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_pid() {
        assert_eq!(normalize_pid("010C"), "0c");
        assert_eq!(normalize_pid("01 0d"), "0d");
        assert_eq!(normalize_pid("0C"), "0c");
        // A bare "01" is PID 01, not a prefix
        assert_eq!(normalize_pid("01"), "01");
    }

    #[test]
    fn test_standard_catalog() {
        let catalog = CommandCatalog::standard();
        assert_eq!(catalog.len(), 10);
        assert_eq!(catalog.init_commands(), ["ATL0", "ATE0", "ATAL", "ATSP0"]);

        let rpm = catalog.find_by_pid("0C").unwrap();
        assert_eq!(rpm.name(), "rpm");
        assert_eq!(rpm.send(), "010C");
        assert_eq!(rpm.reply_length(), 2);
        assert_eq!(rpm.conversion().unwrap().source(), "(B0*256+B1)/4");
    }

    #[test]
    fn test_prefixed_and_bare_codes_match() {
        let catalog = CommandCatalog::new(
            vec![],
            vec![
                CommandDefinition::new("speed", "010D", 1),
                CommandDefinition::new("rpm", "0C", 2),
            ],
        )
        .unwrap();
        assert_eq!(catalog.find_by_pid("0d").unwrap().name(), "speed");
        assert_eq!(catalog.find_by_pid("0C").unwrap().name(), "rpm");
        assert!(catalog.find_by_pid("05").is_none());
    }

    #[test]
    fn test_duplicate_pid_rejected() {
        let result = CommandCatalog::new(
            vec![],
            vec![
                CommandDefinition::new("rpm", "010C", 2),
                CommandDefinition::new("rpm_again", "0C", 2),
            ],
        );
        assert!(matches!(result, Err(ObdError::InvalidCatalog(_))));
    }

    #[test]
    fn test_invalid_definitions_rejected() {
        let bad = [
            CommandDefinition::new("empty", " ", 1),
            CommandDefinition::new("long", "0100", 9),
            CommandDefinition::new("formula", "010C", 2).with_conversion("B0 +* 2"),
            CommandDefinition::new("smooth", "010D", 1).with_smoothing(0.0),
        ];
        for def in bad {
            let name = def.name.clone();
            assert!(
                CommandCatalog::new(vec![], vec![def]).is_err(),
                "{} should be rejected",
                name
            );
        }
    }

    #[test]
    fn test_blank_conversion_means_raw() {
        let catalog = CommandCatalog::new(
            vec![" ATE0 ".to_string(), String::new()],
            vec![CommandDefinition::new("speed", "010D", 1).with_conversion("  ")],
        )
        .unwrap();
        assert!(catalog.commands()[0].conversion().is_none());
        assert_eq!(catalog.init_commands(), ["ATE0"]);
    }

    #[test]
    fn test_bit_unit() {
        let catalog = CommandCatalog::new(
            vec![],
            vec![CommandDefinition::new("mil", "0101", 4).with_units("bit")],
        )
        .unwrap();
        assert!(catalog.commands()[0].is_bit());
    }
}
