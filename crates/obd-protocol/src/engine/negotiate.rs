//! Synchronous Exchanges and Baud Negotiation
//!
//! Everything here runs on the I/O executor with direct access to the
//! transport. Replies are collected by reading until a whole window passes
//! without new bytes.

use crate::config::EngineConfig;
use crate::error::ObdError;
use crate::frame::MAX_BUFFERED_BYTES;
use crate::transport::Transport;
use crate::wire::{ACK, BASE_CLOCK, PROBE, PROMPT, TERMINATOR};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Reads attempted while flushing stale input
const MAX_DRAIN_READS: usize = 16;

/// Read until a full `window` passes with no new bytes
pub(crate) async fn collect<T: Transport>(
    transport: &mut T,
    window: Duration,
) -> Result<Vec<u8>, ObdError> {
    let mut reply = Vec::new();
    loop {
        let chunk = transport.read_available(window).await?;
        if chunk.is_empty() {
            break;
        }
        reply.extend_from_slice(&chunk);
        if reply.len() > MAX_BUFFERED_BYTES {
            warn!("Reply exceeded {} bytes, truncating", MAX_BUFFERED_BYTES);
            break;
        }
    }
    Ok(reply)
}

/// Throw away whatever is already waiting on the link
pub(crate) async fn drain<T: Transport>(transport: &mut T) -> Result<(), ObdError> {
    for _ in 0..MAX_DRAIN_READS {
        if transport.bytes_available() == 0 {
            break;
        }
        transport.read_available(Duration::ZERO).await?;
    }
    Ok(())
}

/// Write raw bytes and collect the reply
pub(crate) async fn exchange<T: Transport>(
    transport: &mut T,
    bytes: &[u8],
    window: Duration,
) -> Result<Vec<u8>, ObdError> {
    transport.write(bytes).await?;
    collect(transport, window).await
}

/// Send one command line and return the reply without trailing
/// terminators or prompts. A silent adapter yields an empty string.
pub(crate) async fn send_text<T: Transport>(
    transport: &mut T,
    command: &str,
    window: Duration,
) -> Result<String, ObdError> {
    let mut line = command.as_bytes().to_vec();
    line.push(TERMINATOR);
    let reply = exchange(transport, &line, window).await?;
    let text = String::from_utf8_lossy(&reply);
    Ok(strip_trailer(&text).to_string())
}

fn strip_trailer(text: &str) -> &str {
    text.trim_end_matches(|c: char| matches!(c, '\r' | '\n' | ' ') || c == PROMPT as char)
}

/// Non-empty reply lines with the command echo removed
pub(crate) fn reply_lines(reply: &str, command: &str) -> Vec<String> {
    let mut lines: Vec<String> = reply
        .split(|c: char| c == '\r' || c == '\n')
        .map(|l| l.trim_matches(|c: char| c.is_whitespace() || c == PROMPT as char))
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    if lines
        .first()
        .is_some_and(|first| first.eq_ignore_ascii_case(command.trim()))
    {
        lines.remove(0);
    }
    lines
}

/// Whether a reply acknowledges its command
pub(crate) fn acknowledged(reply: &str, command: &str) -> bool {
    reply_lines(reply, command)
        .iter()
        .any(|line| line.to_ascii_uppercase().contains(ACK))
}

/// Find the baud rate the adapter is listening on.
///
/// Each candidate is tried once, in order; the first one whose reply ends in
/// a prompt is kept as the local rate.
pub(crate) async fn discover<T: Transport>(
    transport: &mut T,
    candidates: &[u32],
    window: Duration,
) -> Result<u32, ObdError> {
    for &rate in candidates {
        transport.set_baud_rate(rate)?;
        drain(transport).await?;

        let reply = exchange(transport, &PROBE, window).await?;
        let answered = reply
            .iter()
            .rev()
            .find(|b| !b.is_ascii_whitespace())
            .is_some_and(|b| *b == PROMPT);

        if answered {
            info!("Adapter found at {} baud", rate);
            return Ok(rate);
        }
        debug!("No prompt at {} baud", rate);
    }
    Err(ObdError::AdapterNotFound)
}

/// Ask the adapter to identify itself; the last reply line is the identity
pub(crate) async fn identify<T: Transport>(
    transport: &mut T,
    window: Duration,
) -> Result<String, ObdError> {
    let reply = send_text(transport, "ATI", window).await?;
    Ok(reply_lines(&reply, "ATI").pop().unwrap_or_default())
}

/// `ATBRD` divisor for a target rate, if the adapter can express it
pub(crate) fn baud_divisor(rate: u32) -> Option<u8> {
    if rate == 0 {
        return None;
    }
    let divisor = (BASE_CLOCK as f64 / rate as f64).round();
    if (1.0..=255.0).contains(&divisor) {
        Some(divisor as u8)
    } else {
        None
    }
}

/// Move the adapter to the fastest rate both ends can carry.
///
/// Each attempt needs the adapter to acknowledge `ATBRD` and then to repeat
/// its identity at the new rate; otherwise the previous rate is restored and
/// the next slower candidate is tried.
pub(crate) async fn upgrade<T: Transport>(
    transport: &mut T,
    config: &EngineConfig,
    identity: &str,
) -> Result<u32, ObdError> {
    let current = transport.baud_rate();
    if identity.is_empty() {
        return Err(ObdError::BaudUpgradeFailed(
            "adapter did not identify itself".to_string(),
        ));
    }

    let brt = format!("ATBRT{:02X}", config.baud_change_window_units());
    let reply = send_text(transport, &brt, config.command_timeout()).await?;
    if !acknowledged(&reply, &brt) {
        return Err(ObdError::BaudUpgradeFailed(format!(
            "{} not acknowledged",
            brt
        )));
    }

    let mut candidates: Vec<u32> = config
        .baud_candidates
        .iter()
        .copied()
        .filter(|rate| *rate > current && *rate <= config.max_baud)
        .collect();
    candidates.sort_unstable_by(|a, b| b.cmp(a));
    candidates.dedup();

    for rate in candidates {
        let Some(divisor) = baud_divisor(rate) else {
            continue;
        };

        let brd = format!("ATBRD{:02X}", divisor);
        let reply = send_text(transport, &brd, config.command_timeout()).await?;
        if !acknowledged(&reply, &brd) {
            debug!("Adapter refused {} baud", rate);
            continue;
        }

        transport.set_baud_rate(rate)?;
        let echoed = collect(transport, config.baud_switch_timeout()).await?;
        if String::from_utf8_lossy(&echoed).contains(identity) {
            transport.write(&[TERMINATOR]).await?;
            collect(transport, config.command_timeout()).await?;
            info!("Baud rate upgraded from {} to {}", current, rate);
            return Ok(rate);
        }

        debug!("No identity echo at {} baud, falling back", rate);
        transport.set_baud_rate(current)?;
        // Let the adapter's confirmation window lapse before the next attempt
        tokio::time::sleep(config.baud_change_window()).await;
        drain(transport).await?;
    }

    Err(ObdError::BaudUpgradeFailed(format!(
        "no rate above {} confirmed",
        current
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{SimulatedElm327, SimulatorConfig};

    #[test]
    fn test_baud_divisor() {
        assert_eq!(baud_divisor(500_000), Some(8));
        assert_eq!(baud_divisor(2_000_000), Some(2));
        assert_eq!(baud_divisor(115_200), Some(35));
        assert_eq!(baud_divisor(9_600), None);
        assert_eq!(baud_divisor(0), None);
    }

    #[test]
    fn test_reply_lines_drop_echo() {
        assert_eq!(
            reply_lines("ATI\rELM327 v1.5\r\n\r\n>", "ATI"),
            vec!["ELM327 v1.5".to_string()]
        );
        assert_eq!(reply_lines("OK\r\r>", "ATE0"), vec!["OK".to_string()]);
        assert!(reply_lines("\r\r>>>", "ATI").is_empty());
    }

    #[test]
    fn test_acknowledged() {
        assert!(acknowledged("ATL0\rOK\r\n\r\n>", "ATL0"));
        assert!(!acknowledged("ATSP0\r?\r\n\r\n>", "ATSP0"));
        assert!(!acknowledged("", "ATE0"));
    }

    #[test]
    fn test_strip_trailer() {
        assert_eq!(strip_trailer("ELM327 v1.5\r\r>>>"), "ELM327 v1.5");
        assert_eq!(strip_trailer("41 0D 40 \r\n>"), "41 0D 40");
        assert_eq!(strip_trailer(""), "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_only_matching_rate() {
        let mut sim = SimulatedElm327::new(SimulatorConfig {
            adapter_baud: 57_600,
            ..Default::default()
        });
        let probe = sim.probe();
        sim.open("sim").unwrap();

        let rate = discover(&mut sim, &crate::wire::BAUD_CANDIDATES, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(rate, 57_600);
        assert_eq!(
            probe.baud_history(),
            vec![2_000_000, 1_000_000, 500_000, 230_400, 115_200, 57_600]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_gives_up() {
        let mut sim = SimulatedElm327::new(SimulatorConfig {
            adapter_baud: 12_345,
            ..Default::default()
        });
        sim.open("sim").unwrap();
        let result = discover(&mut sim, &[38_400, 9_600], Duration::from_millis(100)).await;
        assert_eq!(result, Err(ObdError::AdapterNotFound));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upgrade_picks_fastest_carried_rate() {
        let mut sim = SimulatedElm327::new(SimulatorConfig {
            max_physical_baud: 500_000,
            ..Default::default()
        });
        let probe = sim.probe();
        sim.open("sim").unwrap();
        sim.set_baud_rate(38_400).unwrap();

        let config = EngineConfig::default();
        let identity = identify(&mut sim, config.command_timeout()).await.unwrap();
        assert_eq!(identity, "ELM327 v1.5");

        let rate = upgrade(&mut sim, &config, &identity).await.unwrap();
        assert_eq!(rate, 500_000);
        assert_eq!(probe.adapter_baud(), 500_000);
        assert!(probe.commands().contains(&"ATBRT64".to_string()));
        assert!(probe.commands().contains(&"ATBRD02".to_string()));
        assert!(probe.commands().contains(&"ATBRD08".to_string()));

        // Link still usable at the new rate
        let reply = send_text(&mut sim, "ATI", config.command_timeout()).await.unwrap();
        assert!(reply.contains("ELM327"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upgrade_restores_rate_on_failure() {
        let mut sim = SimulatedElm327::new(SimulatorConfig::default());
        let probe = sim.probe();
        sim.open("sim").unwrap();
        sim.set_baud_rate(38_400).unwrap();

        let config = EngineConfig::default();
        let result = upgrade(&mut sim, &config, "ELM327 v1.5").await;
        assert!(matches!(result, Err(ObdError::BaudUpgradeFailed(_))));
        assert_eq!(sim.baud_rate(), 38_400);
        assert_eq!(probe.adapter_baud(), 38_400);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upgrade_refused_by_adapter() {
        let mut sim = SimulatedElm327::new(SimulatorConfig {
            accepts_baud_change: false,
            max_physical_baud: 2_000_000,
            ..Default::default()
        });
        sim.open("sim").unwrap();
        sim.set_baud_rate(38_400).unwrap();

        let config = EngineConfig::default();
        let result = upgrade(&mut sim, &config, "ELM327 v1.5").await;
        assert!(matches!(result, Err(ObdError::BaudUpgradeFailed(_))));
        assert_eq!(sim.baud_rate(), 38_400);
    }
}
