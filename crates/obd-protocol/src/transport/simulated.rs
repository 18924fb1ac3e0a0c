//! Simulated ELM327 Adapter
//!
//! An in-memory transport that behaves like an ELM327 behind a serial link:
//! it only understands the host at its own baud rate, echoes commands until
//! `ATE0`, terminates replies with a `>` prompt, supports the `ATBRD` baud
//! switch handshake and answers mode 01 requests from a PID table. Used by the
//! engine tests and by demo mode when no hardware is attached.

use super::Transport;
use crate::error::ObdError;
use crate::wire::BASE_CLOCK;
use crate::DEFAULT_BAUD_RATE;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Relative baud mismatch a UART still tolerates
const BAUD_TOLERANCE: f64 = 0.03;

/// Whether two baud rates can talk to each other
fn rates_compatible(a: u32, b: u32) -> bool {
    if a == 0 || b == 0 {
        return false;
    }
    (a as f64 - b as f64).abs() / (b as f64) < BAUD_TOLERANCE
}

/// Behaviour of the simulated adapter
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Baud rate the adapter listens on at power-up
    pub adapter_baud: u32,
    /// Fastest rate the physical link actually carries
    pub max_physical_baud: u32,
    /// Whether `ATBRD` is understood at all
    pub accepts_baud_change: bool,
    /// Identification string returned by `ATI` and `ATZ`
    pub identity: String,
    /// Prompt characters appended to each reply
    pub trailing_prompts: usize,
    /// Put spaces between reply bytes, as the real adapter does by default
    pub spaces: bool,
    /// Number of data requests prefixed with `SEARCHING...`
    pub searching_replies: usize,
    /// Answer every data request with `SEARCHING...` only
    pub stuck_searching: bool,
    /// Mode 01 replies: upper-case PID -> payload hex
    pub responses: HashMap<String, String>,
    /// PIDs the adapter never answers
    pub silent_pids: HashSet<String>,
    /// AT commands answered with `?`
    pub rejected_commands: HashSet<String>,
    /// Make `open` fail
    pub fail_open: bool,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            adapter_baud: 38_400,
            max_physical_baud: 38_400,
            accepts_baud_change: true,
            identity: "ELM327 v1.5".to_string(),
            trailing_prompts: 1,
            spaces: true,
            searching_replies: 0,
            stuck_searching: false,
            responses: HashMap::new(),
            silent_pids: HashSet::new(),
            rejected_commands: HashSet::new(),
            fail_open: false,
        }
    }
}

impl SimulatorConfig {
    /// A warmed-up car at idle, answering the standard catalog
    pub fn demo() -> Self {
        let responses = [
            ("0D", "28"),   // 40 km/h
            ("0C", "1AF8"), // 1726 rpm
            ("05", "73"),   // 75 C
            ("0F", "41"),   // 25 C
            ("46", "3C"),   // 20 C
            ("2F", "99"),   // 60 %
            ("04", "4D"),   // 30 %
            ("10", "0546"), // 13.5 g/s
            ("11", "33"),   // 20 %
            ("06", "82"),   // 1.6 %
        ];
        Self {
            max_physical_baud: 115_200,
            searching_replies: 1,
            responses: responses
                .iter()
                .map(|(pid, payload)| (pid.to_string(), payload.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    /// Add a PID reply
    pub fn respond(mut self, pid: &str, payload: &str) -> Self {
        self.responses
            .insert(pid.to_ascii_uppercase(), payload.to_ascii_uppercase());
        self
    }

    /// Never answer a PID
    pub fn silent(mut self, pid: &str) -> Self {
        self.silent_pids.insert(pid.to_ascii_uppercase());
        self
    }

    /// Answer an AT command with `?`
    pub fn reject(mut self, command: &str) -> Self {
        self.rejected_commands.insert(command.to_ascii_uppercase());
        self
    }
}

/// Pending `ATBRD` switch awaiting host confirmation
#[derive(Debug, Clone, Copy)]
struct BaudSwitch {
    baud: u32,
    carried: bool,
    identity_sent: bool,
}

#[derive(Debug)]
struct SimState {
    config: SimulatorConfig,
    open: bool,
    unplugged: bool,
    host_baud: u32,
    adapter_baud: u32,
    switch: Option<BaudSwitch>,
    echo: bool,
    linefeeds: bool,
    searching_left: usize,
    inbound: Vec<u8>,
    /// Output chunks tagged with the baud rate they were sent at
    outbound: Vec<(u32, Vec<u8>)>,
    commands: Vec<String>,
    baud_history: Vec<u32>,
}

impl SimState {
    fn new(config: SimulatorConfig) -> Self {
        Self {
            open: false,
            unplugged: false,
            host_baud: DEFAULT_BAUD_RATE,
            adapter_baud: config.adapter_baud,
            switch: None,
            echo: true,
            linefeeds: true,
            searching_left: config.searching_replies,
            inbound: Vec::new(),
            outbound: Vec::new(),
            commands: Vec::new(),
            baud_history: Vec::new(),
            config,
        }
    }

    fn eol(&self) -> &'static str {
        if self.linefeeds {
            "\r\n"
        } else {
            "\r"
        }
    }

    fn emit(&mut self, text: &str) {
        let baud = self.adapter_baud;
        self.outbound.push((baud, text.as_bytes().to_vec()));
    }

    /// Reply lines followed by a blank line and the prompt
    fn reply(&mut self, lines: &[String]) {
        let eol = self.eol();
        let mut text = String::new();
        for line in lines {
            text.push_str(line);
            text.push_str(eol);
        }
        text.push_str(eol);
        text.push_str(&">".repeat(self.config.trailing_prompts));
        self.emit(&text);
    }

    fn host_write(&mut self, bytes: &[u8]) {
        if let Some(switch) = self.switch {
            if switch.carried && rates_compatible(self.host_baud, switch.baud) {
                // Host confirmed at the new rate
                self.adapter_baud = switch.baud;
                self.switch = None;
                self.inbound.clear();
                self.reply(&["OK".to_string()]);
                return;
            }
            // Adapter timed out waiting and fell back to the old rate
            self.switch = None;
        }

        if !rates_compatible(self.host_baud, self.adapter_baud) {
            return;
        }

        self.inbound.extend_from_slice(bytes);
        while let Some(end) = self.inbound.iter().position(|b| *b == b'\r') {
            let line: Vec<u8> = self.inbound.drain(..=end).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]).to_string();
            self.handle_line(&line);
        }
    }

    fn handle_line(&mut self, raw: &str) {
        if self.echo {
            let echoed = format!("{}\r", raw);
            self.emit(&echoed);
        }

        let cmd: String = raw
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_uppercase();
        self.commands.push(cmd.clone());

        if self.config.rejected_commands.contains(&cmd) {
            self.reply(&["?".to_string()]);
            return;
        }

        if let Some(at) = cmd.strip_prefix("AT") {
            self.handle_at(at);
        } else if cmd.len() == 4 && cmd.starts_with("01") && cmd.chars().all(|c| c.is_ascii_hexdigit()) {
            self.handle_data(&cmd[2..]);
        } else if cmd.is_empty() {
            self.reply(&[]);
        } else {
            self.reply(&["?".to_string()]);
        }
    }

    fn handle_at(&mut self, at: &str) {
        let identity = self.config.identity.clone();
        match at {
            "Z" => {
                self.echo = true;
                self.linefeeds = true;
                self.reply(&[String::new(), identity]);
            }
            "I" => self.reply(&[identity]),
            "E0" | "E1" => {
                self.echo = at == "E1";
                self.reply(&["OK".to_string()]);
            }
            "L0" | "L1" => {
                self.linefeeds = at == "L1";
                self.reply(&["OK".to_string()]);
            }
            _ if at.starts_with("BRD") => self.handle_baud_divisor(&at[3..]),
            _ if at.starts_with("BRT") || at.starts_with("SP") || at.starts_with('H') || at.starts_with('S') || at == "AL" || at == "D" => {
                self.reply(&["OK".to_string()]);
            }
            _ => self.reply(&["?".to_string()]),
        }
    }

    fn handle_baud_divisor(&mut self, hex: &str) {
        let divisor = match u32::from_str_radix(hex, 16) {
            Ok(d) if d > 0 && self.config.accepts_baud_change => d,
            _ => {
                self.reply(&["?".to_string()]);
                return;
            }
        };
        let target = BASE_CLOCK / divisor;
        // OK goes out at the old rate, without a prompt
        let eol = self.eol();
        self.emit(&format!("OK{}", eol));
        self.switch = Some(BaudSwitch {
            baud: target,
            carried: target <= self.config.max_physical_baud,
            identity_sent: false,
        });
    }

    fn handle_data(&mut self, pid: &str) {
        if self.config.silent_pids.contains(pid) {
            return;
        }
        if self.config.stuck_searching {
            let eol = self.eol();
            self.emit(&format!("SEARCHING...{}", eol));
            return;
        }

        let mut lines = Vec::new();
        if self.searching_left > 0 {
            self.searching_left -= 1;
            lines.push("SEARCHING...".to_string());
        }
        match self.config.responses.get(pid) {
            Some(payload) => {
                let raw = format!("41{}{}", pid, payload);
                let line = if self.config.spaces {
                    raw.as_bytes()
                        .chunks(2)
                        .map(|pair| String::from_utf8_lossy(pair).to_string())
                        .collect::<Vec<_>>()
                        .join(" ")
                } else {
                    raw
                };
                lines.push(line);
            }
            None => lines.push("NO DATA".to_string()),
        }
        self.reply(&lines);
    }

    /// Deliver whatever the host can hear at its current rate
    fn drain_for_host(&mut self) -> Vec<u8> {
        if let Some(switch) = self.switch.as_mut() {
            if switch.carried && !switch.identity_sent && rates_compatible(self.host_baud, switch.baud)
            {
                switch.identity_sent = true;
                let text = format!("{}\r", self.config.identity);
                self.outbound.push((switch.baud, text.into_bytes()));
            }
        }

        let host = self.host_baud;
        let mut data = Vec::new();
        for (baud, chunk) in self.outbound.drain(..) {
            // Bytes sent at another rate arrive as noise and are lost
            if rates_compatible(host, baud) {
                data.extend_from_slice(&chunk);
            }
        }
        data
    }
}

/// Inspect a simulator after it has been moved into an engine
#[derive(Debug, Clone)]
pub struct SimulatorProbe {
    inner: Arc<Mutex<SimState>>,
}

impl SimulatorProbe {
    fn state(&self) -> MutexGuard<'_, SimState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Commands the adapter understood, upper-cased without spaces
    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    /// Every baud rate the host selected, in order
    pub fn baud_history(&self) -> Vec<u32> {
        self.state().baud_history.clone()
    }

    /// Rate the adapter is committed to
    pub fn adapter_baud(&self) -> u32 {
        self.state().adapter_baud
    }

    /// Rate the host is using
    pub fn host_baud(&self) -> u32 {
        self.state().host_baud
    }

    /// Whether the host has the port open
    pub fn is_open(&self) -> bool {
        self.state().open
    }

    /// Pull the cable: every later read or write fails
    pub fn unplug(&self) {
        self.state().unplugged = true;
    }
}

/// Transport backed by a simulated ELM327
#[derive(Debug)]
pub struct SimulatedElm327 {
    inner: Arc<Mutex<SimState>>,
}

impl SimulatedElm327 {
    /// Create a simulator
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimState::new(config))),
        }
    }

    /// Handle for inspecting the simulator from tests
    pub fn probe(&self) -> SimulatorProbe {
        SimulatorProbe {
            inner: Arc::clone(&self.inner),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Transport for SimulatedElm327 {
    fn open(&mut self, port: &str) -> Result<(), ObdError> {
        let mut state = self.state();
        if state.config.fail_open {
            return Err(ObdError::TransportOpenFailed {
                port: port.to_string(),
                reason: "simulated open failure".to_string(),
            });
        }
        state.open = true;
        state.inbound.clear();
        state.outbound.clear();
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.state();
        state.open = false;
        state.outbound.clear();
        state.inbound.clear();
    }

    fn is_open(&self) -> bool {
        self.state().open
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), ObdError> {
        let mut state = self.state();
        state.host_baud = baud_rate;
        state.baud_history.push(baud_rate);
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.state().host_baud
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), ObdError> {
        let mut state = self.state();
        if !state.open {
            return Err(ObdError::NotConnected);
        }
        if state.unplugged {
            return Err(ObdError::SerialError("device disconnected".to_string()));
        }
        state.host_write(bytes);
        Ok(())
    }

    async fn read_available(&mut self, timeout: Duration) -> Result<Vec<u8>, ObdError> {
        let data = {
            let mut state = self.state();
            if !state.open {
                return Err(ObdError::NotConnected);
            }
            if state.unplugged {
                return Err(ObdError::SerialError("device disconnected".to_string()));
            }
            state.drain_for_host()
        };
        if !data.is_empty() {
            return Ok(data);
        }
        tokio::time::sleep(timeout).await;
        Ok(Vec::new())
    }

    fn bytes_available(&self) -> usize {
        let state = self.state();
        state
            .outbound
            .iter()
            .filter(|(baud, _)| rates_compatible(state.host_baud, *baud))
            .map(|(_, chunk)| chunk.len())
            .sum()
    }
}
