//! In-process stand-in for a Marlin-style controller.
//!
//! Each address gets one [`SimFirmware`] that survives reconnects, so tests can
//! inject faults, inspect the commands a device sent, and count how often the
//! line was opened and closed.

use super::{Connection, Transport, TransportError};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
struct FirmwareState {
    refuse_connect: bool,
    fail_writes: bool,
    silent: bool,
    error_reply: Option<String>,
    hotend: f64,
    bed: f64,
    target_hotend: f64,
    target_bed: f64,
    received: Vec<String>,
    opens: usize,
    closes: usize,
    open: bool,
}

/// Shared handle to one simulated controller.
#[derive(Debug, Clone)]
pub struct SimFirmware {
    state: Arc<Mutex<FirmwareState>>,
}

impl SimFirmware {
    fn new() -> Self {
        let state = FirmwareState {
            hotend: 25.0,
            bed: 25.0,
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FirmwareState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `open` fail as if the device were unplugged.
    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connect = refuse;
    }

    /// Make every write fail as if the cable were pulled.
    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Accept commands but never answer.
    pub fn go_silent(&self, silent: bool) {
        self.lock().silent = silent;
    }

    /// Answer the next command with `Error:<message>`.
    pub fn fail_next_command(&self, message: &str) {
        self.lock().error_reply = Some(message.to_string());
    }

    /// Set the measured temperatures reported by `M105`.
    pub fn set_temperatures(&self, hotend: f64, bed: f64) {
        let mut state = self.lock();
        state.hotend = hotend;
        state.bed = bed;
    }

    pub fn targets(&self) -> (f64, f64) {
        let state = self.lock();
        (state.target_hotend, state.target_bed)
    }

    /// Every command received so far, in order.
    pub fn received(&self) -> Vec<String> {
        self.lock().received.clone()
    }

    pub fn opens(&self) -> usize {
        self.lock().opens
    }

    pub fn closes(&self) -> usize {
        self.lock().closes
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    fn reset_faults(&self) {
        let mut state = self.lock();
        state.refuse_connect = false;
        state.fail_writes = false;
        state.silent = false;
        state.error_reply = None;
    }

    /// Record `command` and produce the reply lines, if any.
    fn handle(&self, command: &str) -> Vec<String> {
        let mut state = self.lock();
        state.received.push(command.to_string());
        if state.silent {
            return Vec::new();
        }
        if let Some(message) = state.error_reply.take() {
            return vec![format!("Error:{}", message)];
        }

        let mut words = command.split_whitespace();
        match words.next() {
            Some("M105") => vec![format!(
                "ok T:{:.1} /{:.1} B:{:.1} /{:.1} @:0 B@:0",
                state.hotend, state.target_hotend, state.bed, state.target_bed
            )],
            Some("M104") => {
                if let Some(target) = s_parameter(words) {
                    state.target_hotend = target;
                }
                vec!["ok".to_string()]
            }
            Some("M140") => {
                if let Some(target) = s_parameter(words) {
                    state.target_bed = target;
                }
                vec!["ok".to_string()]
            }
            Some("G28") | Some("G29") => vec!["echo:busy: processing".to_string(), "ok".to_string()],
            _ => vec!["ok".to_string()],
        }
    }
}

fn s_parameter<'a>(mut words: impl Iterator<Item = &'a str>) -> Option<f64> {
    words
        .find_map(|w| w.strip_prefix('S'))
        .and_then(|v| v.parse().ok())
}

/// Transport whose connections talk to [`SimFirmware`] instances.
#[derive(Debug, Clone, Default)]
pub struct SimTransport {
    firmware: Arc<Mutex<HashMap<String, SimFirmware>>>,
    settle: Duration,
}

impl SimTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the post-open reset delay of real hardware.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// The controller behind `address`, created on first use.
    pub fn firmware(&self, address: &str) -> SimFirmware {
        let mut firmware = self.firmware.lock().unwrap_or_else(PoisonError::into_inner);
        firmware
            .entry(address.to_string())
            .or_insert_with(SimFirmware::new)
            .clone()
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn initialize(&self) -> Result<(), TransportError> {
        tracing::info!("Simulated transport ready");
        Ok(())
    }

    async fn open(&self, address: &str, baud: u32) -> Result<Box<dyn Connection>, TransportError> {
        let firmware = self.firmware(address);
        {
            let mut state = firmware.lock();
            if state.refuse_connect {
                return Err(TransportError::Connect {
                    address: address.to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such device"),
                });
            }
            state.opens += 1;
            state.open = true;
        }
        tracing::info!("Opened simulated line {} at {} baud", address, baud);
        tokio::time::sleep(self.settle).await;
        Ok(Box::new(SimConnection {
            address: address.to_string(),
            firmware,
            open: true,
            replies: VecDeque::new(),
        }))
    }

    async fn release(&self) {
        let firmware = self.firmware.lock().unwrap_or_else(PoisonError::into_inner);
        for controller in firmware.values() {
            controller.reset_faults();
        }
        tracing::info!("Simulated transport released");
    }

    fn available_ports(&self) -> Vec<String> {
        let firmware = self.firmware.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ports: Vec<String> = firmware.keys().cloned().collect();
        ports.sort();
        ports
    }
}

/// Connection to a simulated controller.
#[derive(Debug)]
pub struct SimConnection {
    address: String,
    firmware: SimFirmware,
    open: bool,
    replies: VecDeque<String>,
}

#[async_trait]
impl Connection for SimConnection {
    fn address(&self) -> &str {
        &self.address
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn send(&mut self, command: &str) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::closed_for_write());
        }
        if self.firmware.lock().fail_writes {
            return Err(TransportError::Write(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "simulated write failure",
            )));
        }
        tracing::debug!("{} <- {}", self.address, command);
        let replies = self.firmware.handle(command);
        self.replies.extend(replies);
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<String, TransportError> {
        if !self.open {
            return Err(TransportError::closed_for_read());
        }
        match self.replies.pop_front() {
            Some(line) => {
                tracing::debug!("{} -> {}", self.address, line);
                Ok(line)
            }
            None => {
                tokio::time::sleep(timeout).await;
                Err(TransportError::Timeout(timeout))
            }
        }
    }

    async fn close(&mut self) {
        if self.open {
            self.open = false;
            self.replies.clear();
            let mut state = self.firmware.lock();
            state.open = false;
            state.closes += 1;
        }
    }
}
