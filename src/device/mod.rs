//! One state machine per physical printer.
//!
//! A [`Device`] owns its connection and its bookkeeping behind two locks:
//!
//! - `link` serializes every command exchange on the line;
//! - `state` guards lifecycle, temperatures, position, job and progress.
//!
//! `link` is always taken before `state`, and `state` is never held across
//! I/O, so status reads never wait on hardware.

pub mod protocol;
pub mod registry;
pub mod state;

pub use registry::DeviceRegistry;
pub use state::{AxisMove, DeviceState, DeviceStatus, JobSummary, Position, Temperatures};

use crate::config::{find_material, Config, MaterialProfile};
use crate::print_job::{JobId, JobState, PrintJob};
use crate::transport::{Connection, Transport, TransportError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex, Notify, RwLock};

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Cannot {action} while device is {state}")]
    InvalidTransition {
        action: &'static str,
        state: DeviceState,
    },
    #[error("Firmware error: {0}")]
    Firmware(String),
    #[error("{zone} target {requested}°C exceeds the {limit}°C limit")]
    TemperatureLimit {
        zone: &'static str,
        requested: f64,
        limit: f64,
    },
    #[error("Unknown material profile '{0}'")]
    UnknownMaterial(String),
    #[error("Device is shutting down")]
    ShuttingDown,
}

impl DeviceError {
    /// Errors that mean the line or the controller is no longer trustworthy.
    pub fn is_fault(&self) -> bool {
        matches!(self, DeviceError::Transport(_) | DeviceError::Firmware(_))
    }
}

/// Per-device tuning, usually derived from [`Config`].
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub baud: u32,
    pub response_timeout: Duration,
    pub cooldown_grace: Duration,
    pub max_hotend_temp: f64,
    pub max_bed_temp: f64,
    pub materials: Vec<MaterialProfile>,
}

impl DeviceSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            baud: config.transport.baud,
            response_timeout: config.transport.response_timeout(),
            cooldown_grace: config.safety.cooldown_grace(),
            max_hotend_temp: config.safety.max_hotend_temp,
            max_bed_temp: config.safety.max_bed_temp,
            materials: config.materials.clone(),
        }
    }
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// What happened to one streamed payload line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    /// Sent and acknowledged.
    Sent,
    /// The device is paused; nothing was sent.
    Held,
    /// The job is no longer the device's current job; nothing was sent.
    Detached,
}

#[derive(Debug)]
struct Bookkeeping {
    state: DeviceState,
    temperatures: Temperatures,
    position: Position,
    current_job: Option<PrintJob>,
    progress: f64,
    last_job: Option<PrintJob>,
    last_error: Option<String>,
    /// Set for the whole of `safe_shutdown`; no job or connection may start.
    shutting_down: bool,
}

impl Bookkeeping {
    fn new() -> Self {
        Self {
            state: DeviceState::Offline,
            temperatures: Temperatures::default(),
            position: Position::ORIGIN,
            current_job: None,
            progress: 0.0,
            last_job: None,
            last_error: None,
            shutting_down: false,
        }
    }

    fn holds(&self, job_id: JobId) -> bool {
        self.current_job.as_ref().is_some_and(|j| j.id == job_id)
    }
}

pub struct Device {
    id: String,
    name: String,
    address: String,
    baud: Option<u32>,
    settings: DeviceSettings,
    link: Mutex<Option<Box<dyn Connection>>>,
    state: RwLock<Bookkeeping>,
    state_tx: watch::Sender<DeviceState>,
    waker: Option<Arc<Notify>>,
}

impl Device {
    pub fn new(id: &str, address: &str) -> Self {
        let (state_tx, _) = watch::channel(DeviceState::Offline);
        Self {
            id: id.to_string(),
            name: id.to_string(),
            address: address.to_string(),
            baud: None,
            settings: DeviceSettings::default(),
            link: Mutex::new(None),
            state: RwLock::new(Bookkeeping::new()),
            state_tx,
            waker: None,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Override the transport's default baud rate for this device.
    pub fn with_baud(mut self, baud: u32) -> Self {
        self.baud = Some(baud);
        self
    }

    pub fn with_settings(mut self, settings: DeviceSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Signal `waker` whenever this device lets go of a job.
    pub(crate) fn attach_waker(&mut self, waker: Arc<Notify>) {
        self.waker = Some(waker);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Watch lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<DeviceState> {
        self.state_tx.subscribe()
    }

    pub async fn state(&self) -> DeviceState {
        self.state.read().await.state
    }

    pub async fn progress(&self) -> f64 {
        self.state.read().await.progress
    }

    pub async fn temperatures(&self) -> Temperatures {
        self.state.read().await.temperatures
    }

    pub async fn position(&self) -> Position {
        self.state.read().await.position
    }

    pub async fn current_job(&self) -> Option<PrintJob> {
        self.state.read().await.current_job.clone()
    }

    pub async fn holds_job(&self, job_id: JobId) -> bool {
        self.state.read().await.holds(job_id)
    }

    /// Terminal state of `job_id` if it was the last job this device finished.
    pub async fn job_outcome(&self, job_id: JobId) -> Option<JobState> {
        let book = self.state.read().await;
        book.last_job
            .as_ref()
            .filter(|j| j.id == job_id)
            .map(|j| j.state.clone())
    }

    pub async fn status(&self) -> DeviceStatus {
        let book = self.state.read().await;
        let summary = |job: &PrintJob| JobSummary {
            id: job.id,
            payload: job.payload.clone(),
            state: job.state.clone(),
        };
        DeviceStatus {
            id: self.id.clone(),
            name: self.name.clone(),
            address: self.address.clone(),
            state: book.state,
            temperatures: book.temperatures,
            position: book.position,
            progress: book.progress,
            job: book.current_job.as_ref().map(summary),
            last_job: book.last_job.as_ref().map(summary),
            last_error: book.last_error.clone(),
        }
    }

    fn publish(&self, book: &Bookkeeping) {
        self.state_tx.send_replace(book.state);
    }

    fn wake_scheduler(&self) {
        if let Some(waker) = &self.waker {
            waker.notify_one();
        }
    }

    /// Move the current job to `last_job` with `outcome` and return to `next`.
    fn finish_job(&self, book: &mut Bookkeeping, outcome: JobState, next: DeviceState) {
        if let Some(mut job) = book.current_job.take() {
            tracing::info!("Job {} on {} finished: {:?}", job.id, self.id, outcome);
            job.state = outcome;
            book.last_job = Some(job);
        }
        book.progress = 0.0;
        book.state = next;
        self.publish(book);
        self.wake_scheduler();
    }

    /// Enter ERROR after a fault, failing the current job if there is one.
    async fn fault(&self, error: &DeviceError) {
        let mut book = self.state.write().await;
        tracing::error!("Device {} faulted: {}", self.id, error);
        book.last_error = Some(error.to_string());
        self.finish_job(&mut book, JobState::Failed(error.to_string()), DeviceState::Error);
    }

    /// Open the line. From ERROR this replaces the stale connection.
    pub async fn connect(&self, transport: &dyn Transport) -> Result<(), DeviceError> {
        let mut link = self.link.lock().await;
        if self.state.read().await.shutting_down {
            return Err(DeviceError::ShuttingDown);
        }
        let current = self.state().await;
        if current.is_connected() {
            tracing::debug!("Device {} already connected ({})", self.id, current);
            return Ok(());
        }

        if let Some(mut stale) = link.take() {
            stale.close().await;
        }

        let baud = self.baud.unwrap_or(self.settings.baud);
        match transport.open(&self.address, baud).await {
            Ok(conn) => {
                *link = Some(conn);
                let mut book = self.state.write().await;
                book.state = DeviceState::Idle;
                book.last_error = None;
                self.publish(&book);
                tracing::info!("Device {} connected on {}", self.id, self.address);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Device {} failed to connect: {}", self.id, e);
                self.state.write().await.last_error = Some(e.to_string());
                Err(e.into())
            }
        }
    }

    /// Claim `job` and begin printing. Only an IDLE device accepts a job.
    pub async fn start_job(&self, mut job: PrintJob) -> Result<(), DeviceError> {
        let mut book = self.state.write().await;
        if book.shutting_down {
            return Err(DeviceError::ShuttingDown);
        }
        if book.state != DeviceState::Idle {
            return Err(DeviceError::InvalidTransition {
                action: "start a job",
                state: book.state,
            });
        }
        tracing::info!("Device {} starting job {} ({})", self.id, job.id, job.payload);
        job.state = JobState::Active;
        book.current_job = Some(job);
        book.progress = 0.0;
        book.state = DeviceState::Printing;
        self.publish(&book);
        Ok(())
    }

    /// PRINTING -> PAUSED. Returns whether a transition happened.
    pub async fn pause(&self) -> bool {
        let mut book = self.state.write().await;
        if book.state != DeviceState::Printing {
            return false;
        }
        book.state = DeviceState::Paused;
        self.publish(&book);
        tracing::info!("Device {} paused", self.id);
        true
    }

    /// PAUSED -> PRINTING. Returns whether a transition happened.
    pub async fn resume(&self) -> bool {
        let mut book = self.state.write().await;
        if book.state != DeviceState::Paused || book.shutting_down {
            return false;
        }
        book.state = DeviceState::Printing;
        self.publish(&book);
        tracing::info!("Device {} resumed", self.id);
        true
    }

    /// Drop the current job and return to IDLE. Local state only.
    pub async fn cancel(&self) -> bool {
        let mut book = self.state.write().await;
        if !book.state.holds_job() {
            return false;
        }
        self.finish_job(&mut book, JobState::Cancelled, DeviceState::Idle);
        true
    }

    /// Cancel `job_id`, ignored if another job is current.
    pub async fn cancel_job(&self, job_id: JobId) -> bool {
        let mut book = self.state.write().await;
        if !book.state.holds_job() || !book.holds(job_id) {
            return false;
        }
        self.finish_job(&mut book, JobState::Cancelled, DeviceState::Idle);
        true
    }

    /// Completion of whatever job is current.
    pub async fn complete(&self) -> bool {
        let mut book = self.state.write().await;
        if !book.state.holds_job() {
            return false;
        }
        book.progress = 1.0;
        self.finish_job(&mut book, JobState::Completed, DeviceState::Idle);
        true
    }

    /// Completion of `job_id`, ignored if another job is current.
    pub async fn complete_job(&self, job_id: JobId) -> bool {
        let mut book = self.state.write().await;
        if !book.state.holds_job() || !book.holds(job_id) {
            return false;
        }
        book.progress = 1.0;
        self.finish_job(&mut book, JobState::Completed, DeviceState::Idle);
        true
    }

    /// Fail `job_id` without faulting the device, e.g. an unreadable payload.
    pub async fn reject_job(&self, job_id: JobId, reason: &str) -> bool {
        let mut book = self.state.write().await;
        if !book.holds(job_id) {
            return false;
        }
        self.finish_job(&mut book, JobState::Failed(reason.to_string()), DeviceState::Idle);
        true
    }

    /// Progress of whatever job is current; ignored when there is none.
    pub async fn report_progress(&self, fraction: f64) {
        let mut book = self.state.write().await;
        if book.current_job.is_some() {
            book.progress = fraction.clamp(0.0, 1.0);
        }
    }

    pub async fn report_job_progress(&self, job_id: JobId, fraction: f64) {
        let mut book = self.state.write().await;
        if book.holds(job_id) {
            book.progress = fraction.clamp(0.0, 1.0);
        }
    }

    /// Telemetry update; never changes lifecycle state.
    pub async fn update_temperature(&self, hotend: f64, bed: f64) {
        let mut book = self.state.write().await;
        book.temperatures.hotend = hotend;
        book.temperatures.bed = bed;
    }

    /// Run `commands` back to back on the line, faulting on failure.
    async fn run(&self, action: &'static str, commands: &[String]) -> Result<Vec<String>, DeviceError> {
        let mut link = self.link.lock().await;
        let Some(conn) = link.as_mut() else {
            return Err(DeviceError::InvalidTransition {
                action,
                state: self.state().await,
            });
        };

        let mut replies = Vec::new();
        for command in commands {
            match protocol::exchange(conn.as_mut(), command, self.settings.response_timeout).await {
                Ok(lines) => replies.extend(lines),
                Err(e) => {
                    if e.is_fault() {
                        self.fault(&e).await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(replies)
    }

    /// Forward one payload line of `job_id`.
    pub async fn stream_line(&self, job_id: JobId, line: &str) -> Result<LineOutcome, DeviceError> {
        let mut link = self.link.lock().await;
        {
            let book = self.state.read().await;
            if !book.holds(job_id) {
                return Ok(LineOutcome::Detached);
            }
            if book.state == DeviceState::Paused {
                return Ok(LineOutcome::Held);
            }
        }

        let Some(conn) = link.as_mut() else {
            let error = DeviceError::Transport(TransportError::closed_for_write());
            self.fault(&error).await;
            return Err(error);
        };
        match protocol::exchange(conn.as_mut(), line, self.settings.response_timeout).await {
            Ok(_) => Ok(LineOutcome::Sent),
            Err(e) => {
                self.fault(&e).await;
                Err(e)
            }
        }
    }

    /// Set hotend and bed targets. Limits are checked before anything is sent.
    pub async fn set_temperature(&self, hotend: f64, bed: f64) -> Result<(), DeviceError> {
        if hotend > self.settings.max_hotend_temp {
            return Err(DeviceError::TemperatureLimit {
                zone: "hotend",
                requested: hotend,
                limit: self.settings.max_hotend_temp,
            });
        }
        if bed > self.settings.max_bed_temp {
            return Err(DeviceError::TemperatureLimit {
                zone: "bed",
                requested: bed,
                limit: self.settings.max_bed_temp,
            });
        }

        self.run("set temperature", &[protocol::set_hotend(hotend), protocol::set_bed(bed)])
            .await?;
        let mut book = self.state.write().await;
        book.temperatures.target_hotend = hotend;
        book.temperatures.target_bed = bed;
        Ok(())
    }

    /// Heat to a named material profile.
    pub async fn apply_material(&self, name: &str) -> Result<(), DeviceError> {
        let profile = find_material(&self.settings.materials, name)
            .cloned()
            .ok_or_else(|| DeviceError::UnknownMaterial(name.to_string()))?;
        tracing::info!("Device {} heating for {}", self.id, profile.name);
        self.set_temperature(profile.hotend, profile.bed).await
    }

    /// Ask the firmware for a temperature report and record it.
    pub async fn query_temperature(&self) -> Result<Temperatures, DeviceError> {
        let replies = self
            .run("query temperature", &[protocol::REPORT_TEMPERATURES.to_string()])
            .await?;
        let Some(report) = replies.iter().rev().find_map(|l| protocol::parse_temperature_report(l)) else {
            tracing::warn!("Device {} sent no temperature report", self.id);
            return Ok(self.temperatures().await);
        };
        let mut book = self.state.write().await;
        book.temperatures = report;
        Ok(report)
    }

    /// Move the supplied axes. Others keep their position.
    ///
    /// Without an open line only the bookkeeping changes.
    pub async fn move_to(&self, axes: AxisMove) -> Result<(), DeviceError> {
        let Some(command) = protocol::linear_move(&axes) else {
            return Ok(());
        };
        if self.has_link().await {
            self.run("move", &[command]).await?;
        }
        self.state.write().await.position.apply(&axes);
        Ok(())
    }

    /// Return every axis to the origin, in any state.
    pub async fn home(&self) -> Result<(), DeviceError> {
        self.state.write().await.position = Position::ORIGIN;
        if self.has_link().await {
            self.run("home", &[protocol::HOME.to_string()]).await?;
        }
        Ok(())
    }

    /// Home, then probe the bed.
    pub async fn auto_level(&self) -> Result<(), DeviceError> {
        self.home().await?;
        self.run("level the bed", &[protocol::AUTO_LEVEL.to_string()])
            .await?;
        tracing::info!("Device {} finished bed leveling", self.id);
        Ok(())
    }

    /// Command passthrough. Returns every reply line up to the `ok`.
    pub async fn send_raw(&self, command: &str) -> Result<Vec<String>, DeviceError> {
        self.run("send a command", &[command.trim().to_string()]).await
    }

    async fn has_link(&self) -> bool {
        self.link.lock().await.as_ref().is_some_and(|c| c.is_open())
    }

    /// Pause, cool down, close the line and go OFFLINE.
    ///
    /// Bounded in time: cooling failures are logged, never awaited forever.
    pub async fn safe_shutdown(&self) {
        // Set before taking the line, which a streamer may be holding.
        {
            let mut book = self.state.write().await;
            book.shutting_down = true;
            if book.state == DeviceState::Printing {
                book.state = DeviceState::Paused;
                self.publish(&book);
            }
        }

        let mut link = self.link.lock().await;
        {
            let mut book = self.state.write().await;
            if book.state == DeviceState::Offline && link.is_none() {
                book.shutting_down = false;
                tracing::debug!("Device {} already offline", self.id);
                return;
            }
        }
        tracing::info!("Shutting down device {}", self.id);

        if let Some(conn) = link.as_mut() {
            for command in [protocol::set_hotend(0.0), protocol::set_bed(0.0)] {
                if let Err(e) =
                    protocol::exchange(conn.as_mut(), &command, self.settings.response_timeout).await
                {
                    tracing::warn!("Device {} did not confirm '{}': {}", self.id, command, e);
                }
            }
            tokio::time::sleep(self.settings.cooldown_grace).await;
        }
        if let Some(mut conn) = link.take() {
            conn.close().await;
        }

        let mut book = self.state.write().await;
        book.temperatures.target_hotend = 0.0;
        book.temperatures.target_bed = 0.0;
        book.shutting_down = false;
        if book.current_job.is_some() {
            tracing::info!("Cancelling job on {} for shutdown", self.id);
            self.finish_job(&mut book, JobState::Cancelled, DeviceState::Offline);
        } else {
            book.state = DeviceState::Offline;
            self.publish(&book);
        }
        tracing::info!("Device {} is offline", self.id);
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("address", &self.address)
            .field("state", &*self.state_tx.borrow())
            .finish()
    }
}
