// src/device/state.rs - Lifecycle states and bookkeeping snapshots
use crate::print_job::{JobId, JobState};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceState {
    Offline,
    Idle,
    Printing,
    Paused,
    Error,
}

impl DeviceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Offline => "OFFLINE",
            DeviceState::Idle => "IDLE",
            DeviceState::Printing => "PRINTING",
            DeviceState::Paused => "PAUSED",
            DeviceState::Error => "ERROR",
        }
    }

    /// States in which a job must be assigned.
    pub fn holds_job(&self) -> bool {
        matches!(self, DeviceState::Printing | DeviceState::Paused)
    }

    /// States backed by an open connection.
    pub fn is_connected(&self) -> bool {
        matches!(self, DeviceState::Idle | DeviceState::Printing | DeviceState::Paused)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current and target temperatures in °C.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Temperatures {
    pub hotend: f64,
    pub bed: f64,
    pub target_hotend: f64,
    pub target_bed: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub e: f64,
}

impl Position {
    pub const ORIGIN: Position = Position { x: 0.0, y: 0.0, z: 0.0, e: 0.0 };

    /// Apply the axes present in `axes`, leaving the others untouched.
    pub fn apply(&mut self, axes: &AxisMove) {
        if let Some(x) = axes.x {
            self.x = x;
        }
        if let Some(y) = axes.y {
            self.y = y;
        }
        if let Some(z) = axes.z {
            self.z = z;
        }
        if let Some(e) = axes.e {
            self.e = e;
        }
    }
}

/// A move with any subset of axes specified.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AxisMove {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    pub e: Option<f64>,
}

impl AxisMove {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn x(mut self, x: f64) -> Self {
        self.x = Some(x);
        self
    }

    pub fn y(mut self, y: f64) -> Self {
        self.y = Some(y);
        self
    }

    pub fn z(mut self, z: f64) -> Self {
        self.z = Some(z);
        self
    }

    pub fn e(mut self, e: f64) -> Self {
        self.e = Some(e);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_none() && self.y.is_none() && self.z.is_none() && self.e.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummary {
    pub id: JobId,
    pub payload: String,
    pub state: JobState,
}

/// Plain status snapshot handed to presentation layers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub id: String,
    pub name: String,
    pub address: String,
    pub state: DeviceState,
    pub temperatures: Temperatures,
    pub position: Position,
    pub progress: f64,
    pub job: Option<JobSummary>,
    pub last_job: Option<JobSummary>,
    pub last_error: Option<String>,
}
