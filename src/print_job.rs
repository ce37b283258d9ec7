// src/print_job.rs
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

pub type JobId = Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Active,
    Completed,
    Cancelled,
    Failed(String),
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Cancelled | JobState::Failed(_))
    }
}

/// A unit of work bound to one device.
///
/// Lower `priority` values run first; equal priorities run in admission order.
#[derive(Debug, Clone, Serialize)]
pub struct PrintJob {
    pub id: JobId,
    pub device_id: String,
    /// Opaque reference to the instruction stream, usually a file path.
    pub payload: String,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub state: JobState,
    sequence: u64,
}

impl PrintJob {
    pub fn new(device_id: &str, payload: &str, priority: i32, sequence: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: device_id.to_string(),
            payload: payload.to_string(),
            priority,
            created_at: Utc::now(),
            state: JobState::Pending,
            sequence,
        }
    }

    /// Sort key: priority first, then admission order.
    pub fn precedence(&self) -> (i32, u64) {
        (self.priority, self.sequence)
    }
}
