// src/scheduler/stream.rs - Payload resolution and per-job line streaming
use crate::device::{Device, LineOutcome};
use crate::print_job::PrintJob;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("Cannot read payload {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("No payload named '{0}'")]
    NotFound(String),
}

/// Resolves a job's payload reference to its instruction lines.
#[async_trait]
pub trait PayloadSource: Send + Sync {
    async fn load(&self, payload: &str) -> Result<Vec<String>, PayloadError>;
}

/// Payload references are file paths, optionally relative to `root`.
#[derive(Debug, Clone, Default)]
pub struct FilePayloads {
    root: Option<PathBuf>,
}

impl FilePayloads {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }

    fn resolve(&self, payload: &str) -> PathBuf {
        match &self.root {
            Some(root) => root.join(payload),
            None => PathBuf::from(payload),
        }
    }
}

#[async_trait]
impl PayloadSource for FilePayloads {
    async fn load(&self, payload: &str) -> Result<Vec<String>, PayloadError> {
        let path = self.resolve(payload);
        tracing::info!("Reading payload file: {}", path.display());
        let content = fs::read_to_string(&path).await.map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                PayloadError::NotFound(payload.to_string())
            } else {
                PayloadError::Io {
                    path: path.display().to_string(),
                    source,
                }
            }
        })?;
        let lines = instruction_lines(&content);
        tracing::info!("Loaded {} lines from {}", lines.len(), path.display());
        Ok(lines)
    }
}

/// Payloads held in memory, keyed by reference.
#[derive(Debug, Clone, Default)]
pub struct MemoryPayloads {
    payloads: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryPayloads {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, reference: &str, content: &str) {
        self.payloads
            .write()
            .await
            .insert(reference.to_string(), content.to_string());
    }
}

#[async_trait]
impl PayloadSource for MemoryPayloads {
    async fn load(&self, payload: &str) -> Result<Vec<String>, PayloadError> {
        self.payloads
            .read()
            .await
            .get(payload)
            .map(|content| instruction_lines(content))
            .ok_or_else(|| PayloadError::NotFound(payload.to_string()))
    }
}

/// Drop blank lines and whole-line `;` comments.
pub fn instruction_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with(';'))
        .map(str::to_string)
        .collect()
}

/// Feed `job`'s payload to `device` line by line until it completes, the job
/// goes away, or the device faults.
pub async fn stream_job(device: Arc<Device>, job: PrintJob, source: Arc<dyn PayloadSource>) {
    let lines = match source.load(&job.payload).await {
        Ok(lines) => lines,
        Err(e) => {
            tracing::error!("Job {} failed to load: {}", job.id, e);
            device.reject_job(job.id, &e.to_string()).await;
            return;
        }
    };

    let total = lines.len();
    let mut states = device.subscribe();
    let mut sent = 0;
    while sent < total {
        match device.stream_line(job.id, &lines[sent]).await {
            Ok(LineOutcome::Sent) => {
                sent += 1;
                device
                    .report_job_progress(job.id, sent as f64 / total as f64)
                    .await;
            }
            Ok(LineOutcome::Held) => {
                if states.changed().await.is_err() {
                    return;
                }
            }
            Ok(LineOutcome::Detached) => {
                tracing::info!("Stopped streaming job {} after {}/{} lines", job.id, sent, total);
                return;
            }
            Err(e) => {
                tracing::error!("Streaming job {} on {} failed: {}", job.id, device.id(), e);
                return;
            }
        }
    }

    if device.complete_job(job.id).await {
        tracing::info!("Job {} streamed {} lines", job.id, total);
    }
}
