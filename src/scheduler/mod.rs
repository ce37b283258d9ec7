//! Job admission and dispatch.
//!
//! Pending jobs live in a priority queue. One background loop pops them and
//! hands each to its device when that device is IDLE and has no active job,
//! so a device runs one job at a time while devices run independently.
//!
//! The loop wakes on enqueue, whenever a device lets go of a job, or on the
//! poll interval, whichever comes first.

pub mod queue;
pub mod stream;

pub use queue::JobQueue;
pub use stream::{FilePayloads, MemoryPayloads, PayloadError, PayloadSource};

use crate::config::SchedulerConfig;
use crate::device::{DeviceError, DeviceRegistry, DeviceState};
use crate::print_job::{JobId, JobState, PrintJob};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::{JoinHandle, JoinSet};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Unknown device: {0}")]
    UnknownDevice(String),
}

/// Terminal outcomes of jobs that have left the scheduler, oldest evicted first.
#[derive(Debug)]
struct Outcomes {
    order: VecDeque<JobId>,
    states: HashMap<JobId, JobState>,
    capacity: usize,
}

impl Outcomes {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            states: HashMap::new(),
            capacity,
        }
    }

    fn record(&mut self, id: JobId, state: JobState) {
        if self.states.insert(id, state).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.states.remove(&oldest);
            }
        }
    }

    fn get(&self, id: JobId) -> Option<JobState> {
        self.states.get(&id).cloned()
    }
}

struct Inner {
    registry: DeviceRegistry,
    config: SchedulerConfig,
    queue: Mutex<JobQueue>,
    /// device id -> the job dispatched to it
    active: Mutex<HashMap<String, PrintJob>>,
    outcomes: Mutex<Outcomes>,
    sequence: AtomicU64,
    wake: Arc<Notify>,
    payloads: Option<Arc<dyn PayloadSource>>,
    streams: Mutex<JoinSet<()>>,
    worker: Mutex<Option<(broadcast::Sender<()>, JoinHandle<()>)>>,
}

/// Cheap to clone; clones share one queue and one loop.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Scheduler whose jobs complete only when something outside reports it.
    pub fn new(registry: DeviceRegistry, config: SchedulerConfig) -> Self {
        Self::build(registry, config, None)
    }

    /// Scheduler that streams each dispatched job's payload from `source`.
    pub fn with_payloads(
        registry: DeviceRegistry,
        config: SchedulerConfig,
        source: Arc<dyn PayloadSource>,
    ) -> Self {
        Self::build(registry, config, Some(source))
    }

    fn build(
        registry: DeviceRegistry,
        config: SchedulerConfig,
        payloads: Option<Arc<dyn PayloadSource>>,
    ) -> Self {
        let outcomes = Outcomes::new(config.outcome_history);
        Self {
            inner: Arc::new(Inner {
                registry,
                config,
                queue: Mutex::new(JobQueue::new()),
                active: Mutex::new(HashMap::new()),
                outcomes: Mutex::new(outcomes),
                sequence: AtomicU64::new(0),
                wake: Arc::new(Notify::new()),
                payloads,
                streams: Mutex::new(JoinSet::new()),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Signal that wakes the dispatch loop. Devices fire it when a job ends.
    pub fn waker(&self) -> Arc<Notify> {
        self.inner.wake.clone()
    }

    pub async fn enqueue(
        &self,
        device_id: &str,
        payload: &str,
        priority: i32,
    ) -> Result<JobId, SchedulerError> {
        if !self.inner.registry.contains(device_id).await {
            return Err(SchedulerError::UnknownDevice(device_id.to_string()));
        }
        let sequence = self.inner.sequence.fetch_add(1, Ordering::SeqCst);
        let job = PrintJob::new(device_id, payload, priority, sequence);
        let id = job.id;
        self.inner.queue.lock().await.push(job);
        tracing::info!("Queued job {} for {} ({}, priority {})", id, device_id, payload, priority);
        self.inner.wake.notify_one();
        Ok(id)
    }

    /// Pending jobs in dispatch order.
    pub async fn queue_status(&self) -> Vec<PrintJob> {
        self.inner.queue.lock().await.snapshot()
    }

    /// Jobs currently dispatched, sorted by device id.
    pub async fn active_jobs(&self) -> Vec<PrintJob> {
        let active = self.inner.active.lock().await;
        let mut jobs: Vec<PrintJob> = active.values().cloned().collect();
        jobs.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        jobs
    }

    /// Where `id` is in its lifecycle, or `None` if the scheduler never saw
    /// it or has forgotten it.
    pub async fn job_state(&self, id: JobId) -> Option<JobState> {
        if self.inner.queue.lock().await.contains(id) {
            return Some(JobState::Pending);
        }
        if self.inner.active.lock().await.values().any(|j| j.id == id) {
            return Some(JobState::Active);
        }
        self.inner.outcomes.lock().await.get(id)
    }

    /// Withdraw a job that has not been dispatched yet.
    pub async fn cancel_pending(&self, id: JobId) -> bool {
        let removed = self.inner.queue.lock().await.remove(id);
        match removed {
            Some(job) => {
                tracing::info!("Withdrew pending job {} for {}", job.id, job.device_id);
                self.inner.outcomes.lock().await.record(id, JobState::Cancelled);
                true
            }
            None => false,
        }
    }

    pub async fn is_running(&self) -> bool {
        self.inner.worker.lock().await.is_some()
    }

    /// One scheduling pass: release finished jobs, then dispatch what can run.
    /// Returns how many jobs were dispatched.
    pub async fn run_cycle(&self) -> usize {
        self.reconcile().await;
        let dispatched = self.dispatch().await;
        let mut streams = self.inner.streams.lock().await;
        while let Some(result) = streams.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    tracing::error!("Payload streamer panicked: {}", e);
                }
            }
        }
        dispatched
    }

    /// Release active entries whose device no longer holds that job.
    async fn reconcile(&self) {
        let mut active = self.inner.active.lock().await;
        let mut released = Vec::new();
        for (device_id, job) in active.iter() {
            let outcome = match self.inner.registry.get(device_id).await {
                None => JobState::Failed(format!("device {} was removed", device_id)),
                Some(device) => {
                    if device.holds_job(job.id).await {
                        continue;
                    }
                    device
                        .job_outcome(job.id)
                        .await
                        .unwrap_or_else(|| JobState::Failed("outcome unavailable".to_string()))
                }
            };
            released.push((device_id.clone(), job.id, outcome));
        }

        if released.is_empty() {
            return;
        }
        let mut outcomes = self.inner.outcomes.lock().await;
        for (device_id, job_id, outcome) in released {
            tracing::info!("Released job {} on {}: {:?}", job_id, device_id, outcome);
            active.remove(&device_id);
            outcomes.record(job_id, outcome);
        }
    }

    async fn dispatch(&self) -> usize {
        let mut queue = self.inner.queue.lock().await;
        let mut active = self.inner.active.lock().await;
        let mut deferred = Vec::new();
        let mut dispatched = 0;

        while let Some(job) = queue.pop() {
            if active.contains_key(&job.device_id) {
                deferred.push(job);
                continue;
            }
            let Some(device) = self.inner.registry.get(&job.device_id).await else {
                let reason = format!("device {} is not registered", job.device_id);
                self.fail(job, reason).await;
                continue;
            };

            match device.state().await {
                DeviceState::Offline | DeviceState::Printing | DeviceState::Paused => {
                    deferred.push(job);
                }
                DeviceState::Error => {
                    let reason = format!("device {} is in ERROR", job.device_id);
                    self.fail(job, reason).await;
                }
                DeviceState::Idle => {
                    let mut running = job.clone();
                    running.state = JobState::Active;
                    active.insert(job.device_id.clone(), running.clone());
                    match device.start_job(job).await {
                        Ok(()) => {
                            dispatched += 1;
                            tracing::info!("Dispatched job {} to {}", running.id, running.device_id);
                            if let Some(source) = &self.inner.payloads {
                                let task = stream::stream_job(device.clone(), running, source.clone());
                                self.inner.streams.lock().await.spawn(task);
                            }
                        }
                        Err(DeviceError::ShuttingDown) => {
                            active.remove(&running.device_id);
                            running.state = JobState::Pending;
                            deferred.push(running);
                        }
                        Err(e) => {
                            active.remove(&running.device_id);
                            self.fail(running, e.to_string()).await;
                        }
                    }
                }
            }
        }

        for job in deferred {
            queue.push(job);
        }
        dispatched
    }

    async fn fail(&self, job: PrintJob, reason: String) {
        tracing::warn!("Job {} for {} failed: {}", job.id, job.device_id, reason);
        self.inner.outcomes.lock().await.record(job.id, JobState::Failed(reason));
    }

    /// Spawn the dispatch loop. Does nothing if it is already running.
    pub async fn start(&self) {
        let mut worker = self.inner.worker.lock().await;
        if worker.is_some() {
            tracing::debug!("Scheduler already running");
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            let poll = scheduler.inner.config.poll_interval();
            let wake = scheduler.inner.wake.clone();
            tracing::info!("Scheduler loop started");
            loop {
                scheduler.run_cycle().await;
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Scheduler loop shutting down");
                        break;
                    }
                    _ = wake.notified() => {}
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        });
        *worker = Some((shutdown_tx, handle));
    }

    /// Stop the loop and wait for it to exit, then abort in-flight streamers.
    ///
    /// A job whose streamer is aborted can never complete, so its device
    /// cancels it and the next cycle records the outcome.
    pub async fn stop(&self) {
        let worker = self.inner.worker.lock().await.take();
        if let Some((shutdown_tx, handle)) = worker {
            let _ = shutdown_tx.send(());
            if let Err(e) = handle.await {
                tracing::error!("Scheduler loop ended abnormally: {}", e);
            }
        }
        self.inner.streams.lock().await.shutdown().await;
        if self.inner.payloads.is_none() {
            return;
        }

        let active: Vec<PrintJob> = self.inner.active.lock().await.values().cloned().collect();
        for job in active {
            if let Some(device) = self.inner.registry.get(&job.device_id).await {
                if device.cancel_job(job.id).await {
                    tracing::warn!("Cancelled job {} on {}: its streamer was stopped", job.id, job.device_id);
                }
            }
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.inner.config)
            .field("streaming", &self.inner.payloads.is_some())
            .finish()
    }
}
