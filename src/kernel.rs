// src/kernel.rs - Owns the device registry and the subsystem lifecycle
use crate::config::Config;
use crate::device::{Device, DeviceError, DeviceRegistry, DeviceSettings, DeviceState, DeviceStatus};
use crate::print_job::{JobId, JobState, PrintJob};
use crate::scheduler::{FilePayloads, PayloadSource, Scheduler, SchedulerError};
use crate::transport::{Transport, TransportError};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("Unknown device: {0}")]
    UnknownDevice(String),
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

pub struct Kernel {
    config: Config,
    transport: Arc<dyn Transport>,
    registry: DeviceRegistry,
    scheduler: Scheduler,
}

impl Kernel {
    /// Kernel that streams payload files when `[scheduler] stream_payloads`
    /// is set, and otherwise waits for completions reported from outside.
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Self {
        let registry = DeviceRegistry::new();
        let scheduler = if config.scheduler.stream_payloads {
            let source = FilePayloads::new(config.scheduler.payload_root.clone());
            Scheduler::with_payloads(registry.clone(), config.scheduler.clone(), Arc::new(source))
        } else {
            Scheduler::new(registry.clone(), config.scheduler.clone())
        };
        Self {
            config,
            transport,
            registry,
            scheduler,
        }
    }

    /// Kernel that always streams payloads from `source`.
    pub fn with_payload_source(
        config: Config,
        transport: Arc<dyn Transport>,
        source: Arc<dyn PayloadSource>,
    ) -> Self {
        let registry = DeviceRegistry::new();
        let scheduler = Scheduler::with_payloads(registry.clone(), config.scheduler.clone(), source);
        Self {
            config,
            transport,
            registry,
            scheduler,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn device_settings(&self) -> DeviceSettings {
        DeviceSettings::from_config(&self.config)
    }

    /// Register `device`, replacing any device with the same id.
    pub async fn register_device(&self, mut device: Device) -> Arc<Device> {
        device.attach_waker(self.scheduler.waker());
        let device = Arc::new(device);
        self.registry.insert(device.clone()).await;
        tracing::info!("Registered device {} at {}", device.id(), device.address());
        device
    }

    /// Register every `[[devices]]` entry from the configuration.
    pub async fn register_configured_devices(&self) -> Vec<Arc<Device>> {
        let mut registered = Vec::new();
        for entry in &self.config.devices {
            let mut device = Device::new(&entry.id, &entry.address).with_settings(self.device_settings());
            if let Some(name) = &entry.name {
                device = device.with_name(name);
            }
            if let Some(baud) = entry.baud {
                device = device.with_baud(baud);
            }
            registered.push(self.register_device(device).await);
        }
        registered
    }

    pub async fn deregister_device(&self, id: &str) -> Option<Arc<Device>> {
        let removed = self.registry.remove(id).await;
        if removed.is_some() {
            tracing::info!("Deregistered device {}", id);
            self.scheduler.waker().notify_one();
        }
        removed
    }

    pub async fn get_device(&self, id: &str) -> Option<Arc<Device>> {
        self.registry.get(id).await
    }

    /// Status of every device, sorted by id.
    pub async fn devices(&self) -> Vec<DeviceStatus> {
        let mut statuses = Vec::new();
        for device in self.registry.all().await {
            statuses.push(device.status().await);
        }
        statuses
    }

    async fn device(&self, id: &str) -> Result<Arc<Device>, KernelError> {
        self.registry
            .get(id)
            .await
            .ok_or_else(|| KernelError::UnknownDevice(id.to_string()))
    }

    /// Queue a job for `device_id`. Refused while the device is in ERROR.
    pub async fn schedule_job(
        &self,
        device_id: &str,
        payload: &str,
        priority: i32,
    ) -> Result<JobId, KernelError> {
        let device = self.device(device_id).await?;
        let state = device.state().await;
        if state == DeviceState::Error {
            return Err(DeviceError::InvalidTransition {
                action: "schedule a job",
                state,
            }
            .into());
        }
        Ok(self.scheduler.enqueue(device_id, payload, priority).await?)
    }

    /// Bring up the transport, connect OFFLINE devices, then run the scheduler.
    pub async fn start(&self) -> Result<(), KernelError> {
        tracing::info!("Starting fleet kernel");
        self.transport.initialize().await?;

        let mut connects = JoinSet::new();
        for device in self.registry.all().await {
            if device.state().await != DeviceState::Offline {
                continue;
            }
            let transport = self.transport.clone();
            connects.spawn(async move {
                if let Err(e) = device.connect(transport.as_ref()).await {
                    tracing::warn!("Device {} stays offline: {}", device.id(), e);
                }
            });
        }
        while let Some(result) = connects.join_next().await {
            if let Err(e) = result {
                tracing::error!("Device connect task failed: {}", e);
            }
        }

        self.scheduler.start().await;
        tracing::info!("Fleet kernel ready");
        Ok(())
    }

    /// Shut every device down, stop the scheduler and release the transport.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down fleet kernel");
        let mut shutdowns = JoinSet::new();
        for device in self.registry.all().await {
            shutdowns.spawn(async move { device.safe_shutdown().await });
        }
        while let Some(result) = shutdowns.join_next().await {
            if let Err(e) = result {
                tracing::error!("Device shutdown task failed: {}", e);
            }
        }

        self.scheduler.stop().await;
        self.transport.release().await;
        tracing::info!("Fleet kernel stopped");
    }

    pub async fn connect_device(&self, device_id: &str) -> Result<(), KernelError> {
        let device = self.device(device_id).await?;
        device.connect(self.transport.as_ref()).await?;
        self.scheduler.waker().notify_one();
        Ok(())
    }

    pub async fn pause_job(&self, device_id: &str) -> Result<bool, KernelError> {
        Ok(self.device(device_id).await?.pause().await)
    }

    pub async fn resume_job(&self, device_id: &str) -> Result<bool, KernelError> {
        Ok(self.device(device_id).await?.resume().await)
    }

    pub async fn cancel_job(&self, device_id: &str) -> Result<bool, KernelError> {
        Ok(self.device(device_id).await?.cancel().await)
    }

    /// Raw command passthrough. Returns the reply lines.
    pub async fn send_command(&self, device_id: &str, command: &str) -> Result<Vec<String>, KernelError> {
        Ok(self.device(device_id).await?.send_raw(command).await?)
    }

    pub async fn queue_status(&self) -> Vec<PrintJob> {
        self.scheduler.queue_status().await
    }

    pub async fn job_state(&self, job_id: JobId) -> Option<JobState> {
        self.scheduler.job_state(job_id).await
    }

    pub fn available_ports(&self) -> Vec<String> {
        self.transport.available_ports()
    }
}
