// src/device/registry.rs - Id-keyed device table shared by kernel and scheduler
use super::Device;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Devices keyed by id. Holders keep `Arc<Device>` handles, never references
/// back into the table.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: Arc<RwLock<HashMap<String, Arc<Device>>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `device`, replacing any device with the same id.
    pub async fn insert(&self, device: Arc<Device>) -> Option<Arc<Device>> {
        let id = device.id().to_string();
        let previous = self.devices.write().await.insert(id.clone(), device);
        if previous.is_some() {
            tracing::warn!("Replaced registered device {}", id);
        }
        previous
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<Device>> {
        self.devices.write().await.remove(id)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Device>> {
        self.devices.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.devices.read().await.contains_key(id)
    }

    /// Every device, sorted by id.
    pub async fn all(&self) -> Vec<Arc<Device>> {
        let mut devices: Vec<Arc<Device>> = self.devices.read().await.values().cloned().collect();
        devices.sort_by(|a, b| a.id().cmp(b.id()));
        devices
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }
}
