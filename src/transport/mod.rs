//! Line-oriented transport to printer controllers.
//!
//! A [`Transport`] opens [`Connection`]s; a connection carries one
//! newline-terminated command at a time and hands back response lines.
//! Nothing here knows about device state: every failure is returned to the
//! caller untouched.

pub mod serial;
pub mod sim;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use serial::{SerialConnection, SerialTransport};
pub use sim::{SimConnection, SimFirmware, SimTransport};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Write error: {0}")]
    Write(#[source] std::io::Error),
    #[error("Read error: {0}")]
    Read(#[source] std::io::Error),
    #[error("Timeout after {0:?} waiting for response")]
    Timeout(Duration),
}

impl TransportError {
    pub(crate) fn closed_for_write() -> Self {
        TransportError::Write(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            "connection is closed",
        ))
    }

    pub(crate) fn closed_for_read() -> Self {
        TransportError::Read(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            "connection is closed",
        ))
    }
}

/// Factory for device connections plus subsystem-wide setup/teardown.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Prepare the subsystem before any device connects.
    async fn initialize(&self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Open a connection and wait out the settle delay.
    async fn open(&self, address: &str, baud: u32) -> Result<Box<dyn Connection>, TransportError>;

    /// Release subsystem resources. Called once every device is closed.
    async fn release(&self) {}

    fn available_ports(&self) -> Vec<String> {
        Vec::new()
    }
}

/// One open line to a device. Owned by exactly one device.
#[async_trait]
pub trait Connection: Send + std::fmt::Debug {
    fn address(&self) -> &str;

    fn is_open(&self) -> bool;

    /// Write `command` followed by a newline.
    async fn send(&mut self, command: &str) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next complete response line.
    async fn receive(&mut self, timeout: Duration) -> Result<String, TransportError>;

    /// Close the line. Closing twice is a no-op.
    async fn close(&mut self);
}
