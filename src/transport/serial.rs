// src/transport/serial.rs - Serial line transport backed by serial2-tokio
use super::{Connection, Transport, TransportError};
use crate::config::TransportConfig;
use async_trait::async_trait;
use serial2_tokio::SerialPort;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::{sleep, timeout_at, Instant};

/// How long to wait for boot chatter after the settle delay.
const DRAIN_WINDOW: Duration = Duration::from_millis(50);

/// Opens serial ports and waits for the controller to come out of reset.
#[derive(Debug, Clone)]
pub struct SerialTransport {
    settle: Duration,
}

impl SerialTransport {
    pub fn new(settle: Duration) -> Self {
        Self { settle }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(config.settle())
    }
}

impl Default for SerialTransport {
    fn default() -> Self {
        Self::from_config(&TransportConfig::default())
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn initialize(&self) -> Result<(), TransportError> {
        let ports = self.available_ports();
        tracing::info!("Serial transport ready, {} port(s) visible", ports.len());
        for port in &ports {
            tracing::debug!("Visible serial port: {}", port);
        }
        Ok(())
    }

    async fn open(&self, address: &str, baud: u32) -> Result<Box<dyn Connection>, TransportError> {
        tracing::info!("Opening {} at {} baud", address, baud);
        let port = SerialPort::open(address, baud).map_err(|source| TransportError::Connect {
            address: address.to_string(),
            source,
        })?;

        // Opening the port toggles DTR, which resets most controllers.
        sleep(self.settle).await;

        let mut connection = SerialConnection {
            address: address.to_string(),
            port: Some(BufReader::new(port)),
            pending: Vec::new(),
        };
        connection.drain_boot_messages().await;
        Ok(Box::new(connection))
    }

    async fn release(&self) {
        tracing::info!("Serial transport released");
    }

    fn available_ports(&self) -> Vec<String> {
        match SerialPort::available_ports() {
            Ok(paths) => paths.iter().map(|p| p.display().to_string()).collect(),
            Err(e) => {
                tracing::warn!("Failed to enumerate serial ports: {}", e);
                vec![]
            }
        }
    }
}

/// An open serial line. `pending` holds the bytes of a line that has not
/// seen its newline yet.
pub struct SerialConnection {
    address: String,
    port: Option<BufReader<SerialPort>>,
    pending: Vec<u8>,
}

impl SerialConnection {
    async fn drain_boot_messages(&mut self) {
        while let Ok(line) = self.receive(DRAIN_WINDOW).await {
            tracing::debug!("{} -> {} (boot)", self.address, line);
        }
    }
}

/// Write `command` and a newline, then flush.
async fn write_command<W>(writer: &mut W, command: &str) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let line = format!("{}\n", command);
    writer.write_all(line.as_bytes()).await.map_err(TransportError::Write)?;
    writer.flush().await.map_err(TransportError::Write)?;
    Ok(())
}

/// Next trimmed, non-empty line. A partial line read before the deadline
/// stays in `pending` for the following call.
async fn read_response<R>(
    reader: &mut R,
    pending: &mut Vec<u8>,
    timeout: Duration,
) -> Result<String, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    let deadline = Instant::now() + timeout;
    loop {
        match timeout_at(deadline, reader.read_until(b'\n', pending)).await {
            Err(_) => return Err(TransportError::Timeout(timeout)),
            Ok(Err(e)) => return Err(TransportError::Read(e)),
            Ok(Ok(0)) => {
                return Err(TransportError::Read(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "serial port closed by remote",
                )));
            }
            Ok(Ok(n)) => {
                tracing::trace!("Read {} bytes", n);
                if pending.last() != Some(&b'\n') {
                    continue;
                }
                let line = String::from_utf8_lossy(pending).trim().to_string();
                pending.clear();
                if !line.is_empty() {
                    return Ok(line);
                }
            }
        }
    }
}

#[async_trait]
impl Connection for SerialConnection {
    fn address(&self) -> &str {
        &self.address
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    async fn send(&mut self, command: &str) -> Result<(), TransportError> {
        let port = self.port.as_mut().ok_or_else(TransportError::closed_for_write)?;
        tracing::debug!("{} <- {}", self.address, command);
        write_command(port, command).await
    }

    async fn receive(&mut self, timeout: Duration) -> Result<String, TransportError> {
        let port = self.port.as_mut().ok_or_else(TransportError::closed_for_read)?;
        let line = read_response(port, &mut self.pending, timeout).await?;
        tracing::debug!("{} -> {}", self.address, line);
        Ok(line)
    }

    async fn close(&mut self) {
        if self.port.take().is_some() {
            self.pending.clear();
            tracing::info!("Closed serial connection {}", self.address);
        }
    }
}

impl std::fmt::Debug for SerialConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialConnection")
            .field("address", &self.address)
            .field("open", &self.port.is_some())
            .field("pending", &self.pending.len())
            .finish()
    }
}
