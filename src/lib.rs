// src/lib.rs - Fleet host core: transport, devices, scheduling and lifecycle
pub mod config;
pub mod device;
pub mod kernel;
pub mod print_job;
pub mod scheduler;
pub mod transport;

pub use config::{load_config, Config, ConfigError};
pub use device::{AxisMove, Device, DeviceError, DeviceSettings, DeviceState, DeviceStatus};
pub use kernel::{Kernel, KernelError};
pub use print_job::{JobId, JobState, PrintJob};
pub use scheduler::{FilePayloads, MemoryPayloads, PayloadSource, Scheduler, SchedulerError};
pub use transport::{Connection, SerialTransport, SimTransport, Transport, TransportError};
