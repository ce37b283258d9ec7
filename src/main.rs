// src/main.rs - fleet-host launcher
use clap::{Parser, Subcommand};
use krusty_fleet::config::{self, Config};
use krusty_fleet::kernel::Kernel;
use krusty_fleet::transport::{SerialTransport, SimTransport, Transport};
use std::sync::Arc;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

const DEFAULT_PRIORITY: i32 = 1;

#[derive(Parser, Debug)]
#[command(name = "fleet-host", version, about = "Drive a fleet of serial 3D printers")]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect the configured devices and run the scheduler until Ctrl-C
    Run {
        #[arg(short, long, default_value = "fleet.toml")]
        config: String,
        /// Use simulated controllers instead of serial ports
        #[arg(long)]
        simulate: bool,
        /// Queue a job at startup: <device>:<payload>[:<priority>]
        #[arg(long = "job", value_name = "JOB")]
        jobs: Vec<String>,
    },
    /// Load and validate a configuration file
    CheckConfig {
        #[arg(short, long, default_value = "fleet.toml")]
        config: String,
    },
    /// List serial ports known to the OS
    Ports,
}

/// Split `<device>:<payload>[:<priority>]`.
fn parse_job_arg(arg: &str) -> Result<(String, String, i32), String> {
    let (device, rest) = arg
        .split_once(':')
        .ok_or_else(|| format!("job '{}' is missing a payload", arg))?;
    let (payload, priority) = match rest.rsplit_once(':') {
        Some((payload, priority)) => match priority.parse::<i32>() {
            Ok(priority) => (payload, priority),
            Err(_) => (rest, DEFAULT_PRIORITY),
        },
        None => (rest, DEFAULT_PRIORITY),
    };
    if device.is_empty() || payload.is_empty() {
        return Err(format!("job '{}' needs both a device and a payload", arg));
    }
    Ok((device.to_string(), payload.to_string(), priority))
}

fn load(path: &str) -> Result<Config, BoxError> {
    tracing::info!("Loading configuration from: {}", path);
    let config = config::load_config(path).map_err(|e| {
        tracing::error!("Failed to load config from '{}': {}", path, e);
        Box::new(e) as BoxError
    })?;
    config.validate().map_err(|e| {
        tracing::error!("Invalid configuration in '{}': {}", path, e);
        Box::new(e) as BoxError
    })?;
    Ok(config)
}

async fn run(config_path: &str, simulate: bool, jobs: Vec<String>) -> Result<(), BoxError> {
    let jobs = jobs
        .iter()
        .map(|arg| parse_job_arg(arg))
        .collect::<Result<Vec<_>, _>>()?;
    let config = load(config_path)?;

    let transport: Arc<dyn Transport> = if simulate {
        tracing::info!("Using simulated controllers");
        Arc::new(SimTransport::new().with_settle(config.transport.settle()))
    } else {
        Arc::new(SerialTransport::from_config(&config.transport))
    };

    let kernel = Kernel::new(config, transport);
    let devices = kernel.register_configured_devices().await;
    if devices.is_empty() {
        tracing::warn!("No devices configured");
    }
    kernel.start().await?;

    for (device, payload, priority) in jobs {
        match kernel.schedule_job(&device, &payload, priority).await {
            Ok(id) => tracing::info!("Scheduled job {} on {}", id, device),
            Err(e) => tracing::error!("Could not schedule '{}' on {}: {}", payload, device, e),
        }
    }

    tracing::info!("Running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    kernel.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    tracing::info!("Starting fleet-host {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Run {
            config,
            simulate,
            jobs,
        } => run(&config, simulate, jobs).await,
        Command::CheckConfig { config } => {
            let config = load(&config)?;
            tracing::info!(
                "Configuration OK: {} device(s), {} material profile(s)",
                config.devices.len(),
                config.materials.len()
            );
            for device in &config.devices {
                tracing::info!("  {} @ {}", device.id, device.address);
            }
            Ok(())
        }
        Command::Ports => {
            let ports = SerialTransport::default().available_ports();
            if ports.is_empty() {
                tracing::warn!("No serial ports found");
            }
            for port in ports {
                println!("{}", port);
            }
            Ok(())
        }
    }
}
