use krusty_fleet::config::{Config, DeviceConfig};
use krusty_fleet::device::{Device, DeviceError, DeviceState};
use krusty_fleet::kernel::{Kernel, KernelError};
use krusty_fleet::print_job::JobState;
use krusty_fleet::transport::SimTransport;
use std::sync::Arc;
use std::time::Duration;

fn test_config() -> Config {
    let mut config = Config::default();
    config.transport.response_timeout_ms = 100;
    config.scheduler.poll_interval_ms = 20;
    config.scheduler.stream_payloads = false;
    config.safety.cooldown_grace_ms = 5;
    config
}

async fn wait_for_state(device: &Device, state: DeviceState) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while device.state().await != state {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("device never reached {}", state));
}

fn kernel_with_sim() -> (Kernel, SimTransport) {
    let transport = SimTransport::new();
    let kernel = Kernel::new(test_config(), Arc::new(transport.clone()));
    (kernel, transport)
}

#[tokio::test]
async fn test_schedule_start_and_complete() {
    let (kernel, _transport) = kernel_with_sim();
    let device = Device::new("printer-1", "sim0").with_settings(kernel.device_settings());
    let device = kernel.register_device(device).await;

    let id = kernel.schedule_job("printer-1", "ref-A", 1).await.unwrap();
    assert_eq!(kernel.job_state(id).await, Some(JobState::Pending));
    kernel.start().await.unwrap();

    wait_for_state(&device, DeviceState::Printing).await;
    assert_eq!(device.progress().await, 0.0);
    assert_eq!(device.current_job().await.unwrap().payload, "ref-A");

    assert!(device.complete().await);
    assert_eq!(device.state().await, DeviceState::Idle);
    assert_eq!(device.progress().await, 0.0);

    tokio::time::timeout(Duration::from_secs(1), async {
        while kernel.job_state(id).await != Some(JobState::Completed) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    kernel.shutdown().await;
    assert_eq!(device.state().await, DeviceState::Offline);
}

#[tokio::test]
async fn test_unknown_device_is_rejected() {
    let (kernel, _transport) = kernel_with_sim();
    assert!(matches!(
        kernel.schedule_job("ghost", "a.gcode", 1).await,
        Err(KernelError::UnknownDevice(_))
    ));
    assert!(matches!(
        kernel.pause_job("ghost").await,
        Err(KernelError::UnknownDevice(_))
    ));
    assert!(kernel.get_device("ghost").await.is_none());
}

#[tokio::test]
async fn test_error_device_rejects_jobs_until_reconnect() {
    let (kernel, transport) = kernel_with_sim();
    let device = Device::new("printer-1", "sim0").with_settings(kernel.device_settings());
    let device = kernel.register_device(device).await;
    kernel.connect_device("printer-1").await.unwrap();

    let firmware = transport.firmware("sim0");
    firmware.fail_writes(true);
    assert!(kernel.send_command("printer-1", "M105").await.is_err());
    assert_eq!(device.state().await, DeviceState::Error);

    assert!(matches!(
        kernel.schedule_job("printer-1", "a.gcode", 1).await,
        Err(KernelError::Device(DeviceError::InvalidTransition {
            state: DeviceState::Error,
            ..
        }))
    ));

    firmware.fail_writes(false);
    kernel.connect_device("printer-1").await.unwrap();
    assert!(kernel.schedule_job("printer-1", "a.gcode", 1).await.is_ok());
}

#[tokio::test]
async fn test_shutdown_survives_failing_device() {
    let mut config = test_config();
    for (id, address) in [("printer-1", "sim0"), ("printer-2", "sim1")] {
        config.devices.push(DeviceConfig {
            id: id.to_string(),
            name: None,
            address: address.to_string(),
            baud: None,
        });
    }
    let transport = SimTransport::new();
    let kernel = Kernel::new(config, Arc::new(transport.clone()));
    let devices = kernel.register_configured_devices().await;
    kernel.start().await.unwrap();
    for device in &devices {
        assert_eq!(device.state().await, DeviceState::Idle);
    }

    kernel.schedule_job("printer-2", "a.gcode", 1).await.unwrap();
    wait_for_state(&devices[1], DeviceState::Printing).await;

    transport.firmware("sim0").fail_writes(true);
    kernel.shutdown().await;
    for device in &devices {
        assert_eq!(device.state().await, DeviceState::Offline);
        assert!(device.current_job().await.is_none());
    }
    assert_eq!(transport.firmware("sim1").targets(), (0.0, 0.0));

    kernel.shutdown().await;
    assert_eq!(transport.firmware("sim0").closes(), 1);
    assert_eq!(transport.firmware("sim1").closes(), 1);
}

#[tokio::test]
async fn test_start_leaves_unreachable_device_offline() {
    let (kernel, transport) = kernel_with_sim();
    transport.firmware("sim9").refuse_connections(true);
    let device = Device::new("printer-9", "sim9").with_settings(kernel.device_settings());
    let device = kernel.register_device(device).await;

    kernel.start().await.unwrap();
    assert_eq!(device.state().await, DeviceState::Offline);

    let id = kernel.schedule_job("printer-9", "a.gcode", 1).await.unwrap();
    kernel.scheduler().run_cycle().await;
    assert_eq!(kernel.job_state(id).await, Some(JobState::Pending));
    kernel.shutdown().await;
}

#[tokio::test]
async fn test_deregistered_device_fails_active_job() {
    let (kernel, _transport) = kernel_with_sim();
    let device = Device::new("printer-1", "sim0").with_settings(kernel.device_settings());
    kernel.register_device(device).await;
    kernel.connect_device("printer-1").await.unwrap();

    let id = kernel.schedule_job("printer-1", "a.gcode", 1).await.unwrap();
    assert_eq!(kernel.scheduler().run_cycle().await, 1);
    assert!(kernel.deregister_device("printer-1").await.is_some());
    kernel.scheduler().run_cycle().await;

    assert!(matches!(kernel.job_state(id).await, Some(JobState::Failed(_))));
    assert!(kernel.devices().await.is_empty());
}

#[tokio::test]
async fn test_device_statuses_sorted() {
    let (kernel, _transport) = kernel_with_sim();
    kernel.register_device(Device::new("b", "sim1").with_name("Bravo")).await;
    kernel.register_device(Device::new("a", "sim0")).await;

    let statuses = kernel.devices().await;
    let ids: Vec<&str> = statuses.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert_eq!(statuses[1].name, "Bravo");

    let json = serde_json::to_value(&statuses[0]).unwrap();
    assert_eq!(json["state"], "OFFLINE");
}

#[tokio::test]
async fn test_job_scheduled_during_shutdown_stays_pending() {
    let mut config = test_config();
    config.safety.cooldown_grace_ms = 300;
    let kernel = Arc::new(Kernel::new(config, Arc::new(SimTransport::new())));
    let device = kernel
        .register_device(Device::new("printer-1", "sim0").with_settings(kernel.device_settings()))
        .await;
    kernel.start().await.unwrap();
    assert_eq!(device.state().await, DeviceState::Idle);

    let shutdown = tokio::spawn({
        let kernel = kernel.clone();
        async move { kernel.shutdown().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let id = kernel.schedule_job("printer-1", "ref-A", 1).await.unwrap();

    // Give the dispatch loop several cycles while the device cools down.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_ne!(device.state().await, DeviceState::Printing);
    assert!(device.current_job().await.is_none());

    shutdown.await.unwrap();
    assert_eq!(device.state().await, DeviceState::Offline);
    assert_eq!(kernel.job_state(id).await, Some(JobState::Pending));
    assert!(device.job_outcome(id).await.is_none());
    assert_eq!(kernel.queue_status().await.len(), 1);
}

#[tokio::test]
async fn test_start_connects_devices_in_parallel() {
    let transport = SimTransport::new().with_settle(Duration::from_millis(300));
    let kernel = Kernel::new(test_config(), Arc::new(transport));
    let mut devices = Vec::new();
    for (id, address) in [("printer-1", "sim0"), ("printer-2", "sim1"), ("printer-3", "sim2")] {
        let device = Device::new(id, address).with_settings(kernel.device_settings());
        devices.push(kernel.register_device(device).await);
    }

    let started = tokio::time::Instant::now();
    kernel.start().await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_millis(800), "start took {:?}", elapsed);
    for device in &devices {
        assert_eq!(device.state().await, DeviceState::Idle);
    }
    kernel.shutdown().await;
}
