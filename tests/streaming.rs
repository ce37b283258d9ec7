use krusty_fleet::config::{Config, SchedulerConfig};
use krusty_fleet::device::{Device, DeviceRegistry, DeviceSettings, DeviceState};
use krusty_fleet::kernel::Kernel;
use krusty_fleet::print_job::{JobState, PrintJob};
use krusty_fleet::scheduler::stream::stream_job;
use krusty_fleet::scheduler::{MemoryPayloads, PayloadSource, Scheduler};
use krusty_fleet::transport::SimTransport;
use std::sync::Arc;
use std::time::Duration;

const PAYLOAD: &str = "; generated\nG28\n\nG1 X10 Y10\n;layer 1\nG1 X20 E1.5\nM84\n";

fn test_config() -> Config {
    let mut config = Config::default();
    config.transport.response_timeout_ms = 100;
    config.scheduler.poll_interval_ms = 20;
    config.safety.cooldown_grace_ms = 5;
    config
}

fn settings() -> DeviceSettings {
    DeviceSettings {
        response_timeout: Duration::from_millis(100),
        cooldown_grace: Duration::from_millis(5),
        ..DeviceSettings::default()
    }
}

async fn wait_for_outcome(kernel: &Kernel, id: krusty_fleet::JobId) -> JobState {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match kernel.job_state(id).await {
                Some(state) if state.is_terminal() => return state,
                _ => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }
    })
    .await
    .expect("job never finished")
}

async fn memory(content: &str) -> Arc<MemoryPayloads> {
    let payloads = MemoryPayloads::new();
    payloads.insert("ref-A", content).await;
    Arc::new(payloads)
}

#[tokio::test]
async fn test_streamed_job_forwards_lines_in_order() {
    let transport = SimTransport::new();
    let kernel = Kernel::with_payload_source(
        test_config(),
        Arc::new(transport.clone()),
        memory(PAYLOAD).await,
    );
    let device = kernel
        .register_device(Device::new("printer-1", "sim0").with_settings(kernel.device_settings()))
        .await;
    kernel.start().await.unwrap();

    let id = kernel.schedule_job("printer-1", "ref-A", 1).await.unwrap();
    assert_eq!(wait_for_outcome(&kernel, id).await, JobState::Completed);

    assert_eq!(
        transport.firmware("sim0").received(),
        vec!["G28", "G1 X10 Y10", "G1 X20 E1.5", "M84"]
    );
    assert_eq!(device.state().await, DeviceState::Idle);
    assert_eq!(device.progress().await, 0.0);
    kernel.shutdown().await;
}

#[tokio::test]
async fn test_streamed_jobs_run_back_to_back() {
    let transport = SimTransport::new();
    let payloads = memory("G28\n").await;
    payloads.insert("ref-B", "G1 Z5\n").await;
    let kernel = Kernel::with_payload_source(test_config(), Arc::new(transport.clone()), payloads);
    kernel
        .register_device(Device::new("printer-1", "sim0").with_settings(kernel.device_settings()))
        .await;
    kernel.start().await.unwrap();

    let b = kernel.schedule_job("printer-1", "ref-B", 2).await.unwrap();
    let a = kernel.schedule_job("printer-1", "ref-A", 1).await.unwrap();
    assert_eq!(wait_for_outcome(&kernel, a).await, JobState::Completed);
    assert_eq!(wait_for_outcome(&kernel, b).await, JobState::Completed);
    assert_eq!(transport.firmware("sim0").received().len(), 2);
    kernel.shutdown().await;
}

#[tokio::test]
async fn test_missing_payload_fails_job_but_not_device() {
    let transport = SimTransport::new();
    let kernel = Kernel::with_payload_source(
        test_config(),
        Arc::new(transport.clone()),
        Arc::new(MemoryPayloads::new()),
    );
    let device = kernel
        .register_device(Device::new("printer-1", "sim0").with_settings(kernel.device_settings()))
        .await;
    kernel.start().await.unwrap();

    let id = kernel.schedule_job("printer-1", "missing", 1).await.unwrap();
    assert!(matches!(wait_for_outcome(&kernel, id).await, JobState::Failed(_)));
    assert_eq!(device.state().await, DeviceState::Idle);
    kernel.shutdown().await;
}

#[tokio::test]
async fn test_file_payloads_from_configured_root() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("cube.gcode"), "G28\nG1 Z0.2\n").unwrap();
    let mut config = test_config();
    config.scheduler.payload_root = Some(dir.path().to_path_buf());

    let transport = SimTransport::new();
    let kernel = Kernel::new(config, Arc::new(transport.clone()));
    kernel
        .register_device(Device::new("printer-1", "sim0").with_settings(kernel.device_settings()))
        .await;
    kernel.start().await.unwrap();

    let id = kernel.schedule_job("printer-1", "cube.gcode", 1).await.unwrap();
    assert_eq!(wait_for_outcome(&kernel, id).await, JobState::Completed);
    assert_eq!(transport.firmware("sim0").received(), vec!["G28", "G1 Z0.2"]);
    kernel.shutdown().await;
}

#[tokio::test]
async fn test_pause_holds_lines_until_resume() {
    let transport = SimTransport::new();
    let device = Arc::new(Device::new("printer-1", "sim0").with_settings(settings()));
    device.connect(&transport).await.unwrap();
    let job = PrintJob::new("printer-1", "ref-A", 1, 0);
    let id = job.id;
    device.start_job(job.clone()).await.unwrap();
    assert!(device.pause().await);

    let source: Arc<dyn PayloadSource> = memory(PAYLOAD).await;
    let streamer = tokio::spawn(stream_job(device.clone(), job, source));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(transport.firmware("sim0").received().is_empty());
    assert_eq!(device.progress().await, 0.0);

    assert!(device.resume().await);
    tokio::time::timeout(Duration::from_secs(1), streamer)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(transport.firmware("sim0").received().len(), 4);
    assert_eq!(device.job_outcome(id).await, Some(JobState::Completed));
    assert_eq!(device.state().await, DeviceState::Idle);
}

#[tokio::test]
async fn test_cancel_stops_streaming() {
    let transport = SimTransport::new();
    let device = Arc::new(Device::new("printer-1", "sim0").with_settings(settings()));
    device.connect(&transport).await.unwrap();
    let job = PrintJob::new("printer-1", "ref-A", 1, 0);
    let id = job.id;
    device.start_job(job.clone()).await.unwrap();
    device.pause().await;

    let source: Arc<dyn PayloadSource> = memory(PAYLOAD).await;
    let streamer = tokio::spawn(stream_job(device.clone(), job, source));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(device.cancel().await);

    tokio::time::timeout(Duration::from_secs(1), streamer)
        .await
        .unwrap()
        .unwrap();
    assert!(transport.firmware("sim0").received().is_empty());
    assert_eq!(device.job_outcome(id).await, Some(JobState::Cancelled));
}

#[tokio::test]
async fn test_write_failure_while_streaming_fails_job() {
    let transport = SimTransport::new();
    let device = Arc::new(Device::new("printer-1", "sim0").with_settings(settings()));
    device.connect(&transport).await.unwrap();
    let job = PrintJob::new("printer-1", "ref-A", 1, 0);
    let id = job.id;
    device.start_job(job.clone()).await.unwrap();
    transport.firmware("sim0").fail_writes(true);

    let source: Arc<dyn PayloadSource> = memory(PAYLOAD).await;
    stream_job(device.clone(), job, source).await;

    assert_eq!(device.state().await, DeviceState::Error);
    assert!(matches!(device.job_outcome(id).await, Some(JobState::Failed(_))));
}

#[tokio::test]
async fn test_stop_cancels_jobs_whose_streamer_was_aborted() {
    let transport = SimTransport::new();
    let device = Arc::new(Device::new("printer-1", "sim0").with_settings(DeviceSettings {
        response_timeout: Duration::from_secs(5),
        ..settings()
    }));
    device.connect(&transport).await.unwrap();
    transport.firmware("sim0").go_silent(true);

    let registry = DeviceRegistry::new();
    registry.insert(device.clone()).await;
    let scheduler = Scheduler::with_payloads(registry, SchedulerConfig::default(), memory(PAYLOAD).await);
    let id = scheduler.enqueue("printer-1", "ref-A", 1).await.unwrap();
    scheduler.run_cycle().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(device.state().await, DeviceState::Printing);

    scheduler.stop().await;
    assert_eq!(device.state().await, DeviceState::Idle);
    assert!(device.current_job().await.is_none());
    assert_eq!(device.job_outcome(id).await, Some(JobState::Cancelled));

    scheduler.run_cycle().await;
    assert_eq!(scheduler.job_state(id).await, Some(JobState::Cancelled));
    assert!(scheduler.active_jobs().await.is_empty());
}
