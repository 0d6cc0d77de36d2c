//! Monitoring end to end: donor merging, donor-only suppression, error
//! readings and the ticker feeding the worker.

mod common;

use common::{fast_ramp, register_core, Harness, RecordingSupply};
use figment::providers::{Format, Toml};
use figment::Figment;
use hv_bias::config::Settings;
use hv_bias::hardware::factory::build_registry;
use hv_bias::hardware::DeviceRegistry;
use hv_bias::storage::MeasurementStore;
use hv_bias::worker::{task_queue, MonitorTicker, Task, TaskOutcome};
use std::sync::Arc;
use std::time::Duration;
use tracing_test::traced_test;

fn paired() -> (Harness, Arc<RecordingSupply>, Arc<RecordingSupply>) {
    let primary = Arc::new(RecordingSupply::new("psu"));
    let donor = Arc::new(RecordingSupply::new("module").with_temperature(24.5));

    let mut registry = DeviceRegistry::new();
    register_core(&mut registry, 1, primary.clone());
    register_core(&mut registry, 2, donor.clone());
    registry.pair(1, 2).unwrap();

    (Harness::new(registry), primary, donor)
}

#[tokio::test]
async fn donor_temperature_is_merged_and_donor_not_stored() {
    let (harness, primary, donor) = paired();
    let worker = harness.worker(fast_ramp());

    assert!(worker.process(&Task::monitor(1)).await.is_success());
    assert!(worker.process(&Task::monitor(2)).await.is_success());

    let stored = harness.measurements.all().await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].port_id, 1);
    assert_eq!(stored[0].temperature, Some(24.5));
    assert_eq!(stored[0].raw_response, "psu ok");

    assert_eq!(primary.calls(), vec!["monitor"]);
    // Once for the merge, once for its own poll
    assert_eq!(donor.calls(), vec!["monitor", "monitor"]);

    assert!(harness.actions.all().await.is_empty());
}

#[tokio::test]
async fn error_reading_is_stored_without_fallback_values() {
    let supply = Arc::new(RecordingSupply::new("hv").with_voltage(55.0));
    let mut registry = DeviceRegistry::new();
    register_core(&mut registry, 1, supply.clone());
    let harness = Harness::new(registry);
    let worker = harness.worker(fast_ramp());

    assert!(worker.process(&Task::monitor(1)).await.is_success());
    supply.fail_monitor(true);
    let outcome = worker.process(&Task::monitor(1)).await;
    assert!(matches!(outcome, TaskOutcome::Failed(_)));

    let stored = harness
        .measurements
        .readings_since(chrono::Utc::now() - chrono::Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].voltage, Some(55.0));

    let failed = &stored[1];
    assert!(failed.is_error());
    assert_eq!(failed.voltage, None);
    assert_eq!(failed.current, None);
    assert_eq!(failed.hv_on, None);
    assert_eq!(failed.temperature, None);
}

#[tokio::test]
async fn failed_primary_is_not_merged_with_donor() {
    let (harness, primary, donor) = paired();
    primary.fail_monitor(true);

    harness.worker(fast_ramp()).process(&Task::monitor(1)).await;

    let stored = harness.measurements.all().await;
    assert_eq!(stored.len(), 1);
    assert!(stored[0].is_error());
    assert_eq!(stored[0].temperature, None);
    assert!(donor.calls().is_empty());
}

#[tokio::test]
#[traced_test]
async fn failed_donor_keeps_primary_fields() {
    let (harness, _primary, donor) = paired();
    donor.fail_monitor(true);

    let outcome = harness.worker(fast_ramp()).process(&Task::monitor(1)).await;
    assert!(outcome.is_success());

    let stored = harness.measurements.all().await;
    assert_eq!(stored.len(), 1);
    assert!(!stored[0].is_error());
    assert_eq!(stored[0].temperature, None);
    assert!(logs_contain("Donor reading failed"));
}

#[tokio::test(start_paused = true)]
async fn ticker_feeds_worker_with_simulated_devices() {
    let settings = Settings::from_figment(Figment::from(Toml::string(
        r#"
        [general]
        test_mode = true

        [[devices]]
        id = 1
        type = "serial_hv"
        connection = "/dev/null"

        [[devices]]
        id = 2
        type = "scpi_psu"
        connection = "127.0.0.1"

        [[pairings]]
        primary = 2
        donor = 1
        "#,
    )))
    .unwrap();
    settings.validate().unwrap();

    let registry = Arc::new(build_registry(&settings).await.unwrap());
    let harness = Harness {
        registry: registry.clone(),
        measurements: Arc::new(Default::default()),
        actions: Arc::new(Default::default()),
    };
    let worker = harness.worker(settings.ramp.clone());

    let (tx, mut rx) = task_queue();
    let ticker = MonitorTicker::new(registry, tx, Duration::from_secs(5));
    assert_eq!(ticker.tick_once().unwrap(), 2);

    while let Some(task) = rx.try_recv() {
        assert!(worker.process(&task).await.is_success());
    }

    let stored = harness.measurements.all().await;
    assert_eq!(stored.len(), 1, "donor-only port 1 must not be stored");
    assert_eq!(stored[0].port_id, 2);
    let temperature = stored[0].temperature.unwrap();
    assert!((24.0..26.0).contains(&temperature));
    assert_eq!(stored[0].temp_sensor_connected, Some(true));
}
