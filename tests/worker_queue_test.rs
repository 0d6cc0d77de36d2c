//! The worker as a queue consumer: ordering, serialization and panic
//! containment.

mod common;

use common::{fast_ramp, register_core, ConcurrencyGauge, Harness, RecordingSupply};
use hv_bias::hardware::DeviceRegistry;
use hv_bias::worker::{task_queue, CommandKind, CompletedTask, Task, TaskOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

async fn drain(mut rx: mpsc::UnboundedReceiver<CompletedTask>) -> Vec<CompletedTask> {
    let mut completed = Vec::new();
    while let Some(c) = rx.recv().await {
        completed.push(c);
    }
    completed
}

#[tokio::test(start_paused = true)]
async fn device_calls_never_overlap_across_ports() {
    let gauge = Arc::new(ConcurrencyGauge::default());
    let a = Arc::new(
        RecordingSupply::new("a")
            .with_latency(Duration::from_millis(10))
            .with_gauge(gauge.clone()),
    );
    let b = Arc::new(
        RecordingSupply::new("b")
            .with_latency(Duration::from_millis(10))
            .with_gauge(gauge.clone()),
    );

    let mut registry = DeviceRegistry::new();
    register_core(&mut registry, 1, a.clone());
    register_core(&mut registry, 2, b.clone());
    let harness = Harness::new(registry);

    let (tx, rx) = task_queue();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let handle = harness
        .worker(fast_ramp())
        .with_outcome_sink(out_tx)
        .spawn(rx);

    // Producers on separate tasks, like the API layer and the ticker
    let api = tx.clone();
    let producer = tokio::spawn(async move {
        for i in 0..5 {
            api.enqueue(Task::with_value(1, CommandKind::SetVoltage, 30.0 + f64::from(i)))
                .unwrap();
            api.enqueue(Task::ramp(2, 40.0, Some(3), Some(5))).unwrap();
        }
    });
    for _ in 0..5 {
        tx.enqueue(Task::monitor(1)).unwrap();
        tx.enqueue(Task::monitor(2)).unwrap();
    }
    producer.await.unwrap();
    drop(tx);

    handle.await.unwrap();
    let completed = drain(out_rx).await;

    assert_eq!(completed.len(), 20);
    assert!(completed.iter().all(|c| c.outcome.is_success()));
    assert_eq!(gauge.max_in_flight(), 1);
}

#[tokio::test]
async fn outcomes_follow_enqueue_order() {
    let supply = Arc::new(RecordingSupply::new("hv"));
    let mut registry = DeviceRegistry::new();
    register_core(&mut registry, 1, supply.clone());
    let harness = Harness::new(registry);

    let (tx, rx) = task_queue();
    let (out_tx, out_rx) = mpsc::unbounded_channel();

    tx.enqueue(Task::ramp(1, 30.0, Some(2), Some(0))).unwrap();
    tx.enqueue(Task::new(1, CommandKind::TurnOff)).unwrap();
    tx.enqueue(Task::monitor(9)).unwrap();
    drop(tx);

    harness
        .worker(fast_ramp())
        .with_outcome_sink(out_tx)
        .run(rx)
        .await;
    let completed = drain(out_rx).await;

    let kinds: Vec<_> = completed.iter().map(|c| c.task.command.clone()).collect();
    assert_eq!(
        kinds,
        vec![CommandKind::RampVoltage, CommandKind::TurnOff, CommandKind::Monitor]
    );
    assert!(matches!(completed[2].outcome, TaskOutcome::Rejected(_)));

    // The turn-off ran only after the whole ramp
    let calls = supply.calls();
    let last_ramp_step = calls.iter().position(|c| c == "set_voltage 30").unwrap();
    let turn_off = calls.iter().position(|c| c == "turn_off").unwrap();
    assert!(last_ramp_step < turn_off);
}

#[tokio::test]
async fn panicking_driver_does_not_stop_the_worker() {
    let supply = Arc::new(RecordingSupply::new("flaky").panicking_on("reset"));
    let mut registry = DeviceRegistry::new();
    register_core(&mut registry, 1, supply.clone());
    let harness = Harness::new(registry);

    let (tx, rx) = task_queue();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let handle = harness
        .worker(fast_ramp())
        .with_outcome_sink(out_tx)
        .spawn(rx);

    tx.enqueue(Task::new(1, CommandKind::Reset)).unwrap();
    tx.enqueue(Task::new(1, CommandKind::TurnOn)).unwrap();
    drop(tx);

    handle.await.unwrap();
    let completed = drain(out_rx).await;

    assert_eq!(completed.len(), 2);
    assert!(matches!(&completed[0].outcome, TaskOutcome::Failed(m) if m.contains("blew up")));
    assert_eq!(completed[1].outcome, TaskOutcome::Success("on".to_string()));

    let actions = harness.actions.all().await;
    assert_eq!(actions.len(), 2);
    assert_eq!(actions[0].command, "RESET");
    assert!(actions[0].raw_response.starts_with("ERROR executing RESET"));
}

#[tokio::test]
async fn monitor_panic_is_written_to_the_action_log() {
    let supply = Arc::new(RecordingSupply::new("flaky").panicking_on("monitor"));
    let mut registry = DeviceRegistry::new();
    register_core(&mut registry, 1, supply);
    let harness = Harness::new(registry);

    let outcome = harness.worker(fast_ramp()).process(&Task::monitor(1)).await;
    assert!(matches!(&outcome, TaskOutcome::Failed(m) if m.contains("blew up")));

    let actions = harness.actions.all().await;
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].command, "MONITOR");
    assert!(actions[0]
        .raw_response
        .starts_with("ERROR executing MONITOR: panic: flaky blew up"));
    assert!(harness.measurements.all().await.is_empty());
}

#[tokio::test]
async fn failed_monitor_reading_stays_out_of_the_action_log() {
    let supply = Arc::new(RecordingSupply::new("quiet"));
    supply.fail_monitor(true);
    let mut registry = DeviceRegistry::new();
    register_core(&mut registry, 1, supply);
    let harness = Harness::new(registry);

    let outcome = harness.worker(fast_ramp()).process(&Task::monitor(1)).await;
    assert!(!outcome.is_success());
    assert!(harness.actions.all().await.is_empty());
    assert_eq!(harness.measurements.all().await.len(), 1);
}
