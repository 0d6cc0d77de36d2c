//! The command worker.
//!
//! A single consumer drains the task queue and executes each task to
//! completion before dequeuing the next. There is no cancellation: a TURN_OFF
//! enqueued behind a long ramp waits for the ramp to finish.
//!
//! # Per-task flow
//!
//! 1. Resolve the port. Absent or failed devices reject the task with no
//!    device call and no action-log entry.
//! 2. MONITOR polls, merges donor data and persists the reading. Only a
//!    panic or a storage failure leaves an action-log entry.
//! 3. Every other command probes for the required capability, executes and
//!    appends exactly one action-log entry whatever the outcome.
//!
//! Ramps always run their whole plan. A failed step is logged and recorded
//! in the response; TURN_OFF switches the output off after the ramp even
//! when steps failed.
//!
//! Panics raised while executing a task are caught at the task boundary, so
//! one misbehaving driver cannot stop the worker.

use super::combine::merge_donor;
use super::queue::TaskReceiver;
use super::task::{CommandKind, CompletedTask, Task, TaskOutcome};
use crate::config::RampSettings;
use crate::error::{AppResult, DeviceError};
use crate::hardware::{DeviceRegistry, HvSupply, PortId, Reading};
use crate::ramp::{ramp_down, ramp_up};
use crate::storage::{ActionLogStore, MeasurementStore};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Why a non-MONITOR command did not succeed
#[derive(Debug)]
enum DispatchError {
    NotSupported,
    Unknown(String),
    MissingArgument(&'static str),
    Device(DeviceError),
}

impl From<DeviceError> for DispatchError {
    fn from(err: DeviceError) -> Self {
        DispatchError::Device(err)
    }
}

impl From<DispatchError> for TaskOutcome {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::NotSupported => TaskOutcome::NotSupported,
            DispatchError::Unknown(name) => TaskOutcome::UnknownCommand(name),
            DispatchError::MissingArgument(what) => {
                TaskOutcome::Failed(format!("missing {}", what))
            }
            DispatchError::Device(err) => TaskOutcome::Failed(err.to_string()),
        }
    }
}

type DispatchResult = Result<String, DispatchError>;

/// Single sequential consumer of the task queue.
pub struct CommandWorker {
    registry: Arc<DeviceRegistry>,
    measurements: Arc<dyn MeasurementStore>,
    actions: Arc<dyn ActionLogStore>,
    ramp: RampSettings,
    outcomes: Option<mpsc::UnboundedSender<CompletedTask>>,
}

impl CommandWorker {
    /// Create a worker over a populated registry.
    pub fn new(
        registry: Arc<DeviceRegistry>,
        measurements: Arc<dyn MeasurementStore>,
        actions: Arc<dyn ActionLogStore>,
        ramp: RampSettings,
    ) -> Self {
        Self {
            registry,
            measurements,
            actions,
            ramp,
            outcomes: None,
        }
    }

    /// Report every processed task to `sink`, in processing order.
    #[must_use]
    pub fn with_outcome_sink(mut self, sink: mpsc::UnboundedSender<CompletedTask>) -> Self {
        self.outcomes = Some(sink);
        self
    }

    /// Spawn [`run`](Self::run) onto the runtime.
    pub fn spawn(self, receiver: TaskReceiver) -> JoinHandle<()> {
        tokio::spawn(self.run(receiver))
    }

    /// Process tasks until every sender is dropped.
    pub async fn run(mut self, mut receiver: TaskReceiver) {
        info!(ports = self.registry.len(), "Command worker started");

        while let Some(task) = receiver.recv().await {
            let outcome = self.process(&task).await;

            let sink_closed = self
                .outcomes
                .as_ref()
                .is_some_and(|sink| sink.send(CompletedTask { task, outcome }).is_err());
            if sink_closed {
                debug!("Outcome receiver dropped, no longer reporting");
                self.outcomes = None;
            }
        }

        info!("Task queue closed, command worker stopping");
    }

    /// Execute one task and return its terminal outcome.
    pub async fn process(&self, task: &Task) -> TaskOutcome {
        let port_id = task.port_id;

        let supply = match self.resolve(port_id) {
            Ok(supply) => supply,
            Err(reason) => {
                warn!(port_id, command = %task.command, %reason, "Task rejected");
                return TaskOutcome::Rejected(reason);
            }
        };

        if task.command == CommandKind::Monitor {
            return self.process_monitor(task, supply).await;
        }

        info!(port_id, command = %task.command, value = ?task.value, "Executing task");
        let outcome = match AssertUnwindSafe(self.dispatch(task, supply))
            .catch_unwind()
            .await
        {
            Ok(Ok(response)) => TaskOutcome::Success(response),
            Ok(Err(err)) => err.into(),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(port_id, command = %task.command, %message, "Task panicked");
                TaskOutcome::Failed(format!("panic: {}", message))
            }
        };

        match &outcome {
            TaskOutcome::Success(_) => {
                info!(port_id, command = %task.command, "Task completed")
            }
            other => warn!(port_id, command = %task.command, outcome = ?other, "Task did not succeed"),
        }

        self.log_action(task, &outcome).await;
        outcome
    }

    async fn log_action(&self, task: &Task, outcome: &TaskOutcome) {
        let response = outcome.log_text(&task.command);
        if let Err(e) = self
            .actions
            .save_action(task.port_id, &task.description(), &response)
            .await
        {
            error!(port_id = task.port_id, "Failed to write action log: {}", e);
        }
    }

    fn resolve(&self, port_id: PortId) -> Result<Arc<dyn HvSupply>, String> {
        let device = self
            .registry
            .get(port_id)
            .ok_or_else(|| format!("Port {} is not configured", port_id))?;

        if !device.state().is_ready() {
            return Err(format!("{} is not connected", device.label));
        }

        device
            .components
            .supply
            .clone()
            .ok_or_else(|| format!("{} has no supply", device.label))
    }

    /// A device error is reported through the stored reading. Panics and
    /// storage failures are execution errors and go to the action log.
    async fn process_monitor(&self, task: &Task, supply: Arc<dyn HvSupply>) -> TaskOutcome {
        let port_id = task.port_id;
        let result = AssertUnwindSafe(self.monitor_and_persist(port_id, supply.as_ref()))
            .catch_unwind()
            .await;

        let outcome = match result {
            Ok(Ok(reading)) => {
                return match reading.error {
                    Some(err) => TaskOutcome::Failed(err.to_string()),
                    None => TaskOutcome::Success(reading.raw_response),
                }
            }
            Ok(Err(e)) => {
                error!(port_id, "Failed to store reading: {}", e);
                TaskOutcome::Failed(e.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(port_id, %message, "Monitor panicked");
                TaskOutcome::Failed(format!("panic: {}", message))
            }
        };

        self.log_action(task, &outcome).await;
        outcome
    }

    /// Poll a port, merge donor data and persist the result.
    ///
    /// Error readings are stored as-is and never merged. Readings of ports
    /// that only act as donors are returned but not stored.
    async fn monitor_and_persist(
        &self,
        port_id: PortId,
        supply: &dyn HvSupply,
    ) -> AppResult<Reading> {
        let mut reading = supply.monitor().await;

        if let Some(err) = &reading.error {
            warn!(port_id, error = %err, raw = %reading.raw_response, "Monitor failed");
            self.measurements.save_reading(port_id, &reading).await?;
            return Ok(reading);
        }

        if let Some(donor_id) = self.registry.donor_for(port_id) {
            match self.registry.get_supply(donor_id) {
                Some(donor) => {
                    let donor_reading = donor.monitor().await;
                    reading = merge_donor(reading, &donor_reading);
                }
                None => warn!(port_id, donor_id, "Donor has no supply, skipping merge"),
            }
        }

        if self.registry.is_donor_only(port_id) {
            debug!(port_id, "Donor-only port, reading not stored");
            return Ok(reading);
        }

        self.measurements.save_reading(port_id, &reading).await?;
        debug!(port_id, voltage = ?reading.voltage, current = ?reading.current, "Reading stored");
        Ok(reading)
    }

    async fn dispatch(&self, task: &Task, supply: Arc<dyn HvSupply>) -> DispatchResult {
        let port_id = task.port_id;

        match &task.command {
            CommandKind::TurnOn => Ok(supply.turn_on().await?),
            CommandKind::Reset => Ok(supply.reset().await?),
            CommandKind::SetVoltage => {
                let volts = self.checked_voltage(task)?;
                Ok(supply.set_voltage(volts).await?)
            }
            CommandKind::Raw => {
                let command = task
                    .raw_command
                    .as_deref()
                    .filter(|c| !c.trim().is_empty())
                    .ok_or(DispatchError::MissingArgument("raw command"))?;
                Ok(supply.send_raw(command).await?)
            }
            CommandKind::TurnOff => self.turn_off_with_ramp(port_id, supply.as_ref()).await,
            CommandKind::RampVoltage => {
                let target = self.checked_voltage(task)?;
                let steps = task.ramp_steps.unwrap_or(self.ramp.default_steps);
                let delay = task
                    .ramp_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or_else(|| self.ramp.default_delay());

                let start = self.present_voltage(port_id, supply.as_ref()).await;
                let plan = ramp_up(start, target, steps);
                info!(port_id, start, target, steps = plan.len(), "Ramping voltage");
                let report = self.run_ramp(port_id, supply.as_ref(), &plan, delay).await;
                report.into_result()
            }
            CommandKind::SetCurrent => {
                let protection = self.protection(port_id)?;
                Ok(protection.set_current(required_value(task)?).await?)
            }
            CommandKind::EnableOcp => {
                let protection = self.protection(port_id)?;
                Ok(protection.enable_ocp(required_value(task)?).await?)
            }
            CommandKind::DisableOcp => Ok(self.protection(port_id)?.disable_ocp().await?),
            CommandKind::ClearTrip => Ok(self.protection(port_id)?.clear_protection_trip().await?),
            CommandKind::Unknown(name) => Err(DispatchError::Unknown(name.clone())),
            // Routed to process_monitor before dispatch
            CommandKind::Monitor => Ok(supply.monitor().await.raw_response),
        }
    }

    fn protection(
        &self,
        port_id: PortId,
    ) -> Result<Arc<dyn crate::hardware::CurrentProtection>, DispatchError> {
        self.registry
            .get_current_protection(port_id)
            .ok_or(DispatchError::NotSupported)
    }

    /// Target voltage of a task, checked against the port limit.
    fn checked_voltage(&self, task: &Task) -> Result<f64, DispatchError> {
        let volts = required_value(task)?;
        if let Some(limit) = self.registry.max_voltage(task.port_id) {
            if volts > limit {
                return Err(DeviceError::VoltageLimit {
                    requested: volts,
                    limit,
                }
                .into());
            }
        }
        Ok(volts)
    }

    /// Measured output voltage, or the configured fallback if unavailable.
    async fn present_voltage(&self, port_id: PortId, supply: &dyn HvSupply) -> f64 {
        let reading = supply.monitor().await;
        match reading.voltage.filter(|_| !reading.is_error()) {
            Some(volts) => volts,
            None => {
                warn!(
                    port_id,
                    fallback = self.ramp.fallback_start_volts,
                    "Present voltage unavailable, assuming fallback"
                );
                self.ramp.fallback_start_volts
            }
        }
    }

    async fn turn_off_with_ramp(&self, port_id: PortId, supply: &dyn HvSupply) -> DispatchResult {
        let floor = self.ramp.safe_floor_volts;
        let start = self.present_voltage(port_id, supply).await;

        let report = if start > floor {
            let plan = ramp_down(start, floor, self.ramp.turn_off_steps);
            info!(port_id, start, floor, steps = plan.len(), "Ramping down before turn-off");
            self.run_ramp(port_id, supply, &plan, self.ramp.turn_off_delay())
                .await
        } else {
            RampReport::default()
        };

        let response = supply.turn_off().await?;
        Ok(report.annotate(response))
    }

    /// Apply each setpoint, persisting a reading after every step.
    ///
    /// A failed setpoint is logged and the plan continues.
    async fn run_ramp(
        &self,
        port_id: PortId,
        supply: &dyn HvSupply,
        plan: &[f64],
        delay: Duration,
    ) -> RampReport {
        let mut report = RampReport::default();

        for (i, &volts) in plan.iter().enumerate() {
            match supply.set_voltage(volts).await {
                Ok(response) => report.last_response = Some(response),
                Err(e) => {
                    error!(port_id, volts, step = i + 1, "Ramp step failed: {}", e);
                    report.failures.push(format!("{}V: {}", volts, e));
                    report.last_error = Some(e);
                }
            }

            if let Err(e) = self.monitor_and_persist(port_id, supply).await {
                error!(port_id, "Failed to store ramp reading: {}", e);
            }

            if i + 1 < plan.len() && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        report
    }
}

/// What a completed ramp left behind.
#[derive(Debug, Default)]
struct RampReport {
    /// Response to the last setpoint the device accepted
    last_response: Option<String>,
    /// One `<volts>V: <error>` entry per failed step
    failures: Vec<String>,
    last_error: Option<DeviceError>,
}

impl RampReport {
    /// Append step failures, if any, to a device response.
    fn annotate(&self, response: String) -> String {
        if self.failures.is_empty() {
            response
        } else {
            format!(
                "{} (ramp step errors: {})",
                response,
                self.failures.join("; ")
            )
        }
    }

    /// A ramp where no step was accepted fails with the last error.
    fn into_result(self) -> DispatchResult {
        match (&self.last_response, &self.last_error) {
            (None, Some(err)) => Err(err.clone().into()),
            (response, _) => Ok(self.annotate(response.clone().unwrap_or_default())),
        }
    }
}

fn required_value(task: &Task) -> Result<f64, DispatchError> {
    match task.value {
        Some(v) if v.is_finite() => Ok(v),
        Some(v) => Err(DeviceError::InvalidArgument(format!("{} is not a finite value", v)).into()),
        None => Err(DispatchError::MissingArgument("value")),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{SimulatedHvModule, SimulatedScpiSupply};
    use crate::hardware::{DeviceComponents, RegisteredDevice};
    use crate::storage::{InMemoryActionLog, InMemoryMeasurementStore};

    struct Fixture {
        worker: CommandWorker,
        measurements: Arc<InMemoryMeasurementStore>,
        actions: Arc<InMemoryActionLog>,
        module: Arc<SimulatedHvModule>,
        supply: Arc<SimulatedScpiSupply>,
    }

    fn fixture() -> Fixture {
        let module = Arc::new(SimulatedHvModule::new("sim-1").with_latency(Duration::ZERO));
        let supply = Arc::new(SimulatedScpiSupply::new("sim-2").with_latency(Duration::ZERO));

        let mut registry = DeviceRegistry::new();
        registry
            .register(
                1,
                RegisteredDevice::new(DeviceComponents::new().with_supply(module.clone()))
                    .with_max_voltage(Some(80.0)),
            )
            .unwrap();
        registry
            .register(
                2,
                RegisteredDevice::new(
                    DeviceComponents::new()
                        .with_supply(supply.clone())
                        .with_current_protection(supply.clone()),
                ),
            )
            .unwrap();
        registry
            .register(3, RegisteredDevice::new(DeviceComponents::new()))
            .unwrap();

        let measurements = Arc::new(InMemoryMeasurementStore::new());
        let actions = Arc::new(InMemoryActionLog::new());
        let ramp = RampSettings {
            default_delay_ms: 0,
            turn_off_delay_ms: 0,
            ..RampSettings::default()
        };
        let worker = CommandWorker::new(
            Arc::new(registry),
            measurements.clone(),
            actions.clone(),
            ramp,
        );

        Fixture {
            worker,
            measurements,
            actions,
            module,
            supply,
        }
    }

    #[tokio::test]
    async fn set_voltage_logs_action() {
        let f = fixture();
        let outcome = f
            .worker
            .process(&Task::with_value(1, CommandKind::SetVoltage, 55.0))
            .await;

        assert_eq!(outcome, TaskOutcome::Success("hbv_ok".to_string()));
        assert_eq!(f.module.setpoint().await, 55.0);

        let actions = f.actions.all().await;
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].command, "SET_VOLTAGE: 55V");
        assert_eq!(actions[0].raw_response, "hbv_ok");
        assert!(f.measurements.all().await.is_empty());
    }

    #[tokio::test]
    async fn voltage_limit_is_enforced() {
        let f = fixture();
        let outcome = f
            .worker
            .process(&Task::with_value(1, CommandKind::SetVoltage, 90.0))
            .await;

        assert!(matches!(outcome, TaskOutcome::Failed(ref m) if m.contains("90")));
        assert_eq!(f.module.setpoint().await, 0.0);
        assert_eq!(f.actions.all().await.len(), 1);
    }

    #[tokio::test]
    async fn unsupported_command_logs_once() {
        let f = fixture();
        let outcome = f
            .worker
            .process(&Task::with_value(1, CommandKind::SetCurrent, 0.5))
            .await;

        assert_eq!(outcome, TaskOutcome::NotSupported);
        let actions = f.actions.all().await;
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].command, "SET_CURRENT: 0.5A");
        assert!(actions[0].raw_response.contains("not supported"));
    }

    #[tokio::test]
    async fn failed_port_is_rejected_silently() {
        let f = fixture();
        let outcome = f.worker.process(&Task::new(3, CommandKind::TurnOn)).await;
        assert!(matches!(outcome, TaskOutcome::Rejected(_)));

        let outcome = f.worker.process(&Task::monitor(42)).await;
        assert!(matches!(outcome, TaskOutcome::Rejected(_)));

        assert!(f.actions.all().await.is_empty());
        assert!(f.measurements.all().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_command_is_reported() {
        let f = fixture();
        let outcome = f.worker.process(&Task::new(2, "WARP_SPEED")).await;
        assert_eq!(outcome, TaskOutcome::UnknownCommand("WARP_SPEED".to_string()));

        let actions = f.actions.all().await;
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].command, "WARP_SPEED");
    }

    #[tokio::test]
    async fn missing_value_fails() {
        let f = fixture();
        let outcome = f.worker.process(&Task::new(2, CommandKind::EnableOcp)).await;
        assert_eq!(outcome, TaskOutcome::Failed("missing value".to_string()));
    }

    #[tokio::test]
    async fn ramp_persists_each_step() {
        let f = fixture();
        f.worker.process(&Task::new(2, CommandKind::TurnOn)).await;
        f.supply.set_voltage(20.0).await.unwrap();

        let outcome = f.worker.process(&Task::ramp(2, 60.0, Some(4), Some(0))).await;
        assert!(outcome.is_success());
        assert_eq!(f.supply.setpoint().await, 60.0);

        // One reading per applied step
        let stored = f.measurements.for_port(2).await;
        assert!(!stored.is_empty() && stored.len() <= 4);

        let actions = f.actions.all().await;
        assert_eq!(actions.last().unwrap().command, "RAMP_VOLTAGE to 60V");
    }

    #[tokio::test]
    async fn monitor_produces_no_action_entry() {
        let f = fixture();
        let outcome = f.worker.process(&Task::monitor(1)).await;
        assert!(outcome.is_success());
        assert_eq!(f.measurements.all().await.len(), 1);
        assert!(f.actions.all().await.is_empty());
    }

    struct FullDisk;

    #[async_trait::async_trait]
    impl MeasurementStore for FullDisk {
        async fn save_reading(&self, _port_id: PortId, _reading: &Reading) -> AppResult<()> {
            Err(crate::error::HvError::Storage("disk full".to_string()))
        }

        async fn readings_since(
            &self,
            _since: chrono::DateTime<chrono::Utc>,
        ) -> AppResult<Vec<crate::storage::MeasurementRecord>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn monitor_storage_failure_is_logged_as_action() {
        let f = fixture();
        let worker = CommandWorker::new(
            f.worker.registry.clone(),
            Arc::new(FullDisk),
            f.actions.clone(),
            f.worker.ramp.clone(),
        );

        let outcome = worker.process(&Task::monitor(1)).await;
        assert_eq!(
            outcome,
            TaskOutcome::Failed("Storage error: disk full".to_string())
        );

        let actions = f.actions.all().await;
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].command, "MONITOR");
        assert_eq!(
            actions[0].raw_response,
            "ERROR executing MONITOR: Storage error: disk full"
        );
    }

    #[test]
    fn panic_messages() {
        let boxed: Box<dyn Any + Send> = Box::new("driver exploded");
        assert_eq!(panic_message(boxed.as_ref()), "driver exploded");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
