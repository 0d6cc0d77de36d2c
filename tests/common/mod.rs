//! Shared helpers for hv_bias integration tests
//!
//! - [`RecordingSupply`]: scripted device that records every call and
//!   tracks how many calls are in flight at once
//! - [`Harness`]: worker wired to in-memory stores

#![allow(dead_code)] // Not every test uses every helper

use async_trait::async_trait;
use hv_bias::config::RampSettings;
use hv_bias::error::{DeviceError, DeviceResult};
use hv_bias::hardware::{
    CurrentProtection, DeviceComponents, DeviceRegistry, DeviceState, HvSupply, PortId, Reading,
    RegisteredDevice,
};
use hv_bias::storage::{InMemoryActionLog, InMemoryMeasurementStore};
use hv_bias::worker::CommandWorker;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Counts concurrent device calls across any number of devices.
#[derive(Debug, Default)]
pub struct ConcurrencyGauge {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ConcurrencyGauge {
    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Highest number of simultaneous calls observed
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

/// Scripted device recording every call.
pub struct RecordingSupply {
    name: String,
    calls: Mutex<Vec<String>>,
    voltage: Mutex<f64>,
    temperature: Option<f64>,
    latency: Duration,
    gauge: Arc<ConcurrencyGauge>,
    monitor_fails: AtomicBool,
    set_voltage_fails: AtomicBool,
    panic_on: Option<&'static str>,
}

impl RecordingSupply {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            calls: Mutex::new(Vec::new()),
            voltage: Mutex::new(0.0),
            temperature: None,
            latency: Duration::ZERO,
            gauge: Arc::new(ConcurrencyGauge::default()),
            monitor_fails: AtomicBool::new(false),
            set_voltage_fails: AtomicBool::new(false),
            panic_on: None,
        }
    }

    pub fn with_voltage(self, volts: f64) -> Self {
        *self.voltage.lock().unwrap() = volts;
        self
    }

    pub fn with_temperature(mut self, celsius: f64) -> Self {
        self.temperature = Some(celsius);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_gauge(mut self, gauge: Arc<ConcurrencyGauge>) -> Self {
        self.gauge = gauge;
        self
    }

    pub fn panicking_on(mut self, call: &'static str) -> Self {
        self.panic_on = Some(call);
        self
    }

    pub fn fail_monitor(&self, fail: bool) {
        self.monitor_fails.store(fail, Ordering::SeqCst);
    }

    /// Make every `set_voltage` time out without changing the output
    pub fn fail_set_voltage(&self, fail: bool) {
        self.set_voltage_fails.store(fail, Ordering::SeqCst);
    }

    /// Calls in order, e.g. `["monitor", "set_voltage 55"]`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Values passed to `set_voltage`, in order
    pub fn voltages_set(&self) -> Vec<f64> {
        self.calls()
            .iter()
            .filter_map(|c| c.strip_prefix("set_voltage "))
            .filter_map(|v| v.parse().ok())
            .collect()
    }

    async fn call(&self, name: String) {
        self.gauge.enter();
        self.calls.lock().unwrap().push(name.clone());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.gauge.exit();

        if self.panic_on.is_some_and(|p| name.starts_with(p)) {
            panic!("{} blew up on {}", self.name, name);
        }
    }
}

#[async_trait]
impl HvSupply for RecordingSupply {
    fn state(&self) -> DeviceState {
        DeviceState::Ready
    }

    fn describe(&self) -> String {
        format!("recording:{}", self.name)
    }

    async fn turn_on(&self) -> DeviceResult<String> {
        self.call("turn_on".into()).await;
        Ok("on".into())
    }

    async fn turn_off(&self) -> DeviceResult<String> {
        self.call("turn_off".into()).await;
        Ok("off".into())
    }

    async fn reset(&self) -> DeviceResult<String> {
        self.call("reset".into()).await;
        Ok("reset".into())
    }

    async fn set_voltage(&self, volts: f64) -> DeviceResult<String> {
        self.call(format!("set_voltage {}", volts)).await;
        if self.set_voltage_fails.load(Ordering::SeqCst) {
            return Err(DeviceError::NoResponse);
        }
        *self.voltage.lock().unwrap() = volts;
        Ok(format!("set {}", volts))
    }

    async fn send_raw(&self, command: &str) -> DeviceResult<String> {
        self.call(format!("raw {}", command)).await;
        Ok(format!("echo {}", command))
    }

    async fn monitor(&self) -> Reading {
        self.call("monitor".into()).await;
        if self.monitor_fails.load(Ordering::SeqCst) {
            return Reading::failed(DeviceError::NoResponse, "");
        }
        let voltage = *self.voltage.lock().unwrap();
        Reading {
            voltage: Some(voltage),
            current: Some(0.01),
            temperature: self.temperature,
            hv_on: Some(true),
            overcurrent_active: Some(false),
            current_out_of_spec: Some(false),
            raw_response: format!("{} ok", self.name),
            ..Reading::default()
        }
    }
}

#[async_trait]
impl CurrentProtection for RecordingSupply {
    async fn set_current(&self, amps: f64) -> DeviceResult<String> {
        self.call(format!("set_current {}", amps)).await;
        Ok("curr".into())
    }

    async fn enable_ocp(&self, trip_amps: f64) -> DeviceResult<String> {
        self.call(format!("enable_ocp {}", trip_amps)).await;
        Ok("ocp".into())
    }

    async fn disable_ocp(&self) -> DeviceResult<String> {
        self.call("disable_ocp".into()).await;
        Ok("ocp off".into())
    }

    async fn clear_protection_trip(&self) -> DeviceResult<String> {
        self.call("clear_trip".into()).await;
        Ok("cleared".into())
    }
}

/// Register a supply exposing only the core capability set.
pub fn register_core(registry: &mut DeviceRegistry, port: PortId, supply: Arc<RecordingSupply>) {
    registry
        .register(
            port,
            RegisteredDevice::new(DeviceComponents::new().with_supply(supply)),
        )
        .unwrap();
}

/// Register a supply exposing both capability sets.
pub fn register_full(registry: &mut DeviceRegistry, port: PortId, supply: Arc<RecordingSupply>) {
    registry
        .register(
            port,
            RegisteredDevice::new(
                DeviceComponents::new()
                    .with_supply(supply.clone())
                    .with_current_protection(supply),
            ),
        )
        .unwrap();
}

/// Ramp settings without inter-step delays
pub fn fast_ramp() -> RampSettings {
    RampSettings {
        default_delay_ms: 0,
        turn_off_delay_ms: 0,
        ..RampSettings::default()
    }
}

/// Worker wired to in-memory stores
pub struct Harness {
    pub registry: Arc<DeviceRegistry>,
    pub measurements: Arc<InMemoryMeasurementStore>,
    pub actions: Arc<InMemoryActionLog>,
}

impl Harness {
    pub fn new(registry: DeviceRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            measurements: Arc::new(InMemoryMeasurementStore::new()),
            actions: Arc::new(InMemoryActionLog::new()),
        }
    }

    pub fn worker(&self, ramp: RampSettings) -> CommandWorker {
        CommandWorker::new(
            self.registry.clone(),
            self.measurements.clone(),
            self.actions.clone(),
            ramp,
        )
    }
}
