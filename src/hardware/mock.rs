//! Simulated Hardware
//!
//! Stand-ins for both device families, used when `general.test_mode` is set
//! and in tests. All simulated devices use async-safe operations
//! (tokio::time::sleep, not std::thread::sleep) and are always `Ready`.
//!
//! # Available Simulations
//!
//! - `SimulatedHvModule` - framed-protocol module with temperature sensor
//! - `SimulatedScpiSupply` - bench supply with current protection
//!
//! # Behaviour
//!
//! - Programmed state (output, setpoints, OCP) is remembered, so ramps and
//!   monitors stay coherent
//! - Readings carry a little random noise
//! - Each monitor call takes 50ms by default

use crate::error::DeviceResult;
use crate::hardware::capabilities::{CurrentProtection, DeviceState, HvSupply};
use crate::hardware::framed_codec::round3;
use crate::hardware::reading::{ModuleStatus, Reading};
use async_trait::async_trait;
use rand::Rng;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};
use tracing::debug;

const DEFAULT_LATENCY: Duration = Duration::from_millis(50);

// =============================================================================
// SimulatedHvModule
// =============================================================================

#[derive(Debug, Default)]
struct ModuleState {
    hv_on: bool,
    setpoint: f64,
    temp_correction: bool,
}

/// Simulated framed-protocol HV module
///
/// ```rust,ignore
/// let module = SimulatedHvModule::new("sim-1");
/// module.turn_on().await?;
/// module.set_voltage(55.0).await?;
/// assert!(module.monitor().await.voltage.is_some());
/// ```
pub struct SimulatedHvModule {
    name: String,
    state: RwLock<ModuleState>,
    latency: Duration,
}

impl SimulatedHvModule {
    /// Create a simulated module with default latency.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: RwLock::new(ModuleState {
                temp_correction: true,
                ..ModuleState::default()
            }),
            latency: DEFAULT_LATENCY,
        }
    }

    /// Override the simulated monitor latency.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Programmed voltage.
    pub async fn setpoint(&self) -> f64 {
        self.state.read().await.setpoint
    }
}

#[async_trait]
impl HvSupply for SimulatedHvModule {
    fn state(&self) -> DeviceState {
        DeviceState::Ready
    }

    fn describe(&self) -> String {
        format!("simulated-serial:{}", self.name)
    }

    async fn turn_on(&self) -> DeviceResult<String> {
        self.state.write().await.hv_on = true;
        debug!(device = %self.name, "Simulating TURN_ON");
        Ok("hon_ok".to_string())
    }

    async fn turn_off(&self) -> DeviceResult<String> {
        self.state.write().await.hv_on = false;
        debug!(device = %self.name, "Simulating TURN_OFF");
        Ok("hof_ok".to_string())
    }

    async fn reset(&self) -> DeviceResult<String> {
        let mut state = self.state.write().await;
        state.hv_on = false;
        state.setpoint = 0.0;
        state.temp_correction = false;
        Ok("hre_ok | hof_ok | hcm0_ok".to_string())
    }

    async fn set_voltage(&self, volts: f64) -> DeviceResult<String> {
        crate::hardware::framed_codec::voltage_to_raw(volts)?;
        self.state.write().await.setpoint = volts;
        debug!(device = %self.name, volts, "Simulating SET_VOLTAGE");
        Ok("hbv_ok".to_string())
    }

    async fn send_raw(&self, command: &str) -> DeviceResult<String> {
        debug!(device = %self.name, command, "Simulating RAW command");
        Ok("raw_ok".to_string())
    }

    async fn monitor(&self) -> Reading {
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }

        let (hv_on, setpoint, temp_correction) = {
            let state = self.state.read().await;
            (state.hv_on, state.setpoint, state.temp_correction)
        };

        let mut rng = rand::thread_rng();
        let voltage = if hv_on {
            (setpoint + rng.gen_range(-0.01..0.01)).max(0.0)
        } else {
            0.0
        };
        let current = if hv_on { rng.gen_range(0.01..0.1) } else { 0.0 };
        let temperature = rng.gen_range(24.0..26.0);

        let mut raw: u16 = 1 << 3; // sensor connected
        if hv_on {
            raw |= 1;
        }
        if temp_correction {
            raw |= 1 << 6;
        }
        let status = ModuleStatus::from_raw(raw);

        Reading {
            voltage: Some(round3(voltage)),
            current: Some(round3(current)),
            temperature: Some(round3(temperature)),
            hv_on: Some(status.hv_on),
            overcurrent_active: Some(status.overcurrent_active),
            current_out_of_spec: Some(status.current_out_of_spec),
            status: Some(status),
            raw_response: "simulated".to_string(),
            error: None,
        }
    }
}

// =============================================================================
// SimulatedScpiSupply
// =============================================================================

#[derive(Debug, Default)]
struct SupplyState {
    output_on: bool,
    setpoint: f64,
    current_limit: Option<f64>,
    ocp_level: Option<f64>,
    ocp_tripped: bool,
}

/// Simulated SCPI bench supply
///
/// A supply whose drawn current exceeds the armed OCP level trips, switches
/// its output off and reports the trip until it is cleared.
pub struct SimulatedScpiSupply {
    name: String,
    state: RwLock<SupplyState>,
    latency: Duration,
    load_amps: f64,
}

impl SimulatedScpiSupply {
    /// Create a simulated supply with default latency and a light load.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: RwLock::new(SupplyState::default()),
            latency: DEFAULT_LATENCY,
            load_amps: 0.05,
        }
    }

    /// Override the simulated monitor latency.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Current drawn by the simulated load while the output is on.
    #[must_use]
    pub fn with_load(mut self, amps: f64) -> Self {
        self.load_amps = amps;
        self
    }

    /// Programmed voltage.
    pub async fn setpoint(&self) -> f64 {
        self.state.read().await.setpoint
    }
}

#[async_trait]
impl HvSupply for SimulatedScpiSupply {
    fn state(&self) -> DeviceState {
        DeviceState::Ready
    }

    fn describe(&self) -> String {
        format!("simulated-scpi:{}", self.name)
    }

    async fn turn_on(&self) -> DeviceResult<String> {
        self.state.write().await.output_on = true;
        Ok("OK_ON".to_string())
    }

    async fn turn_off(&self) -> DeviceResult<String> {
        self.state.write().await.output_on = false;
        Ok("OK_OFF".to_string())
    }

    async fn reset(&self) -> DeviceResult<String> {
        *self.state.write().await = SupplyState::default();
        Ok("OK_RST".to_string())
    }

    async fn set_voltage(&self, volts: f64) -> DeviceResult<String> {
        crate::hardware::scpi_codec::check_setpoint("voltage", volts)?;
        self.state.write().await.setpoint = volts;
        Ok("OK_VOLT".to_string())
    }

    async fn send_raw(&self, command: &str) -> DeviceResult<String> {
        debug!(device = %self.name, command, "Simulating RAW command");
        Ok("OK_RAW".to_string())
    }

    async fn monitor(&self) -> Reading {
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }

        let mut state = self.state.write().await;
        let mut current = if state.output_on { self.load_amps } else { 0.0 };
        let cc_mode = state
            .current_limit
            .is_some_and(|limit| state.output_on && current >= limit);
        if let Some(limit) = state.current_limit {
            current = current.min(limit);
        }
        if state.ocp_level.is_some_and(|level| current > level) {
            state.ocp_tripped = true;
            state.output_on = false;
        }

        let noise = rand::thread_rng().gen_range(-0.01..0.01);
        let voltage = if state.output_on {
            (state.setpoint + noise).max(0.0)
        } else {
            0.0
        };

        Reading {
            voltage: Some(round3(voltage)),
            current: Some(round3(if state.output_on { current } else { 0.0 })),
            temperature: None,
            hv_on: Some(state.output_on),
            overcurrent_active: Some(state.ocp_tripped),
            current_out_of_spec: Some(cc_mode),
            status: None,
            raw_response: "simulated".to_string(),
            error: None,
        }
    }
}

#[async_trait]
impl CurrentProtection for SimulatedScpiSupply {
    async fn set_current(&self, amps: f64) -> DeviceResult<String> {
        crate::hardware::scpi_codec::check_setpoint("current", amps)?;
        self.state.write().await.current_limit = Some(amps);
        Ok("OK_CURR".to_string())
    }

    async fn enable_ocp(&self, trip_amps: f64) -> DeviceResult<String> {
        crate::hardware::scpi_codec::check_setpoint("OCP trip current", trip_amps)?;
        self.state.write().await.ocp_level = Some(trip_amps);
        Ok("OK_OCP".to_string())
    }

    async fn disable_ocp(&self) -> DeviceResult<String> {
        self.state.write().await.ocp_level = None;
        Ok("OK_OCP_OFF".to_string())
    }

    async fn clear_protection_trip(&self) -> DeviceResult<String> {
        self.state.write().await.ocp_tripped = false;
        Ok("OK_TRIP_CLEAR".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn module_tracks_programmed_voltage() {
        let module = SimulatedHvModule::new("sim").with_latency(Duration::ZERO);
        module.turn_on().await.unwrap();
        module.set_voltage(55.0).await.unwrap();

        let reading = module.monitor().await;
        let voltage = reading.voltage.unwrap();
        assert!((voltage - 55.0).abs() <= 0.011, "got {}", voltage);
        assert_eq!(reading.hv_on, Some(true));
        assert!(reading.temperature.is_some());
        assert!(reading.status.unwrap().temp_sensor_connected);
    }

    #[tokio::test]
    async fn module_off_reads_zero() {
        let module = SimulatedHvModule::new("sim").with_latency(Duration::ZERO);
        module.set_voltage(55.0).await.unwrap();
        let reading = module.monitor().await;
        assert_eq!(reading.voltage, Some(0.0));
        assert_eq!(reading.hv_on, Some(false));
    }

    #[tokio::test]
    async fn supply_trips_on_overcurrent() {
        let supply = SimulatedScpiSupply::new("sim")
            .with_latency(Duration::ZERO)
            .with_load(0.2);
        supply.enable_ocp(0.1).await.unwrap();
        supply.turn_on().await.unwrap();

        let reading = supply.monitor().await;
        assert_eq!(reading.overcurrent_active, Some(true));
        assert_eq!(reading.hv_on, Some(false));

        supply.clear_protection_trip().await.unwrap();
        assert_eq!(supply.monitor().await.overcurrent_active, Some(false));
    }

    #[tokio::test]
    async fn supply_enters_cc_mode_at_limit() {
        let supply = SimulatedScpiSupply::new("sim")
            .with_latency(Duration::ZERO)
            .with_load(0.2);
        supply.set_current(0.1).await.unwrap();
        supply.turn_on().await.unwrap();

        let reading = supply.monitor().await;
        assert_eq!(reading.current_out_of_spec, Some(true));
        assert_eq!(reading.current, Some(0.1));
    }
}
