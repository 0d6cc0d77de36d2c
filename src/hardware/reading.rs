//! Normalized monitor readings.
//!
//! Both device families report into the same [`Reading`] shape. Fields a
//! family cannot measure stay `None`. A reading that carries an error keeps
//! only its raw response text: every derived field is unknown.

use crate::error::DeviceError;
use serde::{Deserialize, Serialize};

/// Decoded status word of a framed-protocol module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleStatus {
    /// Status word as received
    pub raw: u16,
    /// Bit 0: high voltage output on
    pub hv_on: bool,
    /// Bit 1: over-current protection active
    pub overcurrent_active: bool,
    /// Bit 2: output current out of specification
    pub current_out_of_spec: bool,
    /// Bit 3: temperature sensor connected
    pub temp_sensor_connected: bool,
    /// Bit 4 (inverted): temperature within the correction range
    pub temp_in_range: bool,
    /// Bit 6: temperature correction enabled
    pub temp_correction_enabled: bool,
}

impl ModuleStatus {
    /// Decode a raw status word.
    pub fn from_raw(raw: u16) -> Self {
        let bit = |n: u16| (raw >> n) & 1 == 1;
        Self {
            raw,
            hv_on: bit(0),
            overcurrent_active: bit(1),
            current_out_of_spec: bit(2),
            temp_sensor_connected: bit(3),
            temp_in_range: !bit(4),
            temp_correction_enabled: bit(6),
        }
    }
}

/// Result of one monitor call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reading {
    /// Output voltage in volts
    pub voltage: Option<f64>,
    /// Output current (amps for supplies, module units for serial modules)
    pub current: Option<f64>,
    /// Sensor temperature in °C
    pub temperature: Option<f64>,
    /// High voltage output enabled
    pub hv_on: Option<bool>,
    /// Over-current protection active / tripped
    pub overcurrent_active: Option<bool>,
    /// Current out of spec (serial modules) or constant-current mode (supplies)
    pub current_out_of_spec: Option<bool>,
    /// Full status word (framed-protocol modules only)
    pub status: Option<ModuleStatus>,
    /// Raw response text for diagnosis
    pub raw_response: String,
    /// Failure reason; when set every other field except `raw_response` is unknown
    pub error: Option<DeviceError>,
}

impl Reading {
    /// Build an error reading.
    pub fn failed(error: DeviceError, raw_response: impl Into<String>) -> Self {
        Self {
            raw_response: raw_response.into(),
            error: Some(error),
            ..Self::default()
        }
    }

    /// Returns `true` if this reading carries an error.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Drop every derived field of an error reading.
    ///
    /// Readings without an error are returned unchanged.
    #[must_use]
    pub fn sanitized(self) -> Self {
        match self.error {
            Some(error) => Self::failed(error, self.raw_response),
            None => self,
        }
    }
}
