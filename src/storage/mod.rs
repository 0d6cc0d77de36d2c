//! Measurement and action-log storage.
//!
//! The command worker writes through two narrow traits:
//!
//! - [`MeasurementStore`]: one row per monitor result, in the unified schema
//!   shared by both device families
//! - [`ActionLogStore`]: one row per executed non-monitor command
//!
//! Backends:
//! - [`memory`]: in-process vectors (tests, embedding)
//! - [`csv_store`]: append-only CSV files (feature `storage_csv`)

use crate::error::AppResult;
use crate::hardware::{PortId, Reading};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[cfg(feature = "storage_csv")]
pub mod csv_store;
pub mod memory;

#[cfg(feature = "storage_csv")]
pub use csv_store::{CsvActionLog, CsvMeasurementStore};
pub use memory::{InMemoryActionLog, InMemoryMeasurementStore};

/// Default number of entries returned by [`ActionLogStore::recent_actions`]
pub const DEFAULT_ACTION_LIMIT: usize = 200;

/// One stored monitor result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    /// When the reading was stored
    pub timestamp: DateTime<Utc>,
    /// Port the reading belongs to
    pub port_id: PortId,
    /// Output voltage
    pub voltage: Option<f64>,
    /// Output current
    pub current: Option<f64>,
    /// Temperature (own sensor or borrowed from a donor)
    pub temperature: Option<f64>,
    /// Output enabled
    pub hv_on: Option<bool>,
    /// OCP active / tripped
    pub overcurrent_active: Option<bool>,
    /// Current out of spec / CC mode
    pub current_out_of_spec: Option<bool>,
    /// Raw module status word
    pub status_raw: Option<u16>,
    /// Temperature sensor connected
    pub temp_sensor_connected: Option<bool>,
    /// Temperature within correction range
    pub temp_in_range: Option<bool>,
    /// Temperature correction enabled
    pub temp_correction_enabled: Option<bool>,
    /// Raw device response
    pub raw_response: String,
    /// Error description for failed readings
    pub error: Option<String>,
}

impl MeasurementRecord {
    /// Build a record from a reading.
    ///
    /// Error readings keep only `raw_response` and `error`; every measured
    /// field is stored as unknown.
    pub fn from_reading(port_id: PortId, reading: &Reading, timestamp: DateTime<Utc>) -> Self {
        let reading = reading.clone().sanitized();
        let status = reading.status;

        Self {
            timestamp,
            port_id,
            voltage: reading.voltage,
            current: reading.current,
            temperature: reading.temperature,
            hv_on: reading.hv_on,
            overcurrent_active: reading.overcurrent_active,
            current_out_of_spec: reading.current_out_of_spec,
            status_raw: status.map(|s| s.raw),
            temp_sensor_connected: status.map(|s| s.temp_sensor_connected),
            temp_in_range: status.map(|s| s.temp_in_range),
            temp_correction_enabled: status.map(|s| s.temp_correction_enabled),
            raw_response: reading.raw_response,
            error: reading.error.map(|e| e.to_string()),
        }
    }

    /// Returns `true` if this row records a failed reading.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// One stored action-log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    /// When the action completed
    pub timestamp: DateTime<Utc>,
    /// Target port
    pub port_id: PortId,
    /// Command description, e.g. `SET_VOLTAGE: 55V`
    pub command: String,
    /// Device response or failure description
    pub raw_response: String,
}

/// Sink for monitor results
#[async_trait]
pub trait MeasurementStore: Send + Sync {
    /// Persist one reading.
    async fn save_reading(&self, port_id: PortId, reading: &Reading) -> AppResult<()>;

    /// Readings stored at or after `since`, oldest first.
    async fn readings_since(&self, since: DateTime<Utc>) -> AppResult<Vec<MeasurementRecord>>;
}

/// Sink for executed commands
#[async_trait]
pub trait ActionLogStore: Send + Sync {
    /// Persist one action.
    async fn save_action(&self, port_id: PortId, command: &str, response: &str) -> AppResult<()>;

    /// Up to `limit` most recent actions, newest first.
    async fn recent_actions(&self, limit: usize) -> AppResult<Vec<ActionRecord>>;
}
