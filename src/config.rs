//! Configuration System using Figment
//!
//! Strongly-typed configuration for the bias controller. Configuration is
//! loaded from:
//! 1. A TOML file (base configuration, default `config/default.toml`)
//! 2. Environment variables prefixed with `HV_BIAS_`, using `__` to separate
//!    nested keys (e.g. `HV_BIAS_GENERAL__TEST_MODE=true`)
//!
//! Every section has defaults, so an empty file yields a usable (if
//! device-less) configuration.
//!
//! # Example
//! ```no_run
//! use hv_bias::config::Settings;
//!
//! let settings = Settings::load_from("config/default.toml")?;
//! settings.validate()?;
//! println!("Monitoring every {}s", settings.general.monitoring_interval_secs);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::hardware::PortId;
use crate::tracing_setup::OutputFormat;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "HV_BIAS_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Process-wide settings
    #[serde(default)]
    pub general: GeneralSettings,
    /// Ramp defaults
    #[serde(default)]
    pub ramp: RampSettings,
    /// Framed serial protocol transport settings
    #[serde(default)]
    pub serial: SerialSettings,
    /// SCPI transport settings
    #[serde(default)]
    pub scpi: ScpiSettings,
    /// Device definitions
    #[serde(default)]
    pub devices: Vec<DeviceDefinition>,
    /// Temperature-donor pairings
    #[serde(default)]
    pub pairings: Vec<PairingDefinition>,
}

/// Process-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralSettings {
    /// Interval between monitor rounds in seconds
    #[serde(default = "default_monitoring_interval")]
    pub monitoring_interval_secs: u64,
    /// Replace every device with a simulated twin
    #[serde(default)]
    pub test_mode: bool,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: OutputFormat,
    /// Directory for measurement and action-log files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Optional suffix appended to data file names
    #[serde(default)]
    pub db_suffix: Option<String>,
}

/// Ramp defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RampSettings {
    /// Step count for RAMP_VOLTAGE tasks that do not specify one
    #[serde(default = "default_ramp_steps")]
    pub default_steps: u32,
    /// Inter-step delay for RAMP_VOLTAGE tasks that do not specify one
    #[serde(default = "default_ramp_delay")]
    pub default_delay_ms: u64,
    /// Step count of the ramp-down preceding TURN_OFF
    #[serde(default = "default_ramp_steps")]
    pub turn_off_steps: u32,
    /// Inter-step delay of the ramp-down preceding TURN_OFF
    #[serde(default = "default_ramp_delay")]
    pub turn_off_delay_ms: u64,
    /// Voltage the TURN_OFF ramp-down ends at
    #[serde(default = "default_safe_floor")]
    pub safe_floor_volts: f64,
    /// Start voltage assumed when the device cannot report one
    #[serde(default = "default_fallback_start")]
    pub fallback_start_volts: f64,
}

/// Framed serial protocol transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Baud rate (8 data bits, even parity, 1 stop bit)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Read timeout per exchange
    #[serde(default = "default_serial_timeout")]
    pub timeout_ms: u64,
    /// Delay between writing a frame and reading the reply
    #[serde(default = "default_settle")]
    pub settle_ms: u64,
    /// Delay between the steps of a reset sequence
    #[serde(default = "default_reset_settle")]
    pub reset_settle_ms: u64,
}

/// SCPI transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScpiSettings {
    /// TCP port used when a connection string carries no port
    #[serde(default = "default_scpi_port")]
    pub port: u16,
    /// Timeout per query
    #[serde(default = "default_scpi_timeout")]
    pub timeout_ms: u64,
    /// Bit of the operation condition register signalling constant-current mode
    #[serde(default = "default_status_bit")]
    pub cc_mode_bit: u8,
    /// Bit of the questionable event register signalling an OCP trip
    #[serde(default = "default_status_bit")]
    pub ocp_trip_bit: u8,
}

/// Device family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Custom module on the framed serial protocol
    SerialHv,
    /// Bench supply speaking SCPI
    ScpiPsu,
}

/// One configured device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Numeric port identifier
    pub id: PortId,
    /// Device family
    #[serde(rename = "type")]
    pub kind: DeviceKind,
    /// Serial device path or `host[:port]` instrument address
    pub connection: String,
    /// Human-readable label
    #[serde(default)]
    pub label: Option<String>,
    /// Maximum voltage accepted by SET_VOLTAGE / RAMP_VOLTAGE
    #[serde(default)]
    pub max_voltage: Option<f64>,
}

impl DeviceDefinition {
    /// Label, defaulting to `Port <id>`.
    pub fn display_label(&self) -> String {
        self.label
            .clone()
            .unwrap_or_else(|| format!("Port {}", self.id))
    }
}

/// Temperature-donor relation: readings of `primary` borrow temperature and
/// status from `donor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingDefinition {
    /// Port whose readings are enriched
    pub primary: PortId,
    /// Port supplying temperature and status
    pub donor: PortId,
}

// Default value functions
fn default_monitoring_interval() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_ramp_steps() -> u32 {
    10
}

fn default_ramp_delay() -> u64 {
    500
}

fn default_safe_floor() -> f64 {
    20.5
}

fn default_fallback_start() -> f64 {
    20.0
}

fn default_baud_rate() -> u32 {
    38400
}

fn default_serial_timeout() -> u64 {
    1000
}

fn default_settle() -> u64 {
    100
}

fn default_reset_settle() -> u64 {
    200
}

fn default_scpi_port() -> u16 {
    5025
}

fn default_scpi_timeout() -> u64 {
    5000
}

fn default_status_bit() -> u8 {
    4
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            monitoring_interval_secs: default_monitoring_interval(),
            test_mode: false,
            log_level: default_log_level(),
            log_format: OutputFormat::default(),
            data_dir: default_data_dir(),
            db_suffix: None,
        }
    }
}

impl Default for RampSettings {
    fn default() -> Self {
        Self {
            default_steps: default_ramp_steps(),
            default_delay_ms: default_ramp_delay(),
            turn_off_steps: default_ramp_steps(),
            turn_off_delay_ms: default_ramp_delay(),
            safe_floor_volts: default_safe_floor(),
            fallback_start_volts: default_fallback_start(),
        }
    }
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            timeout_ms: default_serial_timeout(),
            settle_ms: default_settle(),
            reset_settle_ms: default_reset_settle(),
        }
    }
}

impl Default for ScpiSettings {
    fn default() -> Self {
        Self {
            port: default_scpi_port(),
            timeout_ms: default_scpi_timeout(),
            cc_mode_bit: default_status_bit(),
            ocp_trip_bit: default_status_bit(),
        }
    }
}

impl GeneralSettings {
    /// Interval between monitor rounds.
    pub fn monitoring_interval(&self) -> Duration {
        Duration::from_secs(self.monitoring_interval_secs)
    }

    /// File name for a data file, honouring `db_suffix`.
    pub fn data_file(&self, stem: &str, extension: &str) -> PathBuf {
        let name = match self.db_suffix.as_deref().filter(|s| !s.is_empty()) {
            Some(suffix) => format!("{}_{}.{}", stem, suffix, extension),
            None => format!("{}.{}", stem, extension),
        };
        self.data_dir.join(name)
    }
}

impl RampSettings {
    /// Default inter-step delay for RAMP_VOLTAGE.
    pub fn default_delay(&self) -> Duration {
        Duration::from_millis(self.default_delay_ms)
    }

    /// Inter-step delay of the TURN_OFF ramp-down.
    pub fn turn_off_delay(&self) -> Duration {
        Duration::from_millis(self.turn_off_delay_ms)
    }
}

impl Settings {
    /// Load configuration from the default path and environment variables
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// Environment variables override file values, e.g.
    /// `HV_BIAS_GENERAL__MONITORING_INTERVAL_SECS=10`.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::from_figment(
            Figment::new()
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    /// Extract configuration from an arbitrary figment
    pub fn from_figment(figment: Figment) -> Result<Self, figment::Error> {
        figment.extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.general.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.general.monitoring_interval_secs == 0 {
            return Err("monitoring_interval_secs must be at least 1".to_string());
        }

        for (name, value) in [
            ("ramp.safe_floor_volts", self.ramp.safe_floor_volts),
            ("ramp.fallback_start_volts", self.ramp.fallback_start_volts),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(format!("{} must be a non-negative number, got {}", name, value));
            }
        }

        for (name, bit) in [
            ("scpi.cc_mode_bit", self.scpi.cc_mode_bit),
            ("scpi.ocp_trip_bit", self.scpi.ocp_trip_bit),
        ] {
            if bit > 15 {
                return Err(format!("{} must be 0-15, got {}", name, bit));
            }
        }

        // Validate device IDs are unique
        let mut ids = HashSet::new();
        for device in &self.devices {
            if !ids.insert(device.id) {
                return Err(format!("Duplicate device ID: {}", device.id));
            }
            if device.connection.trim().is_empty() {
                return Err(format!("Device {} has an empty connection", device.id));
            }
            if let Some(limit) = device.max_voltage {
                if !limit.is_finite() || limit < 0.0 {
                    return Err(format!(
                        "Device {} max_voltage must be a non-negative number, got {}",
                        device.id, limit
                    ));
                }
            }
        }

        let mut donors: HashMap<PortId, PortId> = HashMap::new();
        for pairing in &self.pairings {
            for port in [pairing.primary, pairing.donor] {
                if !ids.contains(&port) {
                    return Err(format!(
                        "Pairing {} -> {} references unconfigured port {}",
                        pairing.primary, pairing.donor, port
                    ));
                }
            }
            if pairing.primary == pairing.donor {
                return Err(format!("Port {} cannot be its own donor", pairing.primary));
            }
            if let Some(existing) = donors.insert(pairing.primary, pairing.donor) {
                return Err(format!(
                    "Port {} has two donors ({} and {})",
                    pairing.primary, existing, pairing.donor
                ));
            }
        }

        Ok(())
    }

    /// Look up a device definition by port id
    pub fn device(&self, id: PortId) -> Option<&DeviceDefinition> {
        self.devices.iter().find(|d| d.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> Settings {
        Settings::from_figment(Figment::from(Toml::string(toml))).unwrap()
    }

    const SAMPLE: &str = r#"
        [general]
        monitoring_interval_secs = 2
        test_mode = true

        [[devices]]
        id = 1
        type = "scpi_psu"
        connection = "192.168.0.10"
        max_voltage = 80.0

        [[devices]]
        id = 2
        type = "serial_hv"
        connection = "/dev/ttyUSB0"
        label = "Module A"

        [[pairings]]
        primary = 1
        donor = 2
    "#;

    #[test]
    fn empty_config_uses_defaults() {
        let settings = parse("");
        assert_eq!(settings.general.monitoring_interval_secs, 5);
        assert_eq!(settings.ramp.default_steps, 10);
        assert_eq!(settings.ramp.safe_floor_volts, 20.5);
        assert_eq!(settings.serial.baud_rate, 38400);
        assert_eq!(settings.scpi.port, 5025);
        assert!(settings.devices.is_empty());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn parses_devices_and_pairings() {
        let settings = parse(SAMPLE);
        assert!(settings.validate().is_ok());
        assert_eq!(settings.devices.len(), 2);
        assert_eq!(settings.devices[0].kind, DeviceKind::ScpiPsu);
        assert_eq!(settings.devices[0].max_voltage, Some(80.0));
        assert_eq!(settings.devices[0].display_label(), "Port 1");
        assert_eq!(settings.device(2).map(|d| d.display_label()).as_deref(), Some("Module A"));
        assert_eq!(
            settings.pairings,
            vec![PairingDefinition { primary: 1, donor: 2 }]
        );
    }

    #[test]
    fn rejects_invalid_log_level() {
        let mut settings = parse("");
        settings.general.log_level = "loud".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_zero_interval() {
        let settings = parse("[general]\nmonitoring_interval_secs = 0\n");
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_device_ids() {
        let mut settings = parse(SAMPLE);
        settings.devices[1].id = 1;
        settings.pairings.clear();
        let err = settings.validate().unwrap_err();
        assert!(err.contains("Duplicate device ID"));
    }

    #[test]
    fn rejects_bad_pairings() {
        let mut settings = parse(SAMPLE);
        settings.pairings = vec![PairingDefinition { primary: 1, donor: 9 }];
        assert!(settings.validate().unwrap_err().contains("unconfigured"));

        settings.pairings = vec![PairingDefinition { primary: 2, donor: 2 }];
        assert!(settings.validate().unwrap_err().contains("own donor"));

        settings.pairings = vec![
            PairingDefinition { primary: 1, donor: 2 },
            PairingDefinition { primary: 1, donor: 2 },
        ];
        assert!(settings.validate().unwrap_err().contains("two donors"));
    }

    #[test]
    fn rejects_out_of_range_status_bit() {
        let mut settings = parse("");
        settings.scpi.ocp_trip_bit = 16;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_negative_voltage_limit() {
        let mut settings = parse(SAMPLE);
        settings.devices[0].max_voltage = Some(-5.0);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn data_file_honours_suffix() {
        let mut general = GeneralSettings::default();
        assert_eq!(general.data_file("measurements", "csv"), PathBuf::from("data/measurements.csv"));
        general.db_suffix = Some("run2".to_string());
        assert_eq!(
            general.data_file("measurements", "csv"),
            PathBuf::from("data/measurements_run2.csv")
        );
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hv.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert!(settings.general.test_mode);
        assert_eq!(settings.general.monitoring_interval(), Duration::from_secs(2));
    }
}
