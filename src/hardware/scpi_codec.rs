//! SCPI command builders and reply parsers for bench supplies.
//!
//! Pure string handling, no I/O. Every setting is a single discrete command;
//! monitoring uses five discrete queries instead of one compound query.

use crate::error::{DeviceError, DeviceResult};
use crate::hardware::reading::Reading;

/// Clear status
pub const CLEAR_STATUS: &str = "*CLS";
/// Device reset
pub const RESET: &str = "*RST";
/// Identification query
pub const IDENTIFY: &str = "*IDN?";
/// Clear a latched protection trip
pub const CLEAR_PROTECTION: &str = "OUTPut:PROTection:CLEar";

/// Measured output voltage
pub const MEASURE_VOLTAGE: &str = "MEASure:VOLTage?";
/// Measured output current
pub const MEASURE_CURRENT: &str = "MEASure:CURRent?";
/// Output enabled
pub const OUTPUT_STATE: &str = "OUTPut:STATe?";
/// Operation condition register
pub const OPERATION_CONDITION: &str = "STATus:OPERation:CONDition?";
/// Questionable event register
pub const QUESTIONABLE_EVENT: &str = "STATus:QUEStionable:EVENt?";

/// Monitor queries in the order they are issued.
pub const MONITOR_QUERIES: [&str; 5] = [
    MEASURE_VOLTAGE,
    MEASURE_CURRENT,
    OUTPUT_STATE,
    OPERATION_CONDITION,
    QUESTIONABLE_EVENT,
];

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "ON"
    } else {
        "OFF"
    }
}

/// `OUTPut:STATe ON|OFF`
pub fn output_state(enabled: bool) -> String {
    format!("OUTPut:STATe {}", on_off(enabled))
}

/// `SOURce:VOLTage <v>`
pub fn set_voltage(volts: f64) -> String {
    format!("SOURce:VOLTage {:.3}", volts)
}

/// `SOURce:CURRent <a>`
pub fn set_current(amps: f64) -> String {
    format!("SOURce:CURRent {:.3}", amps)
}

/// `CURRent:PROTection:LEVel <a>`
pub fn ocp_level(amps: f64) -> String {
    format!("CURRent:PROTection:LEVel {:.3}", amps)
}

/// `CURRent:PROTection:STATe ON|OFF`
pub fn ocp_state(enabled: bool) -> String {
    format!("CURRent:PROTection:STATe {}", on_off(enabled))
}

/// Reject non-finite or negative setpoints before anything is sent.
pub fn check_setpoint(name: &str, value: f64) -> DeviceResult<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(DeviceError::InvalidArgument(format!(
            "{} must be a non-negative number, got {}",
            name, value
        )))
    }
}

/// Register bits carrying the constant-current and OCP-trip flags.
///
/// These are fixed per instrument model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusBits {
    /// Bit of the operation condition register set in CC mode
    pub cc_mode: u8,
    /// Bit of the questionable event register set after an OCP trip
    pub ocp_trip: u8,
}

impl Default for StatusBits {
    fn default() -> Self {
        Self {
            cc_mode: 4,
            ocp_trip: 4,
        }
    }
}

/// Raw answers to the five monitor queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorResponses {
    /// `MEASure:VOLTage?`
    pub voltage: String,
    /// `MEASure:CURRent?`
    pub current: String,
    /// `OUTPut:STATe?`
    pub output: String,
    /// `STATus:OPERation:CONDition?`
    pub operation: String,
    /// `STATus:QUEStionable:EVENt?`
    pub questionable: String,
}

impl MonitorResponses {
    /// Compact diagnostic form, e.g. `V:12.5,C:0.01,S:1,OP:0,Q_EV:0`.
    pub fn raw_text(&self) -> String {
        format!(
            "V:{},C:{},S:{},OP:{},Q_EV:{}",
            self.voltage, self.current, self.output, self.operation, self.questionable
        )
    }

    /// Decode all five answers into a reading.
    ///
    /// Any unparseable answer fails the whole reading.
    pub fn decode(&self, bits: StatusBits) -> DeviceResult<Reading> {
        let raw = self.raw_text();
        let voltage = parse_number(&self.voltage, "voltage", &raw)?;
        let current = parse_number(&self.current, "current", &raw)?;
        let hv_on = parse_output_state(&self.output, &raw)?;
        let operation = parse_register(&self.operation, "operation condition", &raw)?;
        let questionable = parse_register(&self.questionable, "questionable event", &raw)?;

        Ok(Reading {
            voltage: Some(round3(voltage)),
            current: Some(round3(current)),
            temperature: None,
            hv_on: Some(hv_on),
            overcurrent_active: Some(bit_set(questionable, bits.ocp_trip)),
            current_out_of_spec: Some(bit_set(operation, bits.cc_mode)),
            status: None,
            raw_response: raw,
            error: None,
        })
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Parse a numeric reply such as `+1.2345E+01`.
pub fn parse_number(reply: &str, name: &str, raw: &str) -> DeviceResult<f64> {
    let value: f64 = reply
        .trim()
        .parse()
        .map_err(|_| DeviceError::parse(format!("{} reply {:?} is not a number", name, reply), raw))?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(DeviceError::parse(
            format!("{} reply {:?} is not finite", name, reply),
            raw,
        ))
    }
}

/// Parse an output-state reply (`1`/`0`/`ON`/`OFF`).
pub fn parse_output_state(reply: &str, raw: &str) -> DeviceResult<bool> {
    match reply.trim().to_uppercase().as_str() {
        "1" | "ON" => Ok(true),
        "0" | "OFF" => Ok(false),
        _ => Err(DeviceError::parse(
            format!("output state reply {:?} is not 0/1", reply),
            raw,
        )),
    }
}

/// Parse a status register reply (decimal, optional sign).
pub fn parse_register(reply: &str, name: &str, raw: &str) -> DeviceResult<u32> {
    let value: i64 = reply.trim().parse().map_err(|_| {
        DeviceError::parse(format!("{} register {:?} is not an integer", name, reply), raw)
    })?;
    u32::try_from(value).map_err(|_| {
        DeviceError::parse(format!("{} register {} is out of range", name, value), raw)
    })
}

/// Test one bit of a register.
pub fn bit_set(register: u32, bit: u8) -> bool {
    u32::from(bit) < 32 && register & (1 << bit) != 0
}
