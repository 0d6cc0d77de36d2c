//! Framed serial protocol codec.
//!
//! Pure frame building and reply decoding for the custom HV modules. No I/O.
//!
//! # Frame Format
//!
//! ```text
//! STX | command bytes | ETX | checksum (2 lowercase hex chars) | CR
//! 0x02                  0x03                                    0x0D
//! ```
//!
//! The checksum is the low byte of `sum(command) + 5`; the constant accounts
//! for the STX and ETX byte values, so it equals the low byte of the sum over
//! `STX..=ETX`.
//!
//! # Status Reply
//!
//! The reply to `HPO` carries four fixed-width hex fields at known character
//! offsets:
//!
//! | Field       | Offset  | Conversion                          |
//! |-------------|---------|-------------------------------------|
//! | status      | 4..8    | bit field, see [`ModuleStatus`]     |
//! | voltage     | 12..16  | raw × 1.812e-3 V                    |
//! | current     | 16..20  | raw × 4.980e-3                      |
//! | temperature | 20..24  | (raw × 1.907e-5 − 1.035) / −5.5e-3  |

use crate::error::{DeviceError, DeviceResult};
use crate::hardware::reading::{ModuleStatus, Reading};
use std::ops::Range;

/// Start of text
pub const STX: u8 = 0x02;
/// End of text
pub const ETX: u8 = 0x03;
/// Frame delimiter
pub const CR: u8 = 0x0D;

/// Volts per LSB of the voltage field
pub const VOLTAGE_FACTOR: f64 = 1.812e-3;
/// Current per LSB of the current field
pub const CURRENT_FACTOR: f64 = 4.980e-3;

const TEMP_SLOPE: f64 = 1.907e-5;
const TEMP_OFFSET: f64 = 1.035;
const TEMP_DIVISOR: f64 = -5.5e-3;

const STATUS_FIELD: Range<usize> = 4..8;
const VOLTAGE_FIELD: Range<usize> = 12..16;
const CURRENT_FIELD: Range<usize> = 16..20;
const TEMP_FIELD: Range<usize> = 20..24;

/// Minimum length of a decodable status reply.
pub const MIN_STATUS_REPLY_LEN: usize = 24;

/// Commands understood by the framed-protocol modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleCommand {
    /// `HON`: output on
    HvOn,
    /// `HOF`: output off
    HvOff,
    /// `HRE`: device reset
    Reset,
    /// `HCM0`: disable temperature correction
    DisableTempCorrection,
    /// `HBVxxxx`: set voltage (raw DAC value)
    SetVoltage(u16),
    /// `HPO`: status query
    GetStatus,
}

impl ModuleCommand {
    /// Command bytes without framing.
    pub fn to_bytes(self) -> Vec<u8> {
        match self {
            ModuleCommand::HvOn => b"HON".to_vec(),
            ModuleCommand::HvOff => b"HOF".to_vec(),
            ModuleCommand::Reset => b"HRE".to_vec(),
            ModuleCommand::DisableTempCorrection => b"HCM0".to_vec(),
            ModuleCommand::SetVoltage(raw) => format!("HBV{:04x}", raw).into_bytes(),
            ModuleCommand::GetStatus => b"HPO".to_vec(),
        }
    }

    /// Complete frame ready to write to the port.
    pub fn encode(self) -> Vec<u8> {
        encode_frame(&self.to_bytes())
    }
}

/// Checksum of a command: low byte of `sum(command) + 5` as two lowercase hex chars.
pub fn checksum(command: &[u8]) -> String {
    let sum = command
        .iter()
        .fold(STX.wrapping_add(ETX), |acc, &b| acc.wrapping_add(b));
    format!("{:02x}", sum)
}

/// Wrap command bytes into a complete frame.
pub fn encode_frame(command: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(command.len() + 5);
    frame.push(STX);
    frame.extend_from_slice(command);
    frame.push(ETX);
    frame.extend_from_slice(checksum(command).as_bytes());
    frame.push(CR);
    frame
}

/// Convert a voltage to the raw 16-bit value used by `HBV`.
///
/// The fractional LSB is truncated. Negative, non-finite or out-of-range
/// voltages are rejected.
pub fn voltage_to_raw(volts: f64) -> DeviceResult<u16> {
    if !volts.is_finite() || volts < 0.0 {
        return Err(DeviceError::InvalidArgument(format!(
            "voltage must be a non-negative number, got {}",
            volts
        )));
    }

    let raw = (volts / VOLTAGE_FACTOR).trunc();
    if raw > f64::from(u16::MAX) {
        return Err(DeviceError::InvalidArgument(format!(
            "voltage {} V exceeds the encodable maximum of {:.3} V",
            volts,
            f64::from(u16::MAX) * VOLTAGE_FACTOR
        )));
    }

    Ok(raw as u16)
}

/// Round to millivolt / milliamp / millidegree precision.
pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Convert a raw temperature field to °C.
///
/// Returns `None` when the result is not a finite number.
pub fn raw_to_temperature(raw: u16) -> Option<f64> {
    let celsius = (f64::from(raw) * TEMP_SLOPE - TEMP_OFFSET) / TEMP_DIVISOR;
    celsius.is_finite().then(|| round3(celsius))
}

/// Decoded `HPO` reply.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusReply {
    /// Status word
    pub status: ModuleStatus,
    /// Output voltage in volts
    pub voltage: f64,
    /// Output current
    pub current: f64,
    /// Temperature in °C, present only when the sensor is connected
    pub temperature: Option<f64>,
}

impl StatusReply {
    /// Convert into a normalized reading.
    pub fn into_reading(self, raw_response: impl Into<String>) -> Reading {
        Reading {
            voltage: Some(self.voltage),
            current: Some(self.current),
            temperature: self.temperature,
            hv_on: Some(self.status.hv_on),
            overcurrent_active: Some(self.status.overcurrent_active),
            current_out_of_spec: Some(self.status.current_out_of_spec),
            status: Some(self.status),
            raw_response: raw_response.into(),
            error: None,
        }
    }
}

fn hex_field(text: &str, range: Range<usize>, name: &str) -> DeviceResult<u16> {
    let field = text
        .get(range.clone())
        .ok_or_else(|| DeviceError::parse(format!("missing {} field", name), text))?;

    if !field.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(DeviceError::parse(
            format!("{} field {:?} at {:?} is not hex", name, field, range),
            text,
        ));
    }

    u16::from_str_radix(field, 16)
        .map_err(|e| DeviceError::parse(format!("{} field {:?}: {}", name, field, e), text))
}

/// Decode a reply to the status query.
///
/// A reply shorter than [`MIN_STATUS_REPLY_LEN`], containing non-ASCII bytes,
/// or with any non-hex field is a parse failure. No partial reading is ever
/// produced.
pub fn decode_status_reply(reply: &[u8]) -> DeviceResult<StatusReply> {
    let text = reply_text(reply);

    if !reply.is_ascii() {
        return Err(DeviceError::parse("reply contains non-ASCII bytes", text));
    }
    if reply.len() < MIN_STATUS_REPLY_LEN {
        return Err(DeviceError::parse(
            format!(
                "reply is {} bytes, expected at least {}",
                reply.len(),
                MIN_STATUS_REPLY_LEN
            ),
            text,
        ));
    }

    let status = ModuleStatus::from_raw(hex_field(&text, STATUS_FIELD, "status")?);
    let voltage_raw = hex_field(&text, VOLTAGE_FIELD, "voltage")?;
    let current_raw = hex_field(&text, CURRENT_FIELD, "current")?;
    let temp_raw = hex_field(&text, TEMP_FIELD, "temperature")?;

    let temperature = if status.temp_sensor_connected {
        raw_to_temperature(temp_raw)
    } else {
        None
    };

    Ok(StatusReply {
        status,
        voltage: round3(f64::from(voltage_raw) * VOLTAGE_FACTOR),
        current: round3(f64::from(current_raw) * CURRENT_FACTOR),
        temperature,
    })
}

/// Verify the checksum of a received frame.
///
/// The checksum covers every byte before the two checksum characters
/// (trailing CR/LF ignored). Returns `None` when the frame is too short to
/// carry a checksum.
pub fn verify_reply_checksum(reply: &[u8]) -> Option<bool> {
    let trimmed = trim_line_end(reply);
    if trimmed.len() < 3 {
        return None;
    }

    let (body, received) = trimmed.split_at(trimmed.len() - 2);
    let sum = body.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    let expected = format!("{:02x}", sum);

    Some(expected.as_bytes().eq_ignore_ascii_case(received))
}

/// Reply bytes as display text with the line terminator removed.
pub fn reply_text(reply: &[u8]) -> String {
    String::from_utf8_lossy(trim_line_end(reply)).into_owned()
}

fn trim_line_end(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|&b| b != CR && b != b'\n')
        .map_or(0, |i| i + 1);
    &bytes[..end]
}
