//! Serial HV Module Driver
//!
//! Driver for the custom high-voltage bias modules using the framed serial
//! protocol (see [`framed_codec`](crate::hardware::framed_codec)).
//!
//! Protocol Overview:
//! - Baud: 38400, 8E1, no flow control
//! - Frame: STX + command + ETX + checksum + CR, reply terminated by CR
//! - Commands: HON / HOF (output), HRE (reset), HCM0 (temperature
//!   correction off), HBVxxxx (voltage), HPO (status query)
//!
//! Each exchange discards any unread input, writes one frame, waits a short
//! settle time, then reads one CR-terminated reply under a timeout. A reply
//! that arrives after its timeout is thrown away by the next exchange
//! instead of being taken as that exchange's answer. A module whose port could not be
//! opened stays registered in the `Failed` state and refuses every call
//! without touching I/O.

use crate::config::SerialSettings;
use crate::error::{DeviceError, DeviceResult};
use crate::hardware::capabilities::{DeviceState, HvSupply};
use crate::hardware::framed_codec::{self, ModuleCommand, CR};
use crate::hardware::reading::Reading;
use async_trait::async_trait;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

/// Trait alias for async serial port I/O.
///
/// Implemented by `tokio_serial::SerialStream` for hardware and by
/// `tokio::io::DuplexStream` in tests.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Serial port shared behind a mutex with buffered reading.
pub type SharedPort = Arc<Mutex<BufReader<DynSerial>>>;

/// Wrap any serial stream into a [`SharedPort`].
pub fn wrap_shared(port: DynSerial) -> SharedPort {
    Arc::new(Mutex::new(BufReader::new(port)))
}

/// Drop everything buffered or already readable on `port` without waiting.
///
/// Returns the number of bytes discarded.
pub fn discard_pending(port: &mut BufReader<DynSerial>) -> usize {
    let mut discarded = 0;
    loop {
        let available = match port.fill_buf().now_or_never() {
            Some(Ok(buf)) if !buf.is_empty() => buf.len(),
            _ => break,
        };
        port.consume(available);
        discarded += available;
    }
    discarded
}

/// Exchange timing for one module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialTiming {
    /// Maximum wait for a reply
    pub timeout: Duration,
    /// Delay between write and read
    pub settle: Duration,
    /// Delay between the steps of a reset sequence
    pub reset_settle: Duration,
}

impl From<&SerialSettings> for SerialTiming {
    fn from(settings: &SerialSettings) -> Self {
        Self {
            timeout: Duration::from_millis(settings.timeout_ms),
            settle: Duration::from_millis(settings.settle_ms),
            reset_settle: Duration::from_millis(settings.reset_settle_ms),
        }
    }
}

impl Default for SerialTiming {
    fn default() -> Self {
        Self::from(&SerialSettings::default())
    }
}

/// Driver for one framed-protocol HV module
pub struct SerialHvModule {
    /// Device path, used in log fields
    port_name: String,
    /// `None` when the port could not be opened
    port: Option<SharedPort>,
    timing: SerialTiming,
}

impl SerialHvModule {
    /// Open a module on a serial device path.
    ///
    /// # Errors
    /// Returns error if the serial port cannot be opened
    #[cfg(feature = "instrument_serial")]
    pub fn open(port_name: &str, settings: &SerialSettings) -> anyhow::Result<Self> {
        use anyhow::Context;
        use tokio_serial::SerialPortBuilderExt;

        let port = tokio_serial::new(port_name, settings.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::Even)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(Duration::from_millis(settings.timeout_ms))
            .open_native_async()
            .with_context(|| format!("Failed to open HV module serial port: {}", port_name))?;

        tracing::info!(port = port_name, baud = settings.baud_rate, "Opened HV module serial port");

        Ok(Self::with_port(
            port_name,
            wrap_shared(Box::new(port)),
            SerialTiming::from(settings),
        ))
    }

    /// Build a module on an already-open stream.
    pub fn with_port(port_name: &str, port: SharedPort, timing: SerialTiming) -> Self {
        Self {
            port_name: port_name.to_string(),
            port: Some(port),
            timing,
        }
    }

    /// Build a module whose port failed to open.
    pub fn failed(port_name: &str) -> Self {
        Self {
            port_name: port_name.to_string(),
            port: None,
            timing: SerialTiming::default(),
        }
    }

    #[cfg(test)]
    fn with_test_port(port: SharedPort) -> Self {
        Self::with_port(
            "test",
            port,
            SerialTiming {
                timeout: Duration::from_millis(200),
                settle: Duration::ZERO,
                reset_settle: Duration::ZERO,
            },
        )
    }

    /// Write one frame and read one CR-terminated reply.
    async fn exchange(&self, command: &[u8]) -> DeviceResult<Vec<u8>> {
        let port = self.port.as_ref().ok_or(DeviceError::PortNotOpen)?;
        let frame = framed_codec::encode_frame(command);

        let mut port = port.lock().await;
        let stale = discard_pending(&mut port);
        if stale > 0 {
            warn!(port = %self.port_name, bytes = stale, "Discarded unread input before send");
        }
        debug!(port = %self.port_name, frame = ?String::from_utf8_lossy(&frame), "send");

        port.get_mut()
            .write_all(&frame)
            .await
            .map_err(DeviceError::transport)?;
        port.get_mut().flush().await.map_err(DeviceError::transport)?;

        if !self.timing.settle.is_zero() {
            tokio::time::sleep(self.timing.settle).await;
        }

        let mut reply = Vec::new();
        let read = tokio::time::timeout(self.timing.timeout, port.read_until(CR, &mut reply))
            .await
            .map_err(|_| DeviceError::NoResponse)?
            .map_err(DeviceError::transport)?;

        if read == 0 {
            return Err(DeviceError::NoResponse);
        }

        debug!(port = %self.port_name, reply = ?String::from_utf8_lossy(&reply), "recv");
        Ok(reply)
    }

    async fn send(&self, command: ModuleCommand) -> DeviceResult<String> {
        let reply = self.exchange(&command.to_bytes()).await?;
        Ok(framed_codec::reply_text(&reply))
    }
}

#[async_trait]
impl HvSupply for SerialHvModule {
    fn state(&self) -> DeviceState {
        if self.port.is_some() {
            DeviceState::Ready
        } else {
            DeviceState::Failed
        }
    }

    fn describe(&self) -> String {
        format!("serial:{}", self.port_name)
    }

    #[instrument(skip(self), fields(port = %self.port_name), err)]
    async fn turn_on(&self) -> DeviceResult<String> {
        self.send(ModuleCommand::HvOn).await
    }

    #[instrument(skip(self), fields(port = %self.port_name), err)]
    async fn turn_off(&self) -> DeviceResult<String> {
        self.send(ModuleCommand::HvOff).await
    }

    /// Reset, output off, temperature correction off.
    ///
    /// All three steps are always attempted; step failures are folded into
    /// the combined response. Only a reset where every step failed is an error.
    #[instrument(skip(self), fields(port = %self.port_name), err)]
    async fn reset(&self) -> DeviceResult<String> {
        if self.port.is_none() {
            return Err(DeviceError::PortNotOpen);
        }

        let steps = [
            ModuleCommand::Reset,
            ModuleCommand::HvOff,
            ModuleCommand::DisableTempCorrection,
        ];

        let mut parts = Vec::with_capacity(steps.len());
        let mut failures = 0;
        for (i, step) in steps.into_iter().enumerate() {
            if i > 0 && !self.timing.reset_settle.is_zero() {
                tokio::time::sleep(self.timing.reset_settle).await;
            }
            match self.send(step).await {
                Ok(reply) => parts.push(reply),
                Err(e) => {
                    warn!(port = %self.port_name, ?step, error = %e, "Reset step failed");
                    failures += 1;
                    parts.push(format!("ERROR: {}", e));
                }
            }
        }

        let combined = parts.join(" | ");
        if failures == steps.len() {
            Err(DeviceError::Transport(combined))
        } else {
            Ok(combined)
        }
    }

    #[instrument(skip(self), fields(port = %self.port_name), err)]
    async fn set_voltage(&self, volts: f64) -> DeviceResult<String> {
        if self.port.is_none() {
            return Err(DeviceError::PortNotOpen);
        }
        let raw = framed_codec::voltage_to_raw(volts)?;
        self.send(ModuleCommand::SetVoltage(raw)).await
    }

    #[instrument(skip(self), fields(port = %self.port_name), err)]
    async fn send_raw(&self, command: &str) -> DeviceResult<String> {
        let reply = self.exchange(command.as_bytes()).await?;
        Ok(framed_codec::reply_text(&reply))
    }

    #[instrument(skip(self), fields(port = %self.port_name))]
    async fn monitor(&self) -> Reading {
        let reply = match self.exchange(&ModuleCommand::GetStatus.to_bytes()).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(port = %self.port_name, error = %e, "No valid status reply");
                return Reading::failed(e, "");
            }
        };

        let text = framed_codec::reply_text(&reply);
        if framed_codec::verify_reply_checksum(&reply) == Some(false) {
            warn!(port = %self.port_name, reply = %text, "Status reply checksum mismatch");
        }

        match framed_codec::decode_status_reply(&reply) {
            Ok(decoded) => decoded.into_reading(text),
            Err(e) => {
                warn!(port = %self.port_name, error = %e, "Failed to decode status reply");
                Reading::failed(e, text)
            }
        }
    }
}
