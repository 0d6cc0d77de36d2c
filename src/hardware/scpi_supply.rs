//! SCPI Bench Supply Driver
//!
//! Driver for commercial bias supplies controlled over SCPI. The instrument
//! is reached through a [`ScpiTransport`]; the bundled [`SocketScpiTransport`]
//! speaks raw SCPI over a TCP socket (port 5025 by default), one
//! newline-terminated line per command or reply.
//!
//! Besides the core [`HvSupply`] capabilities the driver implements
//! [`CurrentProtection`]. Every command is a discrete exchange: enabling OCP
//! writes the trip level and the protection state as two separate commands,
//! and monitoring issues five separate queries.
//!
//! On connect the driver clears the status queue (`*CLS`) and reads `*IDN?`.
//! It never resets the instrument on connect.
//!
//! A query first discards any unread input, so an answer that arrived after
//! its timeout never pairs with a later query.

use crate::config::ScpiSettings;
use crate::error::{DeviceError, DeviceResult};
use crate::hardware::capabilities::{CurrentProtection, DeviceState, HvSupply};
use crate::hardware::reading::Reading;
use crate::hardware::scpi_codec::{self, MonitorResponses, StatusBits};
use crate::hardware::serial_module::{discard_pending, DynSerial};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

/// Default raw-socket SCPI port
pub const DEFAULT_PORT: u16 = 5025;

/// Line-oriented SCPI transport.
#[async_trait]
pub trait ScpiTransport: Send + Sync {
    /// Send a query command and return the trimmed response.
    async fn query(&self, command: &str) -> Result<String>;

    /// Send a command without expecting a response.
    async fn command(&self, command: &str) -> Result<()>;
}

/// SCPI over a byte stream (TCP socket in production, duplex in tests).
pub struct SocketScpiTransport {
    stream: Mutex<BufReader<DynSerial>>,
    timeout: Duration,
}

impl SocketScpiTransport {
    /// Connect to `host:port`.
    pub async fn connect(host: &str, port: u16, io_timeout: Duration) -> Result<Self> {
        let stream = timeout(io_timeout, TcpStream::connect((host, port)))
            .await
            .with_context(|| format!("Connection timeout to {}:{}", host, port))?
            .with_context(|| format!("Failed to connect to {}:{}", host, port))?;

        // Disable Nagle's algorithm for low latency
        stream.set_nodelay(true)?;

        Ok(Self::from_stream(Box::new(stream), io_timeout))
    }

    /// Wrap an already-connected stream.
    pub fn from_stream(stream: DynSerial, io_timeout: Duration) -> Self {
        Self {
            stream: Mutex::new(BufReader::new(stream)),
            timeout: io_timeout,
        }
    }

    async fn write_line(stream: &mut BufReader<DynSerial>, line: &str) -> Result<()> {
        stream
            .get_mut()
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .with_context(|| format!("Failed to write command: {}", line))?;
        stream
            .get_mut()
            .flush()
            .await
            .context("Failed to flush stream")
    }
}

#[async_trait]
impl ScpiTransport for SocketScpiTransport {
    async fn query(&self, command: &str) -> Result<String> {
        let mut stream = self.stream.lock().await;
        let stale = discard_pending(&mut stream);
        if stale > 0 {
            warn!(bytes = stale, "Discarded unread SCPI input before query");
        }
        debug!("SCPI query: {:?}", command);
        Self::write_line(&mut stream, command).await?;

        let mut response = String::new();
        match timeout(self.timeout, stream.read_line(&mut response)).await {
            Ok(Ok(0)) => Err(anyhow!("Connection closed by device")),
            Ok(Ok(_)) => {
                let trimmed = response.trim().to_string();
                debug!("SCPI response: {:?}", trimmed);
                Ok(trimmed)
            }
            Ok(Err(e)) => Err(e).context("Failed to read response"),
            Err(_) => Err(anyhow!("Timeout waiting for response to: {}", command)),
        }
    }

    async fn command(&self, command: &str) -> Result<()> {
        let mut stream = self.stream.lock().await;
        debug!("SCPI write: {:?}", command);
        Self::write_line(&mut stream, command).await
    }
}

/// Split a connection string into host and port.
///
/// Accepts `host`, `host:port`, and VISA-style `TCPIP0::host::port::SOCKET`
/// or `TCPIP0::host::inst0::INSTR` resource strings.
pub fn parse_address(connection: &str, default_port: u16) -> Result<(String, u16)> {
    let connection = connection.trim();

    if connection.to_uppercase().starts_with("TCPIP") {
        let parts: Vec<&str> = connection.split("::").collect();
        let host = parts
            .get(1)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| anyhow!("Missing host in resource string: {}", connection))?;
        let port = match parts.last().map(|s| s.to_uppercase()) {
            Some(kind) if kind == "SOCKET" => parts
                .get(2)
                .ok_or_else(|| anyhow!("Missing port in resource string: {}", connection))?
                .parse()
                .with_context(|| format!("Invalid port in resource string: {}", connection))?,
            _ => default_port,
        };
        return Ok((host.to_string(), port));
    }

    match connection.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port
                .parse()
                .with_context(|| format!("Invalid port in address: {}", connection))?;
            Ok((host.to_string(), port))
        }
        _ if connection.is_empty() => Err(anyhow!("Empty instrument address")),
        _ => Ok((connection.to_string(), default_port)),
    }
}

fn transport_error(err: anyhow::Error) -> DeviceError {
    DeviceError::Transport(format!("{:#}", err))
}

/// Driver for one SCPI bench supply
pub struct ScpiSupply {
    /// Connection string, used in log fields
    resource: String,
    /// `None` when the session could not be opened
    transport: Option<Arc<dyn ScpiTransport>>,
    bits: StatusBits,
    identity: Option<String>,
}

impl ScpiSupply {
    /// Connect to an instrument and run the identification handshake.
    ///
    /// # Errors
    /// Returns error if the socket cannot be opened or the handshake fails
    pub async fn connect(resource: &str, settings: &ScpiSettings) -> Result<Self> {
        let (host, port) = parse_address(resource, settings.port)?;
        let transport =
            SocketScpiTransport::connect(&host, port, Duration::from_millis(settings.timeout_ms))
                .await?;

        let bits = StatusBits {
            cc_mode: settings.cc_mode_bit,
            ocp_trip: settings.ocp_trip_bit,
        };
        Self::open(resource, Arc::new(transport), bits).await
    }

    /// Run the identification handshake over an existing transport.
    pub async fn open(
        resource: &str,
        transport: Arc<dyn ScpiTransport>,
        bits: StatusBits,
    ) -> Result<Self> {
        transport
            .command(scpi_codec::CLEAR_STATUS)
            .await
            .with_context(|| format!("Failed to clear status on {}", resource))?;
        let identity = transport
            .query(scpi_codec::IDENTIFY)
            .await
            .with_context(|| format!("Failed to identify {}", resource))?;

        info!(resource, identity = %identity, "Connected to SCPI supply");

        Ok(Self {
            resource: resource.to_string(),
            transport: Some(transport),
            bits,
            identity: Some(identity),
        })
    }

    /// Build a supply whose session failed to open.
    pub fn failed(resource: &str) -> Self {
        Self {
            resource: resource.to_string(),
            transport: None,
            bits: StatusBits::default(),
            identity: None,
        }
    }

    /// `*IDN?` answer captured on connect.
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    fn transport(&self) -> DeviceResult<&Arc<dyn ScpiTransport>> {
        self.transport.as_ref().ok_or(DeviceError::PortNotOpen)
    }

    async fn write(&self, command: &str) -> DeviceResult<String> {
        self.transport()?
            .command(command)
            .await
            .map_err(transport_error)?;
        Ok("OK".to_string())
    }

    async fn query_monitor(&self) -> DeviceResult<MonitorResponses> {
        let transport = self.transport()?;
        let mut answers = Vec::with_capacity(scpi_codec::MONITOR_QUERIES.len());
        for query in scpi_codec::MONITOR_QUERIES {
            answers.push(transport.query(query).await.map_err(transport_error)?);
        }

        let mut answers = answers.into_iter();
        let mut next = || answers.next().unwrap_or_default();
        Ok(MonitorResponses {
            voltage: next(),
            current: next(),
            output: next(),
            operation: next(),
            questionable: next(),
        })
    }
}

#[async_trait]
impl HvSupply for ScpiSupply {
    fn state(&self) -> DeviceState {
        if self.transport.is_some() {
            DeviceState::Ready
        } else {
            DeviceState::Failed
        }
    }

    fn describe(&self) -> String {
        format!("scpi:{}", self.resource)
    }

    #[instrument(skip(self), fields(resource = %self.resource), err)]
    async fn turn_on(&self) -> DeviceResult<String> {
        self.write(&scpi_codec::output_state(true)).await
    }

    #[instrument(skip(self), fields(resource = %self.resource), err)]
    async fn turn_off(&self) -> DeviceResult<String> {
        self.write(&scpi_codec::output_state(false)).await
    }

    #[instrument(skip(self), fields(resource = %self.resource), err)]
    async fn reset(&self) -> DeviceResult<String> {
        self.write(scpi_codec::RESET).await?;
        self.write(scpi_codec::CLEAR_STATUS).await
    }

    #[instrument(skip(self), fields(resource = %self.resource), err)]
    async fn set_voltage(&self, volts: f64) -> DeviceResult<String> {
        scpi_codec::check_setpoint("voltage", volts)?;
        self.write(&scpi_codec::set_voltage(volts)).await
    }

    /// Queries (anything containing `?`) return the instrument's answer.
    #[instrument(skip(self), fields(resource = %self.resource), err)]
    async fn send_raw(&self, command: &str) -> DeviceResult<String> {
        if command.contains('?') {
            self.transport()?
                .query(command)
                .await
                .map_err(transport_error)
        } else {
            self.write(command).await
        }
    }

    #[instrument(skip(self), fields(resource = %self.resource))]
    async fn monitor(&self) -> Reading {
        let answers = match self.query_monitor().await {
            Ok(answers) => answers,
            Err(e) => {
                warn!(resource = %self.resource, error = %e, "Monitor query failed");
                return Reading::failed(e, "");
            }
        };

        match answers.decode(self.bits) {
            Ok(reading) => {
                if reading.overcurrent_active == Some(true) {
                    warn!(resource = %self.resource, "OCP trip event detected");
                }
                reading
            }
            Err(e) => {
                warn!(resource = %self.resource, error = %e, "Failed to parse monitor answers");
                Reading::failed(e, answers.raw_text())
            }
        }
    }
}

#[async_trait]
impl CurrentProtection for ScpiSupply {
    #[instrument(skip(self), fields(resource = %self.resource), err)]
    async fn set_current(&self, amps: f64) -> DeviceResult<String> {
        scpi_codec::check_setpoint("current", amps)?;
        self.write(&scpi_codec::set_current(amps)).await
    }

    #[instrument(skip(self), fields(resource = %self.resource), err)]
    async fn enable_ocp(&self, trip_amps: f64) -> DeviceResult<String> {
        scpi_codec::check_setpoint("OCP trip current", trip_amps)?;
        self.write(&scpi_codec::ocp_level(trip_amps)).await?;
        self.write(&scpi_codec::ocp_state(true)).await
    }

    #[instrument(skip(self), fields(resource = %self.resource), err)]
    async fn disable_ocp(&self) -> DeviceResult<String> {
        self.write(&scpi_codec::ocp_state(false)).await
    }

    #[instrument(skip(self), fields(resource = %self.resource), err)]
    async fn clear_protection_trip(&self) -> DeviceResult<String> {
        self.write(scpi_codec::CLEAR_PROTECTION).await
    }
}
