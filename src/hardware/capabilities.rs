//! Device Capabilities
//!
//! Devices expose what they can do through fine-grained capability traits
//! instead of one monolithic instrument trait:
//!
//! - Every bias supply implements [`HvSupply`] (on/off, reset, voltage, raw
//!   commands and a normalized monitor reading).
//! - Instrument-class supplies additionally implement [`CurrentProtection`]
//!   (current limit and over-current protection).
//!
//! A device's capability set is collected into [`DeviceComponents`] at
//! construction time. Code that wants an optional capability asks the
//! registry for it and receives `None` when the device lacks it, so
//! unsupported commands are detected by probing rather than by a failed call.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Returns a typed [`DeviceResult`] instead of sentinel response strings
//!
//! # Example
//!
//! ```rust,ignore
//! let components = DeviceComponents::new()
//!     .with_supply(supply.clone())
//!     .with_current_protection(supply);
//!
//! assert!(components.capabilities().contains(&Capability::CurrentProtection));
//! ```

use crate::error::DeviceResult;
use crate::hardware::reading::Reading;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Connection state of a device.
///
/// A device is `Failed` only when its connection could not be opened at
/// startup. Transient I/O errors later on fail the individual call and leave
/// the state untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    /// Connection usable
    Ready,
    /// Connection could not be opened; every call is refused without I/O
    Failed,
}

impl DeviceState {
    /// Returns `true` if the device accepts commands.
    pub fn is_ready(self) -> bool {
        matches!(self, DeviceState::Ready)
    }
}

/// Capability: core control of a high-voltage bias supply.
///
/// Implemented by every device family. Each successful call returns the raw
/// device response (or a short acknowledgement for write-only transports) so
/// it can be written to the action log verbatim.
#[async_trait]
pub trait HvSupply: Send + Sync {
    /// Current connection state.
    fn state(&self) -> DeviceState;

    /// Short human-readable description of the underlying connection.
    fn describe(&self) -> String;

    /// Enable the high-voltage output.
    async fn turn_on(&self) -> DeviceResult<String>;

    /// Disable the high-voltage output immediately.
    ///
    /// Callers wanting a safe ramp-down go through the command worker instead.
    async fn turn_off(&self) -> DeviceResult<String>;

    /// Reset the device to a known safe state.
    async fn reset(&self) -> DeviceResult<String>;

    /// Program the output voltage in volts.
    async fn set_voltage(&self, volts: f64) -> DeviceResult<String>;

    /// Send a user-supplied command string unchanged.
    async fn send_raw(&self, command: &str) -> DeviceResult<String>;

    /// Poll the device and return a normalized reading.
    ///
    /// Never fails: transport and parse failures are reported through
    /// [`Reading::error`].
    async fn monitor(&self) -> Reading;
}

/// Capability: current limiting and over-current protection.
///
/// Only instrument-class supplies implement this.
#[async_trait]
pub trait CurrentProtection: Send + Sync {
    /// Program the constant-current limit in amps.
    async fn set_current(&self, amps: f64) -> DeviceResult<String>;

    /// Set the OCP trip level and arm the protection.
    async fn enable_ocp(&self, trip_amps: f64) -> DeviceResult<String>;

    /// Disarm over-current protection.
    async fn disable_ocp(&self) -> DeviceResult<String>;

    /// Clear a latched protection trip.
    async fn clear_protection_trip(&self) -> DeviceResult<String>;
}

/// Capability tags used for introspection and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// Implements [`HvSupply`]
    HvSupply,
    /// Implements [`CurrentProtection`]
    CurrentProtection,
}

/// Capability bag produced when a device is constructed.
#[derive(Clone, Default)]
pub struct DeviceComponents {
    /// Core capability set
    pub supply: Option<Arc<dyn HvSupply>>,

    /// Extended capability set (instrument-class devices only)
    pub current_protection: Option<Arc<dyn CurrentProtection>>,
}

impl DeviceComponents {
    /// Create a new empty DeviceComponents
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the core capability set.
    #[must_use]
    pub fn with_supply(mut self, supply: Arc<dyn HvSupply>) -> Self {
        self.supply = Some(supply);
        self
    }

    /// Attach the extended current-protection capability.
    #[must_use]
    pub fn with_current_protection(mut self, protection: Arc<dyn CurrentProtection>) -> Self {
        self.current_protection = Some(protection);
        self
    }

    /// Get list of capabilities this device supports
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps = Vec::new();

        if self.supply.is_some() {
            caps.push(Capability::HvSupply);
        }
        if self.current_protection.is_some() {
            caps.push(Capability::CurrentProtection);
        }

        caps
    }

    /// Connection state, `Failed` when no supply is attached.
    pub fn state(&self) -> DeviceState {
        self.supply
            .as_ref()
            .map_or(DeviceState::Failed, |supply| supply.state())
    }
}

impl std::fmt::Debug for DeviceComponents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceComponents")
            .field("capabilities", &self.capabilities())
            .field("state", &self.state())
            .finish()
    }
}
