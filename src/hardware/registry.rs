//! Device Registry
//!
//! Maps numeric port identifiers to devices and holds the temperature-donor
//! pairings between ports.
//!
//! # Lifecycle
//!
//! The registry is populated once at startup (see
//! [`factory::build_registry`](crate::hardware::factory::build_registry)) and
//! then shared read-only as `Arc<DeviceRegistry>` by the command worker and
//! the monitor ticker. It has no interior mutability, so no locking is needed.
//!
//! # Capability Access
//!
//! Optional capabilities are probed, not assumed:
//!
//! ```rust,ignore
//! match registry.get_current_protection(port) {
//!     Some(protection) => protection.enable_ocp(0.1).await?,
//!     None => { /* report "not supported" */ }
//! }
//! ```

use crate::error::{AppResult, HvError};
use crate::hardware::capabilities::{
    Capability, CurrentProtection, DeviceComponents, DeviceState, HvSupply,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Numeric port identifier
pub type PortId = u32;

/// A device together with its per-port settings
#[derive(Debug, Clone)]
pub struct RegisteredDevice {
    /// Capability implementations
    pub components: DeviceComponents,
    /// Human-readable label
    pub label: String,
    /// Maximum accepted voltage, if limited
    pub max_voltage: Option<f64>,
}

impl RegisteredDevice {
    /// Wrap components with a default label.
    pub fn new(components: DeviceComponents) -> Self {
        Self {
            components,
            label: String::new(),
            max_voltage: None,
        }
    }

    /// Set the label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Set the voltage limit.
    #[must_use]
    pub fn with_max_voltage(mut self, max_voltage: Option<f64>) -> Self {
        self.max_voltage = max_voltage;
        self
    }

    /// Connection state.
    pub fn state(&self) -> DeviceState {
        self.components.state()
    }
}

/// Central registry of devices by port id
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    /// Ordered so monitor rounds visit ports deterministically
    devices: BTreeMap<PortId, RegisteredDevice>,
    /// primary -> donor
    donors: HashMap<PortId, PortId>,
}

impl DeviceRegistry {
    /// Create a new empty device registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device under a port id.
    ///
    /// # Errors
    /// Fails if the port id is already taken.
    pub fn register(&mut self, id: PortId, mut device: RegisteredDevice) -> AppResult<()> {
        if self.devices.contains_key(&id) {
            return Err(HvError::Startup(format!("Port {} registered twice", id)));
        }
        if device.label.is_empty() {
            device.label = format!("Port {}", id);
        }

        tracing::info!(
            port_id = id,
            label = %device.label,
            state = ?device.state(),
            capabilities = ?device.components.capabilities(),
            "Registered device"
        );
        self.devices.insert(id, device);
        Ok(())
    }

    /// Declare that `primary` borrows temperature and status from `donor`.
    ///
    /// # Errors
    /// Fails if either port is unknown, the ports are identical, or `primary`
    /// already has a donor.
    pub fn pair(&mut self, primary: PortId, donor: PortId) -> AppResult<()> {
        for port in [primary, donor] {
            if !self.devices.contains_key(&port) {
                return Err(HvError::Startup(format!(
                    "Pairing {} -> {} references unknown port {}",
                    primary, donor, port
                )));
            }
        }
        if primary == donor {
            return Err(HvError::Startup(format!(
                "Port {} cannot be its own donor",
                primary
            )));
        }
        if let Some(existing) = self.donors.get(&primary) {
            return Err(HvError::Startup(format!(
                "Port {} already borrows from port {}",
                primary, existing
            )));
        }

        self.donors.insert(primary, donor);
        Ok(())
    }

    /// Get a registered device by port id
    pub fn get(&self, id: PortId) -> Option<&RegisteredDevice> {
        self.devices.get(&id)
    }

    /// Check if a port is registered
    pub fn contains(&self, id: PortId) -> bool {
        self.devices.contains_key(&id)
    }

    /// Get count of registered devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// All registered port ids in ascending order
    pub fn port_ids(&self) -> Vec<PortId> {
        self.devices.keys().copied().collect()
    }

    /// Port ids whose device is `Ready`, in ascending order
    pub fn ready_ports(&self) -> Vec<PortId> {
        self.devices
            .iter()
            .filter(|(_, d)| d.state().is_ready())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Connection state of a port, `None` if unknown
    pub fn state(&self, id: PortId) -> Option<DeviceState> {
        self.devices.get(&id).map(RegisteredDevice::state)
    }

    /// Label of a port
    pub fn label(&self, id: PortId) -> Option<&str> {
        self.devices.get(&id).map(|d| d.label.as_str())
    }

    /// Voltage limit of a port
    pub fn max_voltage(&self, id: PortId) -> Option<f64> {
        self.devices.get(&id).and_then(|d| d.max_voltage)
    }

    // =========================================================================
    // Capability Access
    // =========================================================================

    /// Get a device's core capability set
    pub fn get_supply(&self, id: PortId) -> Option<Arc<dyn HvSupply>> {
        self.devices
            .get(&id)
            .and_then(|d| d.components.supply.clone())
    }

    /// Get a device as CurrentProtection (if it supports this capability)
    pub fn get_current_protection(&self, id: PortId) -> Option<Arc<dyn CurrentProtection>> {
        self.devices
            .get(&id)
            .and_then(|d| d.components.current_protection.clone())
    }

    /// Ports whose device provides a capability
    pub fn devices_with_capability(&self, capability: Capability) -> Vec<PortId> {
        self.devices
            .iter()
            .filter(|(_, d)| d.components.capabilities().contains(&capability))
            .map(|(id, _)| *id)
            .collect()
    }

    // =========================================================================
    // Temperature Donors
    // =========================================================================

    /// Donor port of a primary, if paired
    pub fn donor_for(&self, primary: PortId) -> Option<PortId> {
        self.donors.get(&primary).copied()
    }

    /// Returns `true` if the port donates to some primary
    pub fn is_donor(&self, port: PortId) -> bool {
        self.donors.values().any(|&donor| donor == port)
    }

    /// Returns `true` if the port is a donor but not itself a primary.
    ///
    /// Such ports never persist standalone readings.
    pub fn is_donor_only(&self, port: PortId) -> bool {
        self.is_donor(port) && !self.donors.contains_key(&port)
    }

    /// All pairings as `(primary, donor)`, sorted by primary
    pub fn pairings(&self) -> Vec<(PortId, PortId)> {
        let mut pairs: Vec<_> = self.donors.iter().map(|(&p, &d)| (p, d)).collect();
        pairs.sort_unstable();
        pairs
    }
}
