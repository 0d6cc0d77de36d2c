//! Hardware layer for high-voltage bias modules.
//!
//! Devices are exposed through small capability traits (see [`capabilities`]):
//! every device implements [`HvSupply`], instrument-class supplies additionally
//! implement [`CurrentProtection`]. Drivers own exactly one connection each and
//! are collected into a [`DeviceRegistry`] at startup.
//!
//! # Drivers
//!
//! - [`serial_module::SerialHvModule`]: custom modules using the framed serial protocol
//! - [`scpi_supply::ScpiSupply`]: bench supplies using SCPI over a socket transport
//! - [`mock`]: simulated twins of both families for test mode

pub mod capabilities;
pub mod factory;
pub mod framed_codec;
pub mod mock;
pub mod reading;
pub mod registry;
pub mod scpi_codec;
pub mod scpi_supply;
pub mod serial_module;

pub use capabilities::{Capability, CurrentProtection, DeviceComponents, DeviceState, HvSupply};
pub use reading::{ModuleStatus, Reading};
pub use registry::{DeviceRegistry, PortId, RegisteredDevice};
