//! # HV Bias Core Library
//!
//! Command orchestration and monitoring for the high-voltage modules that bias
//! photodetector arrays. Two device families are driven through one uniform
//! capability interface:
//!
//! - custom bias modules on a serial link speaking a framed, checksummed
//!   protocol
//! - commercial bench supplies speaking SCPI over a socket
//!
//! ## Crate Structure
//!
//! - **`config`**: `Settings` loaded from TOML plus `HV_BIAS_` environment
//!   overrides, and their validation.
//! - **`error`**: `HvError` for application failures and `DeviceError` for the
//!   typed outcome of a single device call.
//! - **`hardware`**: capability traits, both protocol codecs and drivers,
//!   simulated devices and the `DeviceRegistry`.
//! - **`ramp`**: pure voltage-ramp planning.
//! - **`storage`**: measurement and action-log stores (in-memory and CSV).
//! - **`tracing_setup`**: subscriber initialisation.
//! - **`worker`**: the task queue, the single `CommandWorker` that serializes
//!   every hardware call, and the `MonitorTicker`.

pub mod config;
pub mod error;
pub mod hardware;
pub mod ramp;
pub mod storage;
pub mod tracing_setup;
pub mod worker;
