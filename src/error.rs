//! Custom error types for the application.
//!
//! Two error families live here:
//!
//! - **`HvError`**: application-level failures such as configuration parsing,
//!   configuration validation, startup wiring and I/O. These abort a command
//!   line invocation or a startup step.
//! - **`DeviceError`**: the typed failure reason of a single device call. Every
//!   capability method returns `DeviceResult<T>` so callers never have to sniff
//!   sentinel strings such as `"ERROR:PORT_NOT_OPEN"` out of a response.
//!
//! `DeviceError` is `Clone + PartialEq` because it is carried inside a
//! [`Reading`](crate::hardware::Reading) and compared in tests.
//!
//! By using `#[from]`, `HvError` can be created from underlying error types,
//! simplifying error handling with the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, HvError>;

/// Convenience alias for the outcome of one device call.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Application-level error.
#[derive(Error, Debug)]
pub enum HvError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Startup error: {0}")]
    Startup(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Task queue closed")]
    QueueClosed,
}

impl From<figment::Error> for HvError {
    fn from(value: figment::Error) -> Self {
        HvError::Config(Box::new(value))
    }
}

/// Typed failure reason of a single device call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// The connection was never opened; no I/O was attempted.
    #[error("port not open")]
    PortNotOpen,

    /// The transport reported an error during this call.
    #[error("transport error: {0}")]
    Transport(String),

    /// The device did not answer within the transport timeout.
    #[error("no response from device")]
    NoResponse,

    /// The device answered with something that could not be decoded.
    #[error("parse error: {reason} (raw: {raw:?})")]
    Parse {
        /// What was wrong with the reply
        reason: String,
        /// The reply as received
        raw: String,
    },

    /// The request itself was malformed (e.g. a voltage that cannot be encoded).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested voltage exceeds the configured per-port limit.
    #[error("requested {requested} V exceeds the {limit} V limit")]
    VoltageLimit {
        /// Requested voltage
        requested: f64,
        /// Configured maximum
        limit: f64,
    },
}

impl DeviceError {
    /// Build a parse error from a reason and the raw reply.
    pub fn parse(reason: impl Into<String>, raw: impl Into<String>) -> Self {
        DeviceError::Parse {
            reason: reason.into(),
            raw: raw.into(),
        }
    }

    /// Build a transport error from any displayable error.
    pub fn transport(err: impl std::fmt::Display) -> Self {
        DeviceError::Transport(err.to_string())
    }

    /// Raw reply associated with the error, if any.
    pub fn raw(&self) -> Option<&str> {
        match self {
            DeviceError::Parse { raw, .. } => Some(raw.as_str()),
            _ => None,
        }
    }
}
