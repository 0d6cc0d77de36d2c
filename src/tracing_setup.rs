//! Log subscriber wiring for the controller binary and embedding code.
//!
//! Events from the worker and drivers carry `port_id` and `command` fields,
//! so the JSON format yields one queryable record per device interaction.
//! `RUST_LOG`, when set, wins over `general.log_level`.
//!
//! ```no_run
//! use hv_bias::{config::Settings, tracing_setup};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load()?;
//! tracing_setup::init_from_settings(&settings)?;
//! tracing::info!(ports = settings.devices.len(), "controller starting");
//! # Ok(())
//! # }
//! ```

use std::str::FromStr;

use crate::config::Settings;
use serde::{Deserialize, Serialize};
use tracing::{Level, Subscriber};
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Rendering of log lines on stderr.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Multi-line, colored; meant for an operator watching a terminal
    #[default]
    Pretty,
    /// One line per event, no colors
    Compact,
    /// Newline-delimited JSON
    Json,
}

/// Options for [`init`].
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Fallback verbosity when `RUST_LOG` is absent
    pub level: Level,
    /// Line rendering
    pub format: OutputFormat,
    /// Emit an event when spans (e.g. one `process` call) open and close
    pub with_span_events: bool,
    /// Include source file and line
    pub with_file_and_line: bool,
    /// Include the tokio worker thread name
    pub with_thread_names: bool,
    /// Only honored by [`OutputFormat::Pretty`]
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::new(Level::INFO)
    }
}

impl TracingConfig {
    /// Defaults for the given level: pretty output, colors, source locations.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            format: OutputFormat::Pretty,
            with_span_events: false,
            with_file_and_line: true,
            with_thread_names: true,
            with_ansi: true,
        }
    }

    /// Level and format from the `[general]` section.
    pub fn from_settings(settings: &Settings) -> Result<Self, String> {
        let level = parse_log_level(&settings.general.log_level)?;
        Ok(Self::new(level).with_format(settings.general.log_format))
    }

    /// Replace the output format.
    #[must_use]
    pub fn with_format(self, format: OutputFormat) -> Self {
        Self { format, ..self }
    }

    /// Toggle span open/close events.
    #[must_use]
    pub fn with_span_events(self, with_span_events: bool) -> Self {
        Self {
            with_span_events,
            ..self
        }
    }

    /// Toggle colors for pretty output.
    #[must_use]
    pub fn with_ansi(self, with_ansi: bool) -> Self {
        Self { with_ansi, ..self }
    }

    fn filter(&self) -> EnvFilter {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::new(self.level.to_string().to_lowercase()),
        }
    }

    fn span_events(&self) -> FmtSpan {
        if self.with_span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }

    /// The formatting layer, boxed so every format yields one type.
    fn output_layer<S>(&self) -> Box<dyn Layer<S> + Send + Sync + 'static>
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        let base = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_span_events(self.span_events())
            .with_file(self.with_file_and_line)
            .with_line_number(self.with_file_and_line)
            .with_thread_names(self.with_thread_names);

        match self.format {
            OutputFormat::Pretty => base.pretty().with_ansi(self.with_ansi).boxed(),
            OutputFormat::Compact => base.compact().with_ansi(false).boxed(),
            OutputFormat::Json => base.json().with_ansi(false).boxed(),
        }
    }
}

/// Install the global subscriber described by `settings.general`.
pub fn init_from_settings(settings: &Settings) -> Result<(), String> {
    init(TracingConfig::from_settings(settings)?)
}

/// Install the global subscriber.
///
/// A second call, or a call after some other subscriber was installed, is a
/// no-op that returns `Ok(())`.
pub fn init(config: TracingConfig) -> Result<(), String> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    tracing_subscriber::registry()
        .with(config.output_layer().with_filter(config.filter()))
        .try_init()
        .map_err(|e| format!("cannot install log subscriber: {e}"))
}

fn parse_log_level(raw: &str) -> Result<Level, String> {
    Level::from_str(raw.trim()).map_err(|_| {
        format!("unknown log level {raw:?}; expected trace, debug, info, warn or error")
    })
}
