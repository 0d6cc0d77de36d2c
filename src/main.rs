//! CLI entry point for hv_bias
//!
//! ```bash
//! hv_bias run --config config/default.toml
//! hv_bias check --config config/default.toml
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use hv_bias::config::{Settings, DEFAULT_CONFIG_PATH};
use hv_bias::hardware::factory::build_registry;
use hv_bias::storage::{ActionLogStore, MeasurementStore};
use hv_bias::tracing_setup;
use hv_bias::worker::{task_queue, CommandWorker, MonitorTicker};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "hv_bias")]
#[command(about = "Photodetector HV bias control and monitoring", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the devices and run the command worker and monitor ticker
    Run {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Load and validate a configuration file
    Check {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Print the effective configuration (file plus environment overrides)
        #[arg(long)]
        print: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run(&config).await,
        Commands::Check { config, print } => check(&config, print),
    }
}

fn load_settings(path: &Path) -> Result<Settings> {
    let settings = Settings::load_from(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    settings
        .validate()
        .map_err(|e| anyhow!("Invalid configuration in {}: {}", path.display(), e))?;
    Ok(settings)
}

fn check(path: &Path, print: bool) -> Result<()> {
    let settings = load_settings(path)?;
    if print {
        let rendered =
            toml::to_string_pretty(&settings).context("Failed to render configuration")?;
        println!("{}", rendered);
    }
    println!(
        "Configuration OK: {} device(s), {} pairing(s), test_mode = {}",
        settings.devices.len(),
        settings.pairings.len(),
        settings.general.test_mode
    );
    Ok(())
}

async fn run(path: &Path) -> Result<()> {
    let settings = load_settings(path)?;
    tracing_setup::init_from_settings(&settings).map_err(|e| anyhow!(e))?;

    info!(
        config = %path.display(),
        test_mode = settings.general.test_mode,
        "Starting hv_bias"
    );

    let registry = Arc::new(build_registry(&settings).await?);
    let ready = registry.ready_ports();
    if ready.is_empty() {
        if settings.general.test_mode {
            warn!("No device is ready");
        } else {
            error!("No device could be opened");
            return Err(anyhow!("no configured device is ready"));
        }
    }
    info!(ready = ?ready, total = registry.len(), "Devices opened");

    let (measurements, actions) = open_stores(&settings)?;

    let (sender, receiver) = task_queue();
    let worker = CommandWorker::new(
        registry.clone(),
        measurements,
        actions,
        settings.ramp.clone(),
    )
    .spawn(receiver);
    let ticker = MonitorTicker::new(
        registry.clone(),
        sender.clone(),
        settings.general.monitoring_interval(),
    )
    .spawn();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");

    ticker.abort();
    drop(sender);
    if let Err(e) = worker.await {
        error!("Command worker ended abnormally: {}", e);
    }
    info!("hv_bias stopped");
    Ok(())
}

#[cfg(feature = "storage_csv")]
fn open_stores(
    settings: &Settings,
) -> Result<(Arc<dyn MeasurementStore>, Arc<dyn ActionLogStore>)> {
    use hv_bias::storage::{CsvActionLog, CsvMeasurementStore};

    let measurements = CsvMeasurementStore::from_settings(settings)?;
    let actions = CsvActionLog::from_settings(settings)?;
    info!(
        measurements = %measurements.path().display(),
        actions = %actions.path().display(),
        "CSV stores opened"
    );
    Ok((Arc::new(measurements), Arc::new(actions)))
}

#[cfg(not(feature = "storage_csv"))]
fn open_stores(
    _settings: &Settings,
) -> Result<(Arc<dyn MeasurementStore>, Arc<dyn ActionLogStore>)> {
    use hv_bias::storage::{InMemoryActionLog, InMemoryMeasurementStore};

    warn!("storage_csv feature disabled, readings are kept in memory only");
    Ok((
        Arc::new(InMemoryMeasurementStore::new()),
        Arc::new(InMemoryActionLog::new()),
    ))
}
