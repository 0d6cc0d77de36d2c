//! Append-only CSV backends.
//!
//! Each store owns one file. The header row is written only when the file is
//! created empty, so restarts keep appending to the same table.

use super::{ActionLogStore, ActionRecord, MeasurementRecord, MeasurementStore};
use crate::config::Settings;
use crate::error::{AppResult, HvError};
use crate::hardware::{PortId, Reading};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::info;

fn storage_err(err: impl std::fmt::Display) -> HvError {
    HvError::Storage(err.to_string())
}

/// Shared append/read logic for one CSV table.
#[derive(Debug)]
struct CsvTable {
    path: PathBuf,
    writer: Mutex<csv::Writer<File>>,
}

impl CsvTable {
    fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let is_empty = file.metadata()?.len() == 0;
        let writer = csv::WriterBuilder::new()
            .has_headers(is_empty)
            .from_writer(file);

        info!("CSV store opened at {}", path.display());
        Ok(Self {
            path,
            writer: Mutex::new(writer),
        })
    }

    async fn append<T: Serialize>(&self, row: &T) -> AppResult<()> {
        let mut writer = self.writer.lock().await;
        writer.serialize(row).map_err(storage_err)?;
        writer.flush()?;
        Ok(())
    }

    async fn read_all<T: DeserializeOwned>(&self) -> AppResult<Vec<T>> {
        // Hold the writer lock so no half-written row is observed.
        let _guard = self.writer.lock().await;
        let mut reader = csv::Reader::from_path(&self.path).map_err(storage_err)?;
        reader
            .deserialize()
            .collect::<Result<Vec<T>, _>>()
            .map_err(storage_err)
    }
}

/// Measurement table in a CSV file
#[derive(Debug)]
pub struct CsvMeasurementStore {
    table: CsvTable,
}

impl CsvMeasurementStore {
    /// Open (or create) the table at `path`.
    pub fn new(path: impl AsRef<Path>) -> AppResult<Self> {
        Ok(Self {
            table: CsvTable::open(path)?,
        })
    }

    /// Open the table named by the general settings.
    pub fn from_settings(settings: &Settings) -> AppResult<Self> {
        Self::new(settings.general.data_file("measurements", "csv"))
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.table.path
    }
}

#[async_trait]
impl MeasurementStore for CsvMeasurementStore {
    async fn save_reading(&self, port_id: PortId, reading: &Reading) -> AppResult<()> {
        let record = MeasurementRecord::from_reading(port_id, reading, Utc::now());
        self.table.append(&record).await
    }

    async fn readings_since(&self, since: DateTime<Utc>) -> AppResult<Vec<MeasurementRecord>> {
        let mut records: Vec<MeasurementRecord> = self.table.read_all().await?;
        records.retain(|r| r.timestamp >= since);
        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }
}

/// Action log in a CSV file
#[derive(Debug)]
pub struct CsvActionLog {
    table: CsvTable,
}

impl CsvActionLog {
    /// Open (or create) the log at `path`.
    pub fn new(path: impl AsRef<Path>) -> AppResult<Self> {
        Ok(Self {
            table: CsvTable::open(path)?,
        })
    }

    /// Open the log named by the general settings.
    pub fn from_settings(settings: &Settings) -> AppResult<Self> {
        Self::new(settings.general.data_file("action_log", "csv"))
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.table.path
    }
}

#[async_trait]
impl ActionLogStore for CsvActionLog {
    async fn save_action(&self, port_id: PortId, command: &str, response: &str) -> AppResult<()> {
        let record = ActionRecord {
            timestamp: Utc::now(),
            port_id,
            command: command.to_string(),
            raw_response: response.trim().to_string(),
        };
        self.table.append(&record).await
    }

    async fn recent_actions(&self, limit: usize) -> AppResult<Vec<ActionRecord>> {
        let records: Vec<ActionRecord> = self.table.read_all().await?;
        Ok(records.into_iter().rev().take(limit).collect())
    }
}
