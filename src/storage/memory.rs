//! In-memory stores.

use super::{ActionLogStore, ActionRecord, MeasurementRecord, MeasurementStore};
use crate::error::AppResult;
use crate::hardware::{PortId, Reading};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

/// Measurement store backed by a vector
#[derive(Debug, Default)]
pub struct InMemoryMeasurementStore {
    records: RwLock<Vec<MeasurementRecord>>,
}

impl InMemoryMeasurementStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// All records in insertion order.
    pub async fn all(&self) -> Vec<MeasurementRecord> {
        self.records.read().await.clone()
    }

    /// Records of one port in insertion order.
    pub async fn for_port(&self, port_id: PortId) -> Vec<MeasurementRecord> {
        self.records
            .read()
            .await
            .iter()
            .filter(|r| r.port_id == port_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MeasurementStore for InMemoryMeasurementStore {
    async fn save_reading(&self, port_id: PortId, reading: &Reading) -> AppResult<()> {
        let record = MeasurementRecord::from_reading(port_id, reading, Utc::now());
        self.records.write().await.push(record);
        Ok(())
    }

    async fn readings_since(&self, since: DateTime<Utc>) -> AppResult<Vec<MeasurementRecord>> {
        let mut records: Vec<_> = self
            .records
            .read()
            .await
            .iter()
            .filter(|r| r.timestamp >= since)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }
}

/// Action log backed by a vector
#[derive(Debug, Default)]
pub struct InMemoryActionLog {
    records: RwLock<Vec<ActionRecord>>,
}

impl InMemoryActionLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries in insertion order.
    pub async fn all(&self) -> Vec<ActionRecord> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl ActionLogStore for InMemoryActionLog {
    async fn save_action(&self, port_id: PortId, command: &str, response: &str) -> AppResult<()> {
        self.records.write().await.push(ActionRecord {
            timestamp: Utc::now(),
            port_id,
            command: command.to_string(),
            raw_response: response.trim().to_string(),
        });
        Ok(())
    }

    async fn recent_actions(&self, limit: usize) -> AppResult<Vec<ActionRecord>> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn readings_since_filters_and_orders() {
        let store = InMemoryMeasurementStore::new();
        let before = Utc::now() - Duration::seconds(1);

        store
            .save_reading(1, &Reading { voltage: Some(1.0), ..Reading::default() })
            .await
            .unwrap();
        store
            .save_reading(2, &Reading { voltage: Some(2.0), ..Reading::default() })
            .await
            .unwrap();

        let records = store.readings_since(before).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].port_id, 1);
        assert_eq!(records[1].port_id, 2);

        let future = Utc::now() + Duration::seconds(60);
        assert!(store.readings_since(future).await.unwrap().is_empty());
        assert_eq!(store.for_port(2).await.len(), 1);
    }

    #[tokio::test]
    async fn recent_actions_newest_first() {
        let log = InMemoryActionLog::new();
        for i in 0..5 {
            log.save_action(1, &format!("SET_VOLTAGE: {}V", i), "ok\r")
                .await
                .unwrap();
        }

        let recent = log.recent_actions(3).await.unwrap();
        let commands: Vec<_> = recent.iter().map(|r| r.command.as_str()).collect();
        assert_eq!(commands, vec!["SET_VOLTAGE: 4V", "SET_VOLTAGE: 3V", "SET_VOLTAGE: 2V"]);
        assert_eq!(recent[0].raw_response, "ok");
    }
}
