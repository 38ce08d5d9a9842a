use super::{FlowStore, Storage};
use crate::error::{Result, SwapError};
use crate::flow::{FlowKind, FlowRecord, FlowState};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use std::sync::Arc;
use uuid::Uuid;

pub struct SqliteFlowStore {
    storage: Arc<Storage>,
}

impl SqliteFlowStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    fn record_from_row(row: &Row<'_>) -> rusqlite::Result<(String, String, String, i64)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
    }

    fn decode(raw: (String, String, String, i64)) -> Result<FlowRecord> {
        let (swap_id, kind, state, updated_at) = raw;
        let swap_id = Uuid::parse_str(&swap_id)
            .map_err(|e| SwapError::internal(format!("Corrupt swap id '{}': {}", swap_id, e)))?;
        let kind: FlowKind = kind.parse().map_err(SwapError::Internal)?;
        let state: FlowState = serde_json::from_str(&state)?;

        Ok(FlowRecord {
            swap_id,
            kind,
            state,
            updated_at: chrono::DateTime::from_timestamp(updated_at, 0)
                .unwrap_or_else(|| Utc::now()),
        })
    }
}

#[async_trait]
impl FlowStore for SqliteFlowStore {
    async fn load(&self, swap_id: Uuid) -> Result<Option<FlowRecord>> {
        let conn = self.storage.get_connection().await;

        let raw = conn
            .query_row(
                "SELECT swap_id, kind, state, updated_at FROM flows WHERE swap_id = ?1",
                params![swap_id.to_string()],
                Self::record_from_row,
            )
            .optional()?;

        raw.map(Self::decode).transpose()
    }

    async fn save(&self, record: &FlowRecord) -> Result<()> {
        let conn = self.storage.get_connection().await;
        let state_json = serde_json::to_string(&record.state)?;

        // only a strictly newer version may replace what is stored
        let changed = conn.execute(
            "INSERT INTO flows (swap_id, kind, step, version, state, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(swap_id) DO UPDATE SET
                kind = excluded.kind,
                step = excluded.step,
                version = excluded.version,
                state = excluded.state,
                updated_at = excluded.updated_at
             WHERE excluded.version > flows.version",
            params![
                record.swap_id.to_string(),
                record.kind.to_string(),
                record.state.step as i64,
                record.state.version as i64,
                state_json,
                record.updated_at.timestamp(),
            ],
        )?;

        if changed == 0 {
            return Err(SwapError::StaleState {
                swap_id: record.swap_id,
                version: record.state.version,
            });
        }

        Ok(())
    }

    async fn list(&self) -> Result<Vec<FlowRecord>> {
        let conn = self.storage.get_connection().await;

        let mut stmt = conn.prepare(
            "SELECT swap_id, kind, state, updated_at FROM flows ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map([], Self::record_from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(Self::decode(row?)?);
        }

        Ok(records)
    }

    async fn remove(&self, swap_id: Uuid) -> Result<()> {
        let conn = self.storage.get_connection().await;
        conn.execute(
            "DELETE FROM flows WHERE swap_id = ?1",
            params![swap_id.to_string()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(swap_id: Uuid, version: u64) -> FlowRecord {
        let state = FlowState {
            step: 3,
            version,
            is_participant_signed: true,
            ..FlowState::default()
        };
        FlowRecord::new(swap_id, FlowKind::Owner, state)
    }

    #[tokio::test]
    async fn test_save_and_reload_survives_reopen() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("swaps.db");
        let swap_id = Uuid::new_v4();

        {
            let storage = Arc::new(Storage::new(&db_path).await.unwrap());
            let store = SqliteFlowStore::new(storage);
            store.save(&record(swap_id, 1)).await.unwrap();
        }

        let storage = Arc::new(Storage::new(&db_path).await.unwrap());
        let store = SqliteFlowStore::new(storage);
        let loaded = store.load(swap_id).await.unwrap().unwrap();
        assert_eq!(loaded.kind, FlowKind::Owner);
        assert_eq!(loaded.state.step, 3);
        assert!(loaded.state.is_participant_signed);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let storage = Arc::new(Storage::in_memory().await.unwrap());
        let store = SqliteFlowStore::new(storage);
        let swap_id = Uuid::new_v4();

        store.save(&record(swap_id, 1)).await.unwrap();
        store.save(&record(swap_id, 2)).await.unwrap();

        let err = store.save(&record(swap_id, 2)).await.unwrap_err();
        assert!(matches!(err, SwapError::StaleState { version: 2, .. }));
    }

    #[tokio::test]
    async fn test_remove() {
        let storage = Arc::new(Storage::in_memory().await.unwrap());
        let store = SqliteFlowStore::new(storage);
        let swap_id = Uuid::new_v4();

        store.save(&record(swap_id, 1)).await.unwrap();
        store.remove(swap_id).await.unwrap();
        assert!(store.load(swap_id).await.unwrap().is_none());
    }
}
