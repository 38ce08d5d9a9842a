pub mod flow_store;
pub mod memory;

pub use flow_store::SqliteFlowStore;
pub use memory::MemoryFlowStore;

use crate::error::{Result, SwapError};
use crate::flow::FlowRecord;
use async_trait::async_trait;
use rusqlite::Connection;
use std::path::Path;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Durable home of flow records, one per swap.
///
/// `save` must be atomic and must refuse a record whose `state.version` is
/// not newer than the stored one.
#[async_trait]
pub trait FlowStore: Send + Sync {
    async fn load(&self, swap_id: Uuid) -> Result<Option<FlowRecord>>;
    async fn save(&self, record: &FlowRecord) -> Result<()>;
    async fn list(&self) -> Result<Vec<FlowRecord>>;
    async fn remove(&self, swap_id: Uuid) -> Result<()>;
}

pub struct Storage {
    conn: Mutex<Connection>,
}

impl Storage {
    pub async fn new(db_path: &Path) -> Result<Self> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SwapError::internal(format!("Failed to create directory: {}", e)))?;
        }

        let conn = Connection::open(db_path)?;
        Self::with_connection(conn).await
    }

    pub async fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?).await
    }

    async fn with_connection(conn: Connection) -> Result<Self> {
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema().await?;
        Ok(storage)
    }

    async fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().await;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS flows (
                swap_id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                step INTEGER NOT NULL,
                version INTEGER NOT NULL,
                state TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    pub async fn get_connection(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}
