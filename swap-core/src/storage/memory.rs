use super::FlowStore;
use crate::error::{Result, SwapError};
use crate::flow::FlowRecord;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

/// Non-durable store; records live as long as the value does.
#[derive(Default)]
pub struct MemoryFlowStore {
    records: RwLock<HashMap<Uuid, FlowRecord>>,
}

impl MemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlowStore for MemoryFlowStore {
    async fn load(&self, swap_id: Uuid) -> Result<Option<FlowRecord>> {
        Ok(self.records.read().get(&swap_id).cloned())
    }

    async fn save(&self, record: &FlowRecord) -> Result<()> {
        let mut records = self.records.write();
        if let Some(existing) = records.get(&record.swap_id) {
            if existing.state.version >= record.state.version {
                return Err(SwapError::StaleState {
                    swap_id: record.swap_id,
                    version: record.state.version,
                });
            }
        }
        records.insert(record.swap_id, record.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<FlowRecord>> {
        let mut records: Vec<FlowRecord> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(records)
    }

    async fn remove(&self, swap_id: Uuid) -> Result<()> {
        self.records.write().remove(&swap_id);
        Ok(())
    }
}
