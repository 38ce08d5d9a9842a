use crate::error::{Result, SwapError};
use crate::flow::{
    AnyFlow, FlowConfig, FlowKind, FlowRecord, OwnerFlow, ParticipantFlow, SwapContext,
};
use crate::room::Room;
use crate::storage::{FlowStore, SqliteFlowStore, Storage};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// Opens, resumes and tracks the swaps persisted under one data directory.
pub struct SwapManager {
    store: Arc<dyn FlowStore>,
    config: FlowConfig,
    flows: Arc<RwLock<HashMap<Uuid, AnyFlow>>>,
}

impl SwapManager {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        Self::with_config(data_dir, FlowConfig::default()).await
    }

    pub async fn with_config(data_dir: &Path, config: FlowConfig) -> Result<Self> {
        config.validate()?;
        let db_path = data_dir.join("swaps.db");
        let storage = Arc::new(Storage::new(&db_path).await?);

        Ok(Self {
            store: Arc::new(SqliteFlowStore::new(storage)),
            config,
            flows: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    /// Open (or resume) the owner side of `context.swap_id`.
    pub async fn open_owner(
        &self,
        context: SwapContext,
        room: Arc<dyn Room>,
    ) -> Result<Arc<OwnerFlow>> {
        let swap_id = context.swap_id;
        match self.get(swap_id) {
            Some(AnyFlow::Owner(flow)) => return Ok(flow),
            Some(AnyFlow::Participant(_)) => {
                return Err(SwapError::FlowKindMismatch {
                    swap_id,
                    stored: FlowKind::Participant,
                    requested: FlowKind::Owner,
                })
            }
            None => {}
        }

        let flow = OwnerFlow::open(context, room, self.store.clone(), self.config.clone()).await?;
        {
            let mut flows = self.flows.write();
            flows.insert(swap_id, AnyFlow::Owner(flow.clone()));
        }

        tracing::info!("Opened owner flow for swap {}", swap_id);
        Ok(flow)
    }

    /// Open (or resume) the participant side of `context.swap_id`.
    pub async fn open_participant(
        &self,
        context: SwapContext,
        room: Arc<dyn Room>,
    ) -> Result<Arc<ParticipantFlow>> {
        let swap_id = context.swap_id;
        match self.get(swap_id) {
            Some(AnyFlow::Participant(flow)) => return Ok(flow),
            Some(AnyFlow::Owner(_)) => {
                return Err(SwapError::FlowKindMismatch {
                    swap_id,
                    stored: FlowKind::Owner,
                    requested: FlowKind::Participant,
                })
            }
            None => {}
        }

        let flow =
            ParticipantFlow::open(context, room, self.store.clone(), self.config.clone()).await?;
        {
            let mut flows = self.flows.write();
            flows.insert(swap_id, AnyFlow::Participant(flow.clone()));
        }

        tracing::info!("Opened participant flow for swap {}", swap_id);
        Ok(flow)
    }

    /// A flow opened by this manager.
    pub fn get(&self, swap_id: Uuid) -> Option<AnyFlow> {
        self.flows.read().get(&swap_id).cloned()
    }

    /// Every persisted swap, most recently updated first.
    pub async fn list(&self) -> Result<Vec<FlowRecord>> {
        self.store.list().await
    }

    pub async fn record(&self, swap_id: Uuid) -> Result<FlowRecord> {
        self.store
            .load(swap_id)
            .await?
            .ok_or(SwapError::SwapNotFound(swap_id))
    }

    /// Forget a swap, open or not. Funds already locked stay where they are.
    pub async fn abandon(&self, swap_id: Uuid) -> Result<()> {
        let cached = self.flows.write().remove(&swap_id);
        if let Some(flow) = cached {
            return flow.abandon().await;
        }

        if self.store.load(swap_id).await?.is_none() {
            return Err(SwapError::SwapNotFound(swap_id));
        }
        self.store.remove(swap_id).await?;
        tracing::warn!("Swap {} abandoned", swap_id);
        Ok(())
    }
}
