//! Two parties, two simulated chains and a local room, for flow tests.

use super::{FlowConfig, OwnerFlow, ParticipantFlow, SwapContext};
use crate::ledger::MemoryLedger;
use crate::room::{LocalRoom, Room};
use crate::storage::{FlowStore, MemoryFlowStore};
use crate::types::{ChainAccount, PartyKeys};
use bitcoin::Amount;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub(crate) struct Fixture {
    pub swap_id: Uuid,
    /// Owner side: UTXO locked.
    pub sell: Amount,
    /// Owner side: account units bought.
    pub buy: Amount,
    /// Alice's wallet on the UTXO chain.
    pub utxo_chain: MemoryLedger,
    /// Alice's wallet on the account chain.
    pub account_chain: MemoryLedger,
    pub owner_room: Arc<LocalRoom>,
    pub participant_room: Arc<LocalRoom>,
    pub owner_store: Arc<MemoryFlowStore>,
    pub participant_store: Arc<MemoryFlowStore>,
    pub config: FlowConfig,
}

impl Fixture {
    /// 1.5 BTC against 1_000_000 account units, both parties funded.
    pub fn new() -> Self {
        let fixture =
            Self::with_amounts(Amount::from_sat(150_000_000), Amount::from_sat(1_000_000));
        fixture
            .utxo_chain
            .deposit("alice-btc", Amount::from_sat(200_000_000));
        fixture
            .account_chain
            .deposit("bob-point", Amount::from_sat(2_000_000));
        fixture
    }

    /// Nobody funded.
    pub fn with_amounts(sell: Amount, buy: Amount) -> Self {
        let alice = Self::alice();
        let (owner_room, participant_room) = LocalRoom::pair();

        Self {
            swap_id: Uuid::new_v4(),
            sell,
            buy,
            utxo_chain: MemoryLedger::new(alice.utxo.address, alice.utxo.public_key),
            account_chain: MemoryLedger::new(alice.account.address, alice.account.public_key),
            owner_room: Arc::new(owner_room),
            participant_room: Arc::new(participant_room),
            owner_store: Arc::new(MemoryFlowStore::new()),
            participant_store: Arc::new(MemoryFlowStore::new()),
            config: FlowConfig {
                poll_interval: Duration::from_millis(10),
                ..FlowConfig::default()
            },
        }
    }

    pub fn alice() -> PartyKeys {
        PartyKeys {
            utxo: ChainAccount::new("alice-btc", "alice-btc-pk"),
            account: ChainAccount::new("alice-point", "alice-point-pk"),
        }
    }

    pub fn bob() -> PartyKeys {
        PartyKeys {
            utxo: ChainAccount::new("bob-btc", "bob-btc-pk"),
            account: ChainAccount::new("bob-point", "bob-point-pk"),
        }
    }

    pub fn participant_sell(&self) -> Amount {
        self.buy
    }

    pub fn bob_utxo(&self) -> MemoryLedger {
        self.utxo_chain.wallet("bob-btc", "bob-btc-pk")
    }

    pub fn bob_account(&self) -> MemoryLedger {
        self.account_chain.wallet("bob-point", "bob-point-pk")
    }

    pub fn owner_context(&self) -> SwapContext {
        SwapContext::builder(self.swap_id)
            .amounts(self.sell, self.buy)
            .local(Self::alice())
            .counterparty(Self::bob())
            .utxo_ledger(Arc::new(self.utxo_chain.clone()))
            .account_ledger(Arc::new(self.account_chain.clone()))
            .build()
            .unwrap()
    }

    pub fn participant_context(&self) -> SwapContext {
        SwapContext::builder(self.swap_id)
            .amounts(self.buy, self.sell)
            .local(Self::bob())
            .counterparty(Self::alice())
            .utxo_ledger(Arc::new(self.bob_utxo()))
            .account_ledger(Arc::new(self.bob_account()))
            .build()
            .unwrap()
    }

    pub async fn open_owner(&self) -> Arc<OwnerFlow> {
        let room: Arc<dyn Room> = self.owner_room.clone();
        let store: Arc<dyn FlowStore> = self.owner_store.clone();
        OwnerFlow::open(self.owner_context(), room, store, self.config.clone())
            .await
            .unwrap()
    }

    pub async fn open_participant(&self) -> Arc<ParticipantFlow> {
        let room: Arc<dyn Room> = self.participant_room.clone();
        let store: Arc<dyn FlowStore> = self.participant_store.clone();
        ParticipantFlow::open(self.participant_context(), room, store, self.config.clone())
            .await
            .unwrap()
    }
}

/// Resolve once `engine` has reached `step` or moved past it; panics after
/// five seconds.
pub(crate) async fn wait_for_step(engine: &super::StepEngine, step: super::Step) {
    let target = engine.kind().index_of(step).unwrap();
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while engine.step_index() < target {
            engine.wait_step_change(engine.step_index()).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "step {} not reached in time", step);
}
