use crate::error::{Result, SwapError};
use crate::ledger::Ledger;
use crate::types::PartyKeys;
use bitcoin::Amount;
use std::sync::Arc;
use uuid::Uuid;

/// Immutable terms of one swap as seen by the local party.
///
/// `sell_amount` is what the local party locks, `buy_amount` what it
/// withdraws. Both are in the base units of their own chain.
#[derive(Clone)]
pub struct SwapContext {
    pub swap_id: Uuid,
    pub sell_amount: Amount,
    pub buy_amount: Amount,
    pub local: PartyKeys,
    pub counterparty: PartyKeys,
    pub utxo_ledger: Arc<dyn Ledger>,
    pub account_ledger: Arc<dyn Ledger>,
}

impl SwapContext {
    pub fn builder(swap_id: Uuid) -> SwapContextBuilder {
        SwapContextBuilder {
            swap_id,
            ..Default::default()
        }
    }
}

impl std::fmt::Debug for SwapContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwapContext")
            .field("swap_id", &self.swap_id)
            .field("sell_amount", &self.sell_amount)
            .field("buy_amount", &self.buy_amount)
            .field("local", &self.local)
            .field("counterparty", &self.counterparty)
            .finish()
    }
}

#[derive(Default)]
pub struct SwapContextBuilder {
    swap_id: Uuid,
    sell_amount: Option<Amount>,
    buy_amount: Option<Amount>,
    local: Option<PartyKeys>,
    counterparty: Option<PartyKeys>,
    utxo_ledger: Option<Arc<dyn Ledger>>,
    account_ledger: Option<Arc<dyn Ledger>>,
}

impl SwapContextBuilder {
    pub fn amounts(mut self, sell: Amount, buy: Amount) -> Self {
        self.sell_amount = Some(sell);
        self.buy_amount = Some(buy);
        self
    }

    pub fn local(mut self, keys: PartyKeys) -> Self {
        self.local = Some(keys);
        self
    }

    pub fn counterparty(mut self, keys: PartyKeys) -> Self {
        self.counterparty = Some(keys);
        self
    }

    pub fn utxo_ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        self.utxo_ledger = Some(ledger);
        self
    }

    pub fn account_ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        self.account_ledger = Some(ledger);
        self
    }

    pub fn build(self) -> Result<SwapContext> {
        let utxo_ledger = self
            .utxo_ledger
            .ok_or(SwapError::MissingCollaborator("utxo ledger"))?;
        let account_ledger = self
            .account_ledger
            .ok_or(SwapError::MissingCollaborator("account ledger"))?;
        let local = self
            .local
            .ok_or(SwapError::MissingCollaborator("local keys"))?;
        let counterparty = self
            .counterparty
            .ok_or(SwapError::MissingCollaborator("counterparty keys"))?;
        let (sell_amount, buy_amount) = self
            .sell_amount
            .zip(self.buy_amount)
            .ok_or_else(|| SwapError::config("Swap amounts are required"))?;

        if sell_amount == Amount::ZERO || buy_amount == Amount::ZERO {
            return Err(SwapError::config("Swap amounts must be greater than 0"));
        }

        Ok(SwapContext {
            swap_id: self.swap_id,
            sell_amount,
            buy_amount,
            local,
            counterparty,
            utxo_ledger,
            account_ledger,
        })
    }
}
