use super::FlowKind;
use crate::secret::{Secret, SecretHash};
use crate::types::{ScriptValues, TxHash};
use bitcoin::Amount;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Mutable record of one running flow.
///
/// Transaction hashes are the source of truth for each leg; the `is_*`
/// flags next to them are set only once the flow has acted on that
/// transaction. Only [`StepEngine`](super::StepEngine) mutates this.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowState {
    pub step: usize,
    /// Bumped on every persisted mutation.
    pub version: u64,

    pub is_sign_fetching: bool,
    /// Owner side: the participant acknowledged the swap.
    pub is_participant_signed: bool,
    /// Participant side: we acknowledged the swap.
    pub is_me_signed: bool,

    pub secret: Option<Secret>,
    pub secret_hash: Option<SecretHash>,
    pub utxo_script_values: Option<ScriptValues>,
    pub utxo_script_verified: bool,
    pub account_script_values: Option<ScriptValues>,

    pub is_balance_fetching: bool,
    pub is_balance_enough: bool,
    pub balance: Option<Amount>,

    pub utxo_funding_tx: Option<TxHash>,
    pub is_utxo_script_funded: bool,
    pub account_funding_tx: Option<TxHash>,
    pub is_account_script_funded: bool,

    pub account_withdraw_tx: Option<TxHash>,
    pub is_account_withdrawn: bool,
    pub utxo_withdraw_tx: Option<TxHash>,
    pub is_utxo_withdrawn: bool,

    pub refund_tx: Option<TxHash>,
    pub is_refunded: bool,
    pub refund_tx_hex: Option<String>,

    pub is_finished: bool,
    /// The counterparty still has a swap open from an earlier session.
    pub is_swap_exist: bool,
}

/// What the store keeps per swap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub swap_id: Uuid,
    pub kind: FlowKind,
    pub state: FlowState,
    pub updated_at: DateTime<Utc>,
}

impl FlowRecord {
    pub fn new(swap_id: Uuid, kind: FlowKind, state: FlowState) -> Self {
        Self {
            swap_id,
            kind,
            state,
            updated_at: Utc::now(),
        }
    }

    pub fn current_step(&self) -> super::Step {
        self.kind.step_at(self.state.step)
    }
}
