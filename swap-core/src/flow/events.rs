use super::Step;
use crate::ledger::LedgerErrorKind;
use crate::types::TxHash;
use bitcoin::Amount;
use serde::Serialize;

/// Things a UI or caller may want to react to while a flow runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEvent {
    StepChanged { index: usize, step: Step },
    InsufficientBalance { balance: Amount, required: Amount },
    BalanceCheckFailed { reason: String },
    ScriptCheckFailed { reason: String },
    SecretMismatch,
    LedgerSoftFailure { kind: LedgerErrorKind, message: String },
    Refunded { tx: TxHash },
}
