pub mod memory;

pub use memory::MemoryLedger;

use crate::secret::Secret;
use crate::types::{ScriptAddress, ScriptExpectation, ScriptValues, TxHash};
use async_trait::async_trait;
use bitcoin::Amount;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerErrorKind {
    /// The transaction is already in the mempool or chain.
    KnownTransaction,
    /// Execution ran out of gas, usually a wrong secret on an account chain.
    OutOfGas,
    /// The ledger refused the transaction (lock time not reached, spent, ...).
    Rejected,
    NotFound,
    Connection,
    Other,
}

impl LedgerErrorKind {
    /// Map raw node error text to a kind. Meant for adapters wrapping a node
    /// client, so the flows never have to look at message text.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("known transaction") || lower.contains("already known") {
            Self::KnownTransaction
        } else if lower.contains("out of gas") {
            Self::OutOfGas
        } else if lower.contains("not found") {
            Self::NotFound
        } else if lower.contains("connection") || lower.contains("timed out") {
            Self::Connection
        } else {
            Self::Other
        }
    }

    /// Kinds a flow logs and waits out instead of halting on.
    pub fn is_tolerated(&self) -> bool {
        matches!(self, Self::KnownTransaction | Self::OutOfGas)
    }
}

impl fmt::Display for LedgerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::KnownTransaction => "known transaction",
            Self::OutOfGas => "out of gas",
            Self::Rejected => "rejected",
            Self::NotFound => "not found",
            Self::Connection => "connection",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct LedgerError {
    pub kind: LedgerErrorKind,
    pub message: String,
}

impl LedgerError {
    pub fn new(kind: LedgerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: LedgerErrorKind::classify(&message),
            message,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(LedgerErrorKind::Rejected, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(LedgerErrorKind::NotFound, message)
    }
}

/// Wallet operations on one chain, as consumed by the swap flows.
///
/// Implementations own key material and transaction building; the flows only
/// hand over script parameters, amounts and secrets.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Build, sign and broadcast a transaction funding the HTLC described by `values`.
    async fn fund_script(&self, values: &ScriptValues, amount: Amount) -> LedgerResult<TxHash>;

    /// Spend the HTLC to its recipient by revealing `secret`.
    async fn withdraw(&self, values: &ScriptValues, secret: &Secret) -> LedgerResult<TxHash>;

    /// Spend the HTLC back to its owner after the lock time.
    async fn refund(&self, values: &ScriptValues, secret: Option<&Secret>) -> LedgerResult<TxHash>;

    /// Signed refund transaction, hex encoded, for broadcasting out of band.
    async fn refund_tx_hex(
        &self,
        values: &ScriptValues,
        secret: Option<&Secret>,
    ) -> LedgerResult<String>;

    /// Confirmed balance held at `address`.
    async fn get_balance(&self, address: &str) -> LedgerResult<Amount>;

    /// Fresh balance of a wallet address, bypassing any cache.
    async fn fetch_balance(&self, address: &str) -> LedgerResult<Amount>;

    /// `None` when the open swap funded by `owner_address` towards
    /// `participant_address` holds exactly `expected`, otherwise a
    /// description of the mismatch.
    async fn check_balance(
        &self,
        owner_address: &str,
        participant_address: &str,
        expected: Amount,
    ) -> LedgerResult<Option<String>>;

    /// `None` when the script matches `expected`, otherwise a description of
    /// the mismatch.
    async fn check_script(
        &self,
        values: &ScriptValues,
        expected: &ScriptExpectation,
    ) -> LedgerResult<Option<String>>;

    fn create_script(&self, values: &ScriptValues) -> LedgerResult<ScriptAddress>;

    /// Secret revealed by a withdrawal transaction, if it is one.
    async fn get_secret_from_tx_hash(&self, tx_hash: &TxHash) -> LedgerResult<Option<Secret>>;

    /// Whether the ledger knows `tx_hash`.
    async fn check_tx(&self, tx_hash: &TxHash) -> LedgerResult<bool>;

    /// Whether a swap between these two addresses is still open on this ledger.
    async fn swap_exists(
        &self,
        owner_address: &str,
        participant_address: &str,
    ) -> LedgerResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_error_text() {
        assert_eq!(
            LedgerErrorKind::classify("Returned error: known transaction: 0xabc"),
            LedgerErrorKind::KnownTransaction
        );
        assert_eq!(
            LedgerErrorKind::classify("Transaction ran OUT OF GAS"),
            LedgerErrorKind::OutOfGas
        );
        assert_eq!(
            LedgerErrorKind::classify("insufficient funds"),
            LedgerErrorKind::Other
        );
        assert!(LedgerErrorKind::KnownTransaction.is_tolerated());
        assert!(!LedgerErrorKind::Rejected.is_tolerated());
    }

    #[test]
    fn test_from_message_keeps_text() {
        let err = LedgerError::from_message("out of gas");
        assert_eq!(err.kind, LedgerErrorKind::OutOfGas);
        assert_eq!(err.to_string(), "out of gas: out of gas");
    }
}
