use crate::flow::{FlowKind, Step};
use crate::ledger::LedgerError;
use crate::types::Leg;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, SwapError>;

#[derive(Error, Debug)]
pub enum SwapError {
    #[error("Missing required collaborator: {0}")]
    MissingCollaborator(&'static str),

    #[error("Cannot proceed: participant not signed. step={step}")]
    ParticipantNotSigned { step: usize },

    #[error("No script values recorded for the {0} leg")]
    MissingScriptValues(Leg),

    #[error("Secret is not known yet")]
    MissingSecret,

    #[error("Secret hash is not known yet")]
    MissingSecretHash,

    #[error("Can't finish step {requested} while on step {current}")]
    StepMismatch { requested: Step, current: Step },

    #[error("Secret does not match the committed hash")]
    SecretMismatch,

    #[error("Invalid secret: {0}")]
    InvalidSecret(String),

    #[error("Already withdrawn: address={address}")]
    AlreadyWithdrawn { address: String },

    #[error("Refund not available before {unlocks_at}")]
    RefundNotAvailable { unlocks_at: i64 },

    #[error("Nothing to refund at {address}")]
    NothingToRefund { address: String },

    #[error("No refund has been recorded")]
    NoRefundRecorded,

    #[error("Swap {swap_id} is persisted as {stored} flow, not {requested}")]
    FlowKindMismatch {
        swap_id: Uuid,
        stored: FlowKind,
        requested: FlowKind,
    },

    #[error("Swap not found: {0}")]
    SwapNotFound(Uuid),

    #[error("Swap {0} was abandoned")]
    Abandoned(Uuid),

    #[error("Stale state for swap {swap_id}: version {version} already superseded")]
    StaleState { swap_id: Uuid, version: u64 },

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Room error: {0}")]
    Room(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SwapError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn room(msg: impl Into<String>) -> Self {
        Self::Room(msg.into())
    }

    /// Faults that mean the swap cannot continue as requested, as opposed to
    /// infrastructure failures that are worth retrying.
    pub fn is_protocol_fault(&self) -> bool {
        matches!(
            self,
            Self::MissingCollaborator(_)
                | Self::ParticipantNotSigned { .. }
                | Self::MissingScriptValues(_)
                | Self::MissingSecret
                | Self::MissingSecretHash
                | Self::StepMismatch { .. }
                | Self::SecretMismatch
        )
    }
}
