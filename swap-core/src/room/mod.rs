//! The two-party message channel of a swap.

pub mod local;

pub use local::LocalRoom;

use crate::error::Result;
use crate::types::{ScriptValues, TxHash};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Protocol messages. Wire names are shared with the counterparty and must
/// not change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum RoomEvent {
    #[serde(rename = "request sign")]
    RequestSign,
    #[serde(rename = "swap sign")]
    SwapSign,
    #[serde(rename = "swap exists")]
    SwapExists,
    #[serde(rename = "refund completed")]
    RefundCompleted,
    #[serde(rename = "request btc script")]
    RequestUtxoScript,
    #[serde(rename = "create btc script", rename_all = "camelCase")]
    CreateUtxoScript {
        script_values: ScriptValues,
        #[serde(rename = "btcScriptCreatingTransactionHash")]
        funding_tx: Option<TxHash>,
    },
    #[serde(rename = "request point script")]
    RequestAccountScript,
    #[serde(rename = "create point script", rename_all = "camelCase")]
    CreateAccountScript {
        script_values: ScriptValues,
        #[serde(rename = "pointSwapCreationTransactionHash")]
        funding_tx: Option<TxHash>,
    },
    #[serde(rename = "request pointWithdrawTxHash")]
    RequestWithdrawTxHash,
    #[serde(rename = "pointWithdrawTxHash", rename_all = "camelCase")]
    WithdrawTxHash {
        script_values: Option<ScriptValues>,
        #[serde(rename = "pointSwapWithdrawTransactionHash")]
        withdraw_tx: TxHash,
    },
    #[serde(rename = "finish point withdraw")]
    FinishAccountWithdraw,
    #[serde(rename = "swap finished")]
    SwapFinished,
}

/// Payload-free discriminant of a [`RoomEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    RequestSign,
    SwapSign,
    SwapExists,
    RefundCompleted,
    RequestUtxoScript,
    CreateUtxoScript,
    RequestAccountScript,
    CreateAccountScript,
    RequestWithdrawTxHash,
    WithdrawTxHash,
    FinishAccountWithdraw,
    SwapFinished,
}

impl RoomEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            RoomEvent::RequestSign => EventKind::RequestSign,
            RoomEvent::SwapSign => EventKind::SwapSign,
            RoomEvent::SwapExists => EventKind::SwapExists,
            RoomEvent::RefundCompleted => EventKind::RefundCompleted,
            RoomEvent::RequestUtxoScript => EventKind::RequestUtxoScript,
            RoomEvent::CreateUtxoScript { .. } => EventKind::CreateUtxoScript,
            RoomEvent::RequestAccountScript => EventKind::RequestAccountScript,
            RoomEvent::CreateAccountScript { .. } => EventKind::CreateAccountScript,
            RoomEvent::RequestWithdrawTxHash => EventKind::RequestWithdrawTxHash,
            RoomEvent::WithdrawTxHash { .. } => EventKind::WithdrawTxHash,
            RoomEvent::FinishAccountWithdraw => EventKind::FinishAccountWithdraw,
            RoomEvent::SwapFinished => EventKind::SwapFinished,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::RequestSign => "request sign",
            EventKind::SwapSign => "swap sign",
            EventKind::SwapExists => "swap exists",
            EventKind::RefundCompleted => "refund completed",
            EventKind::RequestUtxoScript => "request btc script",
            EventKind::CreateUtxoScript => "create btc script",
            EventKind::RequestAccountScript => "request point script",
            EventKind::CreateAccountScript => "create point script",
            EventKind::RequestWithdrawTxHash => "request pointWithdrawTxHash",
            EventKind::WithdrawTxHash => "pointWithdrawTxHash",
            EventKind::FinishAccountWithdraw => "finish point withdraw",
            EventKind::SwapFinished => "swap finished",
        };
        f.write_str(name)
    }
}

/// Message channel between exactly the two parties of one swap.
///
/// Delivery is at-least-once at best; only messages sent after a
/// subscription is taken are seen by it.
#[async_trait]
pub trait Room: Send + Sync {
    async fn send(&self, event: RoomEvent) -> Result<()>;

    fn subscribe(&self) -> RoomSubscription;
}

/// Stream of incoming counterparty messages.
pub struct RoomSubscription {
    rx: broadcast::Receiver<RoomEvent>,
}

impl RoomSubscription {
    pub fn new(rx: broadcast::Receiver<RoomEvent>) -> Self {
        Self { rx }
    }

    /// Next message, or `None` once the room is closed. Cancel safe.
    pub async fn next(&mut self) -> Option<RoomEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Room subscription lagged, {} messages skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next message of `kind`, skipping everything else.
    pub async fn next_of(&mut self, kind: EventKind) -> Option<RoomEvent> {
        while let Some(event) = self.next().await {
            if event.kind() == kind {
                return Some(event);
            }
        }
        None
    }
}

/// Repeating responders: each answers every `trigger` message with a fixed
/// reply for as long as it is registered.
#[derive(Default)]
pub struct Responders {
    handles: Mutex<HashMap<EventKind, JoinHandle<()>>>,
}

impl Responders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the responder for `trigger`.
    pub fn respond(&self, room: Arc<dyn Room>, trigger: EventKind, reply: RoomEvent) {
        let mut subscription = room.subscribe();
        let handle = tokio::spawn(async move {
            while let Some(event) = subscription.next_of(trigger).await {
                tracing::debug!("Answering '{}' with '{}'", event.kind(), reply.kind());
                if let Err(e) = room.send(reply.clone()).await {
                    tracing::warn!("Failed to answer '{}': {}", trigger, e);
                }
            }
        });

        self.track(trigger, handle);
    }

    /// Keep a listener task spawned elsewhere under `trigger`, aborting
    /// whatever was registered there before.
    pub fn track(&self, trigger: EventKind, handle: JoinHandle<()>) {
        if let Some(previous) = self.handles.lock().insert(trigger, handle) {
            previous.abort();
        }
    }

    pub fn clear(&self) {
        for (_, handle) in self.handles.lock().drain() {
            handle.abort();
        }
    }
}

impl Drop for Responders {
    fn drop(&mut self) {
        self.clear();
    }
}
