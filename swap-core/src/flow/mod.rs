//! Swap flows: a shared step engine driving one of two step tables.

pub mod config;
pub mod context;
pub mod engine;
pub mod events;
pub mod owner;
pub mod participant;
pub mod state;
pub mod step;
#[cfg(test)]
pub(crate) mod testing;

pub use config::FlowConfig;
pub use context::{SwapContext, SwapContextBuilder};
pub use engine::{FinishOptions, StepEngine};
pub use events::FlowEvent;
pub use owner::OwnerFlow;
pub use participant::ParticipantFlow;
pub use state::{FlowRecord, FlowState};
pub use step::{FlowKind, Step};

use crate::error::{Result, SwapError};
use crate::ledger::{Ledger, LedgerError};
use crate::types::{ScriptValues, TxHash};
use async_trait::async_trait;
use bitcoin::Amount;
use std::sync::Arc;
use uuid::Uuid;

/// Result of one [`SwapFlow::advance`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step pointer moved.
    Advanced,
    /// The step returned without completing; something external (a caller
    /// action, a retry) has to happen first.
    Pending,
    /// The flow is on its terminal step.
    Terminal,
}

/// Behaviour shared by both flow variants. A variant supplies its step
/// table (through its [`FlowKind`]) and one async function per step; the
/// driving logic lives here.
#[async_trait]
pub trait SwapFlow: Send + Sync {
    fn engine(&self) -> &StepEngine;

    /// Execute the body of `step`. Returning without finishing the step
    /// leaves the flow pending on it.
    async fn run_step(&self, step: Step) -> Result<()>;

    /// Re-register the room listeners implied by the persisted state. Done
    /// once when a flow is opened; safe to repeat after a reconnect.
    async fn restore_responders(&self) -> Result<()>;

    fn kind(&self) -> FlowKind {
        self.engine().kind()
    }

    fn swap_id(&self) -> Uuid {
        self.engine().swap_id()
    }

    async fn state(&self) -> FlowState {
        self.engine().state().await
    }

    /// Run the step the pointer is on.
    ///
    /// If the step is completed from elsewhere while its body is still
    /// waiting (a manual withdrawal, a racing completion), the body is
    /// dropped at its next await point. Abandoning the flow stops it the
    /// same way, with [`SwapError::Abandoned`].
    async fn advance(&self) -> Result<StepOutcome> {
        let engine = self.engine();
        let _running = engine.lock_step().await;
        if engine.is_closed() {
            return Err(SwapError::Abandoned(engine.swap_id()));
        }

        let index = engine.step_index();
        let step = engine.kind().step_at(index);
        if step.is_terminal() {
            return Ok(StepOutcome::Terminal);
        }
        if step == Step::Start {
            engine
                .finish_step(Step::Start, FinishOptions::SILENT, |_| {})
                .await?;
            return Ok(StepOutcome::Advanced);
        }

        tracing::debug!("Swap {} running step {} ({})", engine.swap_id(), index, step);
        tokio::select! {
            result = self.run_step(step) => result?,
            _ = engine.wait_step_change(index) => {}
            _ = engine.wait_closed() => return Err(SwapError::Abandoned(engine.swap_id())),
        }

        if engine.step_index() != index {
            Ok(StepOutcome::Advanced)
        } else {
            Ok(StepOutcome::Pending)
        }
    }

    /// Drive the flow until the terminal step. Pending steps wait for the
    /// pointer to be moved by a caller action, so this only returns at the
    /// end or on a fault; state stays resumable either way. An abandoned
    /// flow stops with [`SwapError::Abandoned`].
    async fn run(&self) -> Result<()> {
        let engine = self.engine();
        loop {
            let index = engine.step_index();
            match self.advance().await? {
                StepOutcome::Terminal => return Ok(()),
                StepOutcome::Advanced => continue,
                StepOutcome::Pending => {
                    tokio::select! {
                        _ = engine.wait_step_change(index) => {}
                        _ = engine.wait_closed() => {}
                    }
                }
            }
        }
    }
}

/// Either flow variant, for code that handles swaps generically.
#[derive(Clone)]
pub enum AnyFlow {
    Owner(Arc<OwnerFlow>),
    Participant(Arc<ParticipantFlow>),
}

impl AnyFlow {
    pub fn as_flow(&self) -> &dyn SwapFlow {
        match self {
            AnyFlow::Owner(flow) => flow.as_ref(),
            AnyFlow::Participant(flow) => flow.as_ref(),
        }
    }

    pub fn kind(&self) -> FlowKind {
        self.as_flow().kind()
    }

    pub fn swap_id(&self) -> Uuid {
        self.as_flow().swap_id()
    }

    pub async fn state(&self) -> FlowState {
        self.as_flow().state().await
    }

    pub async fn run(&self) -> Result<()> {
        self.as_flow().run().await
    }

    pub async fn try_refund(&self) -> Result<TxHash> {
        match self {
            AnyFlow::Owner(flow) => flow.try_refund().await,
            AnyFlow::Participant(flow) => flow.try_refund().await,
        }
    }

    pub async fn is_refund_success(&self) -> Result<bool> {
        match self {
            AnyFlow::Owner(flow) => flow.is_refund_success().await,
            AnyFlow::Participant(flow) => flow.is_refund_success().await,
        }
    }

    pub async fn abandon(&self) -> Result<()> {
        match self {
            AnyFlow::Owner(flow) => flow.abandon().await,
            AnyFlow::Participant(flow) => flow.abandon().await,
        }
    }
}

/// Fetch the seller's balance and finish `SyncBalance` when it covers
/// `required`; otherwise record the shortfall and stay on the step.
pub(crate) async fn sync_balance(
    engine: &StepEngine,
    ledger: &dyn Ledger,
    address: &str,
    required: Amount,
) -> Result<bool> {
    engine.set_state(|s| s.is_balance_fetching = true).await?;

    let balance = match ledger.fetch_balance(address).await {
        Ok(balance) => balance,
        Err(e) => {
            engine.set_state(|s| s.is_balance_fetching = false).await?;
            return Err(e.into());
        }
    };

    if required <= balance {
        engine
            .finish_step(Step::SyncBalance, FinishOptions::SILENT, |s| {
                s.balance = Some(balance);
                s.is_balance_fetching = false;
                s.is_balance_enough = true;
            })
            .await?;
        Ok(true)
    } else {
        tracing::warn!("Not enough money: {} < {}", balance, required);
        engine
            .set_state(|s| {
                s.balance = Some(balance);
                s.is_balance_fetching = false;
                s.is_balance_enough = false;
            })
            .await?;
        engine.emit(FlowEvent::InsufficientBalance { balance, required });
        Ok(false)
    }
}

/// `tx` if it was recorded and the ledger still knows it.
pub(crate) async fn known_tx(ledger: &dyn Ledger, tx: Option<TxHash>) -> Result<Option<TxHash>> {
    let Some(tx) = tx else {
        return Ok(None);
    };
    if ledger.check_tx(&tx).await? {
        Ok(Some(tx))
    } else {
        tracing::warn!("Recorded tx {} is unknown to the ledger", tx);
        Ok(None)
    }
}

/// What a lock step found or did when asked to fund its script.
pub(crate) enum Lock {
    /// Funded by this transaction, fresh or recorded earlier.
    Funded(TxHash),
    /// The script already holds the amount but its funding transaction was
    /// never recorded, e.g. after a crash right behind the broadcast.
    Found,
    /// A tolerated ledger failure; the step stays pending.
    Retry,
}

/// Fund the script described by `values` with `amount`, at most once.
///
/// `recorded` is the funding tx persisted by an earlier pass. When the values
/// themselves come from an earlier pass (`resumed`), the script address is
/// checked before anything is broadcast. A fresh tx is persisted through
/// `record` before it is returned.
pub(crate) async fn fund_lock(
    engine: &StepEngine,
    ledger: &dyn Ledger,
    values: &ScriptValues,
    amount: Amount,
    recorded: Option<TxHash>,
    resumed: bool,
    record: fn(&mut FlowState, TxHash),
) -> Result<Lock> {
    if let Some(tx) = known_tx(ledger, recorded).await? {
        return Ok(Lock::Funded(tx));
    }

    if resumed {
        let address = ledger.create_script(values)?.address;
        let balance = ledger.get_balance(&address).await?;
        if balance >= amount {
            tracing::warn!(
                "Swap {}: script {} already holds {}, not funding it again",
                engine.swap_id(),
                address,
                balance
            );
            return Ok(Lock::Found);
        }
    }

    match ledger.fund_script(values, amount).await {
        Ok(tx) => {
            let persisted = tx.clone();
            engine.set_state(move |s| record(s, persisted)).await?;
            Ok(Lock::Funded(tx))
        }
        Err(e) => {
            tolerate(engine, e, "Fund script")?;
            Ok(Lock::Retry)
        }
    }
}

/// Swallow the ledger failures a step waits out (already-known transaction,
/// out of gas) and pass everything else on.
pub(crate) fn tolerate(engine: &StepEngine, err: LedgerError, action: &str) -> Result<()> {
    if !err.kind.is_tolerated() {
        tracing::error!("Swap {}: {} failed: {}", engine.swap_id(), action, err);
        return Err(err.into());
    }

    match err.kind {
        crate::ledger::LedgerErrorKind::OutOfGas => {
            tracing::error!("{}: tx failed (wrong secret?): {}", action, err.message)
        }
        _ => tracing::warn!("{}: known tx: {}", action, err.message),
    }
    engine.emit(FlowEvent::LedgerSoftFailure {
        kind: err.kind,
        message: err.message,
    });
    Ok(())
}
