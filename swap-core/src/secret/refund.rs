//! Refund of a party's own lock after its lock time, and the restart that
//! may follow it.

use crate::error::{Result, SwapError};
use crate::flow::{FlowEvent, FlowState, Step, StepEngine};
use crate::ledger::{Ledger, LedgerErrorKind};
use crate::types::{Leg, ScriptValues, TxHash};
use bitcoin::Amount;

fn own_values(state: &FlowState, leg: Leg) -> Result<ScriptValues> {
    let values = match leg {
        Leg::Utxo => state.utxo_script_values.clone(),
        Leg::Account => state.account_script_values.clone(),
    };
    values.ok_or(SwapError::MissingScriptValues(leg))
}

/// Spend the party's own lock on `leg` back to itself.
///
/// Lock time is enforced by the ledger; a refund it rejects is reported as
/// [`SwapError::RefundNotAvailable`].
pub async fn try_refund(engine: &StepEngine, ledger: &dyn Ledger, leg: Leg) -> Result<TxHash> {
    let state = engine.state().await;
    let values = own_values(&state, leg)?;

    let address = ledger.create_script(&values)?.address;
    if ledger.get_balance(&address).await? == Amount::ZERO {
        return Err(SwapError::NothingToRefund { address });
    }

    let tx = match ledger.refund(&values, state.secret.as_ref()).await {
        Ok(tx) => tx,
        Err(e) if e.kind == LedgerErrorKind::Rejected => {
            tracing::warn!("Refund of {} lock rejected: {}", leg, e.message);
            return Err(SwapError::RefundNotAvailable {
                unlocks_at: values.lock_time,
            });
        }
        Err(e) => return Err(e.into()),
    };
    tracing::info!("Swap {} refunded {} lock: {}", engine.swap_id(), leg, tx);

    let recorded = tx.clone();
    engine
        .set_state(move |s| {
            s.refund_tx = Some(recorded);
            s.is_refunded = true;
            s.is_swap_exist = false;
            match leg {
                Leg::Utxo => {
                    s.utxo_funding_tx = None;
                    s.is_utxo_script_funded = false;
                }
                Leg::Account => {
                    s.account_funding_tx = None;
                    s.is_account_script_funded = false;
                }
            }
        })
        .await?;

    engine.emit(FlowEvent::Refunded { tx: tx.clone() });
    Ok(tx)
}

/// Whether the recorded refund is known to the ledger. A refund the ledger
/// has lost is forgotten so it can be attempted again.
pub async fn is_refund_success(engine: &StepEngine, ledger: &dyn Ledger) -> Result<bool> {
    let Some(tx) = engine.state().await.refund_tx else {
        return Ok(false);
    };

    let found = match ledger.check_tx(&tx).await {
        Ok(found) => found,
        Err(e) if e.kind == LedgerErrorKind::NotFound => false,
        Err(e) => return Err(e.into()),
    };
    if found {
        return Ok(true);
    }

    tracing::warn!("Refund tx {} not found, clearing it", tx);
    engine
        .set_state(|s| {
            s.refund_tx = None;
            s.is_refunded = false;
        })
        .await?;
    Ok(false)
}

/// Produce the signed refund transaction for `leg` without broadcasting it.
pub async fn refund_tx_hex(engine: &StepEngine, ledger: &dyn Ledger, leg: Leg) -> Result<String> {
    let state = engine.state().await;
    let values = own_values(&state, leg)?;

    let hex = ledger.refund_tx_hex(&values, state.secret.as_ref()).await?;
    let recorded = hex.clone();
    engine.set_state(move |s| s.refund_tx_hex = Some(recorded)).await?;
    Ok(hex)
}

/// Start the flow over from `Sign` once a refund went through. Everything
/// but the open-swap marker is reset.
pub async fn restart_after_refund(engine: &StepEngine) -> Result<()> {
    if !engine.state().await.is_refunded {
        return Err(SwapError::NoRefundRecorded);
    }

    engine
        .reset_to(Step::Sign, |old| FlowState {
            is_swap_exist: old.is_swap_exist,
            ..FlowState::default()
        })
        .await?;
    Ok(())
}
