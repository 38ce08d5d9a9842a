use super::{
    fund_lock, known_tx, sync_balance, tolerate, FinishOptions, FlowConfig, FlowEvent, FlowKind,
    Lock, Step, StepEngine, SwapContext, SwapFlow,
};
use crate::error::{Result, SwapError};
use crate::ledger::LedgerErrorKind;
use crate::room::{EventKind, Responders, Room, RoomEvent};
use crate::secret::{check_secret, refund, Secret};
use crate::storage::FlowStore;
use crate::types::{utc_now, Leg, ScriptExpectation, ScriptValues, TxHash};
use async_trait::async_trait;
use bitcoin::Amount;
use std::sync::Arc;
use tokio::sync::broadcast;

/// The party that locks second on the account chain and learns the secret
/// from the owner's withdrawal (POINT2BTC).
pub struct ParticipantFlow {
    context: SwapContext,
    config: FlowConfig,
    room: Arc<dyn Room>,
    engine: Arc<StepEngine>,
    responders: Responders,
}

impl ParticipantFlow {
    pub async fn open(
        context: SwapContext,
        room: Arc<dyn Room>,
        store: Arc<dyn FlowStore>,
        config: FlowConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let engine = StepEngine::open(context.swap_id, FlowKind::Participant, store).await?;

        let flow = Arc::new(Self {
            context,
            config,
            room,
            engine: Arc::new(engine),
            responders: Responders::new(),
        });
        flow.restore_responders().await?;
        Ok(flow)
    }

    pub fn context(&self) -> &SwapContext {
        &self.context
    }

    pub fn events(&self) -> broadcast::Receiver<FlowEvent> {
        self.engine.subscribe()
    }

    /// Acknowledge the swap to the owner.
    ///
    /// Refused with a `swap exists` notice while an earlier lock of ours
    /// towards the same owner is still open; refund it first.
    pub async fn sign(&self) -> Result<bool> {
        let exists = self
            .context
            .account_ledger
            .swap_exists(
                &self.context.local.account.address,
                &self.context.counterparty.account.address,
            )
            .await?;
        if exists {
            tracing::warn!(
                "Swap {}: an earlier swap with {} is still open",
                self.context.swap_id,
                self.context.counterparty.account.address
            );
            self.engine.set_state(|s| s.is_swap_exist = true).await?;
            self.room.send(RoomEvent::SwapExists).await?;
            return Ok(false);
        }

        self.engine
            .set_state(|s| {
                s.is_sign_fetching = true;
                s.is_swap_exist = false;
            })
            .await?;
        self.responders
            .respond(self.room.clone(), EventKind::RequestSign, RoomEvent::SwapSign);
        self.room.send(RoomEvent::SwapSign).await?;

        self.engine
            .finish_step(Step::Sign, FinishOptions::SILENT, |s| {
                s.is_sign_fetching = false;
                s.is_me_signed = true;
            })
            .await?;
        tracing::info!("Swap {} signed", self.context.swap_id);
        Ok(true)
    }

    /// Check the owner's lock is bound to our key and the committed hash.
    pub async fn verify_utxo_script(&self) -> Result<bool> {
        let state = self.engine.state().await;
        if state.utxo_script_verified {
            self.engine
                .finish_step(Step::VerifyScript, FinishOptions::SILENT, |_| {})
                .await?;
            return Ok(true);
        }

        let values = state
            .utxo_script_values
            .ok_or(SwapError::MissingScriptValues(Leg::Utxo))?;

        let problem = if values.recipient_public_key != self.context.local.utxo.public_key {
            Some(format!(
                "Expected recipientPublicKey: {}, got: {}",
                self.context.local.utxo.public_key, values.recipient_public_key
            ))
        } else if values.owner_public_key != self.context.counterparty.utxo.public_key {
            Some(format!(
                "Expected ownerPublicKey: {}, got: {}",
                self.context.counterparty.utxo.public_key, values.owner_public_key
            ))
        } else if state.secret_hash != Some(values.secret_hash) {
            Some("Script secret hash differs from the announced one".to_string())
        } else {
            None
        };

        if let Some(reason) = problem {
            tracing::error!("Swap {}: {}", self.context.swap_id, reason);
            self.engine.emit(FlowEvent::ScriptCheckFailed { reason });
            return Ok(false);
        }

        self.engine
            .finish_step(Step::VerifyScript, FinishOptions::SILENT, |s| {
                s.utxo_script_verified = true
            })
            .await
    }

    /// Re-check the account balance against the sell amount.
    pub async fn sync_balance(&self) -> Result<bool> {
        sync_balance(
            &self.engine,
            self.context.account_ledger.as_ref(),
            &self.context.local.account.address,
            self.context.sell_amount,
        )
        .await
    }

    /// Refund our account lock and tell the owner, so its next handshake
    /// asks for a fresh sign.
    pub async fn try_refund(&self) -> Result<TxHash> {
        let tx =
            refund::try_refund(&self.engine, self.context.account_ledger.as_ref(), Leg::Account)
                .await?;
        self.room.send(RoomEvent::RefundCompleted).await?;
        Ok(tx)
    }

    pub async fn is_refund_success(&self) -> Result<bool> {
        refund::is_refund_success(&self.engine, self.context.account_ledger.as_ref()).await
    }

    pub async fn refund_tx_hex(&self) -> Result<String> {
        refund::refund_tx_hex(&self.engine, self.context.account_ledger.as_ref(), Leg::Account)
            .await
    }

    pub async fn restart_after_refund(&self) -> Result<()> {
        refund::restart_after_refund(&self.engine).await?;
        self.responders.clear();
        self.restore_responders().await
    }

    /// Delete the swap and stop it: the running step and every responder.
    pub async fn abandon(&self) -> Result<()> {
        self.engine.abandon().await?;
        self.responders.clear();
        Ok(())
    }

    /// Withdraw the owner's lock with an explicitly supplied secret, for when
    /// the automatic path has stalled.
    pub async fn try_withdraw(&self, secret: Secret) -> Result<TxHash> {
        let state = self.engine.state().await;
        let values = state
            .utxo_script_values
            .clone()
            .ok_or(SwapError::MissingScriptValues(Leg::Utxo))?;

        if state.secret.is_some_and(|known| known != secret) {
            tracing::warn!(
                "Swap {}: withdrawing with a secret other than the one learned",
                self.context.swap_id
            );
        }
        if state.is_utxo_withdrawn || state.utxo_withdraw_tx.is_some() {
            tracing::warn!("Swap {}: utxo leg already marked withdrawn", self.context.swap_id);
        }

        match check_secret(&secret, state.secret_hash.as_ref(), self.config.secret_policy) {
            Ok(true) => {}
            Ok(false) => self.engine.emit(FlowEvent::SecretMismatch),
            Err(e) => {
                if matches!(e, SwapError::SecretMismatch) {
                    self.engine.emit(FlowEvent::SecretMismatch);
                }
                return Err(e);
            }
        }

        let ledger = self.context.utxo_ledger.as_ref();
        let address = ledger.create_script(&values)?.address;
        if ledger.get_balance(&address).await? == Amount::ZERO {
            tracing::warn!("Swap {}: nothing left at {}", self.context.swap_id, address);
            self.engine.set_state(|s| s.is_utxo_withdrawn = true).await?;
            self.skip_to_finish().await?;
            return Err(SwapError::AlreadyWithdrawn { address });
        }

        let tx = ledger.withdraw(&values, &secret).await?;
        tracing::info!("Swap {} withdrew utxo lock in tx {}", self.context.swap_id, tx);

        let recorded = tx.clone();
        self.engine
            .set_state(move |s| {
                s.utxo_withdraw_tx = Some(recorded);
                s.is_utxo_withdrawn = true;
                s.secret = Some(secret);
            })
            .await?;
        self.skip_to_finish().await?;
        Ok(tx)
    }

    /// Move past the wait-for-secret and withdraw steps if the pointer is on
    /// either of them.
    async fn skip_to_finish(&self) -> Result<()> {
        self.engine
            .finish_step(Step::WaitWithdrawAccount, FinishOptions::SILENT, |_| {})
            .await?;
        self.engine
            .finish_step(Step::WithdrawUtxo, FinishOptions::SILENT, |_| {})
            .await?;
        Ok(())
    }

    async fn wait_lock_utxo(&self) -> Result<()> {
        let mut messages = self.room.subscribe();
        self.room.send(RoomEvent::RequestUtxoScript).await?;

        loop {
            tokio::select! {
                message = messages.next_of(EventKind::CreateUtxoScript) => match message {
                    Some(RoomEvent::CreateUtxoScript { script_values, funding_tx }) => {
                        tracing::info!(
                            "Swap {}: owner locked utxo until {}",
                            self.context.swap_id,
                            script_values.lock_time
                        );
                        self.engine
                            .finish_step(Step::WaitLockUtxo, FinishOptions::SILENT, move |s| {
                                s.secret_hash = Some(script_values.secret_hash);
                                s.utxo_script_values = Some(script_values);
                                s.is_utxo_script_funded = funding_tx.is_some();
                                s.utxo_funding_tx = funding_tx;
                            })
                            .await?;
                        return Ok(());
                    }
                    Some(_) => {}
                    None => return Err(SwapError::room("Room closed while waiting for utxo lock")),
                },
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.room.send(RoomEvent::RequestUtxoScript).await?;
                }
            }
        }
    }

    async fn lock_account(&self) -> Result<()> {
        let state = self.engine.state().await;
        let owner_values = state
            .utxo_script_values
            .clone()
            .ok_or(SwapError::MissingScriptValues(Leg::Utxo))?;
        let ledger = self.context.account_ledger.as_ref();

        let resumed = state.account_script_values.is_some();
        let values = match state.account_script_values.clone() {
            Some(values) => values,
            None => {
                let lock_time = utc_now() + self.config.responder_lock_secs();
                let expected = ScriptExpectation {
                    value: self.context.buy_amount,
                    recipient_public_key: self.context.local.utxo.public_key.clone(),
                    lock_time,
                };

                let problem = if lock_time >= owner_values.lock_time {
                    Some(format!(
                        "Own lock time {} must expire before the owner's {}",
                        lock_time, owner_values.lock_time
                    ))
                } else {
                    self.context
                        .utxo_ledger
                        .check_script(&owner_values, &expected)
                        .await?
                };
                if let Some(reason) = problem {
                    tracing::error!("Swap {}: {}", self.context.swap_id, reason);
                    self.engine.emit(FlowEvent::ScriptCheckFailed { reason });
                    return Ok(());
                }

                let values = ScriptValues {
                    secret_hash: owner_values.secret_hash,
                    owner_public_key: self.context.local.account.public_key.clone(),
                    recipient_public_key: self.context.counterparty.account.public_key.clone(),
                    lock_time,
                };
                let recorded = values.clone();
                self.engine
                    .set_state(move |s| s.account_script_values = Some(recorded))
                    .await?;
                values
            }
        };

        let funding_tx = match fund_lock(
            &self.engine,
            ledger,
            &values,
            self.context.sell_amount,
            state.account_funding_tx.clone(),
            resumed,
            |s, tx| s.account_funding_tx = Some(tx),
        )
        .await?
        {
            Lock::Funded(tx) => Some(tx),
            Lock::Found => None,
            Lock::Retry => return Ok(()),
        };

        tracing::info!(
            "Swap {} locked {} until {} (tx {:?})",
            self.context.swap_id,
            self.context.sell_amount,
            values.lock_time,
            funding_tx
        );

        let announce = RoomEvent::CreateAccountScript {
            script_values: values,
            funding_tx,
        };
        self.responders
            .respond(self.room.clone(), EventKind::RequestAccountScript, announce.clone());
        self.room.send(announce).await?;

        self.engine
            .finish_step(Step::LockAccount, FinishOptions::SILENT, |s| {
                s.is_account_script_funded = true
            })
            .await?;
        Ok(())
    }

    async fn wait_withdraw_account(&self) -> Result<()> {
        if self.engine.state().await.is_utxo_withdrawn {
            self.engine
                .finish_step(Step::WaitWithdrawAccount, FinishOptions::SILENT, |_| {})
                .await?;
            return Ok(());
        }

        let mut messages = self.room.subscribe();
        self.room.send(RoomEvent::RequestWithdrawTxHash).await?;

        loop {
            tokio::select! {
                message = messages.next() => match message {
                    Some(RoomEvent::WithdrawTxHash { withdraw_tx, .. }) => {
                        if self.learn_secret(withdraw_tx).await? {
                            return Ok(());
                        }
                    }
                    Some(RoomEvent::FinishAccountWithdraw) => {
                        self.room.send(RoomEvent::RequestWithdrawTxHash).await?;
                    }
                    Some(_) => {}
                    None => return Err(SwapError::room("Room closed while waiting for withdrawal")),
                },
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.room.send(RoomEvent::RequestWithdrawTxHash).await?;
                }
            }
        }
    }

    /// Pull the secret out of the owner's withdrawal and finish the wait
    /// step with it. `Ok(false)` means keep waiting.
    /// The tx hash is recorded together with the secret it revealed, never
    /// on its own.
    async fn learn_secret(&self, withdraw_tx: TxHash) -> Result<bool> {
        let ledger = self.context.account_ledger.as_ref();
        let secret = match ledger.get_secret_from_tx_hash(&withdraw_tx).await {
            Ok(Some(secret)) => secret,
            Ok(None) => {
                tracing::warn!("Tx {} reveals no secret", withdraw_tx);
                return Ok(false);
            }
            Err(e) if e.kind == LedgerErrorKind::NotFound => {
                tracing::debug!("Withdraw tx {} not visible yet", withdraw_tx);
                return Ok(false);
            }
            Err(e) => {
                tolerate(&self.engine, e, "Read secret")?;
                return Ok(false);
            }
        };

        let state = self.engine.state().await;
        match check_secret(&secret, state.secret_hash.as_ref(), self.config.secret_policy) {
            Ok(true) => {}
            Ok(false) => self.engine.emit(FlowEvent::SecretMismatch),
            Err(SwapError::SecretMismatch) => {
                self.engine.emit(FlowEvent::SecretMismatch);
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        tracing::info!("Swap {} learned the secret from {}", self.context.swap_id, withdraw_tx);
        self.engine
            .finish_step(Step::WaitWithdrawAccount, FinishOptions::SILENT, move |s| {
                s.account_withdraw_tx = Some(withdraw_tx);
                s.secret = Some(secret);
                s.is_account_withdrawn = true;
            })
            .await?;
        Ok(true)
    }

    async fn withdraw_utxo(&self) -> Result<()> {
        let state = self.engine.state().await;
        if state.is_utxo_withdrawn {
            self.engine
                .finish_step(Step::WithdrawUtxo, FinishOptions::SILENT, |_| {})
                .await?;
            return Ok(());
        }

        let values = state
            .utxo_script_values
            .clone()
            .ok_or(SwapError::MissingScriptValues(Leg::Utxo))?;
        let secret = state.secret.ok_or(SwapError::MissingSecret)?;
        let ledger = self.context.utxo_ledger.as_ref();

        let tx = match known_tx(ledger, state.utxo_withdraw_tx.clone()).await? {
            Some(tx) => tx,
            None => match ledger.withdraw(&values, &secret).await {
                Ok(tx) => tx,
                Err(e) => return tolerate(&self.engine, e, "Withdraw utxo script"),
            },
        };
        tracing::info!(
            "Swap {} withdrew {} in tx {}",
            self.context.swap_id,
            self.context.buy_amount,
            tx
        );

        self.engine
            .finish_step(Step::WithdrawUtxo, FinishOptions::SILENT, move |s| {
                s.utxo_withdraw_tx = Some(tx);
                s.is_utxo_withdrawn = true;
            })
            .await?;
        Ok(())
    }

    async fn finish(&self) -> Result<()> {
        self.room.send(RoomEvent::SwapFinished).await?;
        self.engine
            .finish_step(Step::Finish, FinishOptions::SILENT, |s| s.is_finished = true)
            .await?;
        tracing::info!("Swap {} finished", self.context.swap_id);
        Ok(())
    }
}

#[async_trait]
impl SwapFlow for ParticipantFlow {
    fn engine(&self) -> &StepEngine {
        &self.engine
    }

    async fn run_step(&self, step: Step) -> Result<()> {
        match step {
            Step::Sign => {
                if self.engine.state().await.is_me_signed {
                    self.engine
                        .finish_step(Step::Sign, FinishOptions::SILENT, |_| {})
                        .await?;
                }
                Ok(())
            }
            Step::WaitLockUtxo => self.wait_lock_utxo().await,
            Step::VerifyScript => self.verify_utxo_script().await.map(|_| ()),
            Step::SyncBalance => self.sync_balance().await.map(|_| ()),
            Step::LockAccount => self.lock_account().await,
            Step::WaitWithdrawAccount => self.wait_withdraw_account().await,
            Step::WithdrawUtxo => self.withdraw_utxo().await,
            Step::Finish => self.finish().await,
            other => Err(SwapError::internal(format!(
                "{} is not a participant step",
                other
            ))),
        }
    }

    async fn restore_responders(&self) -> Result<()> {
        let state = self.engine.state().await;
        if state.is_me_signed {
            self.responders
                .respond(self.room.clone(), EventKind::RequestSign, RoomEvent::SwapSign);
        }
        let funded = state.account_funding_tx.is_some() || state.is_account_script_funded;
        if let (Some(values), true) = (state.account_script_values, funded) {
            self.responders.respond(
                self.room.clone(),
                EventKind::RequestAccountScript,
                RoomEvent::CreateAccountScript {
                    script_values: values,
                    funding_tx: state.account_funding_tx,
                },
            );
        }
        Ok(())
    }
}
