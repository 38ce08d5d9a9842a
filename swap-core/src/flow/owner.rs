use super::{
    fund_lock, known_tx, sync_balance, tolerate, FinishOptions, FlowConfig, FlowEvent, FlowKind,
    FlowState, Lock, Step, StepEngine, SwapContext, SwapFlow,
};
use crate::error::{Result, SwapError};
use crate::room::{EventKind, Responders, Room, RoomEvent};
use crate::secret::{refund, Secret};
use crate::storage::FlowStore;
use crate::types::{utc_now, Leg, ScriptValues, TxHash};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

/// The party that locks first on the UTXO chain and owns the secret
/// (BTC2POINT).
pub struct OwnerFlow {
    context: SwapContext,
    config: FlowConfig,
    room: Arc<dyn Room>,
    engine: Arc<StepEngine>,
    responders: Responders,
}

impl OwnerFlow {
    /// Open the persisted owner flow for `context.swap_id`, or start a new one.
    pub async fn open(
        context: SwapContext,
        room: Arc<dyn Room>,
        store: Arc<dyn FlowStore>,
        config: FlowConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let engine = StepEngine::open(context.swap_id, FlowKind::Owner, store).await?;

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

    /// Commit to `secret`. Only the hash leaves this process before the
    /// withdrawal; a second submission is ignored.
    pub async fn submit_secret(&self, secret: Secret) -> Result<()> {
        let state = self.engine.state().await;
        if !state.is_participant_signed {
            return Err(SwapError::ParticipantNotSigned { step: state.step });
        }
        if state.secret.is_some() {
            tracing::warn!("Swap {}: secret already submitted, ignoring", self.context.swap_id);
            return Ok(());
        }

        self.engine
            .finish_step(Step::SubmitSecret, FinishOptions::STRICT, move |s| {
                s.secret_hash = Some(secret.hash());
                s.secret = Some(secret);
            })
            .await?;
        tracing::info!(
            "Swap {} committed to secret hash {}",
            self.context.swap_id,
            secret.hash()
        );
        Ok(())
    }

    /// Re-check the UTXO balance against the sell amount.
    pub async fn sync_balance(&self) -> Result<bool> {
        sync_balance(
            &self.engine,
            self.context.utxo_ledger.as_ref(),
            &self.context.local.utxo.address,
            self.context.sell_amount,
        )
        .await
    }

    pub async fn try_refund(&self) -> Result<TxHash> {
        refund::try_refund(&self.engine, self.context.utxo_ledger.as_ref(), Leg::Utxo).await
    }

    pub async fn is_refund_success(&self) -> Result<bool> {
        refund::is_refund_success(&self.engine, self.context.utxo_ledger.as_ref()).await
    }

    pub async fn refund_tx_hex(&self) -> Result<String> {
        refund::refund_tx_hex(&self.engine, self.context.utxo_ledger.as_ref(), Leg::Utxo).await
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

    /// Finish `step` with `patch` whenever `trigger` arrives, for as long as
    /// the flow is open.
    fn complete_on(&self, trigger: EventKind, step: Step, patch: fn(&mut FlowState)) {
        let engine = self.engine.clone();
        let mut messages = self.room.subscribe();
        let handle = tokio::spawn(async move {
            while messages.next_of(trigger).await.is_some() {
                if let Err(e) = engine.finish_step(step, FinishOptions::SILENT, patch).await {
                    tracing::warn!("Failed to record '{}': {}", trigger, e);
                }
            }
        });
        self.responders.track(trigger, handle);
    }

    async fn handshake(&self) -> Result<()> {
        let mut messages = self.room.subscribe();
        let state = self.engine.state().await;
        if state.is_participant_signed {
            self.engine
                .finish_step(Step::Sign, FinishOptions::SILENT, |_| {})
                .await?;
            return Ok(());
        }

        if state.is_swap_exist {
            tracing::info!(
                "Swap {}: participant still has an open swap, waiting for its refund",
                self.context.swap_id
            );
        } else {
            self.room.send(RoomEvent::RequestSign).await?;
        }

        loop {
            tokio::select! {
                message = messages.next() => match message {
                    Some(RoomEvent::SwapExists) => {
                        tracing::warn!("Swap {}: participant reports an open swap", self.context.swap_id);
                        self.engine.set_state(|s| s.is_swap_exist = true).await?;
                    }
                    Some(RoomEvent::RefundCompleted) => {
                        tracing::info!("Swap {}: participant refunded, requesting sign again", self.context.swap_id);
                        if self.engine.state().await.is_swap_exist {
                            self.engine.set_state(|s| s.is_swap_exist = false).await?;
                        }
                        self.room.send(RoomEvent::RequestSign).await?;
                    }
                    Some(_) => {}
                    None => return Err(SwapError::room("Room closed during handshake")),
                },
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if !self.engine.state().await.is_swap_exist {
                        self.room.send(RoomEvent::RequestSign).await?;
                    }
                }
            }
        }
    }

    async fn lock_utxo(&self) -> Result<()> {
        let state = self.engine.state().await;
        let secret_hash = state.secret_hash.ok_or(SwapError::MissingSecretHash)?;
        let ledger = self.context.utxo_ledger.as_ref();

        let resumed = state.utxo_script_values.is_some();
        let values = match state.utxo_script_values.clone() {
            Some(values) => values,
            None => {
                let values = ScriptValues {
                    secret_hash,
                    owner_public_key: self.context.local.utxo.public_key.clone(),
                    recipient_public_key: self.context.counterparty.utxo.public_key.clone(),
                    lock_time: utc_now() + self.config.initiator_lock_secs(),
                };
                let recorded = values.clone();
                self.engine
                    .set_state(move |s| s.utxo_script_values = Some(recorded))
                    .await?;
                values
            }
        };

        let funding_tx = match fund_lock(
            &self.engine,
            ledger,
            &values,
            self.context.sell_amount,
            state.utxo_funding_tx.clone(),
            resumed,
            |s, tx| s.utxo_funding_tx = Some(tx),
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

        let announce = RoomEvent::CreateUtxoScript {
            script_values: values,
            funding_tx,
        };
        self.responders
            .respond(self.room.clone(), EventKind::RequestUtxoScript, announce.clone());
        self.room.send(announce).await?;

        self.engine
            .finish_step(Step::LockUtxo, FinishOptions::SILENT, |s| {
                s.is_utxo_script_funded = true
            })
            .await?;
        Ok(())
    }

    async fn wait_lock_account(&self) -> Result<()> {
        let mut messages = self.room.subscribe();
        self.room.send(RoomEvent::RequestAccountScript).await?;

        loop {
            tokio::select! {
                message = messages.next_of(EventKind::CreateAccountScript) => match message {
                    Some(RoomEvent::CreateAccountScript { script_values, funding_tx: Some(tx) }) => {
                        tracing::info!("Swap {}: account script funded by {}", self.context.swap_id, tx);
                        self.engine
                            .finish_step(Step::WaitLockAccount, FinishOptions::SILENT, move |s| {
                                s.account_script_values = Some(script_values);
                                s.account_funding_tx = Some(tx);
                                s.is_account_script_funded = true;
                            })
                            .await?;
                        return Ok(());
                    }
                    Some(RoomEvent::CreateAccountScript { script_values, funding_tx: None }) => {
                        self.engine
                            .set_state(move |s| s.account_script_values = Some(script_values))
                            .await?;
                    }
                    Some(_) => {}
                    None => return Err(SwapError::room("Room closed while waiting for account lock")),
                },
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if self.account_script_funded().await {
                        self.engine
                            .finish_step(Step::WaitLockAccount, FinishOptions::SILENT, |s| {
                                s.is_account_script_funded = true
                            })
                            .await?;
                        return Ok(());
                    }
                    self.room.send(RoomEvent::RequestAccountScript).await?;
                }
            }
        }
    }

    async fn account_script_funded(&self) -> bool {
        let Some(values) = self.engine.state().await.account_script_values else {
            return false;
        };
        let ledger = self.context.account_ledger.as_ref();
        let balance = match ledger.create_script(&values) {
            Ok(script) => ledger.get_balance(&script.address).await,
            Err(e) => Err(e),
        };

        match balance {
            Ok(balance) => balance >= self.context.buy_amount,
            Err(e) => {
                tracing::debug!("Polling account script failed: {}", e);
                false
            }
        }
    }

    async fn withdraw_account(&self) -> Result<()> {
        let state = self.engine.state().await;
        let values = state
            .account_script_values
            .clone()
            .ok_or(SwapError::MissingScriptValues(Leg::Account))?;
        let secret = state.secret.ok_or(SwapError::MissingSecret)?;
        let ledger = self.context.account_ledger.as_ref();

        let withdraw_tx = match known_tx(ledger, state.account_withdraw_tx.clone()).await? {
            Some(tx) => tx,
            None => {
                if Some(&values.secret_hash) != state.secret_hash.as_ref()
                    || values.recipient_public_key != self.context.local.account.public_key
                {
                    let reason = "Account script is not bound to our secret and key".to_string();
                    tracing::error!("Swap {}: {}", self.context.swap_id, reason);
                    self.engine.emit(FlowEvent::ScriptCheckFailed { reason });
                    return Ok(());
                }

                let owner = &self.context.counterparty.account.address;
                let recipient = &self.context.local.account.address;
                if let Some(reason) = ledger
                    .check_balance(owner, recipient, self.context.buy_amount)
                    .await?
                {
                    tracing::error!("Swap {}: {}", self.context.swap_id, reason);
                    self.engine.emit(FlowEvent::BalanceCheckFailed { reason });
                    return Ok(());
                }

                match ledger.withdraw(&values, &secret).await {
                    Ok(tx) => {
                        let recorded = tx.clone();
                        self.engine
                            .set_state(move |s| s.account_withdraw_tx = Some(recorded))
                            .await?;
                        tx
                    }
                    Err(e) => return tolerate(&self.engine, e, "Withdraw account script"),
                }
            }
        };

        tracing::info!(
            "Swap {} withdrew {} in tx {}",
            self.context.swap_id,
            self.context.buy_amount,
            withdraw_tx
        );

        self.responders.respond(
            self.room.clone(),
            EventKind::RequestWithdrawTxHash,
            RoomEvent::WithdrawTxHash {
                script_values: Some(values),
                withdraw_tx,
            },
        );
        self.room.send(RoomEvent::FinishAccountWithdraw).await?;

        self.engine
            .finish_step(Step::WithdrawAccount, FinishOptions::SILENT, |s| {
                s.is_account_withdrawn = true
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SwapFlow for OwnerFlow {
    fn engine(&self) -> &StepEngine {
        &self.engine
    }

    async fn run_step(&self, step: Step) -> Result<()> {
        match step {
            Step::Sign => self.handshake().await,
            Step::SubmitSecret => {
                if self.config.auto_secret {
                    self.submit_secret(Secret::random()).await?;
                }
                Ok(())
            }
            Step::SyncBalance => self.sync_balance().await.map(|_| ()),
            Step::LockUtxo => self.lock_utxo().await,
            Step::WaitLockAccount => self.wait_lock_account().await,
            Step::WithdrawAccount => self.withdraw_account().await,
            Step::Finish => {
                if self.engine.state().await.is_finished {
                    self.engine
                        .finish_step(Step::Finish, FinishOptions::SILENT, |_| {})
                        .await?;
                }
                Ok(())
            }
            other => Err(SwapError::internal(format!("{} is not an owner step", other))),
        }
    }

    async fn restore_responders(&self) -> Result<()> {
        self.complete_on(EventKind::SwapSign, Step::Sign, |s| {
            s.is_participant_signed = true
        });
        self.complete_on(EventKind::SwapFinished, Step::Finish, |s| s.is_finished = true);

        let state = self.engine.state().await;
        let funded = state.utxo_funding_tx.is_some() || state.is_utxo_script_funded;
        if let (Some(values), true) = (state.utxo_script_values, funded) {
            self.responders.respond(
                self.room.clone(),
                EventKind::RequestUtxoScript,
                RoomEvent::CreateUtxoScript {
                    script_values: values,
                    funding_tx: state.utxo_funding_tx,
                },
            );
        }
        if let Some(tx) = state.account_withdraw_tx {
            self.responders.respond(
                self.room.clone(),
                EventKind::RequestWithdrawTxHash,
                RoomEvent::WithdrawTxHash {
                    script_values: state.account_script_values,
                    withdraw_tx: tx,
                },
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::testing::Fixture;
    use crate::flow::StepOutcome;
    use crate::ledger::{Ledger, LedgerError};
    use bitcoin::Amount;

    async fn signed_owner(fixture: &Fixture) -> Arc<OwnerFlow> {
        let owner = fixture.open_owner().await;
        owner.advance().await.unwrap();
        owner
            .engine()
            .finish_step(Step::Sign, FinishOptions::STRICT, |s| {
                s.is_participant_signed = true
            })
            .await
            .unwrap();
        owner
    }

    #[tokio::test]
    async fn test_submit_secret_requires_sign_and_is_set_once() {
        let fixture = Fixture::new();
        let owner = fixture.open_owner().await;

        let err = owner.submit_secret(Secret::random()).await.unwrap_err();
        assert!(matches!(err, SwapError::ParticipantNotSigned { .. }));
        assert!(owner.state().await.secret.is_none());

        owner.advance().await.unwrap();
        owner
            .engine()
            .finish_step(Step::Sign, FinishOptions::STRICT, |s| {
                s.is_participant_signed = true
            })
            .await
            .unwrap();

        let first = Secret::random();
        owner.submit_secret(first).await.unwrap();
        owner.submit_secret(Secret::random()).await.unwrap();

        let state = owner.state().await;
        assert_eq!(state.secret, Some(first));
        assert_eq!(state.secret_hash, Some(first.hash()));
        assert_eq!(owner.engine().current_step(), Step::SyncBalance);
    }

    #[tokio::test]
    async fn test_balance_sync_waits_for_enough_funds() {
        let fixture = Fixture::with_amounts(Amount::from_sat(150_000_000), Amount::from_sat(1_000));
        fixture.utxo_chain.deposit("alice-btc", Amount::from_sat(100_000_000));

        let owner = signed_owner(&fixture).await;
        owner.submit_secret(Secret::random()).await.unwrap();
        let mut events = owner.events();

        assert_eq!(owner.advance().await.unwrap(), StepOutcome::Pending);
        let state = owner.state().await;
        assert!(!state.is_balance_enough);
        assert_eq!(state.balance, Some(Amount::from_sat(100_000_000)));
        assert_eq!(owner.engine().current_step(), Step::SyncBalance);
        assert!(matches!(
            events.recv().await.unwrap(),
            FlowEvent::InsufficientBalance { .. }
        ));

        fixture.utxo_chain.deposit("alice-btc", Amount::from_sat(100_000_000));
        assert!(owner.sync_balance().await.unwrap());
        let state = owner.state().await;
        assert!(state.is_balance_enough);
        assert_eq!(state.balance, Some(Amount::from_sat(200_000_000)));
        assert_eq!(owner.engine().current_step(), Step::LockUtxo);
    }

    #[tokio::test]
    async fn test_lock_utxo_announces_and_answers_requests() {
        let fixture = Fixture::new();
        let owner = signed_owner(&fixture).await;
        let secret = Secret::random();
        owner.submit_secret(secret).await.unwrap();
        owner.sync_balance().await.unwrap();

        let mut counterparty = fixture.participant_room.subscribe();
        assert_eq!(owner.advance().await.unwrap(), StepOutcome::Advanced);

        let state = owner.state().await;
        let values = state.utxo_script_values.clone().unwrap();
        assert!(state.is_utxo_script_funded);
        assert_eq!(values.secret_hash, secret.hash());
        assert_eq!(values.recipient_public_key, "bob-btc-pk");
        assert!(values.lock_time > utc_now() + fixture.config.responder_lock_secs());

        let announced = counterparty.next_of(EventKind::CreateUtxoScript).await.unwrap();
        fixture
            .participant_room
            .send(RoomEvent::RequestUtxoScript)
            .await
            .unwrap();
        let repeated = counterparty.next_of(EventKind::CreateUtxoScript).await.unwrap();
        assert_eq!(announced, repeated);
    }

    #[tokio::test]
    async fn test_soft_ledger_failure_keeps_step_pending() {
        let fixture = Fixture::new();
        let owner = signed_owner(&fixture).await;
        owner.submit_secret(Secret::random()).await.unwrap();
        owner.sync_balance().await.unwrap();

        fixture
            .utxo_chain
            .fail_next(LedgerError::from_message("known transaction"));
        let mut events = owner.events();
        assert_eq!(owner.advance().await.unwrap(), StepOutcome::Pending);
        assert!(matches!(
            events.recv().await.unwrap(),
            FlowEvent::LedgerSoftFailure { .. }
        ));

        fixture
            .utxo_chain
            .fail_next(LedgerError::from_message("connection refused"));
        assert!(owner.advance().await.is_err());
        assert_eq!(owner.engine().current_step(), Step::LockUtxo);

        assert_eq!(owner.advance().await.unwrap(), StepOutcome::Advanced);
    }

    #[tokio::test]
    async fn test_wait_lock_account_advances_exactly_once() {
        let fixture = Fixture::new();
        let owner = signed_owner(&fixture).await;
        owner.submit_secret(Secret::random()).await.unwrap();
        owner.sync_balance().await.unwrap();
        owner.advance().await.unwrap();
        assert_eq!(owner.engine().current_step(), Step::WaitLockAccount);

        let mut events = owner.events();
        let values = ScriptValues {
            secret_hash: owner.state().await.secret_hash.unwrap(),
            owner_public_key: "bob-point-pk".to_string(),
            recipient_public_key: "alice-point-pk".to_string(),
            lock_time: utc_now() + 3600,
        };
        let tx = fixture
            .bob_account()
            .fund_script(&values, fixture.participant_sell())
            .await
            .unwrap();

        // the poll path and two copies of the message all race to finish the step
        let announce = RoomEvent::CreateAccountScript {
            script_values: values.clone(),
            funding_tx: Some(tx.clone()),
        };
        let room = fixture.participant_room.clone();
        let poll_interval = fixture.config.poll_interval;
        let sender = tokio::spawn(async move {
            tokio::time::sleep(poll_interval).await;
            room.send(announce.clone()).await.unwrap();
            room.send(announce).await.unwrap();
        });

        assert_eq!(owner.advance().await.unwrap(), StepOutcome::Advanced);
        sender.await.unwrap();

        let late = owner
            .engine()
            .finish_step(Step::WaitLockAccount, FinishOptions::SILENT, |s| {
                s.is_account_script_funded = false
            })
            .await
            .unwrap();
        assert!(!late);

        let state = owner.state().await;
        assert!(state.is_account_script_funded);
        assert_eq!(state.account_script_values, Some(values));
        assert_eq!(owner.engine().current_step(), Step::WithdrawAccount);

        let mut transitions = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, FlowEvent::StepChanged { .. }) {
                transitions += 1;
            }
        }
        assert_eq!(transitions, 1);
    }

    #[tokio::test]
    async fn test_participant_refund_reopens_handshake() {
        let fixture = Fixture::new();
        let owner = fixture.open_owner().await;
        owner.advance().await.unwrap();
        owner.engine().set_state(|s| s.is_swap_exist = true).await.unwrap();

        let mut counterparty = fixture.participant_room.subscribe();
        let runner = {
            let owner = owner.clone();
            tokio::spawn(async move { owner.advance().await })
        };

        tokio::time::sleep(fixture.config.poll_interval * 3).await;
        fixture
            .participant_room
            .send(RoomEvent::RefundCompleted)
            .await
            .unwrap();
        assert_eq!(
            counterparty.next_of(EventKind::RequestSign).await,
            Some(RoomEvent::RequestSign)
        );
        assert!(!owner.state().await.is_swap_exist);

        fixture.participant_room.send(RoomEvent::SwapSign).await.unwrap();
        assert_eq!(runner.await.unwrap().unwrap(), StepOutcome::Advanced);
        assert!(owner.state().await.is_participant_signed);
    }

    /// Owner on `WaitLockAccount` after locking with `secret`.
    async fn waiting_for_account_lock(fixture: &Fixture, secret: Secret) -> Arc<OwnerFlow> {
        let owner = signed_owner(fixture).await;
        owner.submit_secret(secret).await.unwrap();
        owner.sync_balance().await.unwrap();
        assert_eq!(owner.advance().await.unwrap(), StepOutcome::Advanced);
        assert_eq!(owner.engine().current_step(), Step::WaitLockAccount);
        owner
    }

    fn account_lock(secret: &Secret) -> ScriptValues {
        ScriptValues {
            secret_hash: secret.hash(),
            owner_public_key: "bob-point-pk".to_string(),
            recipient_public_key: "alice-point-pk".to_string(),
            lock_time: utc_now() + 3600,
        }
    }

    #[tokio::test]
    async fn test_resumed_lock_does_not_fund_twice() {
        let fixture = Fixture::new();
        let owner = signed_owner(&fixture).await;
        let secret = Secret::random();
        owner.submit_secret(secret).await.unwrap();
        owner.sync_balance().await.unwrap();

        // values persisted and broadcast, but the process stopped before the tx hash was saved
        let values = ScriptValues {
            secret_hash: secret.hash(),
            owner_public_key: "alice-btc-pk".to_string(),
            recipient_public_key: "bob-btc-pk".to_string(),
            lock_time: utc_now() + fixture.config.initiator_lock_secs(),
        };
        let recorded = values.clone();
        owner
            .engine()
            .set_state(move |s| s.utxo_script_values = Some(recorded))
            .await
            .unwrap();
        fixture.utxo_chain.fund_script(&values, fixture.sell).await.unwrap();
        drop(owner);

        let owner = fixture.open_owner().await;
        assert_eq!(owner.engine().current_step(), Step::LockUtxo);
        let mut counterparty = fixture.participant_room.subscribe();
        assert_eq!(owner.advance().await.unwrap(), StepOutcome::Advanced);

        let address = fixture.utxo_chain.create_script(&values).unwrap().address;
        assert_eq!(fixture.utxo_chain.get_balance(&address).await.unwrap(), fixture.sell);
        assert_eq!(
            fixture.utxo_chain.balance_of("alice-btc"),
            Amount::from_sat(50_000_000)
        );

        let state = owner.state().await;
        assert!(state.is_utxo_script_funded);
        assert!(state.utxo_funding_tx.is_none());
        assert_eq!(
            counterparty.next_of(EventKind::CreateUtxoScript).await,
            Some(RoomEvent::CreateUtxoScript {
                script_values: values,
                funding_tx: None,
            })
        );
    }

    #[tokio::test]
    async fn test_withdraw_ignores_participant_locks_to_others() {
        let fixture = Fixture::new();
        let secret = Secret::random();
        let owner = waiting_for_account_lock(&fixture, secret).await;

        let bob = fixture.bob_account();
        fixture.account_chain.wallet("carol-point", "carol-point-pk");
        let unrelated = ScriptValues {
            recipient_public_key: "carol-point-pk".to_string(),
            ..account_lock(&Secret::random())
        };
        bob.fund_script(&unrelated, Amount::from_sat(5)).await.unwrap();

        let values = account_lock(&secret);
        let tx = bob.fund_script(&values, fixture.participant_sell()).await.unwrap();
        let announce = RoomEvent::CreateAccountScript {
            script_values: values,
            funding_tx: Some(tx),
        };
        let mut requests = fixture.participant_room.subscribe();
        let room = fixture.participant_room.clone();
        let participant = tokio::spawn(async move {
            requests.next_of(EventKind::RequestAccountScript).await;
            room.send(announce).await.unwrap();
        });
        assert_eq!(owner.advance().await.unwrap(), StepOutcome::Advanced);
        participant.await.unwrap();

        let mut events = owner.events();
        assert_eq!(owner.advance().await.unwrap(), StepOutcome::Advanced);
        assert!(owner.state().await.is_account_withdrawn);
        assert_eq!(fixture.account_chain.balance_of("alice-point"), fixture.buy);
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, FlowEvent::BalanceCheckFailed { .. }));
        }
    }

    #[tokio::test]
    async fn test_poll_finishes_wait_before_late_announce() {
        let fixture = Fixture::new();
        let secret = Secret::random();
        let owner = waiting_for_account_lock(&fixture, secret).await;

        // the values came in without a tx; the chain shows the lock before the announce does
        let values = account_lock(&secret);
        let tx = fixture
            .bob_account()
            .fund_script(&values, fixture.participant_sell())
            .await
            .unwrap();
        let recorded = values.clone();
        owner
            .engine()
            .set_state(move |s| s.account_script_values = Some(recorded))
            .await
            .unwrap();

        let mut events = owner.events();
        assert_eq!(owner.advance().await.unwrap(), StepOutcome::Advanced);
        let state = owner.state().await;
        assert!(state.is_account_script_funded);
        assert!(state.account_funding_tx.is_none());

        fixture
            .participant_room
            .send(RoomEvent::CreateAccountScript {
                script_values: values.clone(),
                funding_tx: Some(tx.clone()),
            })
            .await
            .unwrap();
        let late = owner
            .engine()
            .finish_step(Step::WaitLockAccount, FinishOptions::SILENT, move |s| {
                s.account_funding_tx = Some(tx);
            })
            .await
            .unwrap();
        assert!(!late);

        let state = owner.state().await;
        assert!(state.account_funding_tx.is_none());
        assert_eq!(state.account_script_values, Some(values));
        assert_eq!(owner.engine().current_step(), Step::WithdrawAccount);

        let mut transitions = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, FlowEvent::StepChanged { .. }) {
                transitions += 1;
            }
        }
        assert_eq!(transitions, 1);
    }

    #[tokio::test]
    async fn test_lost_announce_is_recovered_after_reconnect() {
        let fixture = Fixture::new();
        let owner = signed_owner(&fixture).await;
        owner.submit_secret(Secret::random()).await.unwrap();
        owner.sync_balance().await.unwrap();

        let participant = fixture.open_participant().await;
        assert!(participant.sign().await.unwrap());
        participant.advance().await.unwrap();
        participant.advance().await.unwrap();
        assert_eq!(participant.engine().current_step(), Step::WaitLockUtxo);

        fixture.owner_room.set_connected(false);
        let waiting = {
            let participant = participant.clone();
            tokio::spawn(async move { participant.advance().await })
        };
        assert_eq!(owner.advance().await.unwrap(), StepOutcome::Advanced);

        tokio::time::sleep(fixture.config.poll_interval * 3).await;
        assert_eq!(participant.engine().current_step(), Step::WaitLockUtxo);
        assert!(participant.state().await.utxo_script_values.is_none());

        fixture.owner_room.set_connected(true);
        assert_eq!(waiting.await.unwrap().unwrap(), StepOutcome::Advanced);

        let owner_state = owner.state().await;
        let state = participant.state().await;
        assert_eq!(state.utxo_script_values, owner_state.utxo_script_values);
        assert_eq!(state.utxo_funding_tx, owner_state.utxo_funding_tx);
        assert_eq!(state.secret_hash, owner_state.secret_hash);
        assert!(state.is_utxo_script_funded);
    }

    #[tokio::test]
    async fn test_abandon_stops_running_flow() {
        let fixture = Fixture::new();
        let owner = fixture.open_owner().await;
        let mut counterparty = fixture.participant_room.subscribe();
        let runner = {
            let owner = owner.clone();
            tokio::spawn(async move { owner.run().await })
        };
        assert_eq!(
            counterparty.next_of(EventKind::RequestSign).await,
            Some(RoomEvent::RequestSign)
        );

        owner.abandon().await.unwrap();
        fixture.participant_room.send(RoomEvent::SwapExists).await.unwrap();
        fixture.participant_room.send(RoomEvent::SwapSign).await.unwrap();

        let err = runner.await.unwrap().unwrap_err();
        assert!(matches!(err, SwapError::Abandoned(id) if id == fixture.swap_id));

        tokio::time::sleep(fixture.config.poll_interval * 3).await;
        assert!(fixture.owner_store.load(fixture.swap_id).await.unwrap().is_none());
        assert!(matches!(owner.abandon().await, Err(SwapError::Abandoned(_))));
    }
}
