//! HTLC atomic swap flows.
//!
//! Two parties trade an asset on a UTXO chain for an asset on an account
//! chain. The owner locks first behind the hash of a secret only it knows;
//! the participant locks second with a shorter lock time; the owner's
//! withdrawal reveals the secret, which lets the participant withdraw in
//! turn. Each side is a resumable, persisted step machine.

pub mod error;
pub mod flow;
pub mod ledger;
pub mod manager;
pub mod room;
pub mod secret;
pub mod storage;
pub mod types;

pub use error::{Result, SwapError};
pub use flow::{
    AnyFlow, FinishOptions, FlowConfig, FlowEvent, FlowKind, FlowRecord, FlowState, OwnerFlow,
    ParticipantFlow, Step, StepOutcome, SwapContext, SwapFlow,
};
pub use ledger::{Ledger, LedgerError, LedgerErrorKind, MemoryLedger};
pub use manager::SwapManager;
pub use room::{LocalRoom, Room, RoomEvent};
pub use secret::{Secret, SecretHash, SecretPolicy};
pub use storage::{FlowStore, MemoryFlowStore, SqliteFlowStore, Storage};
pub use types::{ChainAccount, Leg, PartyKeys, ScriptValues, TxHash};

pub use ::bitcoin::Amount;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::testing::{wait_for_step, Fixture};
    use std::time::Duration;

    const DEADLINE: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_full_swap() {
        let fixture = Fixture::new();
        let owner = fixture.open_owner().await;
        let participant = fixture.open_participant().await;

        let owner_run = {
            let owner = owner.clone();
            tokio::spawn(async move { owner.run().await })
        };
        let participant_run = {
            let participant = participant.clone();
            tokio::spawn(async move { participant.run().await })
        };

        assert!(participant.sign().await.unwrap());
        wait_for_step(owner.engine(), Step::SubmitSecret).await;
        let secret = Secret::random();
        owner.submit_secret(secret).await.unwrap();

        tokio::time::timeout(DEADLINE, owner_run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        tokio::time::timeout(DEADLINE, participant_run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let owner_state = owner.state().await;
        assert!(owner_state.is_finished);
        assert!(owner_state.is_account_withdrawn);
        assert_eq!(owner.engine().current_step(), Step::End);

        let participant_state = participant.state().await;
        assert_eq!(participant_state.secret, Some(secret));
        assert!(participant_state.is_utxo_withdrawn);
        assert!(participant_state.is_finished);

        assert_eq!(fixture.utxo_chain.balance_of("alice-btc"), Amount::from_sat(50_000_000));
        assert_eq!(fixture.utxo_chain.balance_of("bob-btc"), fixture.sell);
        assert_eq!(fixture.account_chain.balance_of("alice-point"), fixture.buy);
        assert_eq!(
            fixture.account_chain.balance_of("bob-point"),
            Amount::from_sat(1_000_000)
        );
    }

    #[tokio::test]
    async fn test_owner_resumes_after_restart() {
        let mut fixture = Fixture::new();
        fixture.config.auto_secret = true;

        let participant = fixture.open_participant().await;
        let participant_run = {
            let participant = participant.clone();
            tokio::spawn(async move { participant.run().await })
        };
        participant.sign().await.unwrap();

        let owner = fixture.open_owner().await;
        let first_run = {
            let owner = owner.clone();
            tokio::spawn(async move { owner.run().await })
        };
        wait_for_step(owner.engine(), Step::WaitLockAccount).await;
        first_run.abort();
        let _ = first_run.await;
        drop(owner);

        let owner = fixture.open_owner().await;
        let resumed_at = owner.engine().step_index();
        assert!(resumed_at >= FlowKind::Owner.index_of(Step::WaitLockAccount).unwrap());
        assert!(owner.state().await.is_utxo_script_funded);

        let owner_run = {
            let owner = owner.clone();
            tokio::spawn(async move { owner.run().await })
        };
        tokio::time::timeout(DEADLINE, owner_run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        tokio::time::timeout(DEADLINE, participant_run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert!(owner.state().await.is_finished);
        assert!(participant.state().await.is_finished);
        // locked exactly once despite the restart
        assert_eq!(fixture.utxo_chain.balance_of("alice-btc"), Amount::from_sat(50_000_000));
        assert_eq!(fixture.utxo_chain.balance_of("bob-btc"), fixture.sell);
    }

    #[tokio::test]
    async fn test_any_flow_exposes_both_variants() {
        let fixture = Fixture::new();
        let flows = [
            AnyFlow::Owner(fixture.open_owner().await),
            AnyFlow::Participant(fixture.open_participant().await),
        ];

        assert_eq!(flows[0].kind(), FlowKind::Owner);
        assert_eq!(flows[1].kind(), FlowKind::Participant);
        for flow in &flows {
            assert_eq!(flow.swap_id(), fixture.swap_id);
            assert_eq!(flow.state().await.version, 1);
            assert!(!flow.is_refund_success().await.unwrap());
        }
    }
}
