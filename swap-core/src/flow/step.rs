use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Named unit of a flow. A step's index in its flow's table is persisted and
/// shown to users, so tables are append-only across protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Step {
    /// Index 0: the flow exists but has not started.
    Start,
    Sign,
    SubmitSecret,
    SyncBalance,
    #[serde(rename = "lock-btc")]
    LockUtxo,
    #[serde(rename = "wait-lock-point")]
    WaitLockAccount,
    #[serde(rename = "withdraw-point")]
    WithdrawAccount,
    #[serde(rename = "wait-lock-btc")]
    WaitLockUtxo,
    VerifyScript,
    #[serde(rename = "lock-point")]
    LockAccount,
    #[serde(rename = "wait-withdraw-point")]
    WaitWithdrawAccount,
    #[serde(rename = "withdraw-btc")]
    WithdrawUtxo,
    Finish,
    End,
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::Start => "start",
            Step::Sign => "sign",
            Step::SubmitSecret => "submit-secret",
            Step::SyncBalance => "sync-balance",
            Step::LockUtxo => "lock-btc",
            Step::WaitLockAccount => "wait-lock-point",
            Step::WithdrawAccount => "withdraw-point",
            Step::WaitLockUtxo => "wait-lock-btc",
            Step::VerifyScript => "verify-script",
            Step::LockAccount => "lock-point",
            Step::WaitWithdrawAccount => "wait-withdraw-point",
            Step::WithdrawUtxo => "withdraw-btc",
            Step::Finish => "finish",
            Step::End => "end",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Step::End)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The two flow variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowKind {
    /// Locks the UTXO-chain asset first and owns the secret.
    Owner,
    /// Locks the account-chain asset second and learns the secret on-chain.
    Participant,
}

const OWNER_STEPS: &[Step] = &[
    Step::Start,
    Step::Sign,
    Step::SubmitSecret,
    Step::SyncBalance,
    Step::LockUtxo,
    Step::WaitLockAccount,
    Step::WithdrawAccount,
    Step::Finish,
    Step::End,
];

const PARTICIPANT_STEPS: &[Step] = &[
    Step::Start,
    Step::Sign,
    Step::WaitLockUtxo,
    Step::VerifyScript,
    Step::SyncBalance,
    Step::LockAccount,
    Step::WaitWithdrawAccount,
    Step::WithdrawUtxo,
    Step::Finish,
    Step::End,
];

impl FlowKind {
    pub fn steps(&self) -> &'static [Step] {
        match self {
            FlowKind::Owner => OWNER_STEPS,
            FlowKind::Participant => PARTICIPANT_STEPS,
        }
    }

    pub fn index_of(&self, step: Step) -> Option<usize> {
        self.steps().iter().position(|s| *s == step)
    }

    /// Step at `index`; indices past the table clamp to the terminal step.
    pub fn step_at(&self, index: usize) -> Step {
        let steps = self.steps();
        steps.get(index).copied().unwrap_or(steps[steps.len() - 1])
    }
}

impl fmt::Display for FlowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowKind::Owner => write!(f, "owner"),
            FlowKind::Participant => write!(f, "participant"),
        }
    }
}

impl FromStr for FlowKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "owner" => Ok(FlowKind::Owner),
            "participant" => Ok(FlowKind::Participant),
            other => Err(format!("unknown flow kind: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_indices_are_stable() {
        let owner: Vec<(&str, usize)> = OWNER_STEPS
            .iter()
            .map(|s| (s.name(), FlowKind::Owner.index_of(*s).unwrap()))
            .collect();
        assert_eq!(
            owner,
            vec![
                ("start", 0),
                ("sign", 1),
                ("submit-secret", 2),
                ("sync-balance", 3),
                ("lock-btc", 4),
                ("wait-lock-point", 5),
                ("withdraw-point", 6),
                ("finish", 7),
                ("end", 8),
            ]
        );

        let participant = FlowKind::Participant;
        assert_eq!(participant.index_of(Step::Sign), Some(1));
        assert_eq!(participant.index_of(Step::WaitLockUtxo), Some(2));
        assert_eq!(participant.index_of(Step::VerifyScript), Some(3));
        assert_eq!(participant.index_of(Step::SyncBalance), Some(4));
        assert_eq!(participant.index_of(Step::LockAccount), Some(5));
        assert_eq!(participant.index_of(Step::WaitWithdrawAccount), Some(6));
        assert_eq!(participant.index_of(Step::WithdrawUtxo), Some(7));
        assert_eq!(participant.index_of(Step::Finish), Some(8));
        assert_eq!(participant.index_of(Step::End), Some(9));
    }

    #[test]
    fn test_step_serde_names_match_display() {
        for step in OWNER_STEPS.iter().chain(PARTICIPANT_STEPS) {
            let json = serde_json::to_value(step).unwrap();
            assert_eq!(json, serde_json::Value::String(step.name().to_string()));
        }
    }

    #[test]
    fn test_step_at_clamps() {
        assert_eq!(FlowKind::Owner.step_at(42), Step::End);
        assert_eq!(FlowKind::Participant.index_of(Step::SubmitSecret), None);
    }
}
