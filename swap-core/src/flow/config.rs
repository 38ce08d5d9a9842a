use crate::error::{Result, SwapError};
use crate::secret::SecretPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// How often on-chain conditions are re-checked and requests re-sent.
    pub poll_interval: Duration,
    /// Lock duration of the party that locks first (owner).
    pub initiator_lock: Duration,
    /// Lock duration of the party that locks second (participant).
    /// Must be shorter than `initiator_lock`.
    pub responder_lock: Duration,
    pub secret_policy: SecretPolicy,
    /// Owner generates and submits its own secret on reaching the commitment step.
    pub auto_secret: bool,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(20),
            initiator_lock: Duration::from_secs(3 * 3600), // 3 hours
            responder_lock: Duration::from_secs(3600),     // 1 hour
            secret_policy: SecretPolicy::Reject,
            auto_secret: false,
        }
    }
}

impl FlowConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(SwapError::config("Poll interval must be greater than 0"));
        }

        if self.responder_lock >= self.initiator_lock {
            return Err(SwapError::config(format!(
                "Responder lock ({}s) must expire before initiator lock ({}s)",
                self.responder_lock.as_secs(),
                self.initiator_lock.as_secs()
            )));
        }

        Ok(())
    }

    pub fn initiator_lock_secs(&self) -> i64 {
        self.initiator_lock.as_secs() as i64
    }

    pub fn responder_lock_secs(&self) -> i64 {
        self.responder_lock.as_secs() as i64
    }
}
