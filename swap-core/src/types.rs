use crate::secret::SecretHash;
use bitcoin::Amount;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One side of the swap, named after the kind of ledger it settles on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Leg {
    Utxo,
    Account,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leg::Utxo => write!(f, "utxo"),
            Leg::Account => write!(f, "account"),
        }
    }
}

/// Public identity on a single chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainAccount {
    pub address: String,
    pub public_key: String,
}

impl ChainAccount {
    pub fn new(address: impl Into<String>, public_key: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            public_key: public_key.into(),
        }
    }
}

/// Public identity of a party on both chains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyKeys {
    pub utxo: ChainAccount,
    pub account: ChainAccount,
}

/// Transaction hash as reported by a ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHash(pub String);

impl TxHash {
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parameters of an HTLC lock script. Field names on the wire match what the
/// counterparty expects in `create btc script` / `create point script`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptValues {
    pub secret_hash: SecretHash,
    pub owner_public_key: String,
    pub recipient_public_key: String,
    /// Unix timestamp (seconds) after which the owner may refund.
    pub lock_time: i64,
}

/// Address a ledger derives for a set of script values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptAddress {
    pub address: String,
}

/// What a party expects of the counterparty's lock script before funding its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptExpectation {
    pub value: Amount,
    pub recipient_public_key: String,
    pub lock_time: i64,
}

pub fn utc_now() -> i64 {
    Utc::now().timestamp()
}
