//! Secret commitment for the HTLC pair.
//!
//! The owner picks a random 32-byte secret and publishes only
//! `RIPEMD160(secret)`. Withdrawing from the participant's lock reveals the
//! secret on-chain, which is what lets the participant claim the owner's lock.

pub mod refund;

use crate::error::{Result, SwapError};
use bitcoin::hashes::{ripemd160, Hash};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

pub const SECRET_SIZE: usize = 32;
pub const HASH_SIZE: usize = 20;

/// How a secret that does not hash to the committed value is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretPolicy {
    /// Refuse to use the secret.
    #[default]
    Reject,
    /// Log a warning and use it anyway.
    Warn,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Secret([u8; SECRET_SIZE]);

impl Secret {
    pub fn random() -> Self {
        let mut bytes = [0u8; SECRET_SIZE];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    #[cfg(test)]
    pub(crate) fn from_bytes(bytes: [u8; SECRET_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn hash(&self) -> SecretHash {
        SecretHash(ripemd160::Hash::hash(&self.0).to_byte_array())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for Secret {
    type Err = SwapError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| SwapError::InvalidSecret(e.to_string()))?;
        let bytes: [u8; SECRET_SIZE] = bytes.try_into().map_err(|v: Vec<u8>| {
            SwapError::InvalidSecret(format!("expected {} bytes, got {}", SECRET_SIZE, v.len()))
        })?;
        Ok(Self(bytes))
    }
}

// never print the raw secret in logs
impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(hash={})", self.hash())
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SecretHash([u8; HASH_SIZE]);

impl SecretHash {
    /// Whether `secret` opens this commitment.
    pub fn verify(&self, secret: &Secret) -> bool {
        secret.hash() == *self
    }
}

impl fmt::Display for SecretHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for SecretHash {
    type Err = SwapError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| SwapError::InvalidSecret(e.to_string()))?;
        let bytes: [u8; HASH_SIZE] = bytes.try_into().map_err(|v: Vec<u8>| {
            SwapError::InvalidSecret(format!("expected {} byte hash, got {}", HASH_SIZE, v.len()))
        })?;
        Ok(Self(bytes))
    }
}

impl Serialize for SecretHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SecretHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Check a candidate secret against the committed hash under `policy`.
///
/// Returns `Ok(true)` when the secret matches, `Ok(false)` when it does not
/// but the policy lets it through, and `Err(SecretMismatch)` otherwise.
pub fn check_secret(
    secret: &Secret,
    secret_hash: Option<&SecretHash>,
    policy: SecretPolicy,
) -> Result<bool> {
    let Some(expected) = secret_hash else {
        tracing::warn!("No secret hash recorded, cannot verify secret");
        return match policy {
            SecretPolicy::Reject => Err(SwapError::MissingSecretHash),
            SecretPolicy::Warn => Ok(false),
        };
    };

    if expected.verify(secret) {
        return Ok(true);
    }

    match policy {
        SecretPolicy::Reject => {
            tracing::error!(
                "Secret hash mismatch: expected {}, got {}",
                expected,
                secret.hash()
            );
            Err(SwapError::SecretMismatch)
        }
        SecretPolicy::Warn => {
            tracing::warn!(
                "Hash does not match! expected {}, got {}",
                expected,
                secret.hash()
            );
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commitment_scheme() {
        let secret = Secret::random();
        let hash = secret.hash();

        assert!(hash.verify(&secret));
        assert!(!hash.verify(&Secret::random()));
    }

    #[test]
    fn test_hash_is_deterministic() {
        let secret = Secret::from_bytes([7u8; SECRET_SIZE]);
        assert_eq!(secret.hash(), Secret::from_bytes([7u8; SECRET_SIZE]).hash());
        assert_eq!(secret.hash().to_string().len(), HASH_SIZE * 2);

        let parsed: SecretHash = secret.hash().to_string().parse().unwrap();
        assert_eq!(parsed, secret.hash());
    }

    #[test]
    fn test_secret_hex_parsing() {
        let secret = Secret::random();
        let parsed: Secret = secret.to_hex().parse().unwrap();
        assert_eq!(parsed, secret);

        assert!("abcd".parse::<Secret>().is_err());
        assert!("zz".parse::<Secret>().is_err());
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = Secret::random();
        let printed = format!("{:?}", secret);
        assert!(!printed.contains(&secret.to_hex()));
    }

    #[test]
    fn test_check_secret_policies() {
        let secret = Secret::random();
        let other = Secret::random();
        let hash = secret.hash();

        assert!(check_secret(&secret, Some(&hash), SecretPolicy::Reject).unwrap());
        assert!(matches!(
            check_secret(&other, Some(&hash), SecretPolicy::Reject),
            Err(SwapError::SecretMismatch)
        ));
        assert!(!check_secret(&other, Some(&hash), SecretPolicy::Warn).unwrap());
        assert!(check_secret(&secret, None, SecretPolicy::Reject).is_err());
    }
}
