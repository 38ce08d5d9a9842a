//! In-process ledger used by tests and the CLI demo.
//!
//! A `MemoryLedger` is a wallet bound to one address on a shared simulated
//! chain; cloning the chain with [`MemoryLedger::wallet`] gives the other
//! party its own view of the same ledger.

use super::{Ledger, LedgerError, LedgerErrorKind, LedgerResult};
use crate::secret::Secret;
use crate::types::{utc_now, ScriptAddress, ScriptExpectation, ScriptValues, TxHash};
use async_trait::async_trait;
use bitcoin::hashes::{ripemd160, Hash};
use bitcoin::Amount;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone)]
enum TxKind {
    Fund,
    Withdraw(Secret),
    Refund,
}

#[derive(Debug, Clone)]
struct HtlcEntry {
    values: ScriptValues,
    balance: Amount,
    funder: String,
}

#[derive(Debug, Default)]
struct ChainState {
    balances: HashMap<String, Amount>,
    /// public key -> address
    accounts: HashMap<String, String>,
    scripts: HashMap<String, HtlcEntry>,
    txs: HashMap<TxHash, TxKind>,
    pending_failures: VecDeque<LedgerError>,
    time_offset: i64,
}

impl ChainState {
    fn now(&self) -> i64 {
        utc_now() + self.time_offset
    }

    fn take_failure(&mut self) -> LedgerResult<()> {
        match self.pending_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn record(&mut self, kind: TxKind) -> TxHash {
        let hash = TxHash::new(Uuid::new_v4().simple().to_string());
        self.txs.insert(hash.clone(), kind);
        hash
    }

    /// Whether `entry` was funded by `owner` and pays out to `participant`.
    fn is_between(&self, entry: &HtlcEntry, owner: &str, participant: &str) -> bool {
        entry.funder == owner
            && self
                .accounts
                .get(&entry.values.recipient_public_key)
                .is_some_and(|address| address == participant)
    }

    fn credit(&mut self, address: &str, amount: Amount) {
        let balance = self.balances.entry(address.to_string()).or_insert(Amount::ZERO);
        *balance += amount;
    }
}

#[derive(Clone)]
pub struct MemoryLedger {
    chain: Arc<Mutex<ChainState>>,
    address: String,
}

impl MemoryLedger {
    /// New chain with a wallet for `address` / `public_key`.
    pub fn new(address: impl Into<String>, public_key: impl Into<String>) -> Self {
        let ledger = Self {
            chain: Arc::new(Mutex::new(ChainState::default())),
            address: address.into(),
        };
        ledger
            .chain
            .lock()
            .accounts
            .insert(public_key.into(), ledger.address.clone());
        ledger
    }

    /// Another wallet on the same chain.
    pub fn wallet(&self, address: impl Into<String>, public_key: impl Into<String>) -> Self {
        let address = address.into();
        self.chain
            .lock()
            .accounts
            .insert(public_key.into(), address.clone());
        Self {
            chain: self.chain.clone(),
            address,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn deposit(&self, address: &str, amount: Amount) {
        self.chain.lock().credit(address, amount);
    }

    pub fn balance_of(&self, address: &str) -> Amount {
        self.chain
            .lock()
            .balances
            .get(address)
            .copied()
            .unwrap_or(Amount::ZERO)
    }

    /// Make the next mutating call fail with `err`.
    pub fn fail_next(&self, err: LedgerError) {
        self.chain.lock().pending_failures.push_back(err);
    }

    /// Move the chain clock forward, e.g. past a lock time.
    pub fn advance_time(&self, seconds: i64) {
        self.chain.lock().time_offset += seconds;
    }

    /// Drop a transaction from the chain, as a reorg would.
    pub fn forget_tx(&self, tx_hash: &TxHash) {
        self.chain.lock().txs.remove(tx_hash);
    }

    fn script_address(values: &ScriptValues) -> LedgerResult<String> {
        let encoded = serde_json::to_vec(values)
            .map_err(|e| LedgerError::new(LedgerErrorKind::Other, e.to_string()))?;
        let digest = ripemd160::Hash::hash(&encoded).to_byte_array();
        Ok(format!("htlc-{}", hex::encode(digest)))
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn fund_script(&self, values: &ScriptValues, amount: Amount) -> LedgerResult<TxHash> {
        let address = Self::script_address(values)?;
        let mut chain = self.chain.lock();
        chain.take_failure()?;

        let available = chain
            .balances
            .get(&self.address)
            .copied()
            .unwrap_or(Amount::ZERO);
        if available < amount {
            return Err(LedgerError::rejected(format!(
                "insufficient funds: need {}, have {}",
                amount, available
            )));
        }
        chain.balances.insert(self.address.clone(), available - amount);

        let entry = chain.scripts.entry(address).or_insert_with(|| HtlcEntry {
            values: values.clone(),
            balance: Amount::ZERO,
            funder: self.address.clone(),
        });
        entry.balance += amount;

        Ok(chain.record(TxKind::Fund))
    }

    async fn withdraw(&self, values: &ScriptValues, secret: &Secret) -> LedgerResult<TxHash> {
        let address = Self::script_address(values)?;
        let mut chain = self.chain.lock();
        chain.take_failure()?;

        let entry = chain
            .scripts
            .get_mut(&address)
            .ok_or_else(|| LedgerError::not_found(format!("script {} not found", address)))?;
        if entry.balance == Amount::ZERO {
            return Err(LedgerError::rejected("nothing to withdraw"));
        }
        if !values.secret_hash.verify(secret) {
            return Err(LedgerError::new(
                LedgerErrorKind::OutOfGas,
                "out of gas: secret does not open the script",
            ));
        }

        let amount = entry.balance;
        entry.balance = Amount::ZERO;
        chain.credit(&self.address, amount);
        Ok(chain.record(TxKind::Withdraw(*secret)))
    }

    async fn refund(&self, values: &ScriptValues, _secret: Option<&Secret>) -> LedgerResult<TxHash> {
        let address = Self::script_address(values)?;
        let mut chain = self.chain.lock();
        chain.take_failure()?;

        let now = chain.now();
        let entry = chain
            .scripts
            .get_mut(&address)
            .ok_or_else(|| LedgerError::not_found(format!("script {} not found", address)))?;
        if now < entry.values.lock_time {
            return Err(LedgerError::rejected(format!(
                "lock time {} not reached (now {})",
                entry.values.lock_time, now
            )));
        }
        if entry.balance == Amount::ZERO {
            return Err(LedgerError::rejected("nothing to refund"));
        }

        let amount = entry.balance;
        let funder = entry.funder.clone();
        entry.balance = Amount::ZERO;
        chain.credit(&funder, amount);
        Ok(chain.record(TxKind::Refund))
    }

    async fn refund_tx_hex(
        &self,
        values: &ScriptValues,
        _secret: Option<&Secret>,
    ) -> LedgerResult<String> {
        let encoded = serde_json::to_vec(values)
            .map_err(|e| LedgerError::new(LedgerErrorKind::Other, e.to_string()))?;
        Ok(hex::encode(encoded))
    }

    async fn get_balance(&self, address: &str) -> LedgerResult<Amount> {
        let chain = self.chain.lock();
        if let Some(entry) = chain.scripts.get(address) {
            return Ok(entry.balance);
        }
        Ok(chain.balances.get(address).copied().unwrap_or(Amount::ZERO))
    }

    async fn fetch_balance(&self, address: &str) -> LedgerResult<Amount> {
        self.get_balance(address).await
    }

    async fn check_balance(
        &self,
        owner_address: &str,
        participant_address: &str,
        expected: Amount,
    ) -> LedgerResult<Option<String>> {
        let chain = self.chain.lock();
        let held = chain
            .scripts
            .values()
            .filter(|entry| chain.is_between(entry, owner_address, participant_address))
            .fold(Amount::ZERO, |total, entry| total + entry.balance);

        if held == expected {
            Ok(None)
        } else {
            Ok(Some(format!(
                "Expected {} locked by {} for {}, found {}",
                expected, owner_address, participant_address, held
            )))
        }
    }

    async fn check_script(
        &self,
        values: &ScriptValues,
        expected: &ScriptExpectation,
    ) -> LedgerResult<Option<String>> {
        let address = Self::script_address(values)?;
        let balance = self.get_balance(&address).await?;

        if balance < expected.value {
            return Ok(Some(format!(
                "Expected script value: {}, got: {}",
                expected.value, balance
            )));
        }
        if values.recipient_public_key != expected.recipient_public_key {
            return Ok(Some(format!(
                "Expected recipientPublicKey: {}, got: {}",
                expected.recipient_public_key, values.recipient_public_key
            )));
        }
        if values.lock_time < expected.lock_time {
            return Ok(Some(format!(
                "Expected lockTime: {}, got: {}",
                expected.lock_time, values.lock_time
            )));
        }
        Ok(None)
    }

    fn create_script(&self, values: &ScriptValues) -> LedgerResult<ScriptAddress> {
        Ok(ScriptAddress {
            address: Self::script_address(values)?,
        })
    }

    async fn get_secret_from_tx_hash(&self, tx_hash: &TxHash) -> LedgerResult<Option<Secret>> {
        let chain = self.chain.lock();
        match chain.txs.get(tx_hash) {
            Some(TxKind::Withdraw(secret)) => Ok(Some(*secret)),
            Some(_) => Ok(None),
            None => Err(LedgerError::not_found(format!("tx {} not found", tx_hash))),
        }
    }

    async fn check_tx(&self, tx_hash: &TxHash) -> LedgerResult<bool> {
        Ok(self.chain.lock().txs.contains_key(tx_hash))
    }

    async fn swap_exists(
        &self,
        owner_address: &str,
        participant_address: &str,
    ) -> LedgerResult<bool> {
        let chain = self.chain.lock();
        Ok(chain.scripts.values().any(|entry| {
            entry.balance > Amount::ZERO
                && chain.is_between(entry, owner_address, participant_address)
        }))
    }
}
