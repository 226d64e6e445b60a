//! The concrete wallet: an in-memory ledger implementing the sync engine's
//! collaborator traits, plus the gap-limited key ring.
//!
//! Key derivation itself is pluggable through [`KeySource`]; the wallet
//! only tracks which derived scripts exist and which have been used.
//! Persistence is a storage concern layered on top by embedders; the maps
//! here are the canonical in-memory shape.

use std::collections::HashMap;

use ember_sync::tx::Transaction;
use ember_sync::wallet::traits::{SyncKeys, SyncOutputs, SyncTransactions, SyncWallet};
use ember_sync::wallet::{KeyScope, KeyScript, OutPoint, Stxo, Subscription, TxRecord, Utxo};

/// Errors raised by the wallet ledger.
#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    /// The outpoint is not in the unspent table.
    #[error("unknown outpoint {0}")]
    UnknownOutpoint(String),
    /// A transaction record's raw bytes failed to parse.
    #[error("stored transaction {0} is corrupt")]
    CorruptTransaction(String),
}

/// External key derivation, kept behind a trait so that BIP32 and friends
/// stay out of the wallet core. Implementations must be deterministic per
/// `(scope, index)`.
pub trait KeySource: Send + Sync {
    /// Returns the output script and rendered address of the key at
    /// `index` under `scope`.
    fn derive(&self, scope: KeyScope, index: u32) -> (Vec<u8>, String);
}

struct KeyEntry {
    key: KeyScript,
    used: bool,
}

/// Derived-key bookkeeping with a lookahead window per branch.
pub struct KeyRing {
    source: Box<dyn KeySource>,
    gap_limit: usize,
    external: Vec<KeyEntry>,
    internal: Vec<KeyEntry>,
}

impl KeyRing {
    /// Builds a ring and derives the initial window on both branches.
    pub fn new(source: Box<dyn KeySource>, gap_limit: usize) -> Self {
        let mut ring = KeyRing {
            source,
            gap_limit,
            external: Vec::new(),
            internal: Vec::new(),
        };
        ring.extend_window(KeyScope::External);
        ring.extend_window(KeyScope::Internal);
        ring
    }

    fn branch(&self, scope: KeyScope) -> &Vec<KeyEntry> {
        match scope {
            KeyScope::External => &self.external,
            KeyScope::Internal => &self.internal,
        }
    }

    fn branch_mut(&mut self, scope: KeyScope) -> &mut Vec<KeyEntry> {
        match scope {
            KeyScope::External => &mut self.external,
            KeyScope::Internal => &mut self.internal,
        }
    }

    fn trailing_unused(&self, scope: KeyScope) -> usize {
        self.branch(scope)
            .iter()
            .rev()
            .take_while(|entry| !entry.used)
            .count()
    }

    /// Derives keys until the trailing unused run equals the gap limit.
    fn extend_window(&mut self, scope: KeyScope) {
        while self.trailing_unused(scope) < self.gap_limit {
            let index = self.branch(scope).len() as u32;
            let (pk_script, address) = self.source.derive(scope, index);
            self.branch_mut(scope).push(KeyEntry {
                key: KeyScript {
                    pk_script,
                    address,
                    scope,
                },
                used: false,
            });
        }
    }

    fn find(&self, pk_script: &[u8]) -> Option<(KeyScope, usize)> {
        for scope in [KeyScope::External, KeyScope::Internal] {
            if let Some(index) = self
                .branch(scope)
                .iter()
                .position(|entry| entry.key.pk_script == pk_script)
            {
                return Some((scope, index));
            }
        }
        None
    }

    fn owns(&self, pk_script: &[u8]) -> bool {
        self.find(pk_script).is_some()
    }

    fn address_of(&self, pk_script: &[u8]) -> Option<String> {
        self.find(pk_script)
            .map(|(scope, index)| self.branch(scope)[index].key.address.clone())
    }

    fn mark_used(&mut self, pk_script: &[u8]) {
        if let Some((scope, index)) = self.find(pk_script) {
            self.branch_mut(scope)[index].used = true;
            self.extend_window(scope);
        }
    }

    fn unused(&self, scope: KeyScope) -> Vec<KeyScript> {
        self.branch(scope)
            .iter()
            .filter(|entry| !entry.used)
            .map(|entry| entry.key.clone())
            .collect()
    }

    fn first_unused(&mut self, scope: KeyScope) -> KeyScript {
        self.extend_window(scope);
        self.branch(scope)
            .iter()
            .find(|entry| !entry.used)
            .map(|entry| entry.key.clone())
            .expect("window extension guarantees an unused key")
    }
}

/// Key source over externally supplied scripts, for watch-only wallets
/// where real derivation lives elsewhere. Indexes past the supplied lists
/// produce unique unspendable placeholder scripts so the gap window can
/// always extend.
pub struct StaticKeySource {
    /// Receiving scripts with their addresses.
    pub external: Vec<(Vec<u8>, String)>,
    /// Change scripts with their addresses.
    pub internal: Vec<(Vec<u8>, String)>,
}

impl KeySource for StaticKeySource {
    fn derive(&self, scope: KeyScope, index: u32) -> (Vec<u8>, String) {
        let (list, tag) = match scope {
            KeyScope::External => (&self.external, 0x00u8),
            KeyScope::Internal => (&self.internal, 0x01u8),
        };
        match list.get(index as usize) {
            Some((script, address)) => (script.clone(), address.clone()),
            None => {
                let mut script = vec![0x6a, tag];
                script.extend_from_slice(&index.to_le_bytes());
                (script, format!("placeholder-{tag}-{index}"))
            }
        }
    }
}

/// Aggregate balance snapshot, base units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Balance {
    /// Value of confirmed spendable outputs. Change from a spend of
    /// confirmed coins counts here even while its transaction is
    /// unconfirmed: if the spend never mines, no coins are lost.
    pub confirmed: i64,
    /// Value of other unconfirmed outputs.
    pub unconfirmed: i64,
    /// Value of frozen outputs.
    pub locked: i64,
}

/// The in-memory wallet.
pub struct MemoryWallet {
    subs: HashMap<String, Subscription>,
    by_scripthash: HashMap<String, String>,
    txns: HashMap<String, TxRecord>,
    utxos: HashMap<OutPoint, Utxo>,
    stxos: HashMap<OutPoint, Stxo>,
    keys: KeyRing,
    tip: i64,
}

impl MemoryWallet {
    /// A wallet over the given key source.
    pub fn new(source: Box<dyn KeySource>, gap_limit: usize) -> Self {
        MemoryWallet {
            subs: HashMap::new(),
            by_scripthash: HashMap::new(),
            txns: HashMap::new(),
            utxos: HashMap::new(),
            stxos: HashMap::new(),
            keys: KeyRing::new(source, gap_limit),
            tip: 0,
        }
    }

    /// All unspent outputs.
    #[must_use]
    pub fn list_unspent(&self) -> Vec<Utxo> {
        self.utxos.values().cloned().collect()
    }

    /// Unspent outputs mined at least once.
    #[must_use]
    pub fn list_confirmed_unspent(&self) -> Vec<Utxo> {
        self.utxos
            .values()
            .filter(|utxo| utxo.at_height > 0)
            .cloned()
            .collect()
    }

    /// Frozen unspent outputs.
    #[must_use]
    pub fn list_frozen_unspent(&self) -> Vec<Utxo> {
        self.utxos
            .values()
            .filter(|utxo| utxo.frozen)
            .cloned()
            .collect()
    }

    /// All spent outputs.
    #[must_use]
    pub fn list_spent(&self) -> Vec<Stxo> {
        self.stxos.values().cloned().collect()
    }

    /// Whether every input of the transaction that funded `utxo` spends an
    /// output this wallet owned. Such change stays "confirmed" for balance
    /// purposes even before the spend mines.
    fn is_change_of_own_spend(&self, utxo: &Utxo) -> bool {
        let Some(record) = self.txns.get(&utxo.outpoint.txid) else {
            return false;
        };
        let Ok(tx) = Transaction::decode(&record.raw) else {
            return false;
        };
        tx.inputs.iter().all(|input| {
            let outpoint = OutPoint::new(input.prev_txid_hex(), input.prev_vout);
            self.stxos.contains_key(&outpoint)
        })
    }

    /// Confirmed / unconfirmed / locked balance.
    #[must_use]
    pub fn balance(&self) -> Balance {
        let mut balance = Balance {
            confirmed: 0,
            unconfirmed: 0,
            locked: 0,
        };
        for utxo in self.utxos.values() {
            if utxo.frozen {
                balance.locked += utxo.value;
            } else if utxo.at_height > 0 || self.is_change_of_own_spend(utxo) {
                balance.confirmed += utxo.value;
            } else {
                balance.unconfirmed += utxo.value;
            }
        }
        balance
    }

    /// A transaction record plus its confirmation count against the
    /// wallet's tip.
    #[must_use]
    pub fn transaction_with_confirmations(&self, txid: &str) -> Option<(i64, TxRecord)> {
        let record = self.txns.get(txid)?.clone();
        let confirmations = if record.height > 0 {
            (self.tip - record.height + 1).max(0)
        } else {
            0
        };
        Some((confirmations, record))
    }

}

impl SyncWallet for MemoryWallet {
    type Error = WalletError;

    fn subscriptions(&self) -> Result<Vec<Subscription>, WalletError> {
        Ok(self.subs.values().cloned().collect())
    }

    fn subscription_for_scripthash(
        &self,
        scripthash: &str,
    ) -> Result<Option<Subscription>, WalletError> {
        Ok(self
            .by_scripthash
            .get(scripthash)
            .and_then(|pk_script| self.subs.get(pk_script))
            .cloned())
    }

    fn subscription_for_script(
        &self,
        pk_script: &str,
    ) -> Result<Option<Subscription>, WalletError> {
        Ok(self.subs.get(pk_script).cloned())
    }

    fn add_subscription(&mut self, subscription: Subscription) -> Result<(), WalletError> {
        self.by_scripthash.insert(
            subscription.electrum_scripthash.clone(),
            subscription.pk_script.clone(),
        );
        self.subs
            .entry(subscription.pk_script.clone())
            .or_insert(subscription);
        Ok(())
    }

    fn remove_subscription(&mut self, pk_script: &str) -> Result<(), WalletError> {
        if let Some(removed) = self.subs.remove(pk_script) {
            self.by_scripthash.remove(&removed.electrum_scripthash);
        }
        Ok(())
    }

    fn is_mine_script(&self, pk_script: &[u8]) -> Result<bool, WalletError> {
        Ok(self.keys.owns(pk_script))
    }

    fn address_for_script(&self, pk_script: &[u8]) -> Result<Option<String>, WalletError> {
        Ok(self.keys.address_of(pk_script))
    }

    fn tip(&self) -> Result<i64, WalletError> {
        Ok(self.tip)
    }

    fn update_tip(&mut self, height: i64) -> Result<(), WalletError> {
        self.tip = height;
        Ok(())
    }
}

impl SyncTransactions for MemoryWallet {
    fn transaction(&self, txid: &str) -> Result<Option<TxRecord>, WalletError> {
        Ok(self.txns.get(txid).cloned())
    }

    fn transactions(&self) -> Result<Vec<TxRecord>, WalletError> {
        Ok(self.txns.values().cloned().collect())
    }

    fn put_transaction(&mut self, record: TxRecord) -> Result<(), WalletError> {
        match self.txns.get_mut(&record.txid) {
            Some(existing) => {
                // a confirmed height only moves by explicit reorg repair
                if record.height > 0 || existing.height <= 0 {
                    existing.height = record.height;
                }
                existing.value = record.value;
                existing.raw = record.raw;
            }
            None => {
                self.txns.insert(record.txid.clone(), record);
            }
        }
        Ok(())
    }
}

impl SyncOutputs for MemoryWallet {
    fn utxos(&self) -> Result<Vec<Utxo>, WalletError> {
        Ok(self.list_unspent())
    }

    fn stxos(&self) -> Result<Vec<Stxo>, WalletError> {
        Ok(self.list_spent())
    }

    fn utxo(&self, outpoint: &OutPoint) -> Result<Option<Utxo>, WalletError> {
        Ok(self.utxos.get(outpoint).cloned())
    }

    fn has_stxo(&self, outpoint: &OutPoint) -> Result<bool, WalletError> {
        Ok(self.stxos.contains_key(outpoint))
    }

    fn add_utxo(&mut self, utxo: Utxo) -> Result<(), WalletError> {
        match self.utxos.get_mut(&utxo.outpoint) {
            Some(existing) => {
                // mempool outputs confirm in place, freeze state survives
                existing.at_height = utxo.at_height;
                existing.value = utxo.value;
            }
            None => {
                self.utxos.insert(utxo.outpoint.clone(), utxo);
            }
        }
        Ok(())
    }

    fn spend_utxo(
        &mut self,
        outpoint: &OutPoint,
        spend_height: i64,
        spend_txid: &str,
    ) -> Result<Option<Stxo>, WalletError> {
        Ok(self.utxos.remove(outpoint).map(|utxo| {
            let stxo = Stxo {
                utxo,
                spend_height,
                spend_txid: spend_txid.to_string(),
            };
            self.stxos.insert(outpoint.clone(), stxo.clone());
            stxo
        }))
    }

    fn freeze_utxo(&mut self, outpoint: &OutPoint) -> Result<(), WalletError> {
        self.utxos
            .get_mut(outpoint)
            .map(|utxo| utxo.frozen = true)
            .ok_or_else(|| WalletError::UnknownOutpoint(outpoint.to_string()))
    }

    fn unfreeze_utxo(&mut self, outpoint: &OutPoint) -> Result<(), WalletError> {
        self.utxos
            .get_mut(outpoint)
            .map(|utxo| utxo.frozen = false)
            .ok_or_else(|| WalletError::UnknownOutpoint(outpoint.to_string()))
    }
}

impl SyncKeys for MemoryWallet {
    fn unused_scripts(&self, scope: KeyScope) -> Result<Vec<KeyScript>, WalletError> {
        Ok(self.keys.unused(scope))
    }

    fn mark_script_used(&mut self, pk_script: &[u8]) -> Result<(), WalletError> {
        self.keys.mark_used(pk_script);
        Ok(())
    }

    fn unused_key(&mut self, scope: KeyScope) -> Result<KeyScript, WalletError> {
        Ok(self.keys.first_unused(scope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_sync::tx::{TxIn, TxOut};

    /// Deterministic scripts for tests: `[tag, index]`.
    pub(crate) struct StubKeys;

    impl KeySource for StubKeys {
        fn derive(&self, scope: KeyScope, index: u32) -> (Vec<u8>, String) {
            let tag = match scope {
                KeyScope::External => 0xe0,
                KeyScope::Internal => 0x10,
            };
            (vec![tag, index as u8], format!("stub-{scope:?}-{index}"))
        }
    }

    fn wallet() -> MemoryWallet {
        MemoryWallet::new(Box::new(StubKeys), 3)
    }

    fn utxo(txid: &str, vout: u32, value: i64, height: i64) -> Utxo {
        Utxo {
            outpoint: OutPoint::new(txid, vout),
            value,
            at_height: height,
            script_pubkey: vec![0xe0, 0],
            watch_only: false,
            frozen: false,
        }
    }

    #[test]
    fn gap_window_extends_on_use() {
        let mut wallet = wallet();
        assert_eq!(wallet.keys.unused(KeyScope::External).len(), 3);

        // using the first unused key derives exactly one key beyond the
        // old window
        wallet.keys.mark_used(&[0xe0, 0]);
        assert_eq!(wallet.keys.external.len(), 4);
        assert_eq!(wallet.keys.trailing_unused(KeyScope::External), 3);

        // internal branch is untouched
        assert_eq!(wallet.keys.internal.len(), 3);
    }

    #[test]
    fn unused_key_skips_used_ones() {
        let mut wallet = wallet();
        wallet.keys.mark_used(&[0xe0, 0]);
        let next = wallet.keys.first_unused(KeyScope::External);
        assert_eq!(next.pk_script, vec![0xe0, 1]);
    }

    #[test]
    fn confirmed_heights_are_not_demoted() {
        let mut wallet = wallet();
        let record = TxRecord {
            txid: "aa".into(),
            raw: vec![1],
            height: 50,
            first_seen: 1,
            watch_only: false,
            value: 10,
        };
        wallet.put_transaction(record.clone()).unwrap();

        let mut mempool_again = record.clone();
        mempool_again.height = 0;
        wallet.put_transaction(mempool_again).unwrap();
        assert_eq!(wallet.txns["aa"].height, 50);

        // a later confirmation (reorg repair path) does move it
        let mut reorged = record;
        reorged.height = 51;
        wallet.put_transaction(reorged).unwrap();
        assert_eq!(wallet.txns["aa"].height, 51);
    }

    #[test]
    fn balance_buckets() {
        let mut wallet = wallet();
        wallet.add_utxo(utxo("aa", 0, 100, 10)).unwrap();
        wallet.add_utxo(utxo("bb", 0, 30, 0)).unwrap();
        let mut frozen = utxo("cc", 0, 7, 12);
        frozen.frozen = true;
        wallet.utxos.insert(frozen.outpoint.clone(), frozen);

        let balance = wallet.balance();
        assert_eq!(balance.confirmed, 100);
        assert_eq!(balance.unconfirmed, 30);
        assert_eq!(balance.locked, 7);
    }

    #[test]
    fn change_of_own_spend_counts_as_confirmed() {
        let mut wallet = wallet();

        // the wallet spent its own confirmed coin; the spend is unmined
        let spend = Transaction {
            version: 2,
            inputs: vec![TxIn {
                prev_txid: [0x11; 32],
                prev_vout: 0,
                script_sig: Vec::new(),
                sequence: 0xffff_ffff,
                witness: Vec::new(),
            }],
            outputs: vec![TxOut {
                value: 40,
                script_pubkey: vec![0x10, 0],
            }],
            lock_time: 0,
        };
        let spent_outpoint = OutPoint::new(spend.inputs[0].prev_txid_hex(), 0);
        wallet.stxos.insert(
            spent_outpoint,
            Stxo {
                utxo: utxo("11", 0, 50, 5),
                spend_height: 0,
                spend_txid: spend.txid(),
            },
        );
        wallet
            .put_transaction(TxRecord {
                txid: spend.txid(),
                raw: spend.encode(true),
                height: 0,
                first_seen: 1,
                watch_only: false,
                value: -10,
            })
            .unwrap();
        wallet.add_utxo(utxo(&spend.txid(), 0, 40, 0)).unwrap();

        assert_eq!(wallet.balance().confirmed, 40);
        assert_eq!(wallet.balance().unconfirmed, 0);
    }

    #[test]
    fn freeze_requires_a_known_outpoint() {
        let mut wallet = wallet();
        wallet.add_utxo(utxo("aa", 1, 5, 3)).unwrap();
        wallet.freeze_utxo(&OutPoint::new("aa", 1)).unwrap();
        assert_eq!(wallet.list_frozen_unspent().len(), 1);
        wallet.unfreeze_utxo(&OutPoint::new("aa", 1)).unwrap();
        assert!(wallet.list_frozen_unspent().is_empty());
        assert!(wallet.freeze_utxo(&OutPoint::new("zz", 0)).is_err());
    }

    #[test]
    fn subscription_secondary_index() {
        let mut wallet = wallet();
        let sub = Subscription::for_script(&[0xe0, 0], "stub");
        wallet.add_subscription(sub.clone()).unwrap();
        let found = wallet
            .subscription_for_scripthash(&sub.electrum_scripthash)
            .unwrap()
            .unwrap();
        assert_eq!(found.pk_script, sub.pk_script);

        wallet.remove_subscription(&sub.pk_script).unwrap();
        assert!(wallet
            .subscription_for_scripthash(&sub.electrum_scripthash)
            .unwrap()
            .is_none());
    }

    #[test]
    fn confirmations_track_the_tip() {
        let mut wallet = wallet();
        wallet
            .put_transaction(TxRecord {
                txid: "aa".into(),
                raw: vec![],
                height: 90,
                first_seen: 1,
                watch_only: false,
                value: 1,
            })
            .unwrap();
        wallet.update_tip(99).unwrap();
        let (confirmations, _) = wallet.transaction_with_confirmations("aa").unwrap();
        assert_eq!(confirmations, 10);
    }
}
