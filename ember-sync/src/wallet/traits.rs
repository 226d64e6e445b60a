//! Traits for interfacing a wallet with the sync engine.
//!
//! The engine owns no wallet state: everything it learns from the server is
//! pushed through this narrow surface. A wallet brings its own error type
//! and storage discipline; in-memory maps and database-backed stores both
//! fit.

use crate::wallet::{KeyScope, KeyScript, OutPoint, Stxo, Subscription, TxRecord, Utxo};

/// Base trait: subscriptions, script ownership and the chain tip.
pub trait SyncWallet {
    /// Errors raised by the wallet's own storage.
    type Error: std::fmt::Debug + std::fmt::Display + std::error::Error;

    /// Every subscription on record.
    fn subscriptions(&self) -> Result<Vec<Subscription>, Self::Error>;

    /// Looks up a subscription by its electrum scripthash.
    fn subscription_for_scripthash(
        &self,
        scripthash: &str,
    ) -> Result<Option<Subscription>, Self::Error>;

    /// Looks up a subscription by output script hex.
    fn subscription_for_script(
        &self,
        pk_script: &str,
    ) -> Result<Option<Subscription>, Self::Error>;

    /// Records a subscription. Inserting an existing script is a no-op.
    fn add_subscription(&mut self, subscription: Subscription) -> Result<(), Self::Error>;

    /// Drops the subscription keyed on `pk_script`, if present.
    fn remove_subscription(&mut self, pk_script: &str) -> Result<(), Self::Error>;

    /// Whether `pk_script` pays a script this wallet owns or watches.
    fn is_mine_script(&self, pk_script: &[u8]) -> Result<bool, Self::Error>;

    /// Rendered address for a wallet-owned script, when known. Used to
    /// label subscription records.
    fn address_for_script(&self, pk_script: &[u8]) -> Result<Option<String>, Self::Error>;

    /// The wallet's notion of the chain tip, used for confirmation counts.
    fn tip(&self) -> Result<i64, Self::Error>;

    /// Advisory tip update from the header sync fan-out.
    fn update_tip(&mut self, height: i64) -> Result<(), Self::Error>;
}

/// Transaction records.
pub trait SyncTransactions: SyncWallet {
    /// Fetches a record by txid.
    fn transaction(&self, txid: &str) -> Result<Option<TxRecord>, Self::Error>;

    /// All records.
    fn transactions(&self) -> Result<Vec<TxRecord>, Self::Error>;

    /// Inserts or updates a record. An update may promote a mempool height
    /// to a confirmed one; a confirmed height is only ever reverted by
    /// explicit reorg repair.
    fn put_transaction(&mut self, record: TxRecord) -> Result<(), Self::Error>;

    /// Whether a confirmed record for `txid` exists.
    fn has_confirmed_transaction(&self, txid: &str) -> Result<bool, Self::Error> {
        Ok(self
            .transaction(txid)?
            .map(|record| record.height > 0)
            .unwrap_or(false))
    }
}

/// The UTXO / STXO ledger.
pub trait SyncOutputs: SyncWallet {
    /// All unspent outputs.
    fn utxos(&self) -> Result<Vec<Utxo>, Self::Error>;

    /// All spent outputs.
    fn stxos(&self) -> Result<Vec<Stxo>, Self::Error>;

    /// Fetches one unspent output.
    fn utxo(&self, outpoint: &OutPoint) -> Result<Option<Utxo>, Self::Error>;

    /// Whether `outpoint` is already recorded as spent.
    fn has_stxo(&self, outpoint: &OutPoint) -> Result<bool, Self::Error>;

    /// Adds an unspent output. Re-adding an existing outpoint updates its
    /// height (mempool outputs confirm in place).
    fn add_utxo(&mut self, utxo: Utxo) -> Result<(), Self::Error>;

    /// Moves an output from the unspent to the spent table. Returns the
    /// resulting record, or `None` when the outpoint was not a known utxo.
    fn spend_utxo(
        &mut self,
        outpoint: &OutPoint,
        spend_height: i64,
        spend_txid: &str,
    ) -> Result<Option<Stxo>, Self::Error>;

    /// Marks an output unspendable for coin selection.
    fn freeze_utxo(&mut self, outpoint: &OutPoint) -> Result<(), Self::Error>;

    /// Makes a frozen output spendable again.
    fn unfreeze_utxo(&mut self, outpoint: &OutPoint) -> Result<(), Self::Error>;
}

/// The key ring: derived-script bookkeeping and the gap-limit window.
///
/// Key derivation itself (BIP32 and friends) stays behind this trait; the
/// engine only ever sees scripts and addresses.
pub trait SyncKeys: SyncWallet {
    /// The scripts of every not-yet-used key inside the lookahead window
    /// for `scope`.
    fn unused_scripts(&self, scope: KeyScope) -> Result<Vec<KeyScript>, Self::Error>;

    /// Marks the key paying `pk_script` as used and extends the window so
    /// that the trailing run of unused keys regains its configured size.
    fn mark_script_used(&mut self, pk_script: &[u8]) -> Result<(), Self::Error>;

    /// The first unused key for `scope`, deriving if the window is empty.
    fn unused_key(&mut self, scope: KeyScope) -> Result<KeyScript, Self::Error>;
}
