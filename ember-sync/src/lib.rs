#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![doc = r#"
# Ember Sync

The wallet synchronization protocol layered on the ember ElectrumX engine.

The wallet is an external collaborator reached through the trait family in
[`wallet::traits`]: subscriptions, transaction records, the UTXO/STXO
ledger and the gap-limited key ring. The engine drives those traits from
server state:

- [`sync::sync`] re-arms stored subscriptions, then processes scripthash
  status notifications with per-scripthash ordering under a worker pool.
- [`sync::subscribe`] / [`sync::unsubscribe`] manage individual watches.
- [`sync::broadcast_with_change`] submits a signed transaction and
  atomically arranges the change-output watch, compensating if the watch
  setup fails.
- [`sync::rescan`] walks the key ring's gap-limit window for wallets
  recreated from a mnemonic.

Transactions are parsed with the small wire codec in [`tx`]; no script
execution, no signing, no fee policy.
"#]

pub mod error;
pub mod sync;
pub mod tx;
pub mod wallet;

pub use error::SyncError;
pub use sync::{
    broadcast_with_change, ingest_transaction, rescan, subscribe, sync, unsubscribe,
    IndexerClient, NetworkIndexer, GAP_LIMIT, STATUS_WORKERS,
};
pub use tx::{Transaction, TxDecodeError, TxIn, TxOut};
