#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![doc = r#"
# emberlib

A light (SPV-style) multi-coin wallet client for ElectrumX-indexed chains.
The library never runs a full node: chain data comes from remote servers
through the `ember-electrum` engine, the wallet holds keys and builds its
ledger from scripthash subscriptions driven by `ember-sync`.

[`client::EmberClient`] ties it together: start the network engine against
a trusted server, run the sync protocol over the wallet, broadcast signed
transactions with automatic change-address follow-up, and answer the usual
console queries (balance, unspent lists, fresh addresses, fee rates).

Key derivation and transaction signing stay outside, behind
[`wallet::KeySource`] and the raw-bytes [`client::EmberClient::broadcast`]
interface.
"#]

pub mod client;
pub mod config;
pub mod error;
pub mod wallet;

pub use client::EmberClient;
pub use config::EmberConfig;
pub use error::ClientError;
pub use wallet::{Balance, KeyRing, KeySource, MemoryWallet, StaticKeySource, WalletError};
