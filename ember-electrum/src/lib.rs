#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![doc = r#"
# Ember Electrum

The ElectrumX-protocol network engine behind the ember wallet. It owns
everything between the socket and the wallet:

- Framed newline-delimited JSON-RPC 2.0 sessions over TCP, TLS or a local
  socks5 proxy for onion endpoints, with request/response correlation by id
  and bounded notification channels.
- A persistent header chain store: one fixed-size record per height in a
  `blockchain_headers` file anchored at a per-coin checkpoint, verified by
  prev-hash linkage.
- A headers sync engine that catches up in 2016-header batches, follows the
  `headers` subscription and repairs reorgs up to 100 blocks deep.
- A peer manager running single-node (reconnect forever against the trusted
  peer) or multi-node (discover peers with `server.peers.subscribe`, keep a
  leader, fail over on death).
- The coin-agnostic [`network::Network`] facade the wallet layers consume,
  plus a coalesce-latest tip-change fan-out.

Coins differ only by a [`chain::ChainProfile`] value: header record size,
header hash function, genesis, checkpoint and peer strategy. No consensus
validation is performed; the client trusts its servers for proof-of-work.
"#]

pub mod chain;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod headers;
pub mod headers_sync;
pub mod network;
pub mod peers;
pub mod protocol;
pub mod scripthash;

pub use chain::{BlockHeader, ChainProfile, Coin, NetType};
pub use config::{ElectrumConfig, Scheme, ServerAddr, Timeouts};
pub use error::{ChainError, ConfigError, NetworkError, RequestError, StoreError, TransportError};
pub use network::Network;
pub use scripthash::electrum_scripthash;
