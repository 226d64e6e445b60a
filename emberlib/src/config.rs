//! Client configuration.

use std::path::PathBuf;

use ember_electrum::chain::{ChainProfile, Coin, NetType};
use ember_electrum::config::{ElectrumConfig, ServerAddr, Timeouts};

use ember_sync::GAP_LIMIT;

/// Fee rate in base units per kB used when the server declines to
/// estimate.
pub const DEFAULT_FALLBACK_FEE_RATE: i64 = 1_000;

/// Immutable client configuration, threaded through constructors.
#[derive(Debug, Clone)]
pub struct EmberConfig {
    /// Coin ticker.
    pub coin: Coin,
    /// mainnet, testnet or regtest.
    pub net: NetType,
    /// Base data directory. Chain data lives under `<base>/<coin>/<net>`.
    pub data_dir: PathBuf,
    /// Bootstrap server; in multi-node mode more are discovered from it.
    pub trusted_peer: ServerAddr,
    /// Local socks5 proxy port for onion servers, `None` to disable.
    pub proxy_port: Option<u16>,
    /// Accept self-signed server certificates (dev servers).
    pub skip_tls_verify: bool,
    /// Unused-key lookahead window size.
    pub gap_limit: usize,
    /// Fee rate in base units per kB when the server has no estimate.
    pub fallback_fee_rate: i64,
    /// Keep the encrypted seed in the wallet store. Policy flag consumed by
    /// the wallet collaborator only.
    pub store_enc_seed: bool,
}

impl EmberConfig {
    /// A configuration with the usual defaults.
    pub fn new(
        coin: Coin,
        net: NetType,
        data_dir: impl Into<PathBuf>,
        trusted_peer: ServerAddr,
    ) -> Self {
        EmberConfig {
            coin,
            net,
            data_dir: data_dir.into(),
            trusted_peer,
            proxy_port: None,
            skip_tls_verify: false,
            gap_limit: GAP_LIMIT,
            fallback_fee_rate: DEFAULT_FALLBACK_FEE_RATE,
            store_enc_seed: false,
        }
    }

    /// Directory holding this coin and net's chain data.
    #[must_use]
    pub fn chain_data_dir(&self) -> PathBuf {
        self.data_dir
            .join(self.coin.to_string())
            .join(self.net.to_string())
    }

    /// Derives the network engine configuration.
    #[must_use]
    pub fn electrum_config(&self) -> ElectrumConfig {
        ElectrumConfig {
            chain: ChainProfile::new(self.coin, self.net),
            data_dir: self.chain_data_dir(),
            trusted_peer: self.trusted_peer.clone(),
            proxy_port: self.proxy_port,
            skip_tls_verify: self.skip_tls_verify,
            timeouts: Timeouts::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_electrum::config::Scheme;

    #[test]
    fn chain_data_is_per_coin_and_net() {
        let cfg = EmberConfig::new(
            Coin::Firo,
            NetType::Regtest,
            "/tmp/ember",
            ServerAddr::new("127.0.0.1", 50001, Scheme::Tcp),
        );
        assert_eq!(
            cfg.chain_data_dir(),
            PathBuf::from("/tmp/ember/firo/regtest")
        );
        let elx = cfg.electrum_config();
        assert_eq!(elx.chain.checkpoint, 0);
        assert_eq!(elx.data_dir, cfg.chain_data_dir());
    }
}
