//! Wallet-side data model shared between the sync engine and any concrete
//! wallet implementation.

use ember_electrum::electrum_scripthash;

pub mod traits;

/// A previous transaction output reference. Txids are display-order hex, the
/// same form the electrum protocol uses on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutPoint {
    /// Funding transaction id, display order hex.
    pub txid: String,
    /// Output index.
    pub vout: u32,
}

impl OutPoint {
    /// Constructs an outpoint.
    pub fn new(txid: impl Into<String>, vout: u32) -> Self {
        OutPoint {
            txid: txid.into(),
            vout,
        }
    }
}

impl std::fmt::Display for OutPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

/// A script the wallet asked the server to watch. Keyed on `pk_script`,
/// with a secondary lookup by `electrum_scripthash`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Output script, hex.
    pub pk_script: String,
    /// `hex(reverse(sha256(pk_script)))`, the server-side key.
    pub electrum_scripthash: String,
    /// Rendered address, informational.
    pub address: String,
}

impl Subscription {
    /// Builds a subscription from raw script bytes, deriving the electrum
    /// scripthash.
    pub fn for_script(pk_script: &[u8], address: impl Into<String>) -> Self {
        Subscription {
            pk_script: hex::encode(pk_script),
            electrum_scripthash: electrum_scripthash(pk_script),
            address: address.into(),
        }
    }
}

/// A transaction relevant to the wallet.
///
/// `height` is positive once confirmed, 0 for mempool and -1 for mempool
/// with unconfirmed inputs. A positive height is never reverted except by
/// explicit reorg repair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRecord {
    /// Transaction id, display order hex.
    pub txid: String,
    /// Raw transaction bytes.
    pub raw: Vec<u8>,
    /// Confirmation height, or 0 / -1 for mempool.
    pub height: i64,
    /// Unix time this wallet first saw the transaction.
    pub first_seen: u64,
    /// Only watch-only scripts are involved.
    pub watch_only: bool,
    /// Net value change for the wallet, base units.
    pub value: i64,
}

/// An unspent output paying a wallet-owned script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    /// Location of the output.
    pub outpoint: OutPoint,
    /// Value in base units.
    pub value: i64,
    /// Height of the funding transaction, 0 while unconfirmed.
    pub at_height: i64,
    /// The output script.
    pub script_pubkey: Vec<u8>,
    /// The wallet watches but cannot spend this output.
    pub watch_only: bool,
    /// Temporarily excluded from coin selection by outside software.
    pub frozen: bool,
}

/// A spent output: the utxo it used to be plus where it met its demise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stxo {
    /// The output as it was when unspent.
    pub utxo: Utxo,
    /// Height of the spending transaction, 0 while the spend is in the
    /// mempool.
    pub spend_height: i64,
    /// Txid of the spending transaction.
    pub spend_txid: String,
}

/// Which keychain branch a key belongs to. External keys are handed out for
/// receiving; internal keys take change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyScope {
    /// Receiving keys.
    External,
    /// Change keys.
    Internal,
}

/// A derived key's script and address, as produced by the wallet's key
/// ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyScript {
    /// Output script paying the key.
    pub pk_script: Vec<u8>,
    /// Rendered address.
    pub address: String,
    /// Branch the key was derived under.
    pub scope: KeyScope,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_derives_the_scripthash() {
        let sub = Subscription::for_script(&[0x51], "addr1");
        assert_eq!(sub.pk_script, "51");
        assert_eq!(sub.electrum_scripthash, electrum_scripthash(&[0x51]));
        assert_eq!(sub.electrum_scripthash.len(), 64);
    }
}
