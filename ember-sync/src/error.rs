//! Sync engine error module

use ember_electrum::error::RequestError;

use crate::tx::TxDecodeError;

/// Top level error enumerating anything that may occur while synchronizing
/// a wallet.
#[derive(Debug, thiserror::Error)]
pub enum SyncError<E>
where
    E: std::fmt::Debug + std::fmt::Display,
{
    /// Server error.
    #[error("server error. {0}")]
    ServerError(#[from] RequestError),
    /// Transaction returned by the server could not be decoded.
    #[error("invalid transaction. {0}")]
    InvalidTransaction(#[from] TxDecodeError),
    /// Change output index does not exist in the transaction being
    /// broadcast.
    #[error("change index {index} is out of range for {outputs} outputs")]
    InvalidChangeIndex {
        /// Declared change output index.
        index: usize,
        /// Number of outputs in the transaction.
        outputs: usize,
    },
    /// The notification stream closed while the engine was running.
    #[error("notification stream closed")]
    NotificationStreamClosed,
    /// Wallet error.
    #[error("wallet error. {0}")]
    WalletError(E),
}
