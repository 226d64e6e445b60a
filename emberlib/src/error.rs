//! Client error module

use ember_electrum::error::{NetworkError, RequestError};
use ember_sync::tx::TxDecodeError;
use ember_sync::SyncError;

use crate::wallet::WalletError;

/// Top level error for the client controller.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Network engine error.
    #[error("network error. {0}")]
    Network(#[from] NetworkError),
    /// Single request error.
    #[error("request error. {0}")]
    Request(#[from] RequestError),
    /// Wallet sync error.
    #[error("sync error. {0}")]
    Sync(#[from] SyncError<WalletError>),
    /// Wallet storage error.
    #[error("wallet error. {0}")]
    Wallet(#[from] WalletError),
    /// Raw transaction bytes failed to parse.
    #[error("transaction decode error. {0}")]
    TxDecode(#[from] TxDecodeError),
    /// Wallet sync is already running.
    #[error("wallet sync already running")]
    SyncAlreadyRunning,
    /// The scripthash notification stream was already consumed.
    #[error("notification stream already taken")]
    NotificationStreamTaken,
}
