//! The client controller.
//!
//! Owns the wallet and the network engine, wires the sync protocol between
//! them and exposes the electrum-console-like command surface: balances,
//! unspent lists, addresses, broadcast and fee queries.

use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ember_electrum::chain::BlockHeader;
use ember_electrum::protocol::TxVerbose;
use ember_electrum::Network;

use ember_sync::tx::Transaction;
use ember_sync::wallet::traits::{SyncKeys, SyncOutputs};
use ember_sync::wallet::{KeyScope, OutPoint, Stxo, Subscription, TxRecord, Utxo};
use ember_sync::{NetworkIndexer, SyncError};

use crate::config::EmberConfig;
use crate::error::ClientError;
use crate::wallet::{Balance, KeySource, MemoryWallet, WalletError};

type SyncHandle = JoinHandle<Result<(), SyncError<WalletError>>>;

/// A running light-wallet client.
pub struct EmberClient {
    config: EmberConfig,
    network: Arc<Network>,
    wallet: Arc<RwLock<MemoryWallet>>,
    indexer: NetworkIndexer,
    cancel: CancellationToken,
    sync_handle: std::sync::Mutex<Option<SyncHandle>>,
}

impl EmberClient {
    /// Starts the network engine and builds the wallet over `keys`.
    /// Fails fast on configuration problems and genesis mismatches.
    pub async fn start(
        config: EmberConfig,
        keys: Box<dyn KeySource>,
    ) -> Result<EmberClient, ClientError> {
        let network = Network::start(config.electrum_config()).await?;
        let wallet = Arc::new(RwLock::new(MemoryWallet::new(keys, config.gap_limit)));
        let cancel = CancellationToken::new();
        let indexer = NetworkIndexer {
            network: network.clone(),
            cancel: cancel.child_token(),
        };
        Ok(EmberClient {
            config,
            network,
            wallet,
            indexer,
            cancel,
            sync_handle: std::sync::Mutex::new(None),
        })
    }

    /// The client configuration.
    #[must_use]
    pub fn config(&self) -> &EmberConfig {
        &self.config
    }

    /// The underlying network facade.
    #[must_use]
    pub fn network(&self) -> &Arc<Network> {
        &self.network
    }

    /// Shared wallet handle.
    #[must_use]
    pub fn wallet(&self) -> &Arc<RwLock<MemoryWallet>> {
        &self.wallet
    }

    /// Launches the wallet sync protocol in the background: re-arms stored
    /// subscriptions and then follows status notifications.
    pub fn sync_wallet(&self) -> Result<(), ClientError> {
        let mut slot = self.sync_handle.lock().expect("not poisoned");
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(ClientError::SyncAlreadyRunning);
        }
        let notifications = self
            .network
            .take_scripthash_notify()
            .ok_or(ClientError::NotificationStreamTaken)?;
        let handle = tokio::spawn(ember_sync::sync(
            self.indexer.clone(),
            self.wallet.clone(),
            notifications,
            self.network.tip_changes(),
            self.network.leader_epochs(),
            self.cancel.child_token(),
        ));
        *slot = Some(handle);
        Ok(())
    }

    /// Rescans a wallet recreated from a mnemonic: walks the key ring's
    /// gap-limit window subscribing every script, which pulls any history
    /// into the ledger and extends the window as keys turn out used.
    pub async fn rescan_wallet(&self) -> Result<(), ClientError> {
        ember_sync::rescan(&self.indexer, &self.wallet).await?;
        Ok(())
    }

    /// Height of the highest known header.
    pub async fn tip(&self) -> i64 {
        self.network.tip().await
    }

    /// Whether the initial header catch-up has completed.
    pub async fn synced(&self) -> bool {
        self.network.synced().await
    }

    /// Tip-change stream for embedders (confirmation counters and the
    /// like). Coalesce-latest: slow readers skip intermediate tips.
    #[must_use]
    pub fn tip_changes(&self) -> tokio::sync::watch::Receiver<i64> {
        self.network.tip_changes()
    }

    /// Decoded header by height.
    pub async fn block_header(&self, height: i64) -> Result<BlockHeader, ClientError> {
        Ok(self.network.block_header(&self.cancel, height).await?)
    }

    /// Decoded headers for a contiguous range.
    pub async fn block_headers(
        &self,
        start_height: i64,
        count: i64,
    ) -> Result<Vec<BlockHeader>, ClientError> {
        Ok(self
            .network
            .block_headers(&self.cancel, start_height, count)
            .await?)
    }

    /// Broadcasts a signed transaction. `change_index` names the output
    /// paying back into this wallet, if any; its script is subscribed so
    /// the change shows up in the ledger as soon as the server sees it.
    pub async fn broadcast(
        &self,
        raw_tx: &[u8],
        change_index: Option<usize>,
    ) -> Result<String, ClientError> {
        let tx = Transaction::decode(raw_tx)?;
        Ok(ember_sync::broadcast_with_change(&self.indexer, &self.wallet, &tx, change_index)
            .await?)
    }

    /// Fee rate in base units per kB for a confirmation target. Falls back
    /// to the configured rate when the server declines.
    pub async fn fee_rate(&self, conf_target: i64) -> i64 {
        match self.network.estimate_fee(&self.cancel, conf_target).await {
            Ok(rate) if rate > 0 => rate,
            Ok(_) => self.config.fallback_fee_rate,
            Err(e) => {
                tracing::debug!("fee estimate unavailable: {e}");
                self.config.fallback_fee_rate
            }
        }
    }

    /// A fresh receive address, subscribed for status notifications before
    /// it is handed out.
    pub async fn unused_address(&self) -> Result<String, ClientError> {
        self.subscribed_address(KeyScope::External).await
    }

    /// A fresh change address, subscribed like [`Self::unused_address`].
    pub async fn change_address(&self) -> Result<String, ClientError> {
        self.subscribed_address(KeyScope::Internal).await
    }

    async fn subscribed_address(&self, scope: KeyScope) -> Result<String, ClientError> {
        let key = self.wallet.write().await.unused_key(scope)?;
        let sub = Subscription::for_script(&key.pk_script, key.address.clone());
        ember_sync::subscribe(&self.indexer, &self.wallet, sub).await?;
        Ok(key.address)
    }

    /// Confirmed / unconfirmed / locked balance from the local ledger.
    pub async fn balance(&self) -> Balance {
        self.wallet.read().await.balance()
    }

    /// All unspent outputs in the ledger.
    pub async fn list_unspent(&self) -> Vec<Utxo> {
        self.wallet.read().await.list_unspent()
    }

    /// Unspent outputs mined at least once.
    pub async fn list_confirmed_unspent(&self) -> Vec<Utxo> {
        self.wallet.read().await.list_confirmed_unspent()
    }

    /// Frozen unspent outputs.
    pub async fn list_frozen_unspent(&self) -> Vec<Utxo> {
        self.wallet.read().await.list_frozen_unspent()
    }

    /// Spent outputs.
    pub async fn list_spent(&self) -> Vec<Stxo> {
        self.wallet.read().await.list_spent()
    }

    /// Excludes an output from coin selection.
    pub async fn freeze_utxo(&self, outpoint: &OutPoint) -> Result<(), ClientError> {
        Ok(self.wallet.write().await.freeze_utxo(outpoint)?)
    }

    /// Makes a frozen output selectable again.
    pub async fn unfreeze_utxo(&self, outpoint: &OutPoint) -> Result<(), ClientError> {
        Ok(self.wallet.write().await.unfreeze_utxo(outpoint)?)
    }

    /// A wallet transaction with its confirmation count.
    pub async fn wallet_transaction(&self, txid: &str) -> Option<(i64, TxRecord)> {
        self.wallet.read().await.transaction_with_confirmations(txid)
    }

    /// Raw transaction lookup, not restricted to wallet transactions.
    /// Results are the server's word; they are not SPV-checked.
    pub async fn get_raw_transaction(&self, txid: &str) -> Result<Vec<u8>, ClientError> {
        Ok(self.network.get_raw_transaction(&self.cancel, txid).await?)
    }

    /// Verbose transaction lookup, same trust caveat as
    /// [`Self::get_raw_transaction`].
    pub async fn get_transaction(&self, txid: &str) -> Result<TxVerbose, ClientError> {
        Ok(self.network.get_transaction(&self.cancel, txid).await?)
    }

    /// History of any script, not restricted to wallet scripts.
    pub async fn script_history(
        &self,
        pk_script: &[u8],
    ) -> Result<Vec<ember_electrum::protocol::HistoryItem>, ClientError> {
        let scripthash = ember_electrum::electrum_scripthash(pk_script);
        Ok(self.network.get_history(&self.cancel, &scripthash).await?)
    }

    /// Server-side unspent list of any script.
    pub async fn script_unspent(
        &self,
        pk_script: &[u8],
    ) -> Result<Vec<ember_electrum::protocol::UnspentItem>, ClientError> {
        let scripthash = ember_electrum::electrum_scripthash(pk_script);
        Ok(self.network.list_unspent(&self.cancel, &scripthash).await?)
    }

    /// Watches an externally supplied script: records the subscription and
    /// arms notifications, importing any existing history.
    pub async fn watch_script(
        &self,
        pk_script: &[u8],
        address: &str,
    ) -> Result<String, ClientError> {
        let sub = Subscription::for_script(pk_script, address);
        Ok(ember_sync::subscribe(&self.indexer, &self.wallet, sub).await?)
    }

    /// Orderly shutdown: stop the sync engine, then the network engine.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.sync_handle.lock().expect("not poisoned").take();
        if let Some(handle) = handle {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("wallet sync ended with {e}"),
                Err(e) => tracing::error!("wallet sync task panicked: {e}"),
            }
        }
        self.network.shutdown().await;
    }
}
