//! Entrypoint for the wallet synchronization protocol.
//!
//! The engine keeps the wallet's view of every subscribed script current:
//! subscribe, receive status, fetch history, fetch the transactions the
//! wallet lacks, update the ledger. Statuses for one scripthash are handled
//! strictly in arrival order; distinct scripthashes proceed concurrently
//! under a bounded worker pool so a burst of notifications cannot flood the
//! server with requests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use ember_electrum::error::RequestError;
use ember_electrum::protocol::{HistoryItem, ScripthashStatus};
use ember_electrum::Network;

use crate::error::SyncError;
use crate::tx::Transaction;
use crate::wallet::traits::{SyncKeys, SyncOutputs, SyncTransactions, SyncWallet};
use crate::wallet::{KeyScope, OutPoint, Subscription, TxRecord, Utxo};

/// Number of consecutive unused external keys kept derivable ahead of the
/// last used key, so receipts to future addresses stay discoverable.
pub const GAP_LIMIT: usize = 10;

/// Bound on concurrently running status handlers.
pub const STATUS_WORKERS: usize = 8;

/// The slice of the network facade the protocol consumes. Small enough to
/// mock in tests.
pub trait IndexerClient: Clone + Send + Sync + 'static {
    /// Arms notifications for a scripthash; returns its current status,
    /// empty for no history.
    fn subscribe_scripthash(
        &self,
        scripthash: &str,
    ) -> impl Future<Output = Result<String, RequestError>> + Send;

    /// Stops notifications for a scripthash.
    fn unsubscribe_scripthash(
        &self,
        scripthash: &str,
    ) -> impl Future<Output = Result<bool, RequestError>> + Send;

    /// Confirmed and mempool history for a scripthash.
    fn get_history(
        &self,
        scripthash: &str,
    ) -> impl Future<Output = Result<Vec<HistoryItem>, RequestError>> + Send;

    /// Raw transaction bytes by display-order txid.
    fn get_raw_transaction(
        &self,
        txid: &str,
    ) -> impl Future<Output = Result<Vec<u8>, RequestError>> + Send;

    /// Submits a signed transaction, returning the server-echoed txid.
    fn broadcast(&self, raw_tx: &[u8])
        -> impl Future<Output = Result<String, RequestError>> + Send;
}

/// [`IndexerClient`] backed by the live network facade.
#[derive(Clone)]
pub struct NetworkIndexer {
    /// The engine facade.
    pub network: Arc<Network>,
    /// Cancellation scope for every request issued through this handle.
    pub cancel: CancellationToken,
}

impl IndexerClient for NetworkIndexer {
    fn subscribe_scripthash(
        &self,
        scripthash: &str,
    ) -> impl Future<Output = Result<String, RequestError>> + Send {
        async move { self.network.subscribe_scripthash(&self.cancel, scripthash).await }
    }

    fn unsubscribe_scripthash(
        &self,
        scripthash: &str,
    ) -> impl Future<Output = Result<bool, RequestError>> + Send {
        async move {
            self.network
                .unsubscribe_scripthash(&self.cancel, scripthash)
                .await
        }
    }

    fn get_history(
        &self,
        scripthash: &str,
    ) -> impl Future<Output = Result<Vec<HistoryItem>, RequestError>> + Send {
        async move { self.network.get_history(&self.cancel, scripthash).await }
    }

    fn get_raw_transaction(
        &self,
        txid: &str,
    ) -> impl Future<Output = Result<Vec<u8>, RequestError>> + Send {
        async move { self.network.get_raw_transaction(&self.cancel, txid).await }
    }

    fn broadcast(
        &self,
        raw_tx: &[u8],
    ) -> impl Future<Output = Result<String, RequestError>> + Send {
        async move { self.network.broadcast(&self.cancel, raw_tx).await }
    }
}

/// Bound alias: everything the sync engine needs a wallet to provide.
pub trait WalletBound:
    SyncWallet + SyncTransactions + SyncOutputs + SyncKeys + Send + Sync + 'static
{
}
impl<W> WalletBound for W where
    W: SyncWallet + SyncTransactions + SyncOutputs + SyncKeys + Send + Sync + 'static
{
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock after 1970")
        .as_secs()
}

/// Schedules statuses so that one scripthash is never handled by two
/// workers at once and arrival order per scripthash is preserved.
#[derive(Default)]
struct StatusQueue {
    busy: HashSet<String>,
    queued: HashMap<String, VecDeque<String>>,
    order: VecDeque<String>,
}

impl StatusQueue {
    fn push(&mut self, scripthash: String, status: String) {
        if !self.queued.contains_key(&scripthash) {
            self.order.push_back(scripthash.clone());
        }
        self.queued.entry(scripthash).or_default().push_back(status);
    }

    /// Next runnable (scripthash, status), honoring the busy set.
    fn pop_runnable(&mut self) -> Option<(String, String)> {
        for _ in 0..self.order.len() {
            let scripthash = self.order.pop_front()?;
            if self.busy.contains(&scripthash) {
                self.order.push_back(scripthash);
                continue;
            }
            let queue = self.queued.get_mut(&scripthash)?;
            let status = queue.pop_front()?;
            if queue.is_empty() {
                self.queued.remove(&scripthash);
            } else {
                self.order.push_back(scripthash.clone());
            }
            return Some((scripthash, status));
        }
        None
    }
}

/// Re-arms every stored subscription on the current leader session and
/// processes any status that differs from the last one seen, bringing the
/// ledger current with history accrued while no session was watching.
async fn rearm_subscriptions<C, W>(
    client: &C,
    wallet: &Arc<RwLock<W>>,
    statuses: &mut HashMap<String, String>,
) -> Result<(), SyncError<W::Error>>
where
    C: IndexerClient,
    W: WalletBound,
{
    let stored = wallet
        .read()
        .await
        .subscriptions()
        .map_err(SyncError::WalletError)?;
    for sub in stored {
        let status = client.subscribe_scripthash(&sub.electrum_scripthash).await?;
        if status.is_empty() || statuses.get(&sub.electrum_scripthash) == Some(&status) {
            continue;
        }
        match handle_status(client, wallet, &sub).await {
            Ok(()) => {
                statuses.insert(sub.electrum_scripthash.clone(), status);
            }
            Err(e) => tracing::warn!("catch-up for {} failed: {e}", sub.address),
        }
    }
    Ok(())
}

/// Runs the wallet sync protocol until cancellation.
///
/// On entry every stored subscription is re-armed on the wire and any
/// changed status is processed. After that the engine reacts to
/// `status_notifications`, re-arms on every `leader_epochs` bump (server
/// side subscriptions die with their session) and forwards tip changes
/// into the wallet.
///
/// A failed handler leaves the last-known status unchanged, so the next
/// notification for that scripthash retries the work instead of poisoning
/// the engine.
pub async fn sync<C, W>(
    client: C,
    wallet: Arc<RwLock<W>>,
    mut status_notifications: mpsc::Receiver<ScripthashStatus>,
    mut tip_changes: tokio::sync::watch::Receiver<i64>,
    mut leader_epochs: tokio::sync::watch::Receiver<u64>,
    cancel: CancellationToken,
) -> Result<(), SyncError<W::Error>>
where
    C: IndexerClient,
    W: WalletBound,
    W::Error: Send,
{
    tracing::info!("starting wallet sync");
    let mut statuses: HashMap<String, String> = HashMap::new();
    leader_epochs.mark_unchanged();
    rearm_subscriptions(&client, &wallet, &mut statuses).await?;

    let mut queue = StatusQueue::default();
    let mut workers: JoinSet<(String, String, Result<(), SyncError<W::Error>>)> = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("wallet sync shut down");
                return Ok(());
            }

            changed = tip_changes.changed() => {
                changed.map_err(|_| SyncError::NotificationStreamClosed)?;
                let tip = *tip_changes.borrow_and_update();
                wallet
                    .write()
                    .await
                    .update_tip(tip)
                    .map_err(SyncError::WalletError)?;
            }

            changed = leader_epochs.changed() => {
                changed.map_err(|_| SyncError::NotificationStreamClosed)?;
                leader_epochs.borrow_and_update();
                tracing::info!("leader session changed, re-arming subscriptions");
                if let Err(e) = rearm_subscriptions(&client, &wallet, &mut statuses).await {
                    tracing::warn!("re-arm after failover failed: {e}");
                }
            }

            notification = status_notifications.recv() => {
                let Some(ScripthashStatus { scripthash, status }) = notification else {
                    return Err(SyncError::NotificationStreamClosed);
                };
                if statuses.get(&scripthash) == Some(&status) {
                    tracing::debug!("unchanged status for {scripthash}, nothing to do");
                } else {
                    queue.push(scripthash, status);
                }
            }

            joined = workers.join_next(), if !workers.is_empty() => {
                let Some(joined) = joined else { continue };
                let (scripthash, status, outcome) = match joined {
                    Ok(done) => done,
                    Err(e) => {
                        // a panicking handler is a bug, not a wedged engine
                        tracing::error!("status worker panicked: {e}");
                        continue;
                    }
                };
                queue.busy.remove(&scripthash);
                match outcome {
                    Ok(()) => {
                        statuses.insert(scripthash, status);
                    }
                    Err(e) => tracing::warn!(
                        "status handler for {scripthash} failed, will retry on next notification: {e}"
                    ),
                }
            }
        }

        // fill worker capacity
        while workers.len() < STATUS_WORKERS {
            let Some((scripthash, status)) = queue.pop_runnable() else {
                break;
            };
            queue.busy.insert(scripthash.clone());
            let client = client.clone();
            let wallet = wallet.clone();
            workers.spawn(async move {
                let outcome = run_status_handler(&client, &wallet, &scripthash).await;
                (scripthash, status, outcome)
            });
        }
    }
}

/// Looks up the subscription for an arrived status and runs the handler.
/// Statuses for scripts we never subscribed are dropped: we only react to
/// subscriptions we placed.
async fn run_status_handler<C, W>(
    client: &C,
    wallet: &Arc<RwLock<W>>,
    scripthash: &str,
) -> Result<(), SyncError<W::Error>>
where
    C: IndexerClient,
    W: WalletBound,
{
    let sub = wallet
        .read()
        .await
        .subscription_for_scripthash(scripthash)
        .map_err(SyncError::WalletError)?;
    let Some(sub) = sub else {
        tracing::warn!("status for unknown scripthash {scripthash} dropped");
        return Ok(());
    };
    handle_status(client, wallet, &sub).await
}

/// The status handler: fetch history, fetch the transactions the wallet
/// lacks as confirmed, ingest them into the ledger.
async fn handle_status<C, W>(
    client: &C,
    wallet: &Arc<RwLock<W>>,
    sub: &Subscription,
) -> Result<(), SyncError<W::Error>>
where
    C: IndexerClient,
    W: WalletBound,
{
    let history = client.get_history(&sub.electrum_scripthash).await?;
    if history.is_empty() {
        tracing::debug!("empty history for {}", sub.address);
        return Ok(());
    }
    for item in &history {
        let already_confirmed = wallet
            .read()
            .await
            .has_confirmed_transaction(&item.tx_hash)
            .map_err(SyncError::WalletError)?;
        if already_confirmed {
            continue;
        }
        let raw = match client.get_raw_transaction(&item.tx_hash).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("fetch of {} failed: {e}", item.tx_hash);
                continue;
            }
        };
        let tx = Transaction::decode(&raw)?;
        if tx.txid() != item.tx_hash {
            tracing::warn!(
                "server returned a different transaction than requested: {} != {}",
                tx.txid(),
                item.tx_hash
            );
            continue;
        }
        let mut wallet_guard = wallet.write().await;
        ingest_transaction(&mut *wallet_guard, &tx, &raw, item.height, now_unix())
            .map_err(SyncError::WalletError)?;
    }
    Ok(())
}

/// Installs one history transaction into the wallet ledger: the record
/// itself, a utxo for each output paying a wallet script, and utxo-to-stxo
/// transitions for confirmed spends of wallet outputs.
pub fn ingest_transaction<W>(
    wallet: &mut W,
    tx: &Transaction,
    raw: &[u8],
    height: i64,
    first_seen: u64,
) -> Result<(), W::Error>
where
    W: SyncWallet + SyncTransactions + SyncOutputs + SyncKeys,
{
    let txid = tx.txid();
    let mut relevant = false;
    let mut credited = 0i64;
    let mut debited = 0i64;

    for (vout, output) in tx.outputs.iter().enumerate() {
        if !wallet.is_mine_script(&output.script_pubkey)? {
            continue;
        }
        relevant = true;
        credited += output.value;
        wallet.mark_script_used(&output.script_pubkey)?;
        let outpoint = OutPoint::new(txid.clone(), vout as u32);
        if wallet.has_stxo(&outpoint)? {
            continue;
        }
        wallet.add_utxo(Utxo {
            outpoint,
            value: output.value,
            at_height: height.max(0),
            script_pubkey: output.script_pubkey.clone(),
            watch_only: false,
            frozen: false,
        })?;
    }

    for input in &tx.inputs {
        let outpoint = OutPoint::new(input.prev_txid_hex(), input.prev_vout);
        if let Some(spent) = wallet.utxo(&outpoint)? {
            relevant = true;
            debited += spent.value;
            // an unconfirmed spend leaves the utxo in place until it mines
            if height > 0 {
                wallet.spend_utxo(&outpoint, height, &txid)?;
            }
        }
    }

    if !relevant {
        tracing::debug!("transaction {txid} does not involve this wallet");
        return Ok(());
    }

    wallet.put_transaction(TxRecord {
        txid,
        raw: raw.to_vec(),
        height,
        first_seen,
        watch_only: false,
        value: credited - debited,
    })
}

/// Subscribes one script: wire first, then the wallet record. A non-empty
/// status is treated as a just-arrived notification and handled inline.
/// Returns the status the server reported.
pub async fn subscribe<C, W>(
    client: &C,
    wallet: &Arc<RwLock<W>>,
    sub: Subscription,
) -> Result<String, SyncError<W::Error>>
where
    C: IndexerClient,
    W: WalletBound,
{
    let status = client.subscribe_scripthash(&sub.electrum_scripthash).await?;
    wallet
        .write()
        .await
        .add_subscription(sub.clone())
        .map_err(SyncError::WalletError)?;
    if !status.is_empty() {
        handle_status(client, wallet, &sub).await?;
    }
    Ok(status)
}

/// Removes the watch for a script from both the wire and the wallet.
pub async fn unsubscribe<C, W>(
    client: &C,
    wallet: &Arc<RwLock<W>>,
    pk_script: &str,
) -> Result<(), SyncError<W::Error>>
where
    C: IndexerClient,
    W: WalletBound,
{
    let sub = wallet
        .read()
        .await
        .subscription_for_script(pk_script)
        .map_err(SyncError::WalletError)?;
    let Some(sub) = sub else {
        tracing::debug!("unsubscribe for unknown script {pk_script}");
        return Ok(());
    };
    if let Err(e) = client.unsubscribe_scripthash(&sub.electrum_scripthash).await {
        tracing::warn!("wire unsubscribe failed: {e}");
    }
    wallet
        .write()
        .await
        .remove_subscription(pk_script)
        .map_err(SyncError::WalletError)
}

/// Broadcasts a signed transaction and arranges to be notified about its
/// change output.
///
/// The subscription record is persisted before the wire subscribe; if the
/// wire call then fails the record is removed again and the broadcast
/// result still stands, since the transaction is already in flight. Only
/// the watch setup failed, which is a warning, not an error.
pub async fn broadcast_with_change<C, W>(
    client: &C,
    wallet: &Arc<RwLock<W>>,
    tx: &Transaction,
    change_index: Option<usize>,
) -> Result<String, SyncError<W::Error>>
where
    C: IndexerClient,
    W: WalletBound,
{
    if let Some(index) = change_index {
        if index >= tx.outputs.len() {
            return Err(SyncError::InvalidChangeIndex {
                index,
                outputs: tx.outputs.len(),
            });
        }
    }

    let raw = tx.encode(true);
    let txid = client.broadcast(&raw).await?;

    if let Some(index) = change_index {
        let script = &tx.outputs[index].script_pubkey;
        let address = wallet
            .read()
            .await
            .address_for_script(script)
            .map_err(SyncError::WalletError)?
            .unwrap_or_default();
        let sub = Subscription::for_script(script, address);
        wallet
            .write()
            .await
            .add_subscription(sub.clone())
            .map_err(SyncError::WalletError)?;
        if let Err(e) = client.subscribe_scripthash(&sub.electrum_scripthash).await {
            tracing::warn!("change watch setup failed after broadcast of {txid}: {e}");
            wallet
                .write()
                .await
                .remove_subscription(&sub.pk_script)
                .map_err(SyncError::WalletError)?;
        }
    }
    Ok(txid)
}

/// Rescan for a wallet just recreated from a mnemonic: subscribe every
/// key-ring script inside the gap-limit window. Each discovery marks keys
/// used, which extends the window, so the walk continues until a full
/// window of unused keys reports no history.
pub async fn rescan<C, W>(
    client: &C,
    wallet: &Arc<RwLock<W>>,
) -> Result<(), SyncError<W::Error>>
where
    C: IndexerClient,
    W: WalletBound,
{
    for scope in [KeyScope::External, KeyScope::Internal] {
        loop {
            let window = wallet
                .read()
                .await
                .unused_scripts(scope)
                .map_err(SyncError::WalletError)?;
            let mut fresh = Vec::new();
            {
                let wallet_guard = wallet.read().await;
                for key in window {
                    let script_hex = hex::encode(&key.pk_script);
                    if wallet_guard
                        .subscription_for_script(&script_hex)
                        .map_err(SyncError::WalletError)?
                        .is_none()
                    {
                        fresh.push(key);
                    }
                }
            }
            if fresh.is_empty() {
                break;
            }
            for key in fresh {
                let sub = Subscription::for_script(&key.pk_script, key.address.clone());
                subscribe(client, wallet, sub).await?;
            }
        }
    }
    Ok(())
}
