//! The network facade and root lifecycle.
//!
//! [`Network`] is the stable, coin-agnostic surface the wallet consumes.
//! Starting it dials the trusted peer (failing fast on configuration and
//! genesis problems), opens the header store and spawns the peer manager
//! and headers sync engine under one root cancellation token. Every
//! background loop is parented by that token; shutdown cancels it and
//! waits for the headers engine to go quiescent.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::chain::BlockHeader;
use crate::config::ElectrumConfig;
use crate::connection::Connection;
use crate::error::{NetworkError, RequestError};
use crate::headers::HeaderStore;
use crate::headers_sync::HeaderSync;
use crate::peers::PeerManager;
use crate::protocol::{HistoryItem, ScripthashStatus, TxVerbose, UnspentItem};

/// Channel capacity between the peer manager and the notification
/// consumers.
const NOTIFY_FANIN_CAPACITY: usize = 16;

/// Satoshis (base units) per whole coin, used to convert the server's
/// coin/kB fee estimate.
const COIN_BASE_UNITS: f64 = 100_000_000.0;

/// The ElectrumX network engine.
pub struct Network {
    cfg: ElectrumConfig,
    store: Arc<HeaderStore>,
    peers: Arc<PeerManager>,
    tip_rx: watch::Receiver<i64>,
    cancel: CancellationToken,
    scripthash_notify: Mutex<Option<mpsc::Receiver<ScripthashStatus>>>,
    headers_task: Mutex<Option<JoinHandle<()>>>,
}

impl Network {
    /// Starts the engine: opens the header store, establishes the first
    /// session (wrong genesis or bad config fail here), then spawns the
    /// background loops.
    pub async fn start(cfg: ElectrumConfig) -> Result<Arc<Self>, NetworkError> {
        cfg.validate()?;
        let store = Arc::new(HeaderStore::open(&cfg.data_dir, cfg.chain).await?);
        let cancel = CancellationToken::new();

        let (headers_tx, headers_rx) = mpsc::channel(NOTIFY_FANIN_CAPACITY);
        let (scripthash_tx, scripthash_rx) = mpsc::channel(NOTIFY_FANIN_CAPACITY);
        let peers = PeerManager::start(
            cfg.clone(),
            cancel.child_token(),
            headers_tx,
            scripthash_tx,
        )
        .await?;

        let (tip_tx, tip_rx) = watch::channel(store.tip().await);
        let sync = HeaderSync {
            store: store.clone(),
            peers: peers.clone(),
            tip_tx,
            cancel: cancel.child_token(),
        };
        let root = cancel.clone();
        let headers_task = tokio::spawn(async move {
            if let Err(e) = sync.run(headers_rx).await {
                // protocol invariant failures shut the engine down; wallet
                // data is untouched
                tracing::error!("headers sync fatal: {e}");
                root.cancel();
            }
        });

        Ok(Arc::new(Network {
            cfg,
            store,
            peers,
            tip_rx,
            cancel,
            scripthash_notify: Mutex::new(Some(scripthash_rx)),
            headers_task: Mutex::new(Some(headers_task)),
        }))
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &ElectrumConfig {
        &self.cfg
    }

    /// Height of the highest stored header.
    pub async fn tip(&self) -> i64 {
        self.store.tip().await.max(0)
    }

    /// True once the initial header catch-up has completed.
    pub async fn synced(&self) -> bool {
        self.store.synced().await
    }

    /// Coalesce-latest tip fan-out: each receiver holds one slot and a
    /// stalled receiver only ever misses intermediate values, never blocks
    /// the producer.
    #[must_use]
    pub fn tip_changes(&self) -> watch::Receiver<i64> {
        self.tip_rx.clone()
    }

    /// Takes the merged scripthash status stream. Statuses flow from
    /// whichever session is leader.
    pub fn take_scripthash_notify(&self) -> Option<mpsc::Receiver<ScripthashStatus>> {
        self.scripthash_notify.lock().expect("not poisoned").take()
    }

    /// Bumps once per newly installed leader session. Scripthash
    /// subscriptions are per-session state on the server, so consumers
    /// re-subscribe on every bump.
    #[must_use]
    pub fn leader_epochs(&self) -> watch::Receiver<u64> {
        self.peers.leader_epochs()
    }

    /// The known-peer set, for diagnostics.
    #[must_use]
    pub fn known_peers(&self) -> Vec<crate::config::ServerAddr> {
        self.peers.known_peers()
    }

    fn require_leader(&self) -> Result<Arc<Connection>, RequestError> {
        self.peers.leader().ok_or(RequestError::ServerNotRunning)
    }

    async fn guarded<T>(
        &self,
        cancel: &CancellationToken,
        request: impl std::future::Future<Output = Result<T, RequestError>>,
    ) -> Result<T, RequestError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(RequestError::Cancelled),
            outcome = request => outcome,
        }
    }

    /// Decoded header at `height`. Served from the store when present;
    /// otherwise (for example below the checkpoint) fetched from the
    /// leader without being stored.
    pub async fn block_header(
        &self,
        cancel: &CancellationToken,
        height: i64,
    ) -> Result<BlockHeader, NetworkError> {
        if let Some(header) = self.store.header_at(height).await {
            return Ok(header);
        }
        let conn = self.require_leader()?;
        let hex_header = self.guarded(cancel, conn.block_header(height)).await?;
        self.decode_header(&hex_header).map_err(Into::into)
    }

    /// Decoded headers for `[start, start + count)`. Served from the store
    /// when the whole range is present.
    pub async fn block_headers(
        &self,
        cancel: &CancellationToken,
        start_height: i64,
        count: i64,
    ) -> Result<Vec<BlockHeader>, NetworkError> {
        let mut from_store = Vec::with_capacity(count.max(0) as usize);
        for height in start_height..start_height + count {
            match self.store.header_at(height).await {
                Some(header) => from_store.push(header),
                None => {
                    from_store.clear();
                    break;
                }
            }
        }
        if from_store.len() == count.max(0) as usize && count > 0 {
            return Ok(from_store);
        }

        let conn = self.require_leader()?;
        let chunk = self
            .guarded(cancel, conn.block_headers(start_height, count))
            .await?;
        let raw = hex::decode(&chunk.hex)
            .map_err(|e| RequestError::BadPayload(e.to_string()))?;
        let record = self.store.record_size();
        if raw.len() % record != 0 {
            return Err(RequestError::BadPayload(
                "headers chunk is not a multiple of the record size".to_string(),
            )
            .into());
        }
        raw.chunks(record)
            .map(|chunk| self.decode_header_raw(chunk).map_err(Into::into))
            .collect()
    }

    /// Arms scripthash notifications for `scripthash` and returns its
    /// current status; empty string means no history yet.
    pub async fn subscribe_scripthash(
        &self,
        cancel: &CancellationToken,
        scripthash: &str,
    ) -> Result<String, RequestError> {
        let conn = self.require_leader()?;
        self.guarded(cancel, conn.subscribe_scripthash(scripthash))
            .await
    }

    /// Stops notifications for `scripthash`.
    pub async fn unsubscribe_scripthash(
        &self,
        cancel: &CancellationToken,
        scripthash: &str,
    ) -> Result<bool, RequestError> {
        let conn = self.require_leader()?;
        self.guarded(cancel, conn.unsubscribe_scripthash(scripthash))
            .await
    }

    /// Confirmed and mempool history for a scripthash.
    pub async fn get_history(
        &self,
        cancel: &CancellationToken,
        scripthash: &str,
    ) -> Result<Vec<HistoryItem>, RequestError> {
        let conn = self.require_leader()?;
        self.guarded(cancel, conn.get_history(scripthash)).await
    }

    /// Unspent outputs for a scripthash, as the server sees them.
    pub async fn list_unspent(
        &self,
        cancel: &CancellationToken,
        scripthash: &str,
    ) -> Result<Vec<UnspentItem>, RequestError> {
        let conn = self.require_leader()?;
        self.guarded(cancel, conn.list_unspent(scripthash)).await
    }

    /// Raw transaction bytes by txid.
    pub async fn get_raw_transaction(
        &self,
        cancel: &CancellationToken,
        txid: &str,
    ) -> Result<Vec<u8>, RequestError> {
        let conn = self.require_leader()?;
        let raw_hex = self.guarded(cancel, conn.get_raw_transaction(txid)).await?;
        hex::decode(raw_hex).map_err(|e| RequestError::BadPayload(e.to_string()))
    }

    /// Verbose transaction lookup.
    pub async fn get_transaction(
        &self,
        cancel: &CancellationToken,
        txid: &str,
    ) -> Result<TxVerbose, RequestError> {
        let conn = self.require_leader()?;
        self.guarded(cancel, conn.get_transaction(txid)).await
    }

    /// Submits a signed transaction. Returns the server-echoed txid.
    pub async fn broadcast(
        &self,
        cancel: &CancellationToken,
        raw_tx: &[u8],
    ) -> Result<String, RequestError> {
        let conn = self.require_leader()?;
        self.guarded(cancel, conn.broadcast(&hex::encode(raw_tx)))
            .await
    }

    /// Fee rate in base units per kB for a confirmation target, or -1 when
    /// the server has no estimate.
    pub async fn estimate_fee(
        &self,
        cancel: &CancellationToken,
        conf_target: i64,
    ) -> Result<i64, RequestError> {
        let conn = self.require_leader()?;
        let coin_per_kb = self.guarded(cancel, conn.estimate_fee(conf_target)).await?;
        if coin_per_kb < 0.0 {
            return Ok(-1);
        }
        Ok((coin_per_kb * COIN_BASE_UNITS).round() as i64)
    }

    fn decode_header(&self, hex_header: &str) -> Result<BlockHeader, RequestError> {
        let raw =
            hex::decode(hex_header).map_err(|e| RequestError::BadPayload(e.to_string()))?;
        self.decode_header_raw(&raw)
    }

    fn decode_header_raw(&self, raw: &[u8]) -> Result<BlockHeader, RequestError> {
        self.store
            .profile_deserialize(raw)
            .map_err(|e| RequestError::BadPayload(e.to_string()))
    }

    /// Orderly shutdown: cancel everything, wait for the headers engine to
    /// go quiescent. Sessions drain their pending waiters with a cancel
    /// error as they close.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.headers_task.lock().expect("not poisoned").take();
        if let Some(task) = task {
            let _ignore_error = task.await;
        }
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
