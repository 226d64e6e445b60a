//! Peer session supervision.
//!
//! Zero or more live sessions, depending on the coin profile. Single-node
//! keeps exactly one session against the trusted peer and reconnects with a
//! 5 second backoff forever. Multi-node maintains up to `max_online_peers`
//! sessions, growing the known-peer set from `server.peers.subscribe`. One
//! session is the leader: the facade and the header subscription are served
//! from it, and when it dies the most recently ready peer is promoted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::{ElectrumConfig, Scheme, ServerAddr};
use crate::connection::{ConnectOpts, Connection};
use crate::error::NetworkError;
use crate::protocol::{parse_peers, HeadersNotify, ScripthashStatus};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const RECONNECT_JITTER_MS: u64 = 1_000;
const TOPUP_INTERVAL: Duration = Duration::from_secs(5);

/// Supervises server sessions and tracks the leader.
pub struct PeerManager {
    cfg: ElectrumConfig,
    opts: ConnectOpts,
    cancel: CancellationToken,
    leader_tx: watch::Sender<Option<Arc<Connection>>>,
    epoch_tx: watch::Sender<u64>,
    known: Mutex<HashMap<String, ServerAddr>>,
    headers_tx: mpsc::Sender<HeadersNotify>,
    scripthash_tx: mpsc::Sender<ScripthashStatus>,
}

impl PeerManager {
    /// Builds the manager and dials the trusted peer. The first connection
    /// is established synchronously so that configuration and genesis
    /// mismatches fail startup instead of retrying in the dark.
    pub async fn start(
        cfg: ElectrumConfig,
        cancel: CancellationToken,
        headers_tx: mpsc::Sender<HeadersNotify>,
        scripthash_tx: mpsc::Sender<ScripthashStatus>,
    ) -> Result<Arc<Self>, NetworkError> {
        cfg.validate()?;
        let opts = ConnectOpts {
            skip_tls_verify: cfg.skip_tls_verify,
            proxy_port: cfg.proxy_port,
            timeouts: cfg.timeouts,
            expected_genesis: cfg.chain.genesis.to_string(),
        };
        let initial = Connection::connect(&cfg.trusted_peer, &opts, &cancel).await?;

        let (leader_tx, _) = watch::channel(None);
        let (epoch_tx, _) = watch::channel(0);
        let manager = Arc::new(PeerManager {
            known: Mutex::new(HashMap::from([(
                cfg.trusted_peer.host_port(),
                cfg.trusted_peer.clone(),
            )])),
            cfg,
            opts,
            cancel,
            leader_tx,
            epoch_tx,
            headers_tx,
            scripthash_tx,
        });

        let runner = manager.clone();
        if manager.cfg.chain.single_node() {
            tokio::spawn(async move { runner.run_single(initial).await });
        } else {
            tokio::spawn(async move { runner.run_multi(initial).await });
        }
        Ok(manager)
    }

    /// The current leader, if one is ready.
    #[must_use]
    pub fn leader(&self) -> Option<Arc<Connection>> {
        self.leader_tx
            .borrow()
            .clone()
            .filter(|conn| !conn.is_done())
    }

    /// Watch for leader changes. Used by the headers sync engine to
    /// re-subscribe after a failover.
    #[must_use]
    pub fn leader_watch(&self) -> watch::Receiver<Option<Arc<Connection>>> {
        self.leader_tx.subscribe()
    }

    /// Snapshot of the known-peer set.
    #[must_use]
    pub fn known_peers(&self) -> Vec<ServerAddr> {
        self.known
            .lock()
            .expect("not poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Counter bumped whenever a new leader session is installed.
    /// Subscription-holding consumers re-arm on every bump: subscriptions
    /// are per-session server state and do not survive a failover.
    #[must_use]
    pub fn leader_epochs(&self) -> watch::Receiver<u64> {
        self.epoch_tx.subscribe()
    }

    fn install_leader(&self, conn: Arc<Connection>) {
        tracing::info!(server = %conn.addr(), "leader session ready");
        // send_replace: the value must update even while nobody watches yet
        self.leader_tx.send_replace(Some(conn));
        self.epoch_tx.send_modify(|epoch| *epoch += 1);
    }

    fn clear_leader(&self) {
        self.leader_tx.send_replace(None);
    }

    /// Forwards the session's notification streams into the manager's
    /// stable channels until the session dies or the engine shuts down.
    async fn forward_until_done(&self, conn: &Arc<Connection>) {
        if conn.is_done() {
            return;
        }
        let mut done = conn.done_watch();
        let mut headers = conn.take_headers_notify();
        let mut scripthashes = conn.take_scripthash_notify();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    conn.close();
                    return;
                }
                changed = done.changed() => {
                    if changed.is_err() || *done.borrow() {
                        return;
                    }
                }
                notify = recv_opt(&mut headers) => {
                    match notify {
                        Some(notify) => {
                            if self.headers_tx.send(notify).await.is_err() {
                                return;
                            }
                        }
                        None => headers = None,
                    }
                }
                status = recv_opt(&mut scripthashes) => {
                    match status {
                        Some(status) => {
                            if self.scripthash_tx.send(status).await.is_err() {
                                return;
                            }
                        }
                        None => scripthashes = None,
                    }
                }
            }
        }
    }

    /// Single-node mode: one session, reconnect forever.
    async fn run_single(self: Arc<Self>, mut current: Arc<Connection>) {
        loop {
            self.install_leader(current.clone());
            self.forward_until_done(&current).await;
            self.clear_leader();
            if self.cancel.is_cancelled() {
                return;
            }
            tracing::warn!(
                "disconnected: retrying {} every {}s",
                self.cfg.trusted_peer,
                RECONNECT_DELAY.as_secs()
            );
            current = loop {
                if !self.backoff().await {
                    return;
                }
                match Connection::connect(&self.cfg.trusted_peer, &self.opts, &self.cancel).await {
                    Ok(conn) => break conn,
                    Err(e) => tracing::warn!("reconnect failed: {e}"),
                }
            };
        }
    }

    /// Multi-node mode: top up to `max_online_peers`, discover more peers
    /// after each handshake, promote on leader death.
    async fn run_multi(self: Arc<Self>, initial: Arc<Connection>) {
        let mut sessions: Vec<Arc<Connection>> = Vec::new();
        self.adopt_session(&mut sessions, initial).await;

        let forwarder = {
            let manager = self.clone();
            tokio::spawn(async move { manager.run_leader_forwarder().await })
        };

        let mut tick = tokio::time::interval(TOPUP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick.tick() => {}
            }

            sessions.retain(|conn| !conn.is_done());
            let leader_alive = self.leader().is_some();
            if !leader_alive {
                // most recently ready peer wins promotion
                match sessions.last() {
                    Some(next) => self.install_leader(next.clone()),
                    None => self.clear_leader(),
                }
            }

            if sessions.len() < self.cfg.chain.max_online_peers {
                if let Some(candidate) = self.pick_candidate(&sessions) {
                    match Connection::connect(&candidate, &self.opts, &self.cancel).await {
                        Ok(conn) => self.adopt_session(&mut sessions, conn).await,
                        Err(e) => {
                            tracing::warn!(server = %candidate, "connect failed: {e}");
                            if !self.cfg.chain.no_delete_known_peers
                                && candidate != self.cfg.trusted_peer
                            {
                                self.known
                                    .lock()
                                    .expect("not poisoned")
                                    .remove(&candidate.host_port());
                            }
                        }
                    }
                }
            }
        }
        for conn in &sessions {
            conn.close();
        }
        forwarder.abort();
    }

    /// Tracks the leader and pumps its notifications. Notifications already
    /// in flight on a dead leader are dropped; the next subscription on the
    /// promoted peer drives a resync.
    async fn run_leader_forwarder(&self) {
        let mut leader_rx = self.leader_tx.subscribe();
        loop {
            let current = leader_rx.borrow_and_update().clone();
            if let Some(conn) = current {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    () = self.forward_until_done(&conn) => {}
                    _ = leader_rx.changed() => continue,
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                changed = leader_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn adopt_session(&self, sessions: &mut Vec<Arc<Connection>>, conn: Arc<Connection>) {
        if self.leader().is_none() {
            self.install_leader(conn.clone());
        }
        self.discover_from(&conn).await;
        sessions.push(conn);
    }

    /// Merges the session's `server.peers.subscribe` answer into the known
    /// set, dedup on host:port, onion endpoints gated on the proxy.
    async fn discover_from(&self, conn: &Arc<Connection>) {
        let peers = match conn.server_peers().await {
            Ok(result) => parse_peers(&result),
            Err(e) => {
                tracing::debug!(server = %conn.addr(), "peer discovery failed: {e}");
                return;
            }
        };
        let mut known = self.known.lock().expect("not poisoned");
        for peer in peers {
            let addr = match (peer.ssl_port, peer.tcp_port) {
                (Some(port), _) => ServerAddr::new(peer.host, port, Scheme::Ssl),
                (None, Some(port)) => ServerAddr::new(peer.host, port, Scheme::Tcp),
                (None, None) => continue,
            };
            if addr.is_onion()
                && (self.cfg.proxy_port.is_none() || self.cfg.chain.max_onion == 0)
            {
                continue;
            }
            known.entry(addr.host_port()).or_insert(addr);
        }
        tracing::debug!("known peers: {}", known.len());
    }

    fn pick_candidate(&self, sessions: &[Arc<Connection>]) -> Option<ServerAddr> {
        let online_onion = sessions
            .iter()
            .filter(|conn| conn.addr().is_onion())
            .count();
        let known = self.known.lock().expect("not poisoned");
        known
            .values()
            .find(|addr| {
                if sessions.iter().any(|conn| conn.addr() == *addr) {
                    return false;
                }
                if addr.is_onion() {
                    return self.cfg.proxy_port.is_some()
                        && online_onion < self.cfg.chain.max_onion;
                }
                true
            })
            .cloned()
    }

    /// 5 second backoff with bounded jitter. Returns false on shutdown.
    async fn backoff(&self) -> bool {
        let jitter = rand::thread_rng().gen_range(0..RECONNECT_JITTER_MS);
        let delay = RECONNECT_DELAY + Duration::from_millis(jitter);
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

async fn recv_opt<T>(receiver: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match receiver {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
