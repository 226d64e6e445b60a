//! Headers sync engine.
//!
//! Brings the header file from the checkpoint up to the server's tip, then
//! stays current through the `blockchain.headers.subscribe` stream. Short
//! reorgs are repaired by walking back from the tip, truncating the file at
//! the fork point and refetching; anything deeper than
//! [`MAX_REORG_DEPTH`] is fatal for the engine.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::chain::BlockHeader;
use crate::connection::Connection;
use crate::error::{ChainError, NetworkError, RequestError};
use crate::headers::{HeaderStore, MAX_CHUNK_SIZE};
use crate::peers::PeerManager;
use crate::protocol::HeadersNotify;

/// Reorgs deeper than this are not repaired automatically.
pub const MAX_REORG_DEPTH: i64 = 100;

const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Next catch-up request, or `None` when local has reached the server tip.
fn next_batch(local_tip: i64, server_tip: i64) -> Option<(i64, i64)> {
    if local_tip >= server_tip {
        return None;
    }
    Some((local_tip + 1, (server_tip - local_tip).min(MAX_CHUNK_SIZE)))
}

pub(crate) struct HeaderSync {
    pub(crate) store: Arc<HeaderStore>,
    pub(crate) peers: Arc<PeerManager>,
    pub(crate) tip_tx: watch::Sender<i64>,
    pub(crate) cancel: CancellationToken,
}

impl HeaderSync {
    /// Drives the store until shutdown. Non-fatal request errors loop back
    /// to a fresh subscription; chain and store errors are returned and
    /// shut the engine down.
    pub(crate) async fn run(
        self,
        mut headers_notify: mpsc::Receiver<HeadersNotify>,
    ) -> Result<(), NetworkError> {
        let mut leader_rx = self.peers.leader_watch();
        loop {
            let Some(conn) = self.wait_for_leader(&mut leader_rx).await else {
                return Ok(());
            };

            let subscribed = conn.subscribe_headers().await;
            let server_tip = match subscribed {
                Ok(notify) => notify.height,
                Err(e) => {
                    tracing::warn!("headers subscribe failed: {e}");
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue;
                }
            };
            match self.sync_to(&conn, server_tip).await {
                Ok(()) => {
                    self.store.set_synced(true).await;
                    self.publish_tip().await;
                }
                Err(e) if is_fatal(&e) => return Err(e),
                Err(e) => {
                    tracing::warn!("initial catch-up interrupted: {e}");
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue;
                }
            }

            // steady state on this leader
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(()),
                    changed = leader_rx.changed() => {
                        if changed.is_err() {
                            return Ok(());
                        }
                        break; // re-subscribe on the promoted leader
                    }
                    notify = headers_notify.recv() => {
                        let Some(notify) = notify else {
                            return Ok(());
                        };
                        match self.on_notify(&conn, notify).await {
                            Ok(()) => {}
                            Err(e) if is_fatal(&e) => return Err(e),
                            Err(e) => {
                                tracing::warn!("header notification handling failed: {e}");
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn wait_for_leader(
        &self,
        leader_rx: &mut watch::Receiver<Option<Arc<Connection>>>,
    ) -> Option<Arc<Connection>> {
        loop {
            if let Some(conn) = self.peers.leader() {
                return Some(conn);
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                changed = leader_rx.changed() => changed.ok()?,
            }
        }
    }

    /// Batch download from the local tip up to `server_tip`.
    async fn sync_to(&self, conn: &Arc<Connection>, server_tip: i64) -> Result<(), NetworkError> {
        while let Some((start, count)) = next_batch(self.store.tip().await, server_tip) {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            let chunk = conn.block_headers(start, count).await?;
            let raw = hex::decode(&chunk.hex)
                .map_err(|e| RequestError::BadPayload(e.to_string()))?;
            if raw.is_empty() {
                tracing::warn!("server returned no headers for {start}+{count}");
                return Ok(());
            }

            // a batch that does not link onto our tip means the chain moved
            // under us; repair before continuing
            if let Some(local_tip_header) = self.store.header_at(start - 1).await {
                let first = self.decode_one(&raw[..self.store.record_size().min(raw.len())])?;
                if first.prev != local_tip_header.hash {
                    return self.repair_reorg(conn, server_tip).await;
                }
            }

            let appended = self.store.append(&raw).await?;
            self.store.store_decoded(&raw, start).await?;
            self.store.verify_from_tip(appended, false).await?;
            tracing::debug!(
                "stored {appended} headers, tip now {}",
                self.store.tip().await
            );
            self.publish_tip().await;
        }
        Ok(())
    }

    /// One `blockchain.headers.subscribe` push.
    async fn on_notify(
        &self,
        conn: &Arc<Connection>,
        notify: HeadersNotify,
    ) -> Result<(), NetworkError> {
        let local_tip = self.store.tip().await;
        if notify.height == local_tip + 1 {
            let raw = hex::decode(&notify.hex)
                .map_err(|e| RequestError::BadPayload(e.to_string()))?;
            let header = self.decode_one(&raw)?;
            if let Some(tip_header) = self.store.header_at(local_tip).await {
                if header.prev != tip_header.hash {
                    return self.repair_reorg(conn, notify.height).await;
                }
            }
            self.store.append(&raw).await?;
            self.store.store_decoded(&raw, notify.height).await?;
            self.publish_tip().await;
            Ok(())
        } else if notify.height > local_tip + 1 {
            self.sync_to(conn, notify.height).await
        } else {
            self.repair_reorg(conn, notify.height).await
        }
    }

    /// Walks backward from the local tip requesting the server's header one
    /// height at a time until the chains agree, truncates to the fork point
    /// and refetches upward.
    async fn repair_reorg(
        &self,
        conn: &Arc<Connection>,
        server_tip: i64,
    ) -> Result<(), NetworkError> {
        let local_tip = self.store.tip().await;
        let mut height = local_tip;
        let fork = loop {
            let depth = local_tip - height;
            if depth >= MAX_REORG_DEPTH {
                return Err(ChainError::DeepReorg(depth).into());
            }
            if height < self.store.checkpoint() {
                // diverged below the trusted checkpoint
                return Err(ChainError::DeepReorg(depth).into());
            }
            let server_hex = conn.block_header(height).await?;
            let raw = hex::decode(&server_hex)
                .map_err(|e| RequestError::BadPayload(e.to_string()))?;
            let server_header = self.decode_one(&raw)?;
            match self.store.header_at(height).await {
                Some(local) if local.hash == server_header.hash => break height,
                _ => height -= 1,
            }
        };

        tracing::info!(
            "reorg detected: fork at height {fork}, local tip was {local_tip}"
        );
        self.store.truncate_to(fork).await?;
        self.sync_to(conn, server_tip).await?;
        self.publish_tip().await;
        Ok(())
    }

    fn decode_one(&self, raw: &[u8]) -> Result<BlockHeader, RequestError> {
        if raw.len() != self.store.record_size() {
            return Err(RequestError::BadPayload(format!(
                "raw header has {} bytes, record size is {}",
                raw.len(),
                self.store.record_size()
            )));
        }
        self.store
            .profile_deserialize(raw)
            .map_err(|e| RequestError::BadPayload(e.to_string()))
    }

    /// Publishes the tip on the coalesce-latest fan-out, once per distinct
    /// value.
    async fn publish_tip(&self) {
        let tip = self.store.tip().await;
        self.tip_tx.send_if_modified(|current| {
            if *current == tip {
                false
            } else {
                *current = tip;
                true
            }
        });
    }
}

fn is_fatal(error: &NetworkError) -> bool {
    matches!(error, NetworkError::Chain(_) | NetworkError::Store(_))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_are_capped_at_electrum_chunk_size() {
        assert_eq!(next_batch(-1, 5), Some((0, 6)));
        assert_eq!(next_batch(99, 10_000), Some((100, 2016)));
        assert_eq!(next_batch(5, 5), None);
        assert_eq!(next_batch(6, 5), None);
    }
}
