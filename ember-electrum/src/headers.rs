//! Persistent block header store.
//!
//! The client's copy of the blockchain headers lives in a single
//! `blockchain_headers` file per coin and net: a strict concatenation of
//! fixed-size records ordered by height, starting at the profile's
//! checkpoint. The record at byte offset `i * N` is the header at height
//! `checkpoint + i`, so `file_size % N == 0` is an invariant at every
//! observable point. Headers are kept decoded in a map keyed by height; we
//! store a map and not a tree, so in single-node mode the server is trusted
//! for the longest chain.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::RwLock;

use crate::chain::{BlockHeader, ChainProfile};
use crate::error::{ChainError, StoreError};

/// File name under the per-coin per-net data directory.
pub const HEADER_FILE_NAME: &str = "blockchain_headers";

/// Largest batch the engine requests during catch-up.
pub const MAX_CHUNK_SIZE: i64 = 2016;

#[derive(Debug, Default)]
struct StoreInner {
    hdrs: HashMap<i64, BlockHeader>,
    /// Height of the highest stored header; `checkpoint - 1` when empty.
    tip: i64,
    synced: bool,
}

/// The header chain store. Shared-read, single-writer: only the headers sync
/// engine appends or truncates.
#[derive(Debug)]
pub struct HeaderStore {
    path: PathBuf,
    profile: ChainProfile,
    inner: RwLock<StoreInner>,
}

impl HeaderStore {
    /// Opens (creating if absent) the header file and decodes every stored
    /// record into the in-memory map.
    pub async fn open(data_dir: &Path, profile: ChainProfile) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(data_dir).await?;
        let path = data_dir.join(HEADER_FILE_NAME);
        let store = HeaderStore {
            path,
            profile,
            inner: RwLock::new(StoreInner {
                hdrs: HashMap::new(),
                tip: profile.checkpoint - 1,
                synced: false,
            }),
        };

        let raw = match tokio::fs::read(&store.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::File::create(&store.path).await?;
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };
        store.records_in(raw.len())?;
        if !raw.is_empty() {
            store.store_decoded(&raw, profile.checkpoint).await?;
        }
        Ok(store)
    }

    /// Number of whole records in `len` bytes, or `CorruptStore`.
    fn records_in(&self, len: usize) -> Result<i64, StoreError> {
        if len % self.profile.header_size != 0 {
            return Err(StoreError::CorruptStore);
        }
        Ok((len / self.profile.header_size) as i64)
    }

    /// Appends raw records to the file. `raw` must be a multiple of the
    /// record size. Returns the number of records appended. The in-memory
    /// map is not touched; follow up with [`Self::store_decoded`].
    pub async fn append(&self, raw: &[u8]) -> Result<i64, StoreError> {
        let count = self.records_in(raw.len())?;
        let _guard = self.inner.write().await;
        let mut file = OpenOptions::new().append(true).open(&self.path).await?;
        file.write_all(raw).await?;
        file.sync_data().await?;
        Ok(count)
    }

    /// Decodes each record of `raw` with the coin's deserializer and
    /// installs the results at consecutive heights from `start_height`.
    pub async fn store_decoded(&self, raw: &[u8], start_height: i64) -> Result<i64, StoreError> {
        let count = self.records_in(raw.len())?;
        let record = self.profile.header_size;
        let mut inner = self.inner.write().await;
        for i in 0..count {
            let at = start_height + i;
            let chunk = &raw[(i as usize) * record..(i as usize + 1) * record];
            let header = (self.profile.deserialize_header)(chunk)
                .map_err(|_| StoreError::Decode(at))?;
            inner.hdrs.insert(at, header);
            if at > inner.tip {
                inner.tip = at;
            }
        }
        Ok(count)
    }

    /// Random-access read of up to `count` records starting at `height`.
    /// Returns a short byte count at EOF; an empty vec when `height` is past
    /// the tip.
    pub async fn read_range(&self, height: i64, count: i64) -> Result<Vec<u8>, StoreError> {
        if height < self.profile.checkpoint {
            return Err(StoreError::BelowCheckpoint(height));
        }
        let record = self.profile.header_size as i64;
        let offset = (height - self.profile.checkpoint) * record;
        let _guard = self.inner.read().await;
        let mut file = tokio::fs::File::open(&self.path).await?;
        let len = file.metadata().await?.len() as i64;
        if offset >= len {
            return Ok(Vec::new());
        }
        let wanted = (count * record).min(len - offset);
        file.seek(SeekFrom::Start(offset as u64)).await?;
        let mut buf = vec![0u8; wanted as usize];
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Decoded header at `height`, if stored.
    pub async fn header_at(&self, height: i64) -> Option<BlockHeader> {
        self.inner.read().await.hdrs.get(&height).copied()
    }

    /// Walks the map from the tip downward checking prev-hash linkage.
    /// `depth` bounds the walk unless `all` is set. The failing height is
    /// the one whose `prev` does not match its parent's hash.
    pub async fn verify_from_tip(&self, depth: i64, all: bool) -> Result<(), ChainError> {
        let inner = self.inner.read().await;
        let mut down_to = inner.tip - depth;
        if down_to < self.profile.checkpoint || all {
            down_to = self.profile.checkpoint;
        }
        let mut height = inner.tip;
        while height > down_to {
            let (this, prev) = match (inner.hdrs.get(&height), inner.hdrs.get(&(height - 1))) {
                (Some(t), Some(p)) => (t, p),
                _ => return Err(ChainError::ChainBroken(height)),
            };
            if this.prev != prev.hash {
                return Err(ChainError::ChainBroken(height));
            }
            height -= 1;
        }
        Ok(())
    }

    /// Reorg repair: drops every record above `height` from both the file
    /// and the map.
    pub async fn truncate_to(&self, height: i64) -> Result<(), StoreError> {
        let record = self.profile.header_size as i64;
        let keep = (height - self.profile.checkpoint + 1).max(0);
        let mut inner = self.inner.write().await;
        let file = OpenOptions::new().write(true).open(&self.path).await?;
        file.set_len((keep * record) as u64).await?;
        file.sync_data().await?;
        inner.hdrs.retain(|&h, _| h <= height);
        inner.tip = inner.tip.min(height.max(self.profile.checkpoint - 1));
        Ok(())
    }

    /// Height of the highest stored header; `checkpoint - 1` when the store
    /// is empty.
    pub async fn tip(&self) -> i64 {
        self.inner.read().await.tip
    }

    /// True once the initial catch-up has completed at least once.
    pub async fn synced(&self) -> bool {
        self.inner.read().await.synced
    }

    /// Flips the synced flag.
    pub async fn set_synced(&self, synced: bool) {
        self.inner.write().await.synced = synced;
    }

    /// Header file size in bytes and the record count it holds.
    pub async fn stat(&self) -> Result<(u64, i64), StoreError> {
        let _guard = self.inner.read().await;
        let len = tokio::fs::metadata(&self.path).await?.len();
        let count = self.records_in(len as usize)?;
        Ok((len, count))
    }

    /// The height the file starts at.
    #[must_use]
    pub fn checkpoint(&self) -> i64 {
        self.profile.checkpoint
    }

    /// The record size N.
    #[must_use]
    pub fn record_size(&self) -> usize {
        self.profile.header_size
    }

    /// Runs the coin's header deserializer on one raw record.
    pub fn profile_deserialize(
        &self,
        raw: &[u8],
    ) -> Result<BlockHeader, crate::chain::HeaderDecodeError> {
        (self.profile.deserialize_header)(raw)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chain::{double_sha256, Coin, NetType};

    // Builds `n` linked 80-byte records. Field layout matches the wire
    // format closely enough for the sha256d deserializer.
    pub(crate) fn linked_chain(n: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(n * 80);
        let mut prev = [0u8; 32];
        for i in 0..n {
            let mut record = [0u8; 80];
            record[0] = 1; // version
            record[4..36].copy_from_slice(&prev);
            record[36] = i as u8; // perturb the merkle root per block
            prev = double_sha256(&record);
            out.extend_from_slice(&record);
        }
        out
    }

    fn regtest_profile() -> ChainProfile {
        ChainProfile::new(Coin::Firo, NetType::Regtest)
    }

    #[tokio::test]
    async fn starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = HeaderStore::open(dir.path(), regtest_profile()).await.unwrap();
        assert_eq!(store.tip().await, -1);
        assert!(!store.synced().await);
        assert_eq!(store.stat().await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn append_then_decode_sets_tip() {
        let dir = tempfile::tempdir().unwrap();
        let store = HeaderStore::open(dir.path(), regtest_profile()).await.unwrap();
        let raw = linked_chain(6);

        assert_eq!(store.append(&raw).await.unwrap(), 6);
        assert_eq!(store.store_decoded(&raw, 0).await.unwrap(), 6);
        assert_eq!(store.tip().await, 5);
        assert_eq!(store.stat().await.unwrap(), (480, 6));
        store.verify_from_tip(0, true).await.unwrap();

        let h5 = store.header_at(5).await.unwrap();
        let h4 = store.header_at(4).await.unwrap();
        assert_eq!(h5.prev, h4.hash);
    }

    #[tokio::test]
    async fn ragged_appends_are_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = HeaderStore::open(dir.path(), regtest_profile()).await.unwrap();
        assert!(matches!(
            store.append(&[0u8; 81]).await,
            Err(StoreError::CorruptStore)
        ));
    }

    #[tokio::test]
    async fn ragged_file_rejected_on_open() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(HEADER_FILE_NAME), [0u8; 79]).unwrap();
        assert!(matches!(
            HeaderStore::open(dir.path(), regtest_profile()).await,
            Err(StoreError::CorruptStore)
        ));
    }

    #[tokio::test]
    async fn read_range_is_short_at_eof() {
        let dir = tempfile::tempdir().unwrap();
        let store = HeaderStore::open(dir.path(), regtest_profile()).await.unwrap();
        let raw = linked_chain(3);
        store.append(&raw).await.unwrap();
        store.store_decoded(&raw, 0).await.unwrap();

        let chunk = store.read_range(1, 10).await.unwrap();
        assert_eq!(chunk.len(), 160);
        assert_eq!(chunk, raw[80..240]);
        assert!(store.read_range(7, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn broken_linkage_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let store = HeaderStore::open(dir.path(), regtest_profile()).await.unwrap();
        let mut raw = linked_chain(4);
        // corrupt the prev hash of the record at height 2
        raw[2 * 80 + 4] ^= 0xff;
        store.append(&raw).await.unwrap();
        store.store_decoded(&raw, 0).await.unwrap();

        match store.verify_from_tip(0, true).await {
            Err(ChainError::ChainBroken(height)) => assert_eq!(height, 2),
            other => panic!("expected broken chain, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn truncate_drops_file_and_map() {
        let dir = tempfile::tempdir().unwrap();
        let store = HeaderStore::open(dir.path(), regtest_profile()).await.unwrap();
        let raw = linked_chain(6);
        store.append(&raw).await.unwrap();
        store.store_decoded(&raw, 0).await.unwrap();

        store.truncate_to(2).await.unwrap();
        assert_eq!(store.tip().await, 2);
        assert_eq!(store.stat().await.unwrap(), (240, 3));
        assert!(store.header_at(3).await.is_none());
        assert!(store.header_at(2).await.is_some());
        store.verify_from_tip(0, true).await.unwrap();
    }

    #[tokio::test]
    async fn reopen_recovers_the_map() {
        let dir = tempfile::tempdir().unwrap();
        let raw = linked_chain(5);
        {
            let store = HeaderStore::open(dir.path(), regtest_profile()).await.unwrap();
            store.append(&raw).await.unwrap();
        }
        let store = HeaderStore::open(dir.path(), regtest_profile()).await.unwrap();
        assert_eq!(store.tip().await, 4);
        store.verify_from_tip(0, true).await.unwrap();
    }
}
