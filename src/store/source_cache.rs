//! LRU cache of raw source bytes.
//!
//! Raw sources are only needed to *re*-derive an image (new DPI, new
//! bleed), so they live in their own bounded cache with its own eviction.
//! Evicting a source never touches derived blobs: it only means a future
//! re-transform has to fetch the original again.
//!
//! Access metadata is persisted as a JSON index blob listing entries from
//! least to most recently used.

use super::blob::BlobStore;
use super::record::{source_key, SOURCE_PREFIX};
use crate::card::ImageId;
use crate::error::EngineError;
use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, warn};

const INDEX_KEY: &str = "meta/source-index.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub size: u64,
    pub stored_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
}

struct SourceIndex {
    lru: LruCache<ImageId, SourceEntry>,
    total_bytes: u64,
}

impl SourceIndex {
    fn remove(&mut self, id: &ImageId) -> Option<SourceEntry> {
        let entry = self.lru.pop(id)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size);
        Some(entry)
    }

    /// Insert or refresh `id`, returning every id evicted to stay within
    /// both budgets. The newest entry itself is never evicted.
    fn insert(&mut self, id: ImageId, entry: SourceEntry, max_bytes: u64) -> Vec<ImageId> {
        let mut evicted = Vec::new();
        if let Some(old) = self.lru.peek(&id) {
            self.total_bytes = self.total_bytes.saturating_sub(old.size);
        }
        self.total_bytes += entry.size;
        if let Some((old_id, old)) = self.lru.push(id.clone(), entry) {
            if old_id != id {
                self.total_bytes = self.total_bytes.saturating_sub(old.size);
                evicted.push(old_id);
            }
        }
        while self.total_bytes > max_bytes && self.lru.len() > 1 {
            match self.lru.pop_lru() {
                Some((old_id, old)) => {
                    self.total_bytes = self.total_bytes.saturating_sub(old.size);
                    evicted.push(old_id);
                }
                None => break,
            }
        }
        evicted
    }

    /// Entries from least to most recently used.
    fn snapshot(&self) -> Vec<(ImageId, SourceEntry)> {
        self.lru
            .iter()
            .rev()
            .map(|(id, entry)| (id.clone(), *entry))
            .collect()
    }
}

pub struct SourceCache {
    blobs: Arc<dyn BlobStore>,
    index: Mutex<SourceIndex>,
    max_bytes: u64,
    persist_lock: tokio::sync::Mutex<()>,
}

impl SourceCache {
    /// Load the persisted index, adopting any source blob the index missed
    /// (a crash between the blob write and the index write).
    pub async fn load(
        blobs: Arc<dyn BlobStore>,
        max_entries: usize,
        max_bytes: u64,
    ) -> Result<Self, EngineError> {
        let cap = NonZeroUsize::new(max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        let mut index = SourceIndex {
            lru: LruCache::new(cap),
            total_bytes: 0,
        };
        let mut evicted = Vec::new();

        let persisted: Vec<(ImageId, SourceEntry)> = match blobs.get(INDEX_KEY).await? {
            Some(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("Source index is corrupt, rebuilding: {}", e);
                Vec::new()
            }),
            None => Vec::new(),
        };
        for (id, entry) in persisted {
            evicted.extend(index.insert(id, entry, max_bytes));
        }

        for key in blobs.keys(SOURCE_PREFIX).await? {
            let Some(raw_id) = key.strip_prefix(SOURCE_PREFIX) else {
                continue;
            };
            let Some(id) = ImageId::parse(raw_id) else {
                continue;
            };
            if index.lru.contains(&id) {
                continue;
            }
            let size = blobs.get(&key).await?.map(|b| b.len() as u64).unwrap_or(0);
            let now = Utc::now();
            debug!("Adopting unindexed source {}", id);
            evicted.extend(index.insert(
                id,
                SourceEntry {
                    size,
                    stored_at: now,
                    last_access: now,
                },
                max_bytes,
            ));
        }

        let cache = Self {
            blobs,
            index: Mutex::new(index),
            max_bytes,
            persist_lock: tokio::sync::Mutex::new(()),
        };
        cache.drop_blobs(&evicted).await;
        Ok(cache)
    }

    pub fn contains(&self, id: &ImageId) -> bool {
        self.index.lock().lru.contains(id)
    }

    pub fn len(&self) -> usize {
        self.index.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> u64 {
        self.index.lock().total_bytes
    }

    pub fn entry(&self, id: &ImageId) -> Option<SourceEntry> {
        self.index.lock().lru.peek(id).copied()
    }

    /// Cached bytes for `id`, marking it most recently used.
    ///
    /// The new access time is persisted right away so the retention sweep
    /// of a later session sees it. A failed index write only warns.
    pub async fn get(&self, id: &ImageId) -> Result<Option<Vec<u8>>, EngineError> {
        {
            let mut index = self.index.lock();
            match index.lru.get_mut(id) {
                Some(entry) => entry.last_access = Utc::now(),
                None => return Ok(None),
            }
        }
        let found = self.blobs.get(&source_key(id)).await?;
        if found.is_none() {
            warn!("Source {} indexed but missing from the store", id);
            self.index.lock().remove(id);
        }
        if let Err(e) = self.persist().await {
            warn!("Failed to persist source index after access: {}", e);
        }
        Ok(found)
    }

    /// Store `bytes` for `id`, evicting least recently used sources as
    /// needed.
    pub async fn put(&self, id: &ImageId, bytes: Vec<u8>) -> Result<(), EngineError> {
        let size = bytes.len() as u64;
        self.blobs.put(&source_key(id), bytes).await?;

        let now = Utc::now();
        let evicted = self.index.lock().insert(
            id.clone(),
            SourceEntry {
                size,
                stored_at: now,
                last_access: now,
            },
            self.max_bytes,
        );
        if !evicted.is_empty() {
            debug!("Source cache evicted {} entries", evicted.len());
        }
        self.drop_blobs(&evicted).await;
        self.persist().await
    }

    pub async fn remove(&self, id: &ImageId) -> Result<(), EngineError> {
        self.index.lock().remove(id);
        self.blobs.delete(&source_key(id)).await?;
        self.persist().await
    }

    /// Remove every entry not accessed since `cutoff` for which
    /// `is_referenced` is false.
    pub async fn sweep(
        &self,
        cutoff: DateTime<Utc>,
        is_referenced: impl Fn(&ImageId) -> bool,
    ) -> Result<Vec<ImageId>, EngineError> {
        let expired: Vec<ImageId> = {
            let mut index = self.index.lock();
            let ids: Vec<ImageId> = index
                .lru
                .iter()
                .filter(|(id, entry)| entry.last_access < cutoff && !is_referenced(id))
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                index.remove(id);
            }
            ids
        };
        self.drop_blobs(&expired).await;
        if !expired.is_empty() {
            self.persist().await?;
        }
        Ok(expired)
    }

    /// Write the index blob.
    pub async fn persist(&self) -> Result<(), EngineError> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.index.lock().snapshot();
        let json = serde_json::to_vec(&snapshot).map_err(|source| EngineError::Serialization {
            key: INDEX_KEY.into(),
            source,
        })?;
        self.blobs.put(INDEX_KEY, json).await
    }

    async fn drop_blobs(&self, ids: &[ImageId]) {
        for id in ids {
            if let Err(e) = self.blobs.delete(&source_key(id)).await {
                warn!("Failed to delete evicted source {}: {}", id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::blob::MemoryBlobStore;

    fn id(n: u8) -> ImageId {
        ImageId::from_bytes(&[n])
    }

    async fn cache(entries: usize, bytes: u64) -> (Arc<MemoryBlobStore>, SourceCache) {
        let blobs = Arc::new(MemoryBlobStore::new());
        let cache = SourceCache::load(blobs.clone(), entries, bytes).await.unwrap();
        (blobs, cache)
    }

    #[tokio::test]
    async fn entry_budget_evicts_least_recent() {
        let (blobs, cache) = cache(2, u64::MAX).await;
        cache.put(&id(1), vec![1; 4]).await.unwrap();
        cache.put(&id(2), vec![2; 4]).await.unwrap();
        // Touch 1 so 2 becomes the eviction candidate.
        assert!(cache.get(&id(1)).await.unwrap().is_some());
        cache.put(&id(3), vec![3; 4]).await.unwrap();

        assert!(cache.contains(&id(1)));
        assert!(!cache.contains(&id(2)));
        assert!(cache.contains(&id(3)));
        assert_eq!(blobs.get(&source_key(&id(2))).await.unwrap(), None);
    }

    #[tokio::test]
    async fn byte_budget_evicts_but_keeps_newest() {
        let (_blobs, cache) = cache(10, 10).await;
        cache.put(&id(1), vec![0; 6]).await.unwrap();
        cache.put(&id(2), vec![0; 6]).await.unwrap();
        assert!(!cache.contains(&id(1)));
        assert_eq!(cache.total_bytes(), 6);

        // Larger than the whole budget: kept anyway, it is the newest.
        cache.put(&id(3), vec![0; 50]).await.unwrap();
        assert!(cache.contains(&id(3)));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn replacing_an_entry_updates_size() {
        let (_blobs, cache) = cache(4, 100).await;
        cache.put(&id(1), vec![0; 30]).await.unwrap();
        cache.put(&id(1), vec![0; 10]).await.unwrap();
        assert_eq!(cache.total_bytes(), 10);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn index_survives_reload_and_adopts_orphans() {
        let blobs = Arc::new(MemoryBlobStore::new());
        {
            let cache = SourceCache::load(blobs.clone(), 8, 1024).await.unwrap();
            cache.put(&id(1), vec![1; 8]).await.unwrap();
            cache.put(&id(2), vec![2; 8]).await.unwrap();
        }
        blobs.put(&source_key(&id(3)), vec![3; 5]).await.unwrap();

        let cache = SourceCache::load(blobs, 8, 1024).await.unwrap();
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.total_bytes(), 21);
        assert_eq!(cache.get(&id(2)).await.unwrap(), Some(vec![2; 8]));
    }

    #[tokio::test]
    async fn sweep_respects_references_and_age() {
        let (_blobs, cache) = cache(8, 1024).await;
        cache.put(&id(1), vec![1]).await.unwrap();
        cache.put(&id(2), vec![2]).await.unwrap();

        let future = Utc::now() + chrono::Duration::seconds(60);
        let keep = id(1);
        let removed = cache.sweep(future, |i| *i == keep).await.unwrap();
        assert_eq!(removed, vec![id(2)]);
        assert!(cache.contains(&id(1)));

        let past = Utc::now() - chrono::Duration::days(1);
        assert!(cache.sweep(past, |_| false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn access_time_survives_reload() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let stored_at = {
            let cache = SourceCache::load(blobs.clone(), 8, 1024).await.unwrap();
            cache.put(&id(1), vec![1; 4]).await.unwrap();
            let stored_at = cache.entry(&id(1)).unwrap().last_access;
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            assert!(cache.get(&id(1)).await.unwrap().is_some());
            stored_at
        };

        let cache = SourceCache::load(blobs, 8, 1024).await.unwrap();
        let entry = cache.entry(&id(1)).unwrap();
        assert!(entry.last_access > stored_at);
        assert_eq!(entry.stored_at, stored_at);
    }

    #[tokio::test]
    async fn read_only_store_still_serves_hits() {
        let (blobs, cache) = cache(8, 1024).await;
        cache.put(&id(1), vec![1; 4]).await.unwrap();
        blobs.set_read_only(true);
        assert_eq!(cache.get(&id(1)).await.unwrap(), Some(vec![1; 4]));
    }

    #[tokio::test]
    async fn missing_blob_reads_as_miss() {
        let (blobs, cache) = cache(8, 1024).await;
        cache.put(&id(1), vec![1]).await.unwrap();
        blobs.delete(&source_key(&id(1))).await.unwrap();
        assert_eq!(cache.get(&id(1)).await.unwrap(), None);
        assert!(!cache.contains(&id(1)));
    }
}
