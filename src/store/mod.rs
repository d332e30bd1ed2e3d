//! Content-addressed persistent cache.
//!
//! [`ContentStore`] owns three kinds of persisted data, all kept in one
//! [`BlobStore`]:
//!
//! ```text
//! records/<id>                    JSON ImageRecord (the commit point)
//! derived/<id>/<generation>/*.png display, darkened display, export
//! sources/<id>                    raw source bytes (LRU, see source_cache)
//! meta/source-index.json          source LRU metadata
//! ```
//!
//! Records are mirrored in memory (write-through) so staleness checks never
//! touch the backend. Every read-modify-write on a record holds that
//! record's async lock; different ids proceed concurrently.

pub mod blob;
pub(crate) mod locks;
pub mod record;
pub mod source_cache;

use crate::card::{ImageId, TransformParams};
use crate::config::EngineConfig;
use crate::error::{EngineError, ImageError};
use crate::pipeline::transform::DerivedImages;
use blob::BlobStore;
use chrono::{DateTime, Utc};
use futures::stream::{Stream, StreamExt};
use locks::KeyedLocks;
use parking_lot::RwLock;
use record::{
    record_key, DerivedKind, DerivedTags, ImageRecord, RecordPatch, DERIVED_PREFIX, RECORD_PREFIX,
};
use serde::{Deserialize, Serialize};
use source_cache::SourceCache;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;

/// A committed change to a record.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Created(ImageRecord),
    Updated(ImageRecord),
    Deleted(ImageId),
}

impl StoreEvent {
    pub fn id(&self) -> &ImageId {
        match self {
            StoreEvent::Created(r) | StoreEvent::Updated(r) => &r.id,
            StoreEvent::Deleted(id) => id,
        }
    }
}

/// What the startup sweep removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub records_removed: usize,
    pub sources_removed: usize,
    pub orphan_blobs_removed: usize,
}

pub struct ContentStore {
    blobs: Arc<dyn BlobStore>,
    records: RwLock<HashMap<ImageId, ImageRecord>>,
    locks: KeyedLocks,
    sources: SourceCache,
    events: broadcast::Sender<StoreEvent>,
}

impl ContentStore {
    /// Load every persisted record and the source index.
    ///
    /// A record that fails to parse is skipped with a warning; its blobs are
    /// reclaimed by the next [`ContentStore::sweep_expired`].
    pub async fn open(blobs: Arc<dyn BlobStore>, config: &EngineConfig) -> Result<Self, EngineError> {
        let mut records = HashMap::new();
        for key in blobs.keys(RECORD_PREFIX).await? {
            let Some(bytes) = blobs.get(&key).await? else {
                continue;
            };
            match serde_json::from_slice::<ImageRecord>(&bytes) {
                Ok(record) => {
                    records.insert(record.id.clone(), record);
                }
                Err(e) => warn!("Skipping corrupt record {}: {}", key, e),
            }
        }
        info!("Loaded {} image records", records.len());

        let sources = SourceCache::load(
            Arc::clone(&blobs),
            config.source_cache_entries,
            config.source_cache_bytes,
        )
        .await?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            blobs,
            records: RwLock::new(records),
            locks: KeyedLocks::default(),
            sources,
            events,
        })
    }

    // ── Records ──────────────────────────────────────────────────────────

    pub fn get(&self, id: &ImageId) -> Option<ImageRecord> {
        self.records.read().get(id).cloned()
    }

    pub fn contains(&self, id: &ImageId) -> bool {
        self.records.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn record_ids(&self) -> Vec<ImageId> {
        let mut ids: Vec<ImageId> = self.records.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Apply `patch` to the record for `id`, creating it if absent.
    pub async fn put(&self, id: &ImageId, patch: RecordPatch) -> Result<ImageRecord, EngineError> {
        self.modify(id, true, |record| {
            record.apply(patch);
            Ok(())
        })
        .await
    }

    /// Serialized read-modify-write of an existing record.
    ///
    /// `f` works on a copy; nothing changes if it errors or the write fails.
    pub async fn update(
        &self,
        id: &ImageId,
        f: impl FnOnce(&mut ImageRecord) -> Result<(), EngineError>,
    ) -> Result<ImageRecord, EngineError> {
        self.modify(id, false, f).await
    }

    /// Like [`ContentStore::update`], starting from an empty record with
    /// `ref_count == 0` when none exists.
    pub async fn upsert(
        &self,
        id: &ImageId,
        f: impl FnOnce(&mut ImageRecord) -> Result<(), EngineError>,
    ) -> Result<ImageRecord, EngineError> {
        self.modify(id, true, f).await
    }

    async fn modify(
        &self,
        id: &ImageId,
        create: bool,
        f: impl FnOnce(&mut ImageRecord) -> Result<(), EngineError>,
    ) -> Result<ImageRecord, EngineError> {
        let _guard = self.locks.lock(id).await;
        let existing = self.get(id);
        let created = existing.is_none();
        let mut record = match existing {
            Some(record) => record,
            None if create => ImageRecord::new(id.clone(), 0),
            None => return Err(EngineError::UnknownImage { id: id.clone() }),
        };
        f(&mut record)?;
        self.write_record(&record).await?;
        self.emit(if created {
            StoreEvent::Created(record.clone())
        } else {
            StoreEvent::Updated(record.clone())
        });
        Ok(record)
    }

    /// Remove the record, its derived blobs and its cached source.
    /// Returns whether a record existed.
    pub async fn delete(&self, id: &ImageId) -> Result<bool, EngineError> {
        let _guard = self.locks.lock(id).await;
        if !self.contains(id) {
            return Ok(false);
        }
        self.delete_locked(id).await?;
        Ok(true)
    }

    /// Delete only if the record still exists with no references.
    pub async fn delete_if_unreferenced(&self, id: &ImageId) -> Result<bool, EngineError> {
        let _guard = self.locks.lock(id).await;
        match self.get(id) {
            Some(record) if record.ref_count == 0 => {
                self.delete_locked(id).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_locked(&self, id: &ImageId) -> Result<(), EngineError> {
        self.blobs.delete(&record_key(id)).await?;
        self.records.write().remove(id);
        self.emit(StoreEvent::Deleted(id.clone()));

        // Past the commit point: failures here leave only orphans.
        let prefix = format!("{DERIVED_PREFIX}{}/", id.as_str());
        match self.blobs.keys(&prefix).await {
            Ok(keys) => self.delete_blobs(&keys).await,
            Err(e) => warn!("Could not list derived blobs of {}: {}", id, e),
        }
        if let Err(e) = self.sources.remove(id).await {
            warn!("Could not drop cached source of {}: {}", id, e);
        }
        debug!("Deleted image {}", id);
        Ok(())
    }

    /// Write a freshly rendered derivative set and retag the record.
    ///
    /// Blobs go under a new generation first; the record write is the commit
    /// point, after which the previous generation is deleted. `cancelled` is
    /// checked under the record lock right before each write, so a cancelled
    /// job never mutates the record.
    pub async fn commit_derived(
        &self,
        id: &ImageId,
        derived: &DerivedImages,
        params: &TransformParams,
        cancelled: &AtomicBool,
    ) -> Result<ImageRecord, ImageError> {
        let _guard = self.locks.lock(id).await;
        let cancelled_err = || ImageError::Cancelled { id: id.clone() };
        let Some(mut record) = self.get(id) else {
            return Err(ImageError::UnknownImage { id: id.clone() });
        };
        if cancelled.load(Ordering::SeqCst) {
            return Err(cancelled_err());
        }

        let generation = record.generation + 1;
        let tags = DerivedTags {
            generation,
            params: *params,
            display_blob: DerivedKind::Display.blob_key(id, generation),
            display_blob_darkened: DerivedKind::DisplayDarkened.blob_key(id, generation),
            export_blob: DerivedKind::Export.blob_key(id, generation),
        };
        let new_keys = [
            tags.display_blob.clone(),
            tags.display_blob_darkened.clone(),
            tags.export_blob.clone(),
        ];

        for (key, bytes) in new_keys.iter().zip([
            &derived.display,
            &derived.display_darkened,
            &derived.export,
        ]) {
            if let Err(e) = self.blobs.put(key, bytes.clone()).await {
                self.delete_blobs(&new_keys).await;
                return Err(ImageError::from_engine(id, e));
            }
        }

        if cancelled.load(Ordering::SeqCst) {
            self.delete_blobs(&new_keys).await;
            return Err(cancelled_err());
        }

        let old_keys = record.derived_keys();
        record.apply(RecordPatch {
            dimensions: Some((derived.source_width, derived.source_height)),
            derived: Some(tags),
            ..Default::default()
        });
        if let Err(e) = self.write_record(&record).await {
            self.delete_blobs(&new_keys).await;
            return Err(ImageError::from_engine(id, e));
        }
        self.delete_blobs(&old_keys).await;

        debug!(
            "Committed generation {} of {} at {}",
            generation, id, params
        );
        self.emit(StoreEvent::Updated(record.clone()));
        Ok(record)
    }

    async fn write_record(&self, record: &ImageRecord) -> Result<(), EngineError> {
        let key = record_key(&record.id);
        let json = serde_json::to_vec(record)
            .map_err(|source| EngineError::Serialization { key: key.clone(), source })?;
        self.blobs.put(&key, json).await?;
        self.records.write().insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn delete_blobs(&self, keys: &[String]) {
        for key in keys {
            if let Err(e) = self.blobs.delete(key).await {
                warn!("Failed to delete blob {}: {}", key, e);
            }
        }
    }

    // ── Blobs ────────────────────────────────────────────────────────────

    pub async fn read_blob(&self, key: &str) -> Result<Option<Vec<u8>>, EngineError> {
        self.blobs.get(key).await
    }

    /// Bytes of the committed derivative of `kind`, if one exists.
    pub async fn load_derived(
        &self,
        id: &ImageId,
        kind: DerivedKind,
    ) -> Result<Option<Vec<u8>>, EngineError> {
        let record = self
            .get(id)
            .ok_or_else(|| EngineError::UnknownImage { id: id.clone() })?;
        match record.blob_key(kind) {
            Some(key) => self.blobs.get(key).await,
            None => Ok(None),
        }
    }

    // ── Raw sources ──────────────────────────────────────────────────────

    pub fn has_source(&self, id: &ImageId) -> bool {
        self.sources.contains(id)
    }

    pub async fn load_source(&self, id: &ImageId) -> Result<Option<Vec<u8>>, EngineError> {
        self.sources.get(id).await
    }

    pub async fn store_source(&self, id: &ImageId, bytes: Vec<u8>) -> Result<(), EngineError> {
        self.sources.put(id, bytes).await
    }

    pub fn sources(&self) -> &SourceCache {
        &self.sources
    }

    // ── Expiry ───────────────────────────────────────────────────────────

    /// Reclaim space left behind by earlier sessions.
    ///
    /// Removes records whose count has been zero for longer than
    /// `release_grace` (their deletion timers did not survive the restart),
    /// sources not accessed within `retention` whose record is gone or
    /// unreferenced, and derived blobs no record points at. Must run before
    /// any job is scheduled.
    pub async fn sweep_expired(
        &self,
        release_grace: Duration,
        retention: Duration,
    ) -> Result<SweepReport, EngineError> {
        let now = Utc::now();
        let mut report = SweepReport::default();

        let released_cutoff = cutoff(now, release_grace);
        let expired: Vec<ImageId> = self
            .records
            .read()
            .values()
            .filter(|r| r.ref_count == 0)
            .filter(|r| r.released_at.unwrap_or(r.updated_at) <= released_cutoff)
            .map(|r| r.id.clone())
            .collect();
        for id in expired {
            if self.delete_if_unreferenced(&id).await? {
                report.records_removed += 1;
            }
        }

        let removed = self
            .sources
            .sweep(cutoff(now, retention), |id| {
                self.records
                    .read()
                    .get(id)
                    .is_some_and(|r| r.ref_count > 0)
            })
            .await?;
        report.sources_removed = removed.len();

        let live: HashSet<String> = self
            .records
            .read()
            .values()
            .flat_map(ImageRecord::derived_keys)
            .collect();
        let orphans: Vec<String> = self
            .blobs
            .keys(DERIVED_PREFIX)
            .await?
            .into_iter()
            .filter(|key| !live.contains(key))
            .collect();
        report.orphan_blobs_removed = orphans.len();
        self.delete_blobs(&orphans).await;

        if report != SweepReport::default() {
            info!(
                "Sweep removed {} records, {} sources, {} orphan blobs",
                report.records_removed, report.sources_removed, report.orphan_blobs_removed
            );
        }
        Ok(report)
    }

    // ── Change notification ──────────────────────────────────────────────

    /// Every committed change, for any record.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Committed changes to one record.
    ///
    /// A subscriber that falls more than the channel capacity behind skips
    /// the missed events; re-reading with [`ContentStore::get`] recovers the
    /// current state.
    pub fn changes(&self, id: &ImageId) -> impl Stream<Item = StoreEvent> + Send + 'static {
        let id = id.clone();
        BroadcastStream::new(self.events.subscribe()).filter_map(move |event| {
            let item = match event {
                Ok(event) if event.id() == &id => Some(event),
                Ok(_) => None,
                Err(e) => {
                    warn!("Change stream for {} lagged: {}", id, e);
                    None
                }
            };
            futures::future::ready(item)
        })
    }

    fn emit(&self, event: StoreEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
