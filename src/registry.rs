//! Reference counting of stored images.
//!
//! Many card slots can point at one piece of artwork (three copies of the
//! same card, the same basic land in two decks). The registry keeps each
//! record's `ref_count` equal to the number of live slots and deletes the
//! record, its derivatives and its cached source once nothing references
//! it. Deletion waits `release_grace` so an undo can revive the record
//! without refetching or reprocessing.

use crate::card::{ImageId, SourceDescriptor};
use crate::error::EngineError;
use crate::source::SourceLoader;
use crate::store::record::RecordPatch;
use crate::store::ContentStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct RefCountedImageRegistry {
    store: Arc<ContentStore>,
    loader: Arc<SourceLoader>,
    release_grace: Duration,
    /// Ids whose count hit zero, mapped to the token of their deletion timer.
    pending_releases: Arc<Mutex<HashMap<ImageId, u64>>>,
    next_token: AtomicU64,
}

impl RefCountedImageRegistry {
    pub(crate) fn new(
        store: Arc<ContentStore>,
        loader: Arc<SourceLoader>,
        release_grace: Duration,
    ) -> Self {
        Self {
            store,
            loader,
            release_grace,
            pending_releases: Arc::new(Mutex::new(HashMap::new())),
            next_token: AtomicU64::new(0),
        }
    }

    /// Register `quantity` new references to the artwork in `source`.
    ///
    /// Returns the existing id when the same content was acquired before
    /// (cancelling a pending deletion), otherwise creates the record.
    /// Uploaded bytes are cached right away; remote sources get one
    /// background prefetch unless already cached.
    pub async fn acquire(
        &self,
        source: SourceDescriptor,
        quantity: u32,
    ) -> Result<ImageId, EngineError> {
        if quantity == 0 {
            return Err(EngineError::InvalidQuantity);
        }
        let id = source.image_id()?;
        self.pending_releases.lock().remove(&id);

        let (urls, file_name) = match &source {
            SourceDescriptor::Upload { file_name, .. } => (Vec::new(), file_name.clone()),
            SourceDescriptor::Remote { urls } => (
                urls.iter()
                    .map(|u| u.trim().to_string())
                    .filter(|u| !u.is_empty())
                    .collect(),
                None,
            ),
        };
        let prefetch_urls = urls.clone();
        let record = self
            .store
            .upsert(&id, |record| {
                let refs = record
                    .ref_count
                    .checked_add(quantity)
                    .ok_or_else(|| EngineError::Internal(format!("reference count overflow on {id}")))?;
                record.apply(RecordPatch {
                    ref_count: Some(refs),
                    source_urls: (!urls.is_empty()).then_some(urls),
                    file_name,
                    ..Default::default()
                });
                Ok(())
            })
            .await?;

        if record.ref_count == quantity {
            info!("Registered image {} ({} references)", id, quantity);
        } else {
            debug!("Image {} now has {} references", id, record.ref_count);
        }

        match source {
            SourceDescriptor::Upload { bytes, .. } => {
                if !self.store.has_source(&id) {
                    self.store.store_source(&id, bytes).await?;
                }
            }
            SourceDescriptor::Remote { .. } => {
                if !self.store.has_source(&id) {
                    self.prefetch(id.clone(), prefetch_urls);
                }
            }
        }
        Ok(id)
    }

    /// One more slot now points at `id`.
    pub async fn link_additional_reference(&self, id: &ImageId) -> Result<u32, EngineError> {
        self.pending_releases.lock().remove(id);
        let record = self
            .store
            .update(id, |record| {
                let refs = record
                    .ref_count
                    .checked_add(1)
                    .ok_or_else(|| EngineError::Internal(format!("reference count overflow on {id}")))?;
                record.apply(RecordPatch {
                    ref_count: Some(refs),
                    ..Default::default()
                });
                Ok(())
            })
            .await?;
        Ok(record.ref_count)
    }

    /// One slot stopped pointing at `id`. Returns the remaining count; at
    /// zero the record is scheduled for deletion.
    pub async fn release_reference(&self, id: &ImageId) -> Result<u32, EngineError> {
        let record = self
            .store
            .update(id, |record| {
                if record.ref_count == 0 {
                    return Err(EngineError::NoReferences { id: id.clone() });
                }
                record.apply(RecordPatch {
                    ref_count: Some(record.ref_count - 1),
                    ..Default::default()
                });
                Ok(())
            })
            .await?;

        if record.ref_count == 0 {
            self.schedule_deletion(id).await?;
        }
        Ok(record.ref_count)
    }

    pub fn ref_count(&self, id: &ImageId) -> Option<u32> {
        self.store.get(id).map(|r| r.ref_count)
    }

    /// True while a released record waits out its grace period.
    pub fn is_pending_release(&self, id: &ImageId) -> bool {
        self.pending_releases.lock().contains_key(id)
    }

    async fn schedule_deletion(&self, id: &ImageId) -> Result<(), EngineError> {
        if self.release_grace.is_zero() {
            if self.store.delete_if_unreferenced(id).await? {
                info!("Removed unreferenced image {}", id);
            }
            return Ok(());
        }

        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        self.pending_releases.lock().insert(id.clone(), token);
        debug!("Image {} unreferenced, deleting in {:?}", id, self.release_grace);

        let store = Arc::clone(&self.store);
        let pending = Arc::clone(&self.pending_releases);
        let grace = self.release_grace;
        let id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            {
                let mut pending = pending.lock();
                // Re-acquired, or released again with a newer timer.
                if pending.get(&id) != Some(&token) {
                    return;
                }
                pending.remove(&id);
            }
            match store.delete_if_unreferenced(&id).await {
                Ok(true) => info!("Removed unreferenced image {}", id),
                Ok(false) => {}
                Err(e) => warn!("Deferred deletion of {} failed: {}", id, e),
            }
        });
        Ok(())
    }

    fn prefetch(&self, id: ImageId, urls: Vec<String>) {
        let loader = Arc::clone(&self.loader);
        tokio::spawn(async move {
            if let Err(e) = loader.load(&id, &urls).await {
                warn!("Prefetch failed: {}", e);
            }
        });
    }
}
