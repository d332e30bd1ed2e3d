//! The engine service handed to the rest of the application.
//!
//! One [`ProxyEngine`] is opened at startup and cloned into every consumer.
//! It owns the store, the registry, the scheduler and the stats collector;
//! nothing in the crate is global.

use crate::card::{BleedWidth, CardEntry, ImageId, Priority, ProcessingSettings, SourceDescriptor};
use crate::config::EngineConfig;
use crate::error::{EngineError, ImageError};
use crate::pipeline::fetch::{HttpFetcher, SourceFetcher};
use crate::progress::{Observers, SharedObserver};
use crate::registry::RefCountedImageRegistry;
use crate::scheduler::{PriorityScheduler, ProcessOutcome, ProcessingScope, ReprocessReport};
use crate::source::SourceLoader;
use crate::stats::{CacheStats, StatsCollector};
use crate::store::blob::{BlobStore, FsBlobStore};
use crate::store::record::{DerivedKind, ImageRecord};
use crate::store::{ContentStore, StoreEvent, SweepReport};
use futures::stream::Stream;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

struct EngineInner {
    config: EngineConfig,
    store: Arc<ContentStore>,
    registry: RefCountedImageRegistry,
    scheduler: PriorityScheduler,
    stats: Arc<StatsCollector>,
    observers: Arc<Observers>,
    default_scope: ProcessingScope,
    startup_sweep: SweepReport,
}

/// Handle to a running transform-and-cache engine. Cheap to clone.
///
/// # Example
///
/// ```rust,no_run
/// use cardproxy_engine::{
///     CardEntry, EngineConfig, Priority, ProcessingSettings, ProxyEngine, SourceDescriptor,
/// };
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let engine = ProxyEngine::open_dir(EngineConfig::default(), "cache").await?;
/// let id = engine
///     .acquire_image(SourceDescriptor::url("https://cards.example/bolt.png"), 4)
///     .await?;
/// let card = CardEntry::new(id.clone(), "Lightning Bolt");
/// engine
///     .ensure_processed(&card, &ProcessingSettings::default(), Priority::High)
///     .await?;
/// let png = engine.load_export(&id).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ProxyEngine {
    inner: Arc<EngineInner>,
}

impl ProxyEngine {
    /// Open the engine over `blobs`, fetching remote sources with `fetcher`.
    ///
    /// Runs the expiry sweep before accepting any request.
    pub async fn open(
        config: EngineConfig,
        blobs: Arc<dyn BlobStore>,
        fetcher: Arc<dyn SourceFetcher>,
    ) -> Result<Self, EngineError> {
        let store = Arc::new(ContentStore::open(blobs, &config).await?);
        let startup_sweep = store
            .sweep_expired(config.release_grace, config.source_retention)
            .await?;

        let stats = Arc::new(StatsCollector::new());
        let mut observers: Vec<SharedObserver> = vec![stats.clone() as SharedObserver];
        if let Some(extra) = &config.observer {
            observers.push(Arc::clone(extra));
        }
        let observers = Arc::new(Observers::new(observers));

        let loader = Arc::new(SourceLoader::new(
            Arc::clone(&store),
            fetcher,
            Arc::clone(&observers),
        ));
        let registry = RefCountedImageRegistry::new(
            Arc::clone(&store),
            Arc::clone(&loader),
            config.release_grace,
        );
        let scheduler = PriorityScheduler::new(
            &config,
            Arc::clone(&store),
            loader,
            Arc::clone(&observers),
        );
        let default_scope = scheduler.scope("default");

        info!(
            "Engine ready: {} records, {} workers, display {} dpi",
            store.len(),
            config.workers,
            config.display_dpi
        );
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                store,
                registry,
                scheduler,
                stats,
                observers,
                default_scope,
                startup_sweep,
            }),
        })
    }

    /// Open over a cache directory with the HTTP fetcher.
    pub async fn open_dir(config: EngineConfig, dir: impl AsRef<Path>) -> Result<Self, EngineError> {
        let blobs = Arc::new(FsBlobStore::open(dir.as_ref()).await?);
        let fetcher = HttpFetcher::new(config.fetch_timeout_secs)
            .map_err(|e| EngineError::InvalidConfig(format!("HTTP client: {e}")))?;
        Self::open(config, blobs, Arc::new(fetcher)).await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &ContentStore {
        &self.inner.store
    }

    pub fn registry(&self) -> &RefCountedImageRegistry {
        &self.inner.registry
    }

    pub fn scheduler(&self) -> &PriorityScheduler {
        &self.inner.scheduler
    }

    /// What the sweep at open time removed.
    pub fn startup_sweep(&self) -> &SweepReport {
        &self.inner.startup_sweep
    }

    // ── References ───────────────────────────────────────────────────────

    pub async fn acquire_image(
        &self,
        source: SourceDescriptor,
        quantity: u32,
    ) -> Result<ImageId, EngineError> {
        self.inner.registry.acquire(source, quantity).await
    }

    pub async fn link_additional_reference(&self, id: &ImageId) -> Result<u32, EngineError> {
        self.inner.registry.link_additional_reference(id).await
    }

    pub async fn release_reference(&self, id: &ImageId) -> Result<u32, EngineError> {
        self.inner.registry.release_reference(id).await
    }

    pub fn ref_count(&self, id: &ImageId) -> Option<u32> {
        self.inner.registry.ref_count(id)
    }

    // ── Processing ───────────────────────────────────────────────────────

    /// A new cancellation scope, e.g. one per open view.
    pub fn scope(&self, name: impl Into<String>) -> ProcessingScope {
        self.inner.scheduler.scope(name)
    }

    /// [`ProcessingScope::ensure_processed`] on the engine's default scope.
    pub async fn ensure_processed(
        &self,
        card: &CardEntry,
        settings: &ProcessingSettings,
        priority: Priority,
    ) -> Result<ProcessOutcome, ImageError> {
        self.inner
            .default_scope
            .ensure_processed(card, settings, priority)
            .await
    }

    /// [`ProcessingScope::reprocess_selected_images`] on the default scope.
    pub async fn reprocess_selected_images(
        &self,
        cards: &[CardEntry],
        settings: &ProcessingSettings,
        bleed_width: BleedWidth,
    ) -> ReprocessReport {
        self.inner
            .default_scope
            .reprocess_selected_images(cards, settings, bleed_width)
            .await
    }

    /// Cancel requests made through the default scope.
    pub fn cancel_processing(&self) -> usize {
        self.inner.default_scope.cancel_processing()
    }

    pub fn cancel_all_processing(&self) -> usize {
        self.inner.scheduler.cancel_all_processing()
    }

    // ── Statistics ───────────────────────────────────────────────────────

    /// Reset the counters and notify observers that `total_cards` cards are
    /// about to be processed.
    pub fn begin_batch(&self, total_cards: usize) {
        self.inner
            .observers
            .each(|o| o.on_batch_start(total_cards));
    }

    /// Close the batch: log the summary and return the final counters.
    pub fn finish_batch(&self) -> CacheStats {
        let stats = self.inner.stats.finish_batch();
        self.inner.observers.each(|o| o.on_batch_complete(&stats));
        stats
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.stats.snapshot()
    }

    // ── Reads ────────────────────────────────────────────────────────────

    pub fn get_record(&self, id: &ImageId) -> Option<ImageRecord> {
        self.inner.store.get(id)
    }

    /// Committed export PNG of `id`, if it was processed.
    pub async fn load_export(&self, id: &ImageId) -> Result<Option<Vec<u8>>, EngineError> {
        self.inner.store.load_derived(id, DerivedKind::Export).await
    }

    /// Committed display PNG of `id`, darkened or not.
    pub async fn load_display(
        &self,
        id: &ImageId,
        darkened: bool,
    ) -> Result<Option<Vec<u8>>, EngineError> {
        let kind = if darkened {
            DerivedKind::DisplayDarkened
        } else {
            DerivedKind::Display
        };
        self.inner.store.load_derived(id, kind).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.store.subscribe()
    }

    /// Committed changes to one record.
    pub fn changes(&self, id: &ImageId) -> impl Stream<Item = StoreEvent> + Send + 'static {
        self.inner.store.changes(id)
    }
}
