//! Single-flight acquisition of raw source bytes.
//!
//! Both the registry's background prefetch and a transform job may want the
//! same source at the same time. [`SourceLoader::load`] hands every
//! concurrent caller for one id the same shared future, so at most one
//! network fetch per id is ever in flight.

use crate::card::ImageId;
use crate::error::ImageError;
use crate::pipeline::fetch::{fetch_first, SourceFetcher};
use crate::progress::Observers;
use crate::store::ContentStore;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

type SharedLoad = Shared<BoxFuture<'static, Result<Arc<Vec<u8>>, ImageError>>>;

pub(crate) struct SourceLoader {
    store: Arc<ContentStore>,
    fetcher: Arc<dyn SourceFetcher>,
    observers: Arc<Observers>,
    inflight: Arc<Mutex<HashMap<ImageId, SharedLoad>>>,
}

impl SourceLoader {
    pub(crate) fn new(
        store: Arc<ContentStore>,
        fetcher: Arc<dyn SourceFetcher>,
        observers: Arc<Observers>,
    ) -> Self {
        Self {
            store,
            fetcher,
            observers,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Source bytes for `id`: from the source cache if present, otherwise
    /// fetched from `urls` and written back to the cache.
    pub(crate) async fn load(
        &self,
        id: &ImageId,
        urls: &[String],
    ) -> Result<Arc<Vec<u8>>, ImageError> {
        let load = self
            .inflight
            .lock()
            .entry(id.clone())
            .or_insert_with(|| self.start(id.clone(), urls.to_vec()))
            .clone();
        load.await
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.inflight.lock().len()
    }

    fn start(&self, id: ImageId, urls: Vec<String>) -> SharedLoad {
        let store = Arc::clone(&self.store);
        let fetcher = Arc::clone(&self.fetcher);
        let observers = Arc::clone(&self.observers);
        let inflight = Arc::clone(&self.inflight);
        async move {
            let result = obtain(&store, fetcher.as_ref(), &observers, &id, &urls).await;
            inflight.lock().remove(&id);
            result
        }
        .boxed()
        .shared()
    }
}

async fn obtain(
    store: &ContentStore,
    fetcher: &dyn SourceFetcher,
    observers: &Observers,
    id: &ImageId,
    urls: &[String],
) -> Result<Arc<Vec<u8>>, ImageError> {
    match store.load_source(id).await {
        Ok(Some(bytes)) => {
            debug!("Source cache hit for {}", id);
            observers.each(|o| o.on_cache_hit(id));
            return Ok(Arc::new(bytes));
        }
        Ok(None) => {}
        // An unreadable cache is treated as a miss.
        Err(e) => warn!("Source cache read for {} failed: {}", id, e),
    }

    let start = Instant::now();
    let bytes = fetch_first(fetcher, id, urls).await?;
    let elapsed = start.elapsed();
    debug!("Fetched {} bytes for {} in {:?}", bytes.len(), id, elapsed);
    observers.each(|o| o.on_network_fetch(id, bytes.len(), elapsed));

    // The record may have been released while the fetch ran.
    if !store.contains(id) {
        debug!("Image {} was removed during fetch, not caching its source", id);
        return Ok(Arc::new(bytes));
    }
    if let Err(e) = store.store_source(id, bytes.clone()).await {
        warn!("Could not cache source for {}: {}", id, e);
    } else if !store.contains(id) {
        if let Err(e) = store.sources().remove(id).await {
            warn!("Could not drop source of removed image {}: {}", id, e);
        }
    }
    Ok(Arc::new(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::progress::SharedObserver;
    use crate::stats::StatsCollector;
    use crate::store::blob::MemoryBlobStore;
    use crate::store::record::RecordPatch;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Slow {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SourceFetcher for Slow {
        async fn fetch(&self, _url: &str) -> Result<Vec<u8>, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(vec![1, 2, 3])
        }
    }

    struct Fixture {
        fetcher: Arc<Slow>,
        stats: Arc<StatsCollector>,
        store: Arc<ContentStore>,
        loader: SourceLoader,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(
            ContentStore::open(Arc::new(MemoryBlobStore::new()), &EngineConfig::default())
                .await
                .unwrap(),
        );
        let fetcher = Arc::new(Slow {
            calls: AtomicUsize::new(0),
        });
        let stats = Arc::new(StatsCollector::new());
        let observers = Arc::new(Observers::new(vec![stats.clone() as SharedObserver]));
        let loader = SourceLoader::new(Arc::clone(&store), fetcher.clone(), observers);
        Fixture {
            fetcher,
            stats,
            store,
            loader,
        }
    }

    #[tokio::test]
    async fn concurrent_loads_fetch_once() {
        let Fixture {
            fetcher,
            stats,
            store,
            loader,
        } = fixture().await;
        let id = ImageId::from_url("https://cards.example/a.png");
        let urls = vec!["https://cards.example/a.png".to_string()];
        store.put(&id, RecordPatch::default()).await.unwrap();

        let (a, b) = tokio::join!(loader.load(&id, &urls), loader.load(&id, &urls));
        assert_eq!(*a.unwrap(), vec![1, 2, 3]);
        assert_eq!(*b.unwrap(), vec![1, 2, 3]);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(loader.in_flight(), 0);

        // Now cached.
        loader.load(&id, &urls).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        let s = stats.snapshot();
        assert_eq!(s.network_fetches, 1);
        assert_eq!(s.persistent_cache_hits, 1);
    }

    #[tokio::test]
    async fn fetch_for_removed_record_is_not_cached() {
        let f = fixture().await;
        let id = ImageId::from_url("https://cards.example/gone.png");
        let urls = vec!["https://cards.example/gone.png".to_string()];

        assert_eq!(*f.loader.load(&id, &urls).await.unwrap(), vec![1, 2, 3]);
        assert!(!f.store.has_source(&id));
        assert_eq!(f.fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_urls_and_no_cache_is_a_fetch_error() {
        let loader = fixture().await.loader;
        let id = ImageId::from_bytes(b"lost upload");
        let err = loader.load(&id, &[]).await.unwrap_err();
        assert!(matches!(err, ImageError::Fetch { .. }));
    }
}
