//! Observer trait for scheduler and cache events.
//!
//! The engine reports every step of a job (dispatch, source cache hit,
//! network fetch, transform, commit, failure, cancellation) to the built-in
//! [`crate::stats::StatsCollector`] and, when configured, to one extra
//! [`ProcessingObserver`] supplied through
//! [`crate::config::EngineConfigBuilder::observer`]. The CLI uses the latter
//! to drive its progress bar.
//!
//! # Example
//!
//! ```rust
//! use cardproxy_engine::{EngineConfig, ImageId, ProcessingObserver, TransformParams};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//! use std::time::Duration;
//!
//! struct Counting(AtomicUsize);
//!
//! impl ProcessingObserver for Counting {
//!     fn on_processed(&self, _id: &ImageId, _params: &TransformParams, _elapsed: Duration) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//!
//! let config = EngineConfig::builder()
//!     .observer(Arc::new(Counting(AtomicUsize::new(0))))
//!     .build()
//!     .unwrap();
//! ```

use crate::card::{ImageId, Priority, TransformParams};
use crate::error::ImageError;
use crate::stats::CacheStats;
use std::sync::Arc;
use std::time::Duration;

/// Called by the engine as it processes images.
///
/// Implementations must be `Send + Sync`: events arrive concurrently from
/// every worker. All methods default to no-ops.
pub trait ProcessingObserver: Send + Sync {
    /// A logical batch (one import, one bulk reprocess) begins.
    fn on_batch_start(&self, total_cards: usize) {
        let _ = total_cards;
    }

    /// A queued job was handed to a worker.
    fn on_job_started(&self, id: &ImageId, params: &TransformParams, priority: Priority) {
        let _ = (id, params, priority);
    }

    /// The record already carried derivatives for the requested parameters.
    fn on_already_current(&self, id: &ImageId) {
        let _ = id;
    }

    /// Raw source bytes were served from the persistent source cache.
    fn on_cache_hit(&self, id: &ImageId) {
        let _ = id;
    }

    /// Raw source bytes had to be fetched over the network.
    fn on_network_fetch(&self, id: &ImageId, bytes: usize, elapsed: Duration) {
        let _ = (id, bytes, elapsed);
    }

    /// A job committed fresh derivatives.
    fn on_processed(&self, id: &ImageId, params: &TransformParams, elapsed: Duration) {
        let _ = (id, params, elapsed);
    }

    /// A job failed; `error` is what every attached caller receives.
    fn on_failed(&self, id: &ImageId, error: &ImageError) {
        let _ = (id, error);
    }

    /// A job was cancelled before committing.
    fn on_cancelled(&self, id: &ImageId) {
        let _ = id;
    }

    /// The batch finished; `stats` is the collector's final snapshot.
    fn on_batch_complete(&self, stats: &CacheStats) {
        let _ = stats;
    }
}

/// A no-op implementation for callers that don't need events.
pub struct NoopObserver;

impl ProcessingObserver for NoopObserver {}

/// Convenience alias for the type stored in [`crate::config::EngineConfig`].
pub type SharedObserver = Arc<dyn ProcessingObserver>;

/// Fans one event out to several observers.
pub(crate) struct Observers(Vec<SharedObserver>);

impl Observers {
    pub(crate) fn new(observers: Vec<SharedObserver>) -> Self {
        Self(observers)
    }

    pub(crate) fn each(&self, f: impl Fn(&dyn ProcessingObserver)) {
        for observer in &self.0 {
            f(observer.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Tracking {
        started: AtomicUsize,
        failed: AtomicUsize,
    }

    impl ProcessingObserver for Tracking {
        fn on_job_started(&self, _id: &ImageId, _params: &TransformParams, _priority: Priority) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        fn on_failed(&self, _id: &ImageId, _error: &ImageError) {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn params() -> TransformParams {
        TransformParams {
            dpi: 300,
            bleed_width: Default::default(),
            darken: Default::default(),
        }
    }

    #[test]
    fn noop_observer_does_not_panic() {
        let id = ImageId::from_bytes(b"a");
        let o = NoopObserver;
        o.on_batch_start(3);
        o.on_job_started(&id, &params(), Priority::High);
        o.on_cache_hit(&id);
        o.on_network_fetch(&id, 10, Duration::from_millis(5));
        o.on_processed(&id, &params(), Duration::from_millis(5));
        o.on_cancelled(&id);
        o.on_batch_complete(&CacheStats::default());
    }

    #[test]
    fn fan_out_reaches_every_observer() {
        let a = Arc::new(Tracking {
            started: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        });
        let b = Arc::new(Tracking {
            started: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        });
        let fan = Observers::new(vec![a.clone(), b.clone(), Arc::new(NoopObserver)]);
        let id = ImageId::from_bytes(b"a");

        fan.each(|o| o.on_job_started(&id, &params(), Priority::Low));
        fan.each(|o| o.on_failed(&id, &ImageError::Cancelled { id: id.clone() }));

        assert_eq!(a.started.load(Ordering::SeqCst), 1);
        assert_eq!(b.started.load(Ordering::SeqCst), 1);
        assert_eq!(b.failed.load(Ordering::SeqCst), 1);
    }
}
