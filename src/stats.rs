//! Cache-hit/miss telemetry for one logical processing batch.
//!
//! [`StatsCollector`] is a passive [`ProcessingObserver`]: the scheduler and
//! the source cache report to it, it never influences scheduling. At batch
//! end [`StatsCollector::finish_batch`] snapshots the counters into a
//! [`CacheStats`] and logs its [`CacheStats::summary`].

use crate::card::{ImageId, TransformParams};
use crate::error::ImageError;
use crate::progress::ProcessingObserver;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

/// Counters for one logical import/processing batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_cards: usize,
    pub images_processed: usize,
    pub images_failed: usize,
    pub images_cancelled: usize,
    pub network_fetches: usize,
    pub persistent_cache_hits: usize,
    pub already_correct: usize,
    pub fetch_duration_ms: u64,
    pub process_duration_ms: u64,
    pub elapsed_ms: u64,
}

impl CacheStats {
    /// Multi-line human-readable report.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Image processing summary");
        let _ = writeln!(out, "  cards:            {}", self.total_cards);
        let _ = writeln!(out, "  processed:        {}", self.images_processed);
        let _ = writeln!(out, "  failed:           {}", self.images_failed);
        if self.images_cancelled > 0 {
            let _ = writeln!(out, "  cancelled:        {}", self.images_cancelled);
        }
        let _ = writeln!(out, "  already correct:  {}", self.already_correct);
        let _ = writeln!(out, "  source cache hits:{:>4}", self.persistent_cache_hits);
        let _ = writeln!(out, "  network fetches:  {}", self.network_fetches);
        let _ = write!(
            out,
            "  time:             {}ms total ({}ms fetch, {}ms process)",
            self.elapsed_ms, self.fetch_duration_ms, self.process_duration_ms
        );
        out
    }
}

/// Thread-safe accumulator behind [`CacheStats`].
pub struct StatsCollector {
    total_cards: AtomicUsize,
    images_processed: AtomicUsize,
    images_failed: AtomicUsize,
    images_cancelled: AtomicUsize,
    network_fetches: AtomicUsize,
    persistent_cache_hits: AtomicUsize,
    already_correct: AtomicUsize,
    fetch_duration_ms: AtomicU64,
    process_duration_ms: AtomicU64,
    batch_start: Mutex<Instant>,
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            total_cards: AtomicUsize::new(0),
            images_processed: AtomicUsize::new(0),
            images_failed: AtomicUsize::new(0),
            images_cancelled: AtomicUsize::new(0),
            network_fetches: AtomicUsize::new(0),
            persistent_cache_hits: AtomicUsize::new(0),
            already_correct: AtomicUsize::new(0),
            fetch_duration_ms: AtomicU64::new(0),
            process_duration_ms: AtomicU64::new(0),
            batch_start: Mutex::new(Instant::now()),
        }
    }

    /// Reset every counter and start timing a new batch.
    pub fn begin_batch(&self, total_cards: usize) {
        for counter in [
            &self.images_processed,
            &self.images_failed,
            &self.images_cancelled,
            &self.network_fetches,
            &self.persistent_cache_hits,
            &self.already_correct,
        ] {
            counter.store(0, Ordering::SeqCst);
        }
        self.fetch_duration_ms.store(0, Ordering::SeqCst);
        self.process_duration_ms.store(0, Ordering::SeqCst);
        self.total_cards.store(total_cards, Ordering::SeqCst);
        *self.batch_start.lock() = Instant::now();
    }

    /// Current counters without ending the batch.
    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            total_cards: self.total_cards.load(Ordering::SeqCst),
            images_processed: self.images_processed.load(Ordering::SeqCst),
            images_failed: self.images_failed.load(Ordering::SeqCst),
            images_cancelled: self.images_cancelled.load(Ordering::SeqCst),
            network_fetches: self.network_fetches.load(Ordering::SeqCst),
            persistent_cache_hits: self.persistent_cache_hits.load(Ordering::SeqCst),
            already_correct: self.already_correct.load(Ordering::SeqCst),
            fetch_duration_ms: self.fetch_duration_ms.load(Ordering::SeqCst),
            process_duration_ms: self.process_duration_ms.load(Ordering::SeqCst),
            elapsed_ms: self.batch_start.lock().elapsed().as_millis() as u64,
        }
    }

    /// Snapshot the batch and log its summary.
    pub fn finish_batch(&self) -> CacheStats {
        let stats = self.snapshot();
        for line in stats.summary().lines() {
            info!("{}", line);
        }
        stats
    }
}

impl ProcessingObserver for StatsCollector {
    fn on_batch_start(&self, total_cards: usize) {
        self.begin_batch(total_cards);
    }

    fn on_already_current(&self, _id: &ImageId) {
        self.already_correct.fetch_add(1, Ordering::SeqCst);
    }

    fn on_cache_hit(&self, _id: &ImageId) {
        self.persistent_cache_hits.fetch_add(1, Ordering::SeqCst);
    }

    fn on_network_fetch(&self, _id: &ImageId, _bytes: usize, elapsed: Duration) {
        self.network_fetches.fetch_add(1, Ordering::SeqCst);
        self.fetch_duration_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::SeqCst);
    }

    fn on_processed(&self, _id: &ImageId, _params: &TransformParams, elapsed: Duration) {
        self.images_processed.fetch_add(1, Ordering::SeqCst);
        self.process_duration_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::SeqCst);
    }

    fn on_failed(&self, _id: &ImageId, _error: &ImageError) {
        self.images_failed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_cancelled(&self, _id: &ImageId) {
        self.images_cancelled.fetch_add(1, Ordering::SeqCst);
    }
}
