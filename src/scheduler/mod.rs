//! Priority scheduling of transform jobs.
//!
//! Callers ask for a card to be processed through a [`ProcessingScope`].
//! Requests for the same `(image, parameters)` pair share one job; queued
//! jobs dispatch HIGH before LOW, FIFO within a level, onto at most
//! `workers` concurrent workers. Running jobs are never preempted.
//!
//! Cancellation is per scope: cancelling detaches the scope's callers (they
//! resolve with [`ImageError::Cancelled`]) and a job left with no caller is
//! cancelled. A cancelled job never writes to the store.

mod queue;
mod worker;

use crate::card::{BleedWidth, CardEntry, ImageId, Priority, ProcessingSettings, TransformParams};
use crate::config::EngineConfig;
use crate::error::ImageError;
use crate::progress::Observers;
use crate::source::SourceLoader;
use crate::store::record::ImageRecord;
use crate::store::ContentStore;
use futures::future::join_all;
use parking_lot::Mutex;
use queue::{Cancellation, JobQueue, Waiter};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info};
use worker::Worker;

/// Deduplication key of a transform job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub id: ImageId,
    pub params: TransformParams,
}

/// Identifies the caller group a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(u64);

/// How a request was satisfied.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// The record already carried derivatives for the requested parameters.
    AlreadyCurrent(ImageRecord),
    /// Fresh derivatives were computed and committed.
    Regenerated(ImageRecord),
}

impl ProcessOutcome {
    pub fn record(&self) -> &ImageRecord {
        match self {
            ProcessOutcome::AlreadyCurrent(r) | ProcessOutcome::Regenerated(r) => r,
        }
    }

    pub fn was_regenerated(&self) -> bool {
        matches!(self, ProcessOutcome::Regenerated(_))
    }
}

pub(crate) type Outcome = Result<ProcessOutcome, ImageError>;

/// Result of a bulk reprocess.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReprocessReport {
    /// Distinct `(image, parameters)` targets among the selected cards.
    pub requested: usize,
    pub regenerated: usize,
    pub already_current: usize,
    /// Superseded by a newer bulk reprocess or cancelled by the caller.
    pub cancelled: usize,
    pub failed: Vec<ImageError>,
}

struct Inner {
    queue: Mutex<JobQueue>,
    worker: Worker,
    observers: Arc<Observers>,
    workers: usize,
    next_scope: AtomicU64,
    bulk_epoch: AtomicU64,
    bulk_lock: tokio::sync::Mutex<()>,
}

/// Bounded-concurrency job scheduler. Cheap to clone.
#[derive(Clone)]
pub struct PriorityScheduler {
    inner: Arc<Inner>,
}

impl PriorityScheduler {
    pub(crate) fn new(
        config: &EngineConfig,
        store: Arc<ContentStore>,
        loader: Arc<SourceLoader>,
        observers: Arc<Observers>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(JobQueue::default()),
                worker: Worker {
                    store,
                    loader,
                    observers: Arc::clone(&observers),
                    config: config.clone(),
                },
                observers,
                workers: config.workers.max(1),
                next_scope: AtomicU64::new(0),
                bulk_epoch: AtomicU64::new(0),
                bulk_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// A new cancellation scope.
    pub fn scope(&self, name: impl Into<String>) -> ProcessingScope {
        let id = ScopeId(self.inner.next_scope.fetch_add(1, Ordering::SeqCst));
        ProcessingScope {
            id,
            name: name.into(),
            scheduler: self.clone(),
        }
    }

    /// Cancel every queued and running request of every scope.
    pub fn cancel_all_processing(&self) -> usize {
        let cancellation = self.inner.queue.lock().cancel_where(|_, _, _| true);
        let n = cancellation.waiters.len();
        self.resolve_cancelled(cancellation);
        if n > 0 {
            info!("Cancelled {} pending requests", n);
        }
        n
    }

    /// Jobs currently running.
    pub fn running(&self) -> usize {
        self.inner.queue.lock().running()
    }

    /// Jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.inner.queue.lock().queued()
    }

    async fn ensure_processed(
        &self,
        scope: ScopeId,
        card: &CardEntry,
        settings: &ProcessingSettings,
        priority: Priority,
    ) -> Outcome {
        let params = TransformParams::resolve(card, settings);
        self.request(scope, &card.image_id, params, priority, None)?
            .await
            .unwrap_or_else(|_| Err(ImageError::Cancelled {
                id: card.image_id.clone(),
            }))
    }

    /// Resolve immediately when the record is current, otherwise attach a
    /// waiter to the job for `(id, params)`.
    fn request(
        &self,
        scope: ScopeId,
        id: &ImageId,
        params: TransformParams,
        priority: Priority,
        bulk_epoch: Option<u64>,
    ) -> Result<oneshot::Receiver<Outcome>, ImageError> {
        let record = self
            .inner
            .worker
            .store
            .get(id)
            .ok_or_else(|| ImageError::UnknownImage { id: id.clone() })?;
        let (tx, rx) = oneshot::channel();
        if record.is_current(&params) {
            self.inner.observers.each(|o| o.on_already_current(id));
            let _ = tx.send(Ok(ProcessOutcome::AlreadyCurrent(record)));
            return Ok(rx);
        }

        let waiter = Waiter {
            scope,
            bulk_epoch,
            tx,
        };
        let key = JobKey {
            id: id.clone(),
            params,
        };
        if self.inner.queue.lock().attach(key, priority, waiter) {
            debug!("Queued {} at {} ({:?})", id, params, priority);
        }
        self.pump();
        Ok(rx)
    }

    /// Hand queued jobs to workers until the pool is full.
    fn pump(&self) {
        loop {
            let dispatch = {
                let mut queue = self.inner.queue.lock();
                if queue.running() >= self.inner.workers {
                    return;
                }
                match queue.next_ready() {
                    Some(dispatch) => dispatch,
                    None => return,
                }
            };
            let id = &dispatch.key.id;
            self.inner
                .observers
                .each(|o| o.on_job_started(id, &dispatch.key.params, dispatch.priority));

            let this = self.clone();
            tokio::spawn(async move {
                let outcome = this
                    .inner
                    .worker
                    .execute(&dispatch.key, &dispatch.cancelled)
                    .await;
                let waiters = this
                    .inner
                    .queue
                    .lock()
                    .finish(&dispatch.key, dispatch.job_id);
                for waiter in waiters {
                    let _ = waiter.tx.send(outcome.clone());
                }
                this.pump();
            });
        }
    }

    fn cancel_scope(&self, scope: ScopeId, keys: Option<&HashSet<JobKey>>) -> usize {
        let cancellation = self.inner.queue.lock().cancel_where(|key, _, w| {
            w.scope == scope && keys.map_or(true, |keys| keys.contains(key))
        });
        let n = cancellation.waiters.len();
        self.resolve_cancelled(cancellation);
        n
    }

    fn resolve_cancelled(&self, cancellation: Cancellation) {
        for (key, queued) in &cancellation.jobs {
            // Running jobs report when they notice the flag.
            if *queued {
                self.inner.observers.each(|o| o.on_cancelled(&key.id));
            }
        }
        for (key, waiter) in cancellation.waiters {
            let _ = waiter.tx.send(Err(ImageError::Cancelled { id: key.id }));
        }
    }

    async fn reprocess_selected_images(
        &self,
        scope: ScopeId,
        cards: &[CardEntry],
        settings: &ProcessingSettings,
        bleed_width: BleedWidth,
    ) -> ReprocessReport {
        let epoch = self.inner.bulk_epoch.fetch_add(1, Ordering::SeqCst) + 1;

        // Older bulk requests lose their not-yet-started jobs.
        let superseded = self.inner.queue.lock().cancel_where(|_, queued, w| {
            queued && w.bulk_epoch.is_some_and(|e| e < epoch)
        });
        if !superseded.waiters.is_empty() {
            info!(
                "Bulk reprocess superseded {} queued requests",
                superseded.waiters.len()
            );
        }
        self.resolve_cancelled(superseded);

        let _serial = self.inner.bulk_lock.lock().await;

        let mut seen = HashSet::new();
        let targets: Vec<(ImageId, TransformParams, TransformParams)> = cards
            .iter()
            .map(|card| {
                let current = TransformParams::resolve(card, settings);
                let fresh = TransformParams {
                    bleed_width,
                    ..current
                };
                (card.image_id.clone(), current, fresh)
            })
            .filter(|(id, _, fresh)| seen.insert((id.clone(), *fresh)))
            .collect();

        let mut report = ReprocessReport {
            requested: targets.len(),
            ..Default::default()
        };
        if self.inner.bulk_epoch.load(Ordering::SeqCst) != epoch {
            report.cancelled = targets.len();
            return report;
        }

        let stale: HashSet<JobKey> = targets
            .iter()
            .filter(|(_, current, fresh)| current != fresh)
            .map(|(id, current, _)| JobKey {
                id: id.clone(),
                params: *current,
            })
            .collect();
        self.cancel_scope(scope, Some(&stale));

        info!(
            "Reprocessing {} images with {} bleed",
            targets.len(),
            bleed_width
        );
        let mut pending = Vec::with_capacity(targets.len());
        for (id, _, fresh) in targets {
            match self.request(scope, &id, fresh, Priority::Low, Some(epoch)) {
                Ok(rx) => pending.push((id, rx)),
                Err(e) => report.failed.push(e),
            }
        }

        for (id, result) in join_all(
            pending
                .into_iter()
                .map(|(id, rx)| async move { (id, rx.await) }),
        )
        .await
        {
            match result {
                Ok(Ok(ProcessOutcome::Regenerated(_))) => report.regenerated += 1,
                Ok(Ok(ProcessOutcome::AlreadyCurrent(_))) => report.already_current += 1,
                Ok(Err(ImageError::Cancelled { .. })) | Err(_) => report.cancelled += 1,
                Ok(Err(e)) => {
                    debug!("Reprocess of {} failed: {}", id, e);
                    report.failed.push(e);
                }
            }
        }
        report
    }
}

/// A group of requests that can be cancelled together, typically one UI
/// view or one import.
#[derive(Clone)]
pub struct ProcessingScope {
    id: ScopeId,
    name: String,
    scheduler: PriorityScheduler,
}

impl ProcessingScope {
    pub fn id(&self) -> ScopeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Make sure `card`'s derivatives match its effective parameters under
    /// `settings`, processing it if they do not.
    ///
    /// Resolves with [`ImageError::Cancelled`] if this scope (or everything)
    /// is cancelled first.
    pub async fn ensure_processed(
        &self,
        card: &CardEntry,
        settings: &ProcessingSettings,
        priority: Priority,
    ) -> Result<ProcessOutcome, ImageError> {
        self.scheduler
            .ensure_processed(self.id, card, settings, priority)
            .await
    }

    /// Regenerate the selected cards with `bleed_width`, at LOW priority.
    ///
    /// Jobs this scope queued for the cards' current parameters are
    /// cancelled first. Bulk calls run one at a time; starting a new one
    /// cancels the queued jobs of any older one.
    pub async fn reprocess_selected_images(
        &self,
        cards: &[CardEntry],
        settings: &ProcessingSettings,
        bleed_width: BleedWidth,
    ) -> ReprocessReport {
        self.scheduler
            .reprocess_selected_images(self.id, cards, settings, bleed_width)
            .await
    }

    /// Cancel every request made through this scope. Returns how many were
    /// detached.
    pub fn cancel_processing(&self) -> usize {
        let n = self.scheduler.cancel_scope(self.id, None);
        if n > 0 {
            debug!("Scope '{}' cancelled {} requests", self.name, n);
        }
        n
    }
}
