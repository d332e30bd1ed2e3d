//! The scheduler's job table and ready queue.
//!
//! Pure bookkeeping, no I/O: which jobs exist, who waits on each, and which
//! queued job runs next. Queued jobs dispatch HIGH before LOW and FIFO
//! within a level. Promoting a queued job pushes a fresh heap entry and
//! leaves the old one to be skipped on pop.

use super::{JobKey, Outcome, ScopeId};
use crate::card::Priority;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

/// One caller attached to a job.
pub(crate) struct Waiter {
    pub(crate) scope: ScopeId,
    /// Set for waiters enqueued by a bulk reprocess.
    pub(crate) bulk_epoch: Option<u64>,
    pub(crate) tx: oneshot::Sender<Outcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobStatus {
    Queued,
    Running,
}

pub(crate) struct Job {
    job_id: u64,
    priority: Priority,
    /// Sequence number of the heap entry currently valid for this job.
    seq: u64,
    status: JobStatus,
    waiters: Vec<Waiter>,
    cancelled: Arc<AtomicBool>,
}

#[derive(PartialEq, Eq)]
struct QueueEntry {
    priority: Priority,
    seq: u64,
    key: JobKey,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// A job handed to a worker.
pub(crate) struct Dispatch {
    pub(crate) key: JobKey,
    pub(crate) job_id: u64,
    pub(crate) priority: Priority,
    pub(crate) cancelled: Arc<AtomicBool>,
}

/// Result of a cancellation sweep.
#[derive(Default)]
pub(crate) struct Cancellation {
    /// Detached waiters, to be told their request was cancelled.
    pub(crate) waiters: Vec<(JobKey, Waiter)>,
    /// Jobs left with no waiter and therefore cancelled. `true` if the job
    /// had not started yet.
    pub(crate) jobs: Vec<(JobKey, bool)>,
}

#[derive(Default)]
pub(crate) struct JobQueue {
    heap: BinaryHeap<QueueEntry>,
    jobs: HashMap<JobKey, Job>,
    next_seq: u64,
    next_job_id: u64,
    running: usize,
}

impl JobQueue {
    /// Attach `waiter` to the job for `key`, creating and queueing it if
    /// none exists. Returns `true` when a new job was created.
    pub(crate) fn attach(&mut self, key: JobKey, priority: Priority, waiter: Waiter) -> bool {
        if let Some(job) = self.jobs.get_mut(&key) {
            job.waiters.push(waiter);
            if job.status == JobStatus::Queued && priority > job.priority {
                self.next_seq += 1;
                job.priority = priority;
                job.seq = self.next_seq;
                self.heap.push(QueueEntry {
                    priority,
                    seq: self.next_seq,
                    key,
                });
            }
            return false;
        }

        self.next_seq += 1;
        self.next_job_id += 1;
        self.heap.push(QueueEntry {
            priority,
            seq: self.next_seq,
            key: key.clone(),
        });
        self.jobs.insert(
            key,
            Job {
                job_id: self.next_job_id,
                priority,
                seq: self.next_seq,
                status: JobStatus::Queued,
                waiters: vec![waiter],
                cancelled: Arc::new(AtomicBool::new(false)),
            },
        );
        true
    }

    /// Pop the next runnable job and mark it running.
    pub(crate) fn next_ready(&mut self) -> Option<Dispatch> {
        while let Some(entry) = self.heap.pop() {
            let Some(job) = self.jobs.get_mut(&entry.key) else {
                continue;
            };
            if job.status != JobStatus::Queued || job.seq != entry.seq {
                continue;
            }
            job.status = JobStatus::Running;
            self.running += 1;
            return Some(Dispatch {
                key: entry.key,
                job_id: job.job_id,
                priority: job.priority,
                cancelled: Arc::clone(&job.cancelled),
            });
        }
        None
    }

    /// A worker finished `job_id`. Returns the waiters still attached, who
    /// receive its outcome.
    pub(crate) fn finish(&mut self, key: &JobKey, job_id: u64) -> Vec<Waiter> {
        self.running = self.running.saturating_sub(1);
        match self.jobs.get(key) {
            Some(job) if job.job_id == job_id => self
                .jobs
                .remove(key)
                .map(|job| job.waiters)
                .unwrap_or_default(),
            // Cancelled while running; a newer job may own the key now.
            _ => Vec::new(),
        }
    }

    /// Detach every waiter matching `pred(key, queued, waiter)`. Jobs left
    /// without waiters are flagged cancelled and dropped from the table.
    pub(crate) fn cancel_where(
        &mut self,
        pred: impl Fn(&JobKey, bool, &Waiter) -> bool,
    ) -> Cancellation {
        let mut out = Cancellation::default();
        for (key, job) in self.jobs.iter_mut() {
            let queued = job.status == JobStatus::Queued;
            let before = job.waiters.len();
            let (detached, kept): (Vec<Waiter>, Vec<Waiter>) = job
                .waiters
                .drain(..)
                .partition(|w| pred(key, queued, w));
            job.waiters = kept;
            out.waiters
                .extend(detached.into_iter().map(|w| (key.clone(), w)));
            if before > 0 && job.waiters.is_empty() {
                job.cancelled.store(true, Ordering::SeqCst);
                out.jobs.push((key.clone(), queued));
            }
        }
        for (key, _) in &out.jobs {
            self.jobs.remove(key);
        }
        out
    }

    pub(crate) fn running(&self) -> usize {
        self.running
    }

    pub(crate) fn queued(&self) -> usize {
        self.jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued)
            .count()
    }

    pub(crate) fn status(&self, key: &JobKey) -> Option<JobStatus> {
        self.jobs.get(key).map(|j| j.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::{ImageId, TransformParams};

    fn key(n: u8) -> JobKey {
        JobKey {
            id: ImageId::from_bytes(&[n]),
            params: TransformParams {
                dpi: 300,
                bleed_width: Default::default(),
                darken: Default::default(),
            },
        }
    }

    fn waiter(scope: u64) -> (Waiter, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Waiter {
                scope: ScopeId(scope),
                bulk_epoch: None,
                tx,
            },
            rx,
        )
    }

    fn attach(q: &mut JobQueue, k: JobKey, p: Priority) -> oneshot::Receiver<Outcome> {
        let (w, rx) = waiter(0);
        q.attach(k, p, w);
        rx
    }

    fn drain_order(q: &mut JobQueue) -> Vec<JobKey> {
        std::iter::from_fn(|| q.next_ready().map(|d| d.key)).collect()
    }

    #[test]
    fn high_before_low_fifo_within_level() {
        let mut q = JobQueue::default();
        let _r: Vec<_> = [
            (1, Priority::Low),
            (2, Priority::High),
            (3, Priority::Low),
            (4, Priority::High),
        ]
        .into_iter()
        .map(|(n, p)| attach(&mut q, key(n), p))
        .collect();

        assert_eq!(drain_order(&mut q), vec![key(2), key(4), key(1), key(3)]);
        assert_eq!(q.running(), 4);
    }

    #[test]
    fn duplicate_requests_share_one_job() {
        let mut q = JobQueue::default();
        let (w1, _r1) = waiter(1);
        let (w2, _r2) = waiter(2);
        assert!(q.attach(key(1), Priority::Low, w1));
        assert!(!q.attach(key(1), Priority::Low, w2));

        let d = q.next_ready().unwrap();
        assert!(q.next_ready().is_none());
        assert_eq!(q.finish(&d.key, d.job_id).len(), 2);
        assert_eq!(q.running(), 0);
    }

    #[test]
    fn high_request_promotes_queued_job() {
        let mut q = JobQueue::default();
        let _a = attach(&mut q, key(1), Priority::Low);
        let _b = attach(&mut q, key(2), Priority::Low);
        let _c = attach(&mut q, key(2), Priority::High);

        let first = q.next_ready().unwrap();
        assert_eq!(first.key, key(2));
        assert_eq!(first.priority, Priority::High);
        // The stale LOW entry for key 2 is skipped.
        assert_eq!(drain_order(&mut q), vec![key(1)]);
    }

    #[test]
    fn running_jobs_are_not_promoted_or_requeued() {
        let mut q = JobQueue::default();
        let _a = attach(&mut q, key(1), Priority::Low);
        let d = q.next_ready().unwrap();
        let _b = attach(&mut q, key(1), Priority::High);
        assert!(q.next_ready().is_none());
        assert_eq!(q.status(&d.key), Some(JobStatus::Running));
        assert_eq!(q.finish(&d.key, d.job_id).len(), 2);
    }

    #[test]
    fn cancel_detaches_only_matching_scope() {
        let mut q = JobQueue::default();
        let (w1, _r1) = waiter(1);
        let (w2, _r2) = waiter(2);
        q.attach(key(1), Priority::Low, w1);
        q.attach(key(1), Priority::Low, w2);

        let c = q.cancel_where(|_, _, w| w.scope == ScopeId(1));
        assert_eq!(c.waiters.len(), 1);
        assert!(c.jobs.is_empty());
        assert_eq!(q.status(&key(1)), Some(JobStatus::Queued));

        let c = q.cancel_where(|_, _, w| w.scope == ScopeId(2));
        assert_eq!(c.jobs, vec![(key(1), true)]);
        assert_eq!(q.status(&key(1)), None);
        assert!(q.next_ready().is_none());
    }

    #[test]
    fn cancelled_running_job_does_not_steal_new_waiters() {
        let mut q = JobQueue::default();
        let _a = attach(&mut q, key(1), Priority::Low);
        let old = q.next_ready().unwrap();
        let c = q.cancel_where(|_, _, _| true);
        assert_eq!(c.jobs, vec![(key(1), false)]);
        assert!(old.cancelled.load(Ordering::SeqCst));

        let _b = attach(&mut q, key(1), Priority::High);
        assert!(q.finish(&old.key, old.job_id).is_empty());
        let fresh = q.next_ready().unwrap();
        assert_ne!(fresh.job_id, old.job_id);
        assert!(!fresh.cancelled.load(Ordering::SeqCst));
    }
}
