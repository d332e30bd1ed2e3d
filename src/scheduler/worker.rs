//! Execution of one dispatched job.
//!
//! ```text
//! record current? ──yes──► AlreadyCurrent
//!      │ no
//!  load source (cache, else fetch)      ── cancel check
//!  render_derivatives (spawn_blocking)  ── cancel check
//!  commit_derived (under record lock)   ── cancel check before each write
//!      ▼
//!  Regenerated
//! ```

use super::{JobKey, ProcessOutcome};
use crate::config::EngineConfig;
use crate::error::ImageError;
use crate::pipeline::transform::render_derivatives;
use crate::progress::Observers;
use crate::source::SourceLoader;
use crate::store::ContentStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

pub(crate) struct Worker {
    pub(crate) store: Arc<ContentStore>,
    pub(crate) loader: Arc<SourceLoader>,
    pub(crate) observers: Arc<Observers>,
    pub(crate) config: EngineConfig,
}

impl Worker {
    /// Run the job and report its outcome to the observers.
    pub(crate) async fn execute(
        &self,
        key: &JobKey,
        cancelled: &AtomicBool,
    ) -> Result<ProcessOutcome, ImageError> {
        let start = Instant::now();
        let result = self.run(key, cancelled).await;
        let id = &key.id;
        match &result {
            Ok(ProcessOutcome::Regenerated(_)) => {
                let elapsed = start.elapsed();
                debug!("Processed {} at {} in {:?}", id, key.params, elapsed);
                self.observers
                    .each(|o| o.on_processed(id, &key.params, elapsed));
            }
            Ok(ProcessOutcome::AlreadyCurrent(_)) => {}
            Err(ImageError::Cancelled { .. }) => {
                debug!("Job for {} cancelled", id);
                self.observers.each(|o| o.on_cancelled(id));
            }
            Err(e) => {
                warn!("{}", e);
                self.observers.each(|o| o.on_failed(id, e));
            }
        }
        result
    }

    async fn run(
        &self,
        key: &JobKey,
        cancelled: &AtomicBool,
    ) -> Result<ProcessOutcome, ImageError> {
        let id = &key.id;
        let check = || {
            if cancelled.load(Ordering::SeqCst) {
                Err(ImageError::Cancelled { id: id.clone() })
            } else {
                Ok(())
            }
        };

        check()?;
        let record = self
            .store
            .get(id)
            .ok_or_else(|| ImageError::UnknownImage { id: id.clone() })?;
        // Another job may have produced these parameters since enqueue.
        if record.is_current(&key.params) {
            self.observers.each(|o| o.on_already_current(id));
            return Ok(ProcessOutcome::AlreadyCurrent(record));
        }

        let source = self.loader.load(id, &record.source_urls).await?;
        check()?;

        let params = key.params;
        let geometry = self.config.geometry;
        let display_dpi = self.config.display_dpi;
        let derived = tokio::task::spawn_blocking(move || {
            render_derivatives(&source, &params, &geometry, display_dpi)
        })
        .await
        .map_err(|e| ImageError::Decode {
            id: id.clone(),
            detail: format!("transform task failed: {e}"),
        })?
        .map_err(|e| e.into_image_error(id))?;
        check()?;

        let record = self
            .store
            .commit_derived(id, &derived, &key.params, cancelled)
            .await?;
        Ok(ProcessOutcome::Regenerated(record))
    }
}
