//! Error types for the cardproxy-engine library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`EngineError`]: **fatal** for the call that returned it: the engine
//!   could not be opened, the configuration is invalid, the blob store is
//!   unreachable, or the caller referenced an image that does not exist.
//!
//! * [`ImageError`]: **per-job**: a single transform failed (corrupt source,
//!   network failure, degenerate parameters) or was cancelled. It is `Clone`
//!   so the scheduler can hand the same outcome to every caller attached to
//!   a shared job, and it never escapes into the worker loop.
//!
//! None of these are retried automatically. A card whose transform failed is
//! retried by issuing a fresh HIGH-priority `ensure_processed`.

use crate::card::ImageId;
use thiserror::Error;

/// All fatal errors returned by the cardproxy-engine library.
#[derive(Debug, Error)]
pub enum EngineError {
    // ── Caller errors ─────────────────────────────────────────────────────
    /// No record exists for the given image id.
    #[error("Unknown image '{id}'")]
    UnknownImage { id: ImageId },

    /// A reference count operation would drop below zero.
    #[error("Image '{id}' has no outstanding references to release")]
    NoReferences { id: ImageId },

    /// `acquire` was asked for zero references.
    #[error("Reference quantity must be at least 1")]
    InvalidQuantity,

    /// A source descriptor carried neither bytes nor URLs.
    #[error("Image source is empty: provide uploaded bytes or at least one URL")]
    EmptySource,

    // ── Storage errors ────────────────────────────────────────────────────
    /// The blob store rejected a read, write or delete.
    #[error("Storage failure on '{key}': {detail}")]
    Storage { key: String, detail: String },

    /// A persisted record or index could not be (de)serialised.
    #[error("Corrupt persisted entry '{key}': {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub(crate) fn storage(key: impl Into<String>, detail: impl ToString) -> Self {
        EngineError::Storage {
            key: key.into(),
            detail: detail.to_string(),
        }
    }
}

/// A non-fatal error for a single transform job.
///
/// Broadcast to every caller attached to the job; the scheduler carries on
/// with the rest of its queue.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum ImageError {
    /// Source bytes are not a decodable PNG/JPEG.
    #[error("Image {id}: source could not be decoded: {detail}")]
    Decode { id: ImageId, detail: String },

    /// Source bytes could not be obtained from any known URL.
    #[error("Image {id}: fetch failed: {detail}")]
    Fetch { id: ImageId, detail: String },

    /// DPI/bleed combination produces a degenerate or oversized raster.
    #[error("Image {id}: invalid transform parameters: {detail}")]
    InvalidParameters { id: ImageId, detail: String },

    /// Writing the derived output failed. Nothing was committed.
    #[error("Image {id}: storage failure: {detail}")]
    Storage { id: ImageId, detail: String },

    /// The job was cancelled before its final write.
    #[error("Image {id}: processing cancelled")]
    Cancelled { id: ImageId },

    /// The record disappeared (released to zero) or never existed.
    #[error("Image {id}: no such image")]
    UnknownImage { id: ImageId },
}

impl ImageError {
    /// Id of the image the failed job targeted.
    pub fn image_id(&self) -> &ImageId {
        match self {
            ImageError::Decode { id, .. }
            | ImageError::Fetch { id, .. }
            | ImageError::InvalidParameters { id, .. }
            | ImageError::Storage { id, .. }
            | ImageError::Cancelled { id }
            | ImageError::UnknownImage { id } => id,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ImageError::Cancelled { .. })
    }

    pub(crate) fn from_engine(id: &ImageId, err: EngineError) -> Self {
        match err {
            EngineError::UnknownImage { id } => ImageError::UnknownImage { id },
            other => ImageError::Storage {
                id: id.clone(),
                detail: other.to_string(),
            },
        }
    }
}
