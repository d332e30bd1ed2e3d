//! Transform pipeline stages: raw card art → print-ready rasters.
//!
//! Every stage except [`fetch`] is a pure function over in-memory buffers
//! with no knowledge of scheduling or storage.
//!
//! ## Data Flow
//!
//! ```text
//! fetch ──▶ encode::decode ──▶ bleed ──▶ resample ──▶ darken ──▶ encode::encode_png
//! (HTTP)     (PNG/JPEG)        (mirror)  (Lanczos3)   (LUT)      (PNG bytes)
//! ```
//!
//! 1. [`fetch`]: obtain source bytes from the first URL that answers
//! 2. [`encode`]: decode uploads/downloads to RGBA; PNG-encode results
//! 3. [`bleed`]: extend every edge by mirroring edge-adjacent pixels
//! 4. [`resample`]: scale to the physical card size at the requested DPI
//! 5. [`darken`]: optional fixed tone map for prints that come out light
//! 6. [`transform`]: composes 2-5 into the display/export derivative set

pub mod bleed;
pub mod darken;
pub mod encode;
pub mod fetch;
pub mod resample;
pub mod transform;

use crate::card::ImageId;
use crate::error::ImageError;
use thiserror::Error;

/// Failure of a pure pipeline stage. Converted to [`ImageError`] by the
/// scheduler once the owning image id is known.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error("decode failed: {0}")]
    Decode(String),

    #[error("{0}")]
    InvalidParameters(String),

    #[error("encode failed: {0}")]
    Encode(String),
}

impl TransformError {
    pub fn into_image_error(self, id: &ImageId) -> ImageError {
        match self {
            TransformError::Decode(detail) => ImageError::Decode {
                id: id.clone(),
                detail,
            },
            TransformError::InvalidParameters(detail) => ImageError::InvalidParameters {
                id: id.clone(),
                detail,
            },
            // Encoding an in-memory RGBA buffer only fails on allocation
            // problems; surface it as a storage-side failure.
            TransformError::Encode(detail) => ImageError::Storage {
                id: id.clone(),
                detail,
            },
        }
    }
}
