//! Configuration types for the transform-and-cache engine.
//!
//! All engine behaviour is controlled through [`EngineConfig`], built via its
//! [`EngineConfigBuilder`]. Per-request rendering settings (DPI, bleed,
//! darken) are *not* part of this struct: they travel with each call as a
//! [`crate::card::ProcessingSettings`].

use crate::card::CardGeometry;
use crate::error::EngineError;
use crate::progress::ProcessingObserver;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Highest DPI accepted for display previews.
pub const MAX_DISPLAY_DPI: u32 = 600;

/// Configuration for a [`crate::engine::ProxyEngine`].
///
/// # Example
/// ```rust
/// use cardproxy_engine::EngineConfig;
///
/// let config = EngineConfig::builder()
///     .workers(8)
///     .display_dpi(120)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct EngineConfig {
    /// Maximum number of transforms running at once. Default: 4.
    ///
    /// Each running job holds a decoded source plus up to three derived
    /// rasters in memory; at 1200 DPI a single export raster is ~60 MB.
    pub workers: usize,

    /// Resolution of the on-screen preview blobs. Default: 150.
    pub display_dpi: u32,

    /// Nominal card size used to convert bleed millimetres into pixels.
    pub geometry: CardGeometry,

    /// Delay between a record's count reaching zero and its deletion. Default: 3 s.
    ///
    /// A re-acquire within the window revives the record with its derived
    /// blobs intact, so undo/redo of a card deletion does not re-fetch.
    pub release_grace: Duration,

    /// Age after which unreferenced raw sources are swept at startup. Default: 30 days.
    pub source_retention: Duration,

    /// Entry budget of the raw source LRU. Default: 512.
    pub source_cache_entries: usize,

    /// Byte budget of the raw source LRU. Default: 512 MiB.
    pub source_cache_bytes: u64,

    /// HTTP timeout for remote source fetches in seconds. Default: 60.
    pub fetch_timeout_secs: u64,

    /// Extra observer notified alongside the built-in stats collector.
    pub observer: Option<Arc<dyn ProcessingObserver>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            display_dpi: 150,
            geometry: CardGeometry::default(),
            release_grace: Duration::from_secs(3),
            source_retention: Duration::from_secs(30 * 24 * 60 * 60),
            source_cache_entries: 512,
            source_cache_bytes: 512 * 1024 * 1024,
            fetch_timeout_secs: 60,
            observer: None,
        }
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("workers", &self.workers)
            .field("display_dpi", &self.display_dpi)
            .field("geometry", &self.geometry)
            .field("release_grace", &self.release_grace)
            .field("source_retention", &self.source_retention)
            .field("source_cache_entries", &self.source_cache_entries)
            .field("source_cache_bytes", &self.source_cache_bytes)
            .field("fetch_timeout_secs", &self.fetch_timeout_secs)
            .field(
                "observer",
                &self.observer.as_ref().map(|_| "<dyn ProcessingObserver>"),
            )
            .finish()
    }
}

impl EngineConfig {
    /// Create a new builder for `EngineConfig`.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`EngineConfig`].
#[derive(Debug)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn workers(mut self, n: usize) -> Self {
        self.config.workers = n.max(1);
        self
    }

    pub fn display_dpi(mut self, dpi: u32) -> Self {
        self.config.display_dpi = dpi.clamp(36, MAX_DISPLAY_DPI);
        self
    }

    pub fn geometry(mut self, geometry: CardGeometry) -> Self {
        self.config.geometry = geometry;
        self
    }

    pub fn release_grace(mut self, grace: Duration) -> Self {
        self.config.release_grace = grace;
        self
    }

    pub fn source_retention(mut self, retention: Duration) -> Self {
        self.config.source_retention = retention;
        self
    }

    pub fn source_cache_entries(mut self, n: usize) -> Self {
        self.config.source_cache_entries = n.max(1);
        self
    }

    pub fn source_cache_bytes(mut self, bytes: u64) -> Self {
        self.config.source_cache_bytes = bytes;
        self
    }

    pub fn fetch_timeout_secs(mut self, secs: u64) -> Self {
        self.config.fetch_timeout_secs = secs;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn ProcessingObserver>) -> Self {
        self.config.observer = Some(observer);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<EngineConfig, EngineError> {
        let c = &self.config;
        if c.workers == 0 {
            return Err(EngineError::InvalidConfig("Workers must be ≥ 1".into()));
        }
        if c.display_dpi == 0 || c.display_dpi > MAX_DISPLAY_DPI {
            return Err(EngineError::InvalidConfig(format!(
                "Display DPI must be 1–{MAX_DISPLAY_DPI}, got {}",
                c.display_dpi
            )));
        }
        let g = &c.geometry;
        if !(g.width_mm.is_finite() && g.height_mm.is_finite())
            || g.width_mm <= 0.0
            || g.height_mm <= 0.0
        {
            return Err(EngineError::InvalidConfig(format!(
                "Card geometry must be positive, got {}×{} mm",
                g.width_mm, g.height_mm
            )));
        }
        if c.source_cache_bytes == 0 {
            return Err(EngineError::InvalidConfig(
                "Source cache byte budget must be > 0".into(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::builder().build().unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.display_dpi, 150);
        assert_eq!(config.geometry, CardGeometry::default());
    }

    #[test]
    fn setters_clamp() {
        let config = EngineConfig::builder()
            .workers(0)
            .display_dpi(10_000)
            .source_cache_entries(0)
            .build()
            .unwrap();
        assert_eq!(config.workers, 1);
        assert_eq!(config.display_dpi, MAX_DISPLAY_DPI);
        assert_eq!(config.source_cache_entries, 1);
    }

    #[test]
    fn rejects_degenerate_geometry() {
        let err = EngineConfig::builder()
            .geometry(CardGeometry {
                width_mm: 0.0,
                height_mm: 88.0,
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }

    #[test]
    fn debug_hides_observer() {
        let config = EngineConfig::builder()
            .observer(Arc::new(crate::progress::NoopObserver))
            .build()
            .unwrap();
        let dbg = format!("{config:?}");
        assert!(dbg.contains("<dyn ProcessingObserver>"));
    }
}
