//! # cardproxy-engine
//!
//! Image transform-and-cache engine for printable card proxies.
//!
//! ## Why this crate?
//!
//! A proxy sheet references hundreds of card images, many of them the same
//! artwork several times over. Every image has to be padded with bleed,
//! resampled to the print DPI and sometimes darkened, and every settings
//! change invalidates the lot. This crate does that work once per distinct
//! `(image, parameters)` pair: sources are fetched once, cached, transformed
//! on a bounded worker pool, and the results kept in a content-addressed
//! store whose records are reference-counted by the card slots using them.
//!
//! ## Pipeline Overview
//!
//! ```text
//! card slot ─▶ ensure_processed(card, settings, priority)
//!                │
//!                ├─ 1. Check    record tags == requested params? → AlreadyCurrent
//!                ├─ 2. Queue    dedup by (image, params), HIGH before LOW
//!                ├─ 3. Source   raw source cache, else HTTP fetch (single-flight)
//!                ├─ 4. Render   bleed → resample → darken (spawn_blocking)
//!                ├─ 5. Commit   new-generation blobs, then the record
//!                └─ 6. Notify   waiters, observers, store change stream
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cardproxy_engine::{
//!     BleedWidth, CardEntry, EngineConfig, Priority, ProcessingSettings, ProxyEngine,
//!     SourceDescriptor,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = ProxyEngine::open_dir(EngineConfig::default(), ".cardproxy-cache").await?;
//!
//!     let id = engine
//!         .acquire_image(SourceDescriptor::url("https://cards.example/bolt.png"), 3)
//!         .await?;
//!     let card = CardEntry::new(id.clone(), "Lightning Bolt");
//!     let settings = ProcessingSettings::default().with_bleed(BleedWidth::from_mm(2.0));
//!
//!     engine.begin_batch(1);
//!     engine.ensure_processed(&card, &settings, Priority::High).await?;
//!     let stats = engine.finish_batch();
//!     eprintln!("{}", stats.summary());
//!
//!     let png = engine.load_export(&id).await?.expect("processed above");
//!     std::fs::write("bolt.png", png)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `cardproxy` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! cardproxy-engine = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod card;
pub mod config;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod registry;
pub mod scheduler;
mod source;
pub mod stats;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use card::{
    BleedWidth, CardEntry, CardFace, CardGeometry, DarkenMode, ImageId, Priority,
    ProcessingSettings, SourceDescriptor, TransformParams,
};
pub use config::{EngineConfig, EngineConfigBuilder};
pub use engine::ProxyEngine;
pub use error::{EngineError, ImageError};
pub use pipeline::fetch::{HttpFetcher, SourceFetcher};
pub use progress::{NoopObserver, ProcessingObserver};
pub use registry::RefCountedImageRegistry;
pub use scheduler::{
    JobKey, PriorityScheduler, ProcessOutcome, ProcessingScope, ReprocessReport, ScopeId,
};
pub use stats::{CacheStats, StatsCollector};
pub use store::blob::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use store::record::{DerivedKind, ImageRecord, RecordPatch};
pub use store::{ContentStore, StoreEvent, SweepReport};
