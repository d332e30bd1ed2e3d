//! The persisted per-image record and the patch type used to update it.

use crate::card::{BleedWidth, DarkenMode, ImageId, TransformParams};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub(crate) const RECORD_PREFIX: &str = "records/";
pub(crate) const DERIVED_PREFIX: &str = "derived/";
pub(crate) const SOURCE_PREFIX: &str = "sources/";

pub(crate) fn record_key(id: &ImageId) -> String {
    format!("{RECORD_PREFIX}{}", id.as_str())
}

pub(crate) fn source_key(id: &ImageId) -> String {
    format!("{SOURCE_PREFIX}{}", id.as_str())
}

/// The three derived rasters kept per image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivedKind {
    Display,
    DisplayDarkened,
    Export,
}

impl DerivedKind {
    pub(crate) fn file_name(self) -> &'static str {
        match self {
            DerivedKind::Display => "display.png",
            DerivedKind::DisplayDarkened => "display-dark.png",
            DerivedKind::Export => "export.png",
        }
    }

    pub(crate) fn blob_key(self, id: &ImageId, generation: u64) -> String {
        format!(
            "{DERIVED_PREFIX}{}/{generation}/{}",
            id.as_str(),
            self.file_name()
        )
    }
}

/// One distinct piece of artwork and its current derivatives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: ImageId,
    /// Ways to re-fetch the original if the raw source cache lost it.
    pub source_urls: Vec<String>,
    pub file_name: Option<String>,
    /// Source pixel dimensions, known after the first decode.
    pub width: Option<u32>,
    pub height: Option<u32>,

    /// Blob keys of the current derivatives.
    pub display_blob: Option<String>,
    pub display_blob_darkened: Option<String>,
    pub export_blob: Option<String>,

    /// Parameters the current derivatives were computed with.
    pub export_dpi: Option<u32>,
    pub export_bleed_width: Option<BleedWidth>,
    pub export_darken: Option<DarkenMode>,

    /// Bumped by every committed regeneration; embedded in blob keys.
    pub generation: u64,
    pub ref_count: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When `ref_count` last dropped to zero.
    pub released_at: Option<DateTime<Utc>>,
}

impl ImageRecord {
    pub fn new(id: ImageId, ref_count: u32) -> Self {
        let now = Utc::now();
        Self {
            id,
            source_urls: Vec::new(),
            file_name: None,
            width: None,
            height: None,
            display_blob: None,
            display_blob_darkened: None,
            export_blob: None,
            export_dpi: None,
            export_bleed_width: None,
            export_darken: None,
            generation: 0,
            ref_count,
            created_at: now,
            updated_at: now,
            released_at: None,
        }
    }

    /// Parameters of the committed derivatives, if any.
    pub fn derived_params(&self) -> Option<TransformParams> {
        if self.display_blob.is_none()
            || self.display_blob_darkened.is_none()
            || self.export_blob.is_none()
        {
            return None;
        }
        Some(TransformParams {
            dpi: self.export_dpi?,
            bleed_width: self.export_bleed_width?,
            darken: self.export_darken?,
        })
    }

    /// True when the committed derivatives were computed with exactly
    /// `params`. Anything else is stale.
    pub fn is_current(&self, params: &TransformParams) -> bool {
        self.derived_params().as_ref() == Some(params)
    }

    pub fn blob_key(&self, kind: DerivedKind) -> Option<&str> {
        match kind {
            DerivedKind::Display => self.display_blob.as_deref(),
            DerivedKind::DisplayDarkened => self.display_blob_darkened.as_deref(),
            DerivedKind::Export => self.export_blob.as_deref(),
        }
    }

    pub(crate) fn derived_keys(&self) -> Vec<String> {
        [
            &self.display_blob,
            &self.display_blob_darkened,
            &self.export_blob,
        ]
        .into_iter()
        .flatten()
        .cloned()
        .collect()
    }

    /// Apply `patch`, stamping `updated_at`.
    pub fn apply(&mut self, patch: RecordPatch) {
        if let Some(n) = patch.ref_count {
            if n == 0 && self.ref_count > 0 {
                self.released_at = Some(Utc::now());
            } else if n > 0 {
                self.released_at = None;
            }
            self.ref_count = n;
        }
        if let Some(urls) = patch.source_urls {
            for url in urls {
                if !self.source_urls.contains(&url) {
                    self.source_urls.push(url);
                }
            }
        }
        if let Some(name) = patch.file_name {
            self.file_name = Some(name);
        }
        if let Some((w, h)) = patch.dimensions {
            self.width = Some(w);
            self.height = Some(h);
        }
        if let Some(derived) = patch.derived {
            self.generation = derived.generation;
            self.export_dpi = Some(derived.params.dpi);
            self.export_bleed_width = Some(derived.params.bleed_width);
            self.export_darken = Some(derived.params.darken);
            self.display_blob = Some(derived.display_blob);
            self.display_blob_darkened = Some(derived.display_blob_darkened);
            self.export_blob = Some(derived.export_blob);
        }
        self.updated_at = Utc::now();
    }
}

/// Tags and blob keys of a freshly committed derivative set.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedTags {
    pub generation: u64,
    pub params: TransformParams,
    pub display_blob: String,
    pub display_blob_darkened: String,
    pub export_blob: String,
}

/// Partial update of an [`ImageRecord`]. `None` leaves a field untouched;
/// `source_urls` are merged, not replaced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPatch {
    pub ref_count: Option<u32>,
    pub source_urls: Option<Vec<String>>,
    pub file_name: Option<String>,
    pub dimensions: Option<(u32, u32)>,
    pub derived: Option<DerivedTags>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(bleed_mm: f64) -> TransformParams {
        TransformParams {
            dpi: 300,
            bleed_width: BleedWidth::from_mm(bleed_mm),
            darken: DarkenMode::Off,
        }
    }

    fn tags(id: &ImageId, generation: u64, p: TransformParams) -> DerivedTags {
        DerivedTags {
            generation,
            params: p,
            display_blob: DerivedKind::Display.blob_key(id, generation),
            display_blob_darkened: DerivedKind::DisplayDarkened.blob_key(id, generation),
            export_blob: DerivedKind::Export.blob_key(id, generation),
        }
    }

    #[test]
    fn fresh_record_is_never_current() {
        let r = ImageRecord::new(ImageId::from_bytes(b"a"), 1);
        assert!(r.derived_params().is_none());
        assert!(!r.is_current(&params(0.0)));
    }

    #[test]
    fn staleness_tracks_every_tag() {
        let id = ImageId::from_bytes(b"a");
        let mut r = ImageRecord::new(id.clone(), 1);
        r.apply(RecordPatch {
            derived: Some(tags(&id, 1, params(0.0))),
            ..Default::default()
        });

        assert!(r.is_current(&params(0.0)));
        assert!(!r.is_current(&params(2.0)));
        let mut other_dpi = params(0.0);
        other_dpi.dpi = 600;
        assert!(!r.is_current(&other_dpi));
        let mut dark = params(0.0);
        dark.darken = DarkenMode::Darken;
        assert!(!r.is_current(&dark));
        assert_eq!(r.derived_keys().len(), 3);
        assert!(r.blob_key(DerivedKind::Export).unwrap().ends_with("/1/export.png"));
    }

    #[test]
    fn patch_tracks_release_time_and_merges_urls() {
        let mut r = ImageRecord::new(ImageId::from_bytes(b"a"), 2);
        r.apply(RecordPatch {
            source_urls: Some(vec!["https://a".into()]),
            ..Default::default()
        });
        r.apply(RecordPatch {
            source_urls: Some(vec!["https://a".into(), "https://b".into()]),
            ref_count: Some(0),
            ..Default::default()
        });
        assert_eq!(r.source_urls, vec!["https://a", "https://b"]);
        assert!(r.released_at.is_some());

        r.apply(RecordPatch {
            ref_count: Some(1),
            ..Default::default()
        });
        assert!(r.released_at.is_none());
    }

    #[test]
    fn record_json_roundtrip_keeps_tags() {
        let id = ImageId::from_bytes(b"a");
        let mut r = ImageRecord::new(id.clone(), 3);
        r.apply(RecordPatch {
            derived: Some(tags(&id, 4, params(1.5))),
            dimensions: Some((745, 1040)),
            ..Default::default()
        });
        let json = serde_json::to_vec(&r).unwrap();
        let back: ImageRecord = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, r);
        assert!(back.is_current(&params(1.5)));
    }
}
