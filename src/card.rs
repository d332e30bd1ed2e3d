//! Domain types shared by every stage: image identity, card slots, and the
//! parameter set a derived raster is computed with.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Content-derived identifier of one distinct piece of artwork.
///
/// SHA-256 of the uploaded bytes, or of the primary URL for remote art, so
/// re-importing the same source always lands on the same record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(String);

impl ImageId {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"upload\0");
        hasher.update(bytes);
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn from_url(url: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"url\0");
        hasher.update(url.trim().as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Accepts only the 64-digit lowercase hex form produced above.
    pub fn parse(s: &str) -> Option<Self> {
        let valid = s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        valid.then(|| Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First twelve hex digits, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short())
    }
}

/// Bleed width in whole micrometres.
///
/// Integer storage keeps parameter tags exactly comparable, so a record
/// computed at 2 mm is never considered stale against a 2.0000001 mm request.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct BleedWidth(u32);

impl BleedWidth {
    pub const ZERO: BleedWidth = BleedWidth(0);

    /// Negative and non-finite inputs clamp to zero.
    pub fn from_mm(mm: f64) -> Self {
        if !mm.is_finite() || mm <= 0.0 {
            return Self::ZERO;
        }
        Self((mm * 1000.0).round().min(u32::MAX as f64) as u32)
    }

    pub fn from_micrometres(um: u32) -> Self {
        Self(um)
    }

    pub fn as_mm(self) -> f64 {
        self.0 as f64 / 1000.0
    }

    pub fn micrometres(self) -> u32 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for BleedWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}mm", self.as_mm())
    }
}

/// Tone adjustment applied to the export raster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DarkenMode {
    #[default]
    Off,
    /// Fixed gamma + gain pass compensating for printers that render light.
    Darken,
}

impl DarkenMode {
    pub fn is_on(self) -> bool {
        self == DarkenMode::Darken
    }
}

/// Dispatch priority of a transform request.
///
/// `High` is for cards currently on screen, `Low` for background catch-up
/// and bulk reprocessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    High,
}

/// Nominal physical size of a card without bleed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CardGeometry {
    pub width_mm: f64,
    pub height_mm: f64,
}

impl Default for CardGeometry {
    /// Standard poker-size trading card, 63 × 88 mm.
    fn default() -> Self {
        Self {
            width_mm: 63.0,
            height_mm: 88.0,
        }
    }
}

/// The global, user-controlled rendering settings.
///
/// Passed explicitly into every staleness check so results never depend on
/// when a shared settings store happened to be read.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProcessingSettings {
    pub dpi: u32,
    pub bleed_enabled: bool,
    pub bleed_width: BleedWidth,
    pub darken: DarkenMode,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            dpi: 300,
            bleed_enabled: false,
            bleed_width: BleedWidth::ZERO,
            darken: DarkenMode::Off,
        }
    }
}

impl ProcessingSettings {
    pub fn with_bleed(mut self, width: BleedWidth) -> Self {
        self.bleed_enabled = !width.is_zero();
        self.bleed_width = width;
        self
    }

    pub fn with_dpi(mut self, dpi: u32) -> Self {
        self.dpi = dpi;
        self
    }

    pub fn with_darken(mut self, darken: DarkenMode) -> Self {
        self.darken = darken;
        self
    }
}

/// The exact parameter set a derived raster is computed with.
///
/// Together with the image id this is the job deduplication key and the tag
/// stored on the record for staleness detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransformParams {
    pub dpi: u32,
    pub bleed_width: BleedWidth,
    pub darken: DarkenMode,
}

impl TransformParams {
    /// Effective parameters for `card` under `settings`, honouring the
    /// card's per-slot overrides.
    pub fn resolve(card: &CardEntry, settings: &ProcessingSettings) -> Self {
        let bleed_width = match card.bleed_override {
            Some(width) => width,
            None if settings.bleed_enabled => settings.bleed_width,
            None => BleedWidth::ZERO,
        };
        Self {
            dpi: settings.dpi,
            bleed_width,
            darken: card.darken_override.unwrap_or(settings.darken),
        }
    }
}

impl fmt::Display for TransformParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}dpi/{}", self.dpi, self.bleed_width)?;
        if self.darken.is_on() {
            f.write_str("/dark")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardFace {
    #[default]
    Front,
    Back,
}

/// A slot in the user's deck list. Owned by the caller's record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardEntry {
    pub image_id: ImageId,
    pub name: String,
    pub face: CardFace,
    pub bleed_override: Option<BleedWidth>,
    pub darken_override: Option<DarkenMode>,
}

impl CardEntry {
    pub fn new(image_id: ImageId, name: impl Into<String>) -> Self {
        Self {
            image_id,
            name: name.into(),
            face: CardFace::Front,
            bleed_override: None,
            darken_override: None,
        }
    }

    pub fn with_face(mut self, face: CardFace) -> Self {
        self.face = face;
        self
    }

    pub fn with_bleed_override(mut self, width: BleedWidth) -> Self {
        self.bleed_override = Some(width);
        self
    }

    pub fn with_darken_override(mut self, mode: DarkenMode) -> Self {
        self.darken_override = Some(mode);
        self
    }
}

/// Where the original raster of a new image comes from.
#[derive(Debug, Clone)]
pub enum SourceDescriptor {
    /// A local upload; bytes are cached immediately.
    Upload {
        bytes: Vec<u8>,
        file_name: Option<String>,
    },
    /// One or more remote locations, tried in order.
    Remote { urls: Vec<String> },
}

impl SourceDescriptor {
    pub fn upload(bytes: Vec<u8>) -> Self {
        SourceDescriptor::Upload {
            bytes,
            file_name: None,
        }
    }

    /// Attach the original file name of an upload. No-op for remote sources.
    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        if let SourceDescriptor::Upload { file_name, .. } = &mut self {
            *file_name = Some(name.into());
        }
        self
    }

    pub fn url(url: impl Into<String>) -> Self {
        SourceDescriptor::Remote {
            urls: vec![url.into()],
        }
    }

    /// Content identity of this source.
    pub fn image_id(&self) -> Result<ImageId, EngineError> {
        match self {
            SourceDescriptor::Upload { bytes, .. } if !bytes.is_empty() => {
                Ok(ImageId::from_bytes(bytes))
            }
            SourceDescriptor::Remote { urls } => urls
                .iter()
                .map(|u| u.trim())
                .find(|u| !u.is_empty())
                .map(ImageId::from_url)
                .ok_or(EngineError::EmptySource),
            SourceDescriptor::Upload { .. } => Err(EngineError::EmptySource),
        }
    }

    pub fn urls(&self) -> &[String] {
        match self {
            SourceDescriptor::Remote { urls } => urls,
            SourceDescriptor::Upload { .. } => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_stable_across_reimports() {
        let a = SourceDescriptor::upload(vec![1, 2, 3]).image_id().unwrap();
        let b = SourceDescriptor::upload(vec![1, 2, 3]).image_id().unwrap();
        let c = SourceDescriptor::upload(vec![1, 2, 4]).image_id().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);

        let u1 = SourceDescriptor::url("https://cards.example/a.png").image_id().unwrap();
        let u2 = SourceDescriptor::url(" https://cards.example/a.png ").image_id().unwrap();
        assert_eq!(u1, u2);
        assert_eq!(u1.as_str().len(), 64);
        assert_eq!(ImageId::parse(u1.as_str()), Some(u1.clone()));
        assert_eq!(ImageId::parse("../etc"), None);
    }

    #[test]
    fn empty_sources_are_rejected() {
        assert!(matches!(
            SourceDescriptor::upload(Vec::new()).image_id(),
            Err(EngineError::EmptySource)
        ));
        assert!(matches!(
            SourceDescriptor::Remote { urls: vec!["  ".into()] }.image_id(),
            Err(EngineError::EmptySource)
        ));
    }

    #[test]
    fn bleed_width_rounds_to_micrometres() {
        assert_eq!(BleedWidth::from_mm(2.0).micrometres(), 2000);
        assert_eq!(BleedWidth::from_mm(3.175), BleedWidth::from_micrometres(3175));
        assert_eq!(BleedWidth::from_mm(-1.0), BleedWidth::ZERO);
        assert_eq!(BleedWidth::from_mm(f64::NAN), BleedWidth::ZERO);
        assert!((BleedWidth::from_mm(1.5).as_mm() - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn params_honour_card_overrides() {
        let id = ImageId::from_bytes(b"x");
        let settings = ProcessingSettings::default()
            .with_dpi(600)
            .with_bleed(BleedWidth::from_mm(2.0));

        let plain = CardEntry::new(id.clone(), "Island");
        let p = TransformParams::resolve(&plain, &settings);
        assert_eq!(p.dpi, 600);
        assert_eq!(p.bleed_width, BleedWidth::from_mm(2.0));
        assert_eq!(p.darken, DarkenMode::Off);

        let custom = CardEntry::new(id, "Island")
            .with_bleed_override(BleedWidth::ZERO)
            .with_darken_override(DarkenMode::Darken);
        let p = TransformParams::resolve(&custom, &settings);
        assert!(p.bleed_width.is_zero());
        assert!(p.darken.is_on());
    }

    #[test]
    fn disabled_bleed_ignores_width() {
        let card = CardEntry::new(ImageId::from_bytes(b"x"), "Forest");
        let mut settings = ProcessingSettings::default();
        settings.bleed_width = BleedWidth::from_mm(2.0);
        settings.bleed_enabled = false;
        assert!(TransformParams::resolve(&card, &settings).bleed_width.is_zero());
    }

    #[test]
    fn high_outranks_low() {
        assert!(Priority::High > Priority::Low);
    }
}
