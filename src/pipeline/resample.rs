//! DPI resampling to the physical card size.
//!
//! Output size depends only on the card geometry, bleed and DPI, never on
//! the source resolution:
//! `pixels = round(mm_to_inch(card_mm + 2 · bleed_mm) · dpi)`.

use super::TransformError;
use crate::card::{BleedWidth, CardGeometry};
use image::imageops::{self, FilterType};
use image::RgbaImage;
use tracing::debug;

pub const MM_PER_INCH: f64 = 25.4;

/// Largest edge, in pixels, of any raster the pipeline will allocate.
pub const MAX_OUTPUT_DIMENSION: u32 = 16_384;

pub fn mm_to_inch(mm: f64) -> f64 {
    mm / MM_PER_INCH
}

/// Pixel size of a card with `bleed` on every edge rendered at `dpi`.
pub fn output_dimensions(
    geometry: &CardGeometry,
    bleed: BleedWidth,
    dpi: u32,
) -> Result<(u32, u32), TransformError> {
    if dpi == 0 {
        return Err(TransformError::InvalidParameters("DPI must be > 0".into()));
    }
    let axis = |card_mm: f64| -> Result<u32, TransformError> {
        let px = (mm_to_inch(card_mm + 2.0 * bleed.as_mm()) * dpi as f64).round();
        if !px.is_finite() || px < 1.0 {
            return Err(TransformError::InvalidParameters(format!(
                "{card_mm}mm + {bleed} bleed at {dpi} DPI rounds to zero pixels"
            )));
        }
        if px > MAX_OUTPUT_DIMENSION as f64 {
            return Err(TransformError::InvalidParameters(format!(
                "{card_mm}mm + {bleed} bleed at {dpi} DPI needs {px} px (max {MAX_OUTPUT_DIMENSION})"
            )));
        }
        Ok(px as u32)
    };
    Ok((axis(geometry.width_mm)?, axis(geometry.height_mm)?))
}

/// Resample `img` to exactly `width × height` with Lanczos3.
pub fn resample(img: &RgbaImage, width: u32, height: u32) -> RgbaImage {
    if img.dimensions() == (width, height) {
        return img.clone();
    }
    debug!(
        "Resampling {}x{} → {}x{}",
        img.width(),
        img.height(),
        width,
        height
    );
    imageops::resize(img, width, height, FilterType::Lanczos3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn dimensions_follow_physical_size() {
        let g = CardGeometry::default();
        // 63 mm = 2.4803 in → 744 px; 88 mm = 3.4646 in → 1039 px at 300 DPI.
        assert_eq!(output_dimensions(&g, BleedWidth::ZERO, 300).unwrap(), (744, 1039));
        // +2 mm each side: 67 mm → 791 px, 92 mm → 1087 px.
        assert_eq!(
            output_dimensions(&g, BleedWidth::from_mm(2.0), 300).unwrap(),
            (791, 1087)
        );
    }

    #[test]
    fn degenerate_parameters_rejected() {
        let g = CardGeometry::default();
        assert!(matches!(
            output_dimensions(&g, BleedWidth::ZERO, 0),
            Err(TransformError::InvalidParameters(_))
        ));
        assert!(matches!(
            output_dimensions(&g, BleedWidth::ZERO, 1_000_000),
            Err(TransformError::InvalidParameters(_))
        ));
        assert!(matches!(
            output_dimensions(&g, BleedWidth::from_mm(1e9), 300),
            Err(TransformError::InvalidParameters(_))
        ));
    }

    #[test]
    fn resample_hits_exact_size() {
        let img = RgbaImage::from_pixel(50, 70, Rgba([10, 20, 30, 255]));
        let out = resample(&img, 31, 44);
        assert_eq!(out.dimensions(), (31, 44));
        assert_eq!(resample(&img, 50, 70), img);
    }
}
