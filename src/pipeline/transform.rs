//! Composition of the pure stages into the derivative set stored per image.

use super::bleed::{bleed_pixels, extend_bleed};
use super::darken::{darken, darken_in_place};
use super::encode::{decode_source, encode_png};
use super::resample::{output_dimensions, resample, MAX_OUTPUT_DIMENSION};
use super::TransformError;
use crate::card::{CardGeometry, DarkenMode, TransformParams};
use image::RgbaImage;

/// The encoded outputs of one job.
#[derive(Debug, Clone)]
pub struct DerivedImages {
    /// Preview at the display DPI, with the requested bleed.
    pub display: Vec<u8>,
    /// `display` with the darken pass applied.
    pub display_darkened: Vec<u8>,
    /// Print raster at the requested DPI, bleed and darken mode.
    pub export: Vec<u8>,
    pub source_width: u32,
    pub source_height: u32,
    pub export_width: u32,
    pub export_height: u32,
}

/// Most pixels the mirrored bleed border may add to a source (256 MiB of
/// RGBA on top of the source itself).
pub const MAX_BLEED_PIXELS: u64 = 64 * 1024 * 1024;

/// Bleed-extend, resample and optionally darken `source`.
///
/// Fails with [`TransformError::InvalidParameters`] before allocating when
/// the bleed border would exceed [`MAX_BLEED_PIXELS`].
pub fn transform(
    source: &RgbaImage,
    params: &TransformParams,
    geometry: &CardGeometry,
) -> Result<RgbaImage, TransformError> {
    let (out_w, out_h) = output_dimensions(geometry, params.bleed_width, params.dpi)?;

    let (src_w, src_h) = source.dimensions();
    let pad_x = bleed_pixels(src_w, geometry.width_mm, params.bleed_width);
    let pad_y = bleed_pixels(src_h, geometry.height_mm, params.bleed_width);
    let padded_w = pad_x.checked_mul(2).and_then(|p| p.checked_add(src_w));
    let padded_h = pad_y.checked_mul(2).and_then(|p| p.checked_add(src_h));
    match (padded_w, padded_h) {
        (Some(w), Some(h))
            if w <= 2 * MAX_OUTPUT_DIMENSION
                && h <= 2 * MAX_OUTPUT_DIMENSION
                && (w as u64) * (h as u64) - (src_w as u64) * (src_h as u64)
                    <= MAX_BLEED_PIXELS => {}
        _ => {
            return Err(TransformError::InvalidParameters(format!(
                "{} bleed on a {src_w}x{src_h} source is too large to extend",
                params.bleed_width
            )))
        }
    }

    let bled = extend_bleed(source, pad_x, pad_y);
    let mut out = resample(&bled, out_w, out_h);
    if params.darken.is_on() {
        darken_in_place(&mut out);
    }
    Ok(out)
}

/// Decode `source_bytes` once and produce display, darkened display and
/// export rasters, all PNG-encoded.
///
/// CPU-bound; callers on an async runtime run it under `spawn_blocking`.
pub fn render_derivatives(
    source_bytes: &[u8],
    params: &TransformParams,
    geometry: &CardGeometry,
    display_dpi: u32,
) -> Result<DerivedImages, TransformError> {
    let source = decode_source(source_bytes)?;

    let export = transform(&source, params, geometry)?;

    let display_params = TransformParams {
        dpi: display_dpi,
        bleed_width: params.bleed_width,
        darken: DarkenMode::Off,
    };
    let display = transform(&source, &display_params, geometry)?;
    let display_darkened = darken(&display);

    Ok(DerivedImages {
        display: encode_png(&display)?,
        display_darkened: encode_png(&display_darkened)?,
        export: encode_png(&export)?,
        source_width: source.width(),
        source_height: source.height(),
        export_width: export.width(),
        export_height: export.height(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::BleedWidth;
    use image::Rgba;

    fn card_art() -> RgbaImage {
        // 63 × 88 px: one pixel per millimetre, red frame around a blue field.
        RgbaImage::from_fn(63, 88, |x, y| {
            if x < 3 || y < 3 || x >= 60 || y >= 85 {
                Rgba([220, 20, 20, 255])
            } else {
                Rgba([20, 20, 220, 255])
            }
        })
    }

    fn params(dpi: u32, bleed_mm: f64, darken: DarkenMode) -> TransformParams {
        TransformParams {
            dpi,
            bleed_width: BleedWidth::from_mm(bleed_mm),
            darken,
        }
    }

    #[test]
    fn output_size_is_deterministic() {
        let g = CardGeometry::default();
        let out = transform(&card_art(), &params(100, 0.0, DarkenMode::Off), &g).unwrap();
        assert_eq!(out.dimensions(), output_dimensions(&g, BleedWidth::ZERO, 100).unwrap());
    }

    #[test]
    fn bleed_border_carries_art_not_white() {
        let g = CardGeometry::default();
        let out = transform(&card_art(), &params(100, 3.0, DarkenMode::Off), &g).unwrap();
        let corner = out.get_pixel(0, 0);
        // Mirrored red frame, not blank padding.
        assert!(corner[0] > 150 && corner[2] < 100, "corner was {corner:?}");
        assert_eq!(corner[3], 255);
    }

    #[test]
    fn darken_applies_after_resampling() {
        let g = CardGeometry::default();
        let plain = transform(&card_art(), &params(100, 0.0, DarkenMode::Off), &g).unwrap();
        let dark = transform(&card_art(), &params(100, 0.0, DarkenMode::Darken), &g).unwrap();
        assert_eq!(plain.dimensions(), dark.dimensions());
        let (x, y) = (plain.width() / 2, plain.height() / 2);
        assert!(dark.get_pixel(x, y)[2] < plain.get_pixel(x, y)[2]);
    }

    #[test]
    fn derivative_set_has_three_rasters() {
        let g = CardGeometry::default();
        let png = encode_png(&card_art()).unwrap();
        let set = render_derivatives(&png, &params(200, 2.0, DarkenMode::Off), &g, 50).unwrap();

        assert_eq!((set.source_width, set.source_height), (63, 88));
        assert_eq!(
            (set.export_width, set.export_height),
            output_dimensions(&g, BleedWidth::from_mm(2.0), 200).unwrap()
        );
        let display = decode_source(&set.display).unwrap();
        assert_eq!(
            display.dimensions(),
            output_dimensions(&g, BleedWidth::from_mm(2.0), 50).unwrap()
        );
        assert_ne!(set.display, set.display_darkened);
    }

    #[test]
    fn corrupt_source_fails_with_decode() {
        let g = CardGeometry::default();
        let err = render_derivatives(b"\x89PNG broken", &params(300, 0.0, DarkenMode::Off), &g, 150)
            .unwrap_err();
        assert!(matches!(err, TransformError::Decode(_)));
    }

    #[test]
    fn oversized_bleed_fails_before_allocating() {
        let g = CardGeometry::default();
        // 1590 mm of bleed at 1 DPI is a small output (128 × 129) but a
        // 32430 × 32680 intermediate.
        let source = RgbaImage::new(630, 880);
        let p = params(1, 1590.0, DarkenMode::Off);
        assert_eq!(output_dimensions(&g, p.bleed_width, 1).unwrap(), (128, 129));

        let err = transform(&source, &p, &g).unwrap_err();
        assert!(matches!(err, TransformError::InvalidParameters(_)), "{err:?}");
    }

    #[test]
    fn pathological_dpi_fails_with_invalid_parameters() {
        let g = CardGeometry::default();
        let err = transform(&card_art(), &params(900_000, 0.0, DarkenMode::Off), &g).unwrap_err();
        assert!(matches!(err, TransformError::InvalidParameters(_)));
    }
}
