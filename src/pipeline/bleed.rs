//! Bleed extension by edge mirroring.
//!
//! Source art is assumed to be a full card with no bleed. The extra border
//! is filled by reflecting the pixels next to each edge outward, so a cut
//! that lands slightly outside the trim line shows art instead of white.

use crate::card::BleedWidth;
use image::RgbaImage;

/// Source-resolution pixels covering `bleed` on an axis that spans
/// `source_px` pixels and `card_mm` millimetres.
pub fn bleed_pixels(source_px: u32, card_mm: f64, bleed: BleedWidth) -> u32 {
    if bleed.is_zero() || source_px == 0 || card_mm <= 0.0 {
        return 0;
    }
    let px = (source_px as f64 * bleed.as_mm() / card_mm).round();
    px.min(u32::MAX as f64) as u32
}

/// Extend `src` by `pad_x` pixels left and right and `pad_y` pixels top and
/// bottom. Zero padding returns a copy.
///
/// Padding wider than the image keeps reflecting back and forth across it.
pub fn extend_bleed(src: &RgbaImage, pad_x: u32, pad_y: u32) -> RgbaImage {
    if pad_x == 0 && pad_y == 0 {
        return src.clone();
    }
    let (w, h) = src.dimensions();
    let out_w = w + 2 * pad_x;
    let out_h = h + 2 * pad_y;

    RgbaImage::from_fn(out_w, out_h, |x, y| {
        let sx = reflect(x as i64 - pad_x as i64, w);
        let sy = reflect(y as i64 - pad_y as i64, h);
        *src.get_pixel(sx, sy)
    })
}

/// Symmetric reflection of `i` into `0..len` (edge pixel repeated once:
/// `-1 → 0`, `-2 → 1`, `len → len - 1`).
fn reflect(i: i64, len: u32) -> u32 {
    let n = len as i64;
    if n <= 1 {
        return 0;
    }
    let period = 2 * n;
    let m = i.rem_euclid(period);
    if m >= n {
        (period - 1 - m) as u32
    } else {
        m as u32
    }
}
