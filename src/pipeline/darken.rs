//! Fixed tone map for prints that come out lighter than the source art.
//!
//! `out = 255 · (in / 255)^GAMMA · GAIN` per colour channel through a
//! precomputed table. Alpha is left alone.

use image::RgbaImage;
use once_cell::sync::Lazy;

const GAMMA: f64 = 1.3;
const GAIN: f64 = 0.95;

static LUT: Lazy<[u8; 256]> = Lazy::new(|| {
    let mut lut = [0u8; 256];
    for (i, slot) in lut.iter_mut().enumerate() {
        let v = (i as f64 / 255.0).powf(GAMMA) * GAIN * 255.0;
        *slot = v.round().clamp(0.0, 255.0) as u8;
    }
    lut
});

/// Darken `img` in place.
pub fn darken_in_place(img: &mut RgbaImage) {
    let lut = &*LUT;
    for px in img.pixels_mut() {
        px[0] = lut[px[0] as usize];
        px[1] = lut[px[1] as usize];
        px[2] = lut[px[2] as usize];
    }
}

/// Darkened copy of `img`.
pub fn darken(img: &RgbaImage) -> RgbaImage {
    let mut out = img.clone();
    darken_in_place(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn never_brightens_and_keeps_black() {
        for i in 0..=255usize {
            assert!(LUT[i] as usize <= i, "value {i} brightened to {}", LUT[i]);
        }
        assert_eq!(LUT[0], 0);
        assert!(LUT[255] < 255);
    }

    #[test]
    fn table_is_monotonic() {
        assert!(LUT.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn alpha_untouched() {
        let img = RgbaImage::from_pixel(3, 3, Rgba([200, 128, 64, 77]));
        let out = darken(&img);
        let p = out.get_pixel(1, 1);
        assert_eq!(p[3], 77);
        assert!(p[0] < 200 && p[1] < 128 && p[2] < 64);
    }
}
