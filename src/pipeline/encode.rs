//! Raster codec: source bytes → RGBA buffer → PNG bytes.
//!
//! Derived rasters are stored as PNG: lossless, so a card re-exported from
//! the cache is bit-identical to the one previewed.

use super::TransformError;
use image::{DynamicImage, RgbaImage};
use std::io::Cursor;
use tracing::debug;

/// Decode an uploaded or downloaded PNG/JPEG into RGBA.
pub fn decode_source(bytes: &[u8]) -> Result<RgbaImage, TransformError> {
    if bytes.is_empty() {
        return Err(TransformError::Decode("source is empty".into()));
    }
    let img = image::load_from_memory(bytes).map_err(|e| TransformError::Decode(e.to_string()))?;
    if img.width() == 0 || img.height() == 0 {
        return Err(TransformError::Decode(format!(
            "source has zero size ({}x{})",
            img.width(),
            img.height()
        )));
    }
    debug!("Decoded source → {}x{} px", img.width(), img.height());
    Ok(img.to_rgba8())
}

/// Encode a derived raster as PNG.
pub fn encode_png(img: &RgbaImage) -> Result<Vec<u8>, TransformError> {
    let mut buf = Vec::new();
    DynamicImage::ImageRgba8(img.clone())
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .map_err(|e| TransformError::Encode(e.to_string()))?;
    debug!(
        "Encoded {}x{} raster → {} bytes PNG",
        img.width(),
        img.height(),
        buf.len()
    );
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn encode_small_image() {
        let img = RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255]));
        let png = encode_png(&img).expect("encode should succeed");
        assert_eq!(&png[1..4], b"PNG");
        let back = decode_source(&png).expect("decode should succeed");
        assert_eq!(back.get_pixel(4, 4), &Rgba([255, 0, 0, 255]));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let err = decode_source(b"definitely not an image").unwrap_err();
        assert!(matches!(err, TransformError::Decode(_)));
        assert!(matches!(decode_source(&[]), Err(TransformError::Decode(_))));
    }
}
