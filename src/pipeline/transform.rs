//! Image transformation: trim uniform margins and re-encode compactly.
//!
//! Paged images are trimmed against a white background and re-encoded as
//! lossy WebP. Webtoon strips pass through byte-for-byte: a continuous
//! vertical strip has no uniform border worth trimming, and re-encoding a
//! 10 000 px tall strip costs far more than it saves.
//!
//! Decoding and encoding are CPU-bound and run inside `spawn_blocking`
//! (see [`crate::pipeline::task`]); everything in this module is synchronous.

use crate::error::ImageError;
use crate::pipeline::classify::Classification;
use image::DynamicImage;
use tracing::debug;

/// Max per-channel distance from white still counted as margin (0–255).
pub const TRIM_THRESHOLD: u8 = 40;
/// Lossy WebP quality (0–100).
pub const WEBP_QUALITY: f32 = 75.0;
/// libwebp `method`: 0 = fastest, 6 = smallest output.
pub const WEBP_EFFORT: i32 = 6;

/// Decode/trim/encode primitives.
///
/// Implementations must be deterministic: the same input bytes always
/// produce the same output bytes.
pub trait ImageCodec: Send + Sync {
    /// Width and height of the encoded image.
    fn dimensions(&self, bytes: &[u8]) -> Result<(u32, u32), String>;

    /// Trim uniform margins and re-encode to the compact format.
    fn compact(&self, bytes: &[u8]) -> Result<Vec<u8>, String>;
}

/// Default codec built on the `image` and `webp` crates.
#[derive(Debug, Clone, Copy)]
pub struct WebpCodec {
    pub trim_threshold: u8,
    pub quality: f32,
    pub effort: i32,
}

impl Default for WebpCodec {
    fn default() -> Self {
        Self {
            trim_threshold: TRIM_THRESHOLD,
            quality: WEBP_QUALITY,
            effort: WEBP_EFFORT,
        }
    }
}

impl ImageCodec for WebpCodec {
    fn dimensions(&self, bytes: &[u8]) -> Result<(u32, u32), String> {
        let reader = image::ImageReader::new(std::io::Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| e.to_string())?;
        reader.into_dimensions().map_err(|e| e.to_string())
    }

    fn compact(&self, bytes: &[u8]) -> Result<Vec<u8>, String> {
        let img = image::load_from_memory(bytes).map_err(|e| format!("decode: {e}"))?;
        let trimmed = trim_white(&img, self.trim_threshold);
        debug!(
            "Trimmed {}x{} → {}x{}",
            img.width(),
            img.height(),
            trimmed.width(),
            trimmed.height()
        );
        encode_webp(&trimmed, self.quality, self.effort)
    }
}

/// Produce the bytes to store for an image of the given classification.
pub fn transform(
    codec: &dyn ImageCodec,
    bytes: &[u8],
    classification: Classification,
    filename: &str,
) -> Result<Vec<u8>, ImageError> {
    match classification {
        Classification::Webtoon => Ok(bytes.to_vec()),
        Classification::Paged => codec.compact(bytes).map_err(|detail| ImageError::Transform {
            filename: filename.to_string(),
            detail,
        }),
    }
}

/// Crop away the white (within `threshold`) border around the content.
///
/// Fully transparent pixels count as background. An image that is entirely
/// background is returned unchanged rather than cropped to nothing.
pub fn trim_white(img: &DynamicImage, threshold: u8) -> DynamicImage {
    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();

    let is_content = |x: u32, y: u32| {
        let p = rgba.get_pixel(x, y).0;
        p[3] != 0 && p[..3].iter().any(|&c| 255 - c > threshold)
    };

    let mut top = None;
    let mut bottom = 0;
    let mut left = width;
    let mut right = 0;

    for y in 0..height {
        for x in 0..width {
            if is_content(x, y) {
                top.get_or_insert(y);
                bottom = y;
                left = left.min(x);
                right = right.max(x);
            }
        }
    }

    match top {
        Some(top) => img.crop_imm(left, top, right - left + 1, bottom - top + 1),
        None => img.clone(),
    }
}

fn encode_webp(img: &DynamicImage, quality: f32, effort: i32) -> Result<Vec<u8>, String> {
    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();

    let mut config =
        webp::WebPConfig::new().map_err(|_| "encode: cannot initialise WebP config".to_string())?;
    config.quality = quality;
    config.method = effort;
    config.lossless = 0;

    let encoder = webp::Encoder::from_rgba(rgba.as_raw(), width, height);
    let memory = encoder
        .encode_advanced(&config)
        .map_err(|e| format!("encode: {e:?}"))?;
    Ok(memory.to_vec())
}
