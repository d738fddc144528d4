//! Aspect-ratio classification: webtoon strip or standard page.

use serde::{Deserialize, Serialize};

/// Height-over-width ratio above which an image is a webtoon strip.
pub const WEBTOON_RATIO: f64 = 1.6;

/// How an image will be treated by the transformer and the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    /// Tall continuous strip; stored untouched, heights are accumulated.
    Webtoon,
    /// Standard page; trimmed and re-encoded.
    Paged,
}

/// Classify by `height / width`.
///
/// The ratio must be height over width. Inverting it flips every decision
/// (tall strips get trimmed, ordinary pages do not), so keep the operand
/// order exactly as written. A zero width cannot be a strip.
pub fn classify(width: u32, height: u32) -> Classification {
    if width == 0 {
        return Classification::Paged;
    }
    if f64::from(height) / f64::from(width) > WEBTOON_RATIO {
        Classification::Webtoon
    } else {
        Classification::Paged
    }
}
