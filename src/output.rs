//! Result types: per-image outcomes, the batch response, background reports.

use crate::error::ImageError;
use crate::pipeline::classify::{classify, Classification};
use serde::{Deserialize, Serialize};

/// Decoded size and classification of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub width: u32,
    pub height: u32,
    pub classification: Classification,
}

impl ImageMetadata {
    pub fn from_dimensions((width, height): (u32, u32)) -> Self {
        Self {
            width,
            height,
            classification: classify(width, height),
        }
    }
}

/// How a single task ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "error", rename_all = "lowercase")]
pub enum TaskStatus {
    /// The artifact already existed; nothing was fetched or written.
    Skipped,
    /// Fetched, transformed and persisted.
    Processed,
    /// Isolated failure; siblings are unaffected.
    Failed(ImageError),
}

/// Result of running one image task.
///
/// A task never propagates an error past its own boundary; failures are
/// stored in `status` so callers aggregate rather than abort.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageOutcome {
    /// Position in the batch (0-based).
    pub index: usize,
    pub filename: String,
    pub public_url: String,
    #[serde(flatten)]
    pub status: TaskStatus,
    /// Only populated when the caller asked for metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ImageMetadata>,
}

impl ImageOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self.status, TaskStatus::Failed(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.status, TaskStatus::Skipped)
    }

    pub fn error(&self) -> Option<&ImageError> {
        match &self.status {
            TaskStatus::Failed(e) => Some(e),
            _ => None,
        }
    }

    pub fn height(&self) -> Option<u32> {
        self.metadata.map(|m| m.height)
    }

    pub fn classification(&self) -> Option<Classification> {
        self.metadata.map(|m| m.classification)
    }
}

/// Batch-level reading mode, fixed once the first image completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchMode {
    Webtoon,
    Paged,
    /// The first image succeeded but its size could not be read.
    Unknown,
}

/// Upstream chapter descriptor echoed back in chapter-mode responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterData {
    pub hash: String,
    pub data: Vec<String>,
}

/// The response handed to the HTTP layer.
///
/// `processed_images` lists the final public URL of **every** image in the
/// batch, not just the disclosed ones: URLs are stable and resolve once
/// processing completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub result: String,
    pub processed_images: Vec<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_images: Option<Vec<String>>,
    /// Chapter mode only: the site origin that replaces the upstream node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Chapter mode only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chapter: Option<ChapterData>,
    /// Not serialised; lets embedders inspect how the batch was split.
    #[serde(skip)]
    pub summary: DisclosureSummary,
}

/// How the dispatcher split a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisclosureSummary {
    pub total: usize,
    pub disclosed: usize,
    pub background: usize,
    pub cumulative_height: u64,
    pub mode: Option<BatchMode>,
}

/// Message telling the caller how many pages are ready.
pub fn disclosure_message(disclosed: usize) -> String {
    format!("Images are being processed. The first {disclosed} page(s) are ready.")
}

/// Aggregate of a finished background wave.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveReport {
    pub total: usize,
    pub processed: usize,
    pub skipped: usize,
    /// `(filename, error)` for every failed image.
    pub failed: Vec<(String, ImageError)>,
}

impl WaveReport {
    pub fn from_outcomes<'a>(outcomes: impl IntoIterator<Item = &'a ImageOutcome>) -> Self {
        let mut report = WaveReport::default();
        for outcome in outcomes {
            report.total += 1;
            match &outcome.status {
                TaskStatus::Skipped => report.skipped += 1,
                TaskStatus::Processed => report.processed += 1,
                TaskStatus::Failed(e) => report.failed.push((outcome.filename.clone(), e.clone())),
            }
        }
        report
    }
}
