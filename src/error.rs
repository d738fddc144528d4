//! Error types for the panel-proxy library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`ProxyError`] — **Fatal**: the batch cannot produce a response at all
//!   (empty input, upstream chapter API said no, the very first image could
//!   not be processed). Returned as `Err(ProxyError)` from the dispatch entry
//!   points and mapped to a 4xx/5xx by the routing layer.
//!
//! * [`ImageError`] — **Non-fatal**: a single image failed to fetch, decode
//!   or persist. Stored inside [`crate::output::ImageOutcome`] so one broken
//!   page never aborts its siblings; disclosed-phase failures are listed in
//!   the response's `failedImages`, background failures are only logged.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// All batch-fatal errors returned by the panel-proxy library.
///
/// Per-image failures use [`ImageError`] and are stored in
/// [`crate::output::ImageOutcome`] rather than propagated here.
#[derive(Debug, Error)]
pub enum ProxyError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// The batch contained no images.
    #[error("No image URLs provided.")]
    EmptyBatch,

    /// A source URL could not be parsed or has no usable file name.
    #[error("Invalid image URL '{input}': {reason}")]
    InvalidUrl { input: String, reason: String },

    /// The chapter identifier is empty or contains characters that cannot
    /// appear in an upstream chapter id.
    #[error("Invalid chapter id '{0}'")]
    InvalidChapterId(String),

    /// A requested artifact path escapes the data root or sanitises to nothing.
    #[error("Invalid path '{path}'")]
    InvalidPath { path: String },

    // ── Upstream errors ───────────────────────────────────────────────────
    /// The chapter API answered with a non-"ok" result.
    #[error("Chapter API rejected '{chapter_id}' ({} error(s))", errors.len())]
    UpstreamApi {
        chapter_id: String,
        errors: Vec<serde_json::Value>,
    },

    /// The chapter API could not be reached or returned an unreadable body.
    #[error("Chapter API request to '{url}' failed: {reason}")]
    UpstreamUnavailable { url: String, reason: String },

    // ── Pipeline errors ───────────────────────────────────────────────────
    /// The first image of the batch failed; there is nothing to disclose.
    #[error("Failed to process the first image '{filename}': {error}")]
    FirstImageFailed { filename: String, error: ImageError },

    /// Awaiting a background wave failed (the wave task panicked).
    #[error("Background wave failed: {0}")]
    BackgroundJoin(String),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// HTTP status the routing layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::EmptyBatch
            | ProxyError::InvalidUrl { .. }
            | ProxyError::InvalidChapterId(_)
            | ProxyError::InvalidPath { .. } => 400,
            ProxyError::UpstreamApi { .. } => 404,
            ProxyError::UpstreamUnavailable { .. } => 502,
            ProxyError::FirstImageFailed { .. }
            | ProxyError::BackgroundJoin(_)
            | ProxyError::InvalidConfig(_)
            | ProxyError::Internal(_) => 500,
        }
    }

    /// JSON error body: `{"result": "error", "errors": [...]}`.
    ///
    /// Upstream errors are forwarded verbatim; every other variant becomes a
    /// single message string.
    pub fn error_body(&self) -> serde_json::Value {
        let errors = match self {
            ProxyError::UpstreamApi { errors, .. } => errors.clone(),
            other => vec![serde_json::Value::String(other.to_string())],
        };
        serde_json::json!({ "result": "error", "errors": errors })
    }
}

/// A non-fatal error for a single image.
///
/// Caught at the task boundary and stored in the image's outcome. The
/// batch continues unless this happens to the very first image.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ImageError {
    /// Network failure, non-2xx status, timeout or oversized body.
    #[error("fetch of '{url}' failed: {reason}")]
    Fetch { url: String, reason: String },

    /// Decode, trim or encode failure.
    #[error("transform of '{filename}' failed: {detail}")]
    Transform { filename: String, detail: String },

    /// Writing the artifact (or creating its directory) failed.
    #[error("persist to '{}' failed: {detail}", path.display())]
    Persist { path: PathBuf, detail: String },

    /// The task running this image panicked or was torn down.
    #[error("task for '{filename}' aborted: {detail}")]
    Aborted { filename: String, detail: String },
}

impl ImageError {
    /// Short machine-readable tag, used in logs and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            ImageError::Fetch { .. } => "fetch",
            ImageError::Transform { .. } => "transform",
            ImageError::Persist { .. } => "persist",
            ImageError::Aborted { .. } => "aborted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_error_body_forwards_errors() {
        let e = ProxyError::UpstreamApi {
            chapter_id: "abc".into(),
            errors: vec![serde_json::json!({"status": 404, "title": "Not found"})],
        };
        let body = e.error_body();
        assert_eq!(body["result"], "error");
        assert_eq!(body["errors"][0]["status"], 404);
        assert_eq!(e.status_code(), 404);
    }

    #[test]
    fn first_image_failure_is_server_error() {
        let e = ProxyError::FirstImageFailed {
            filename: "1.png".into(),
            error: ImageError::Fetch {
                url: "https://x/1.png".into(),
                reason: "HTTP 503".into(),
            },
        };
        assert_eq!(e.status_code(), 500);
        let msg = e.to_string();
        assert!(msg.contains("1.png"), "got: {msg}");
        assert!(msg.contains("HTTP 503"), "got: {msg}");
    }

    #[test]
    fn empty_batch_is_client_error() {
        assert_eq!(ProxyError::EmptyBatch.status_code(), 400);
        let body = ProxyError::EmptyBatch.error_body();
        assert_eq!(body["errors"][0], "No image URLs provided.");
    }

    #[test]
    fn image_error_kinds() {
        let e = ImageError::Persist {
            path: PathBuf::from("/data/a/b.png"),
            detail: "disk full".into(),
        };
        assert_eq!(e.kind(), "persist");
        assert!(e.to_string().contains("disk full"));
    }
}
