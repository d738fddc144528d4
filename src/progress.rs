//! Progress-callback trait for per-image pipeline events.
//!
//! Inject an [`Arc<dyn ProxyProgressCallback>`] via
//! [`crate::config::ProxyConfigBuilder::progress_callback`] to receive
//! real-time events as the dispatcher works through a batch.
//!
//! # Why callbacks instead of channels?
//!
//! The callback approach is the least-invasive integration point: callers can
//! forward events to a metrics sink, a log line or a terminal progress bar
//! without the library knowing anything about how the host application
//! communicates. The trait is `Send + Sync` because images are processed
//! concurrently inside `tokio::spawn`ed tasks, including after the batch
//! response has already been returned.
//!
//! # Example
//!
//! ```rust
//! use panel_proxy::{ProxyConfig, ProxyProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     failed: AtomicUsize,
//! }
//!
//! impl ProxyProgressCallback for CountingCallback {
//!     fn on_image_error(&self, index: usize, total: usize, error: &str) {
//!         self.failed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("image {}/{} failed: {}", index + 1, total, error);
//!     }
//! }
//!
//! let config = ProxyConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { failed: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::output::WaveReport;
use std::sync::Arc;

/// Called by the pipeline as it processes each image.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. Methods may be called concurrently from different
/// worker threads; protect shared state accordingly.
pub trait ProxyProgressCallback: Send + Sync {
    /// Called once per batch before the first image starts.
    fn on_batch_start(&self, total_images: usize) {
        let _ = total_images;
    }

    /// Called when a task leaves the pending state.
    ///
    /// `index` is 0-based.
    fn on_image_start(&self, index: usize, total_images: usize) {
        let _ = (index, total_images);
    }

    /// Called when a task finishes without error.
    ///
    /// `skipped` is true when the artifact was already cached.
    fn on_image_complete(&self, index: usize, total_images: usize, skipped: bool) {
        let _ = (index, total_images, skipped);
    }

    /// Called when a task fails.
    fn on_image_error(&self, index: usize, total_images: usize, error: &str) {
        let _ = (index, total_images, error);
    }

    /// Called right before the batch response is returned.
    fn on_disclosed(&self, disclosed: usize, total_images: usize) {
        let _ = (disclosed, total_images);
    }

    /// Called when the detached background wave has drained.
    fn on_background_complete(&self, report: &WaveReport) {
        let _ = report;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ProxyProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ProxyConfig`].
pub type ProgressCallback = Arc<dyn ProxyProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TrackingCallback {
        starts: AtomicUsize,
        completes: AtomicUsize,
        skips: AtomicUsize,
        errors: AtomicUsize,
        disclosed: AtomicUsize,
    }

    impl ProxyProgressCallback for TrackingCallback {
        fn on_image_start(&self, _index: usize, _total: usize) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_image_complete(&self, _index: usize, _total: usize, skipped: bool) {
            self.completes.fetch_add(1, Ordering::SeqCst);
            if skipped {
                self.skips.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn on_image_error(&self, _index: usize, _total: usize, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }

        fn on_disclosed(&self, disclosed: usize, _total: usize) {
            self.disclosed.store(disclosed, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_batch_start(5);
        cb.on_image_start(0, 5);
        cb.on_image_complete(0, 5, false);
        cb.on_image_error(1, 5, "boom");
        cb.on_disclosed(2, 5);
        cb.on_background_complete(&WaveReport::default());
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();

        tracker.on_image_start(0, 3);
        tracker.on_image_complete(0, 3, false);
        tracker.on_image_start(1, 3);
        tracker.on_image_complete(1, 3, true);
        tracker.on_image_start(2, 3);
        tracker.on_image_error(2, 3, "HTTP 404");
        tracker.on_disclosed(2, 3);

        assert_eq!(tracker.starts.load(Ordering::SeqCst), 3);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.skips.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.disclosed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_batch_start(10);
        cb.on_image_complete(3, 10, true);
    }
}
