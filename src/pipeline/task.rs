//! The per-image task: probe → fetch → classify → transform → persist.
//!
//! ```text
//! Pending ──(cached)──────────────────────────────────────────▶ Done [skipped]
//!    │
//!    └──▶ Fetching ──▶ Classifying ──▶ Transforming ──▶ Done
//!            │              │                │
//!            └──────────────┴────────────────┴──────────▶ Failed
//! ```
//!
//! [`ImageTask::run`] always returns an [`ImageOutcome`]; every error is
//! caught here and stored in the outcome so a failing image can never abort
//! the wave it belongs to.

use crate::error::ImageError;
use crate::output::{ImageMetadata, ImageOutcome, TaskStatus};
use crate::pipeline::cache::CacheStore;
use crate::pipeline::fetch::ImageFetcher;
use crate::pipeline::path::ImageRef;
use crate::pipeline::transform::{self, ImageCodec};
use crate::progress::ProgressCallback;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Lifecycle of one [`ImageTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Fetching,
    Classifying,
    Transforming,
    Done,
    Failed,
}

/// Everything a task needs, shared by every task of a batch.
#[derive(Clone)]
pub struct TaskContext {
    pub store: CacheStore,
    pub fetcher: Arc<dyn ImageFetcher>,
    pub codec: Arc<dyn ImageCodec>,
    pub progress: Option<ProgressCallback>,
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("store", &self.store)
            .field("fetcher", &"<dyn ImageFetcher>")
            .field("codec", &"<dyn ImageCodec>")
            .field("progress", &self.progress.as_ref().map(|_| "<dyn ProxyProgressCallback>"))
            .finish()
    }
}

/// One image's unit of work.
#[derive(Debug, Clone)]
pub struct ImageTask {
    index: usize,
    total: usize,
    image: ImageRef,
    state: TaskState,
}

impl ImageTask {
    pub fn new(index: usize, total: usize, image: ImageRef) -> Self {
        Self {
            index,
            total,
            image,
            state: TaskState::Pending,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn image(&self) -> &ImageRef {
        &self.image
    }

    /// Drive the task to `Done` or `Failed`.
    ///
    /// With `want_metadata` the outcome carries width, height and
    /// classification; without it, only success or failure is reported.
    pub async fn run(mut self, ctx: &TaskContext, want_metadata: bool) -> ImageOutcome {
        if let Some(ref cb) = ctx.progress {
            cb.on_image_start(self.index, self.total);
        }

        let result = self.execute(ctx, want_metadata).await;

        let (status, metadata) = match result {
            Ok((status, metadata)) => {
                self.advance(TaskState::Done);
                if let Some(ref cb) = ctx.progress {
                    cb.on_image_complete(self.index, self.total, status == TaskStatus::Skipped);
                }
                (status, metadata)
            }
            Err(e) => {
                self.advance(TaskState::Failed);
                warn!(
                    "Image {}/{} ({}) failed [{}]: {}",
                    self.index + 1,
                    self.total,
                    self.image.filename,
                    e.kind(),
                    e
                );
                if let Some(ref cb) = ctx.progress {
                    cb.on_image_error(self.index, self.total, &e.to_string());
                }
                (TaskStatus::Failed(e), None)
            }
        };

        ImageOutcome {
            index: self.index,
            filename: self.image.filename.clone(),
            public_url: self.image.public_url.clone(),
            status,
            metadata: if want_metadata { metadata } else { None },
        }
    }

    async fn execute(
        &mut self,
        ctx: &TaskContext,
        want_metadata: bool,
    ) -> Result<(TaskStatus, Option<ImageMetadata>), ImageError> {
        if ctx.store.exists(&self.image).await {
            debug!("Cache hit for {}", self.image.relative_path);
            let metadata = if want_metadata {
                ctx.store.cached_metadata(&self.image).await
            } else {
                None
            };
            return Ok((TaskStatus::Skipped, metadata));
        }

        self.advance(TaskState::Fetching);
        let bytes = ctx.fetcher.fetch(&self.image).await?;

        self.advance(TaskState::Classifying);
        let codec = Arc::clone(&ctx.codec);
        let filename = self.image.filename.clone();
        let probe_bytes = bytes.clone();
        let dimensions = tokio::task::spawn_blocking(move || codec.dimensions(&probe_bytes))
            .await
            .map_err(|e| self.aborted(e))?
            .map_err(|detail| ImageError::Transform {
                filename: filename.clone(),
                detail,
            })?;
        let metadata = ImageMetadata::from_dimensions(dimensions);
        debug!(
            "{} is {}x{} → {:?}",
            self.image.filename, metadata.width, metadata.height, metadata.classification
        );

        self.advance(TaskState::Transforming);
        let codec = Arc::clone(&ctx.codec);
        let classification = metadata.classification;
        let output = tokio::task::spawn_blocking(move || {
            transform::transform(codec.as_ref(), &bytes, classification, &filename)
        })
        .await
        .map_err(|e| self.aborted(e))??;

        // Record first so that the artifact, once visible, already has it.
        ctx.store.record_metadata(&self.image, &metadata).await;
        ctx.store.persist(&self.image, output).await?;
        Ok((TaskStatus::Processed, Some(metadata)))
    }

    fn advance(&mut self, next: TaskState) {
        debug!(
            "Image {}/{} {:?} → {:?}",
            self.index + 1,
            self.total,
            self.state,
            next
        );
        self.state = next;
    }

    fn aborted(&self, err: tokio::task::JoinError) -> ImageError {
        ImageError::Aborted {
            filename: self.image.filename.clone(),
            detail: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::cache::WaitPolicy;
    use crate::pipeline::classify::Classification;
    use crate::pipeline::path::PathResolver;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Serves `"<w>x<h>"` as the image body.
    struct SizeFetcher {
        calls: AtomicUsize,
        body: &'static str,
    }

    #[async_trait]
    impl ImageFetcher for SizeFetcher {
        async fn fetch(&self, image: &ImageRef) -> Result<Bytes, ImageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.body.is_empty() {
                return Err(ImageError::Fetch {
                    url: image.source_url.clone(),
                    reason: "HTTP 500".into(),
                });
            }
            Ok(Bytes::from_static(self.body.as_bytes()))
        }
    }

    /// Parses `"<w>x<h>"`; compacts by prefixing `"compact:"`.
    struct TextCodec {
        compacts: AtomicUsize,
    }

    impl ImageCodec for TextCodec {
        fn dimensions(&self, bytes: &[u8]) -> Result<(u32, u32), String> {
            let text = std::str::from_utf8(bytes).map_err(|e| e.to_string())?;
            let (w, h) = text.split_once('x').ok_or("not a size")?;
            Ok((
                w.parse().map_err(|_| "bad width")?,
                h.parse().map_err(|_| "bad height")?,
            ))
        }

        fn compact(&self, bytes: &[u8]) -> Result<Vec<u8>, String> {
            self.compacts.fetch_add(1, Ordering::SeqCst);
            let mut out = b"compact:".to_vec();
            out.extend_from_slice(bytes);
            Ok(out)
        }
    }

    fn setup(body: &'static str) -> (TempDir, TaskContext, Arc<SizeFetcher>, Arc<TextCodec>) {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(SizeFetcher {
            calls: AtomicUsize::new(0),
            body,
        });
        let codec = Arc::new(TextCodec {
            compacts: AtomicUsize::new(0),
        });
        let ctx = TaskContext {
            store: CacheStore::new(dir.path(), WaitPolicy::default()),
            fetcher: fetcher.clone(),
            codec: codec.clone(),
            progress: None,
        };
        (dir, ctx, fetcher, codec)
    }

    fn image() -> ImageRef {
        PathResolver::new("https://p")
            .resolve_chapter("https://node", "hash", "1.png")
            .unwrap()
    }

    #[tokio::test]
    async fn paged_image_is_compacted_and_persisted() {
        let (dir, ctx, fetcher, codec) = setup("100x150");
        let outcome = ImageTask::new(0, 1, image()).run(&ctx, true).await;

        assert_eq!(outcome.status, TaskStatus::Processed);
        assert_eq!(outcome.classification(), Some(Classification::Paged));
        assert_eq!(outcome.height(), Some(150));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(codec.compacts.load(Ordering::SeqCst), 1);
        let stored = std::fs::read(dir.path().join("hash/1.png")).unwrap();
        assert_eq!(stored, b"compact:100x150");
    }

    #[tokio::test]
    async fn webtoon_image_is_stored_verbatim() {
        let (dir, ctx, _fetcher, codec) = setup("100x2000");
        let outcome = ImageTask::new(0, 1, image()).run(&ctx, true).await;

        assert_eq!(outcome.classification(), Some(Classification::Webtoon));
        assert_eq!(codec.compacts.load(Ordering::SeqCst), 0);
        let stored = std::fs::read(dir.path().join("hash/1.png")).unwrap();
        assert_eq!(stored, b"100x2000");
    }

    #[tokio::test]
    async fn cached_image_is_skipped_without_fetching() {
        let (dir, ctx, fetcher, codec) = setup("100x150");
        std::fs::create_dir_all(dir.path().join("hash")).unwrap();
        std::fs::write(dir.path().join("hash/1.png"), b"old").unwrap();

        let outcome = ImageTask::new(0, 1, image()).run(&ctx, false).await;

        assert!(outcome.is_skipped());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(codec.compacts.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read(dir.path().join("hash/1.png")).unwrap(), b"old");
    }

    #[tokio::test]
    async fn cache_hit_reports_the_source_classification() {
        let (_dir, ctx, fetcher, _codec) = setup("100x150");
        ImageTask::new(0, 1, image()).run(&ctx, true).await;

        // The stored "compact:100x150" has no readable header of its own.
        let outcome = ImageTask::new(0, 1, image()).run(&ctx, true).await;
        assert!(outcome.is_skipped());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.classification(), Some(Classification::Paged));
        assert_eq!(outcome.height(), Some(150));
    }

    #[tokio::test]
    async fn metadata_is_omitted_unless_requested() {
        let (_dir, ctx, _fetcher, _codec) = setup("100x150");
        let outcome = ImageTask::new(0, 1, image()).run(&ctx, false).await;
        assert_eq!(outcome.status, TaskStatus::Processed);
        assert!(outcome.metadata.is_none());
    }

    #[tokio::test]
    async fn fetch_failure_becomes_failed_outcome() {
        let (dir, ctx, _fetcher, _codec) = setup("");
        let outcome = ImageTask::new(3, 6, image()).run(&ctx, true).await;

        assert_eq!(outcome.index, 3);
        assert_eq!(outcome.error().map(|e| e.kind()), Some("fetch"));
        assert!(!dir.path().join("hash/1.png").exists());
    }

    #[tokio::test]
    async fn undecodable_body_becomes_transform_failure() {
        let (dir, ctx, _fetcher, _codec) = setup("garbage");
        let outcome = ImageTask::new(0, 1, image()).run(&ctx, true).await;

        match outcome.error() {
            Some(ImageError::Transform { filename, .. }) => assert_eq!(filename, "1.png"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(!dir.path().join("hash/1.png").exists());
    }

    #[test]
    fn new_task_is_pending() {
        let task = ImageTask::new(0, 1, image());
        assert_eq!(task.state(), TaskState::Pending);
        assert_eq!(task.image().filename, "1.png");
    }
}
