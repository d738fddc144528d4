//! Progressive dispatch: decide how much of a batch the caller waits for.
//!
//! ```text
//! item 0 ──(awaited, metadata)──▶ mode
//!                                  │
//!          Webtoon ────────────────┼──▶ items 1.. in source order until Σheight ≥ 3500
//!          Paged / Unknown ────────┴──▶ item 1 only
//!                                  │
//!                                  ▼
//!                      response (every public URL)  +  detached background wave
//! ```
//!
//! Item 0 is representative of the whole batch: if it fails, the batch
//! fails. Any later failure is reported (disclosed phase) or logged
//! (background wave), never propagated.
//!
//! Every wave of a batch runs through the same [`ConcurrencyLimiter`], so at
//! most `config.concurrency` images of one batch are ever in flight, the
//! background wave included.

use crate::config::ProxyConfig;
use crate::error::{ImageError, ProxyError};
use crate::limiter::ConcurrencyLimiter;
use crate::output::{
    disclosure_message, BatchMode, BatchResponse, ChapterData, DisclosureSummary, ImageOutcome,
    TaskStatus, WaveReport,
};
use crate::pipeline::classify::Classification;
use crate::pipeline::fetch::{HttpFetcher, ImageFetcher};
use crate::pipeline::path::{ImageRef, PathResolver};
use crate::pipeline::task::{ImageTask, TaskContext};
use crate::pipeline::transform::{ImageCodec, WebpCodec};
use crate::upstream::{validate_chapter_id, AtHomeClient, ChapterSource};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

/// Cumulative source height (pixels) a webtoon batch discloses before
/// answering.
pub const DISCLOSURE_HEIGHT: u64 = 3500;

/// Number of items a paged batch discloses, item 0 included.
pub const PAGED_DISCLOSURE: usize = 2;

/// What a dispatch hands back: the response for the caller and, when some
/// items were left for later, the handle of the wave processing them.
#[derive(Debug)]
pub struct Dispatched {
    pub response: BatchResponse,
    pub background: Option<BackgroundWave>,
}

/// The detached remainder of a batch.
///
/// Dropping the handle detaches the wave; it keeps running either way.
#[derive(Debug)]
pub struct BackgroundWave {
    handle: JoinHandle<WaveReport>,
    len: usize,
}

impl BackgroundWave {
    /// Number of images in the wave.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for every image in the wave to finish.
    pub async fn join(self) -> Result<WaveReport, ProxyError> {
        self.handle
            .await
            .map_err(|e| ProxyError::BackgroundJoin(e.to_string()))
    }
}

/// Process an explicit list of source URLs.
///
/// # Errors
/// - [`ProxyError::EmptyBatch`] for an empty list
/// - [`ProxyError::InvalidUrl`] if any entry is not an http(s) image URL
/// - [`ProxyError::FirstImageFailed`] if the first image cannot be processed
pub async fn process_urls<S: AsRef<str>>(
    urls: &[S],
    config: &ProxyConfig,
) -> Result<Dispatched, ProxyError> {
    if urls.is_empty() {
        return Err(ProxyError::EmptyBatch);
    }
    let resolver = PathResolver::new(&config.site_origin);
    let images = urls
        .iter()
        .map(|u| resolver.resolve_url(u.as_ref()))
        .collect::<Result<Vec<_>, _>>()?;
    process_batch(images, config).await
}

/// Resolve a chapter through the upstream API and process its pages.
///
/// The response additionally carries `baseUrl` (this site's origin) and the
/// upstream `chapter` descriptor.
pub async fn process_chapter(
    chapter_id: &str,
    config: &ProxyConfig,
) -> Result<Dispatched, ProxyError> {
    validate_chapter_id(chapter_id)?;
    let source = resolve_chapter_source(config)?;
    let manifest = source.resolve(chapter_id).await?;
    info!(
        "Chapter {} has {} pages (hash {})",
        chapter_id,
        manifest.filenames.len(),
        manifest.hash
    );
    if manifest.filenames.is_empty() {
        return Err(ProxyError::EmptyBatch);
    }

    let resolver = PathResolver::new(&config.site_origin);
    let images = manifest
        .filenames
        .iter()
        .map(|f| resolver.resolve_chapter(&manifest.base_url, &manifest.hash, f))
        .collect::<Result<Vec<_>, _>>()?;

    let mut dispatched = process_batch(images, config).await?;
    dispatched.response.base_url = Some(config.site_origin.clone());
    dispatched.response.chapter = Some(ChapterData {
        hash: manifest.hash,
        data: manifest.filenames,
    });
    Ok(dispatched)
}

/// Run the progressive dispatch over already-resolved images.
pub async fn process_batch(
    images: Vec<ImageRef>,
    config: &ProxyConfig,
) -> Result<Dispatched, ProxyError> {
    let total = images.len();
    if total == 0 {
        return Err(ProxyError::EmptyBatch);
    }
    info!("Dispatching batch of {} images", total);

    let ctx = TaskContext {
        store: config.cache_store(),
        fetcher: resolve_fetcher(config)?,
        codec: resolve_codec(config),
        progress: config.progress_callback.clone(),
    };
    let limiter = ConcurrencyLimiter::new(config.concurrency);
    if let Some(ref cb) = config.progress_callback {
        cb.on_batch_start(total);
    }

    let processed_images: Vec<String> = images.iter().map(|i| i.public_url.clone()).collect();
    let mut queue: VecDeque<ImageTask> = images
        .into_iter()
        .enumerate()
        .map(|(index, image)| ImageTask::new(index, total, image))
        .collect();

    // ── Item 0: sets the mode, fatal on failure ─────────────────────────
    let Some(first_task) = queue.pop_front() else {
        return Err(ProxyError::EmptyBatch);
    };
    let first = limiter.run(first_task.run(&ctx, true)).await;
    if let Some(error) = first.error() {
        return Err(ProxyError::FirstImageFailed {
            filename: first.filename.clone(),
            error: error.clone(),
        });
    }

    let mode = match first.classification() {
        Some(Classification::Webtoon) => BatchMode::Webtoon,
        Some(Classification::Paged) => BatchMode::Paged,
        None => BatchMode::Unknown,
    };
    debug!("Batch mode {:?} from {}", mode, first.filename);

    let mut cumulative_height = u64::from(first.height().unwrap_or(0));
    let mut disclosed = vec![first];
    let mut in_flight: VecDeque<InFlight> = VecDeque::new();

    // ── Disclosed phase ─────────────────────────────────────────────────
    match mode {
        BatchMode::Webtoon => {
            // Up to `width` items run ahead, but heights are added strictly
            // in source order. Whatever is still in flight when the
            // threshold is met belongs to the background wave.
            while cumulative_height < DISCLOSURE_HEIGHT {
                while in_flight.len() < limiter.width() {
                    let Some(task) = queue.pop_front() else { break };
                    in_flight.push_back(InFlight::spawn(&limiter, task, &ctx, true).await);
                }
                let Some(next) = in_flight.pop_front() else { break };
                let outcome = next.join().await;
                if outcome.is_success() {
                    cumulative_height += u64::from(outcome.height().unwrap_or(0));
                }
                disclosed.push(outcome);
            }
        }
        BatchMode::Paged | BatchMode::Unknown => {
            let extra = PAGED_DISCLOSURE.saturating_sub(1).min(queue.len());
            let tasks: Vec<ImageTask> = queue.drain(..extra).collect();
            disclosed.extend(run_wave(&limiter, tasks, &ctx, false).await);
        }
    }

    let failed: Vec<String> = disclosed
        .iter()
        .filter(|o| !o.is_success())
        .map(|o| o.public_url.clone())
        .collect();

    // ── Background wave ─────────────────────────────────────────────────
    let background_len = in_flight.len() + queue.len();
    let background = if background_len == 0 {
        None
    } else {
        Some(spawn_background(
            limiter,
            in_flight,
            queue.into_iter().collect(),
            ctx,
        ))
    };

    let summary = DisclosureSummary {
        total,
        disclosed: disclosed.len(),
        background: background_len,
        cumulative_height,
        mode: Some(mode),
    };
    info!(
        "Batch {:?}: {} disclosed ({} failed), {} in background, cumulative height {}",
        mode,
        summary.disclosed,
        failed.len(),
        summary.background,
        cumulative_height
    );
    if let Some(ref cb) = config.progress_callback {
        cb.on_disclosed(summary.disclosed, total);
    }

    Ok(Dispatched {
        response: BatchResponse {
            result: "ok".to_string(),
            processed_images,
            message: disclosure_message(summary.disclosed),
            failed_images: if failed.is_empty() { None } else { Some(failed) },
            base_url: None,
            chapter: None,
            summary,
        },
        background,
    })
}

// ── Internal helpers ─────────────────────────────────────────────────────

/// A spawned task together with what is needed to report it if it panics.
struct InFlight {
    index: usize,
    image: ImageRef,
    handle: JoinHandle<ImageOutcome>,
}

impl InFlight {
    async fn spawn(
        limiter: &ConcurrencyLimiter,
        task: ImageTask,
        ctx: &TaskContext,
        want_metadata: bool,
    ) -> Self {
        let index = task.index();
        let image = task.image().clone();
        let ctx = ctx.clone();
        let handle = limiter
            .spawn(async move { task.run(&ctx, want_metadata).await })
            .await;
        Self {
            index,
            image,
            handle,
        }
    }

    async fn join(self) -> ImageOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => aborted_outcome(self.index, &self.image, e),
        }
    }
}

/// Run `tasks` through the limiter and collect their outcomes in order.
async fn run_wave(
    limiter: &ConcurrencyLimiter,
    tasks: Vec<ImageTask>,
    ctx: &TaskContext,
    want_metadata: bool,
) -> Vec<ImageOutcome> {
    let refs: Vec<(usize, ImageRef)> = tasks
        .iter()
        .map(|t| (t.index(), t.image().clone()))
        .collect();
    let futures = tasks.into_iter().map(|task| {
        let ctx = ctx.clone();
        async move { task.run(&ctx, want_metadata).await }
    });
    limiter
        .run_all(futures)
        .await
        .into_iter()
        .zip(refs)
        .map(|(result, (index, image))| {
            result.unwrap_or_else(|e| aborted_outcome(index, &image, e))
        })
        .collect()
}

/// Detach the remainder of the batch.
///
/// Each image already has its own failure boundary in [`ImageTask::run`];
/// this task only aggregates and logs.
fn spawn_background(
    limiter: ConcurrencyLimiter,
    in_flight: VecDeque<InFlight>,
    queued: Vec<ImageTask>,
    ctx: TaskContext,
) -> BackgroundWave {
    let len = in_flight.len() + queued.len();
    let handle = tokio::spawn(async move {
        let queued_wave = {
            let limiter = limiter.clone();
            let ctx = ctx.clone();
            async move { run_wave(&limiter, queued, &ctx, false).await }
        };
        let carried = futures::future::join_all(in_flight.into_iter().map(InFlight::join));
        let (mut outcomes, rest) = futures::join!(carried, queued_wave);
        outcomes.extend(rest);

        for outcome in &outcomes {
            if let TaskStatus::Failed(ref e) = outcome.status {
                warn!(
                    "Background image {} failed [{}]: {}",
                    outcome.filename,
                    e.kind(),
                    e
                );
            }
        }
        let report = WaveReport::from_outcomes(&outcomes);
        info!(
            "Background wave done: {} processed, {} skipped, {} failed",
            report.processed,
            report.skipped,
            report.failed.len()
        );
        if let Some(ref cb) = ctx.progress {
            cb.on_background_complete(&report);
        }
        report
    });
    BackgroundWave { handle, len }
}

fn aborted_outcome(index: usize, image: &ImageRef, err: JoinError) -> ImageOutcome {
    warn!("Task for {} was aborted: {}", image.filename, err);
    ImageOutcome {
        index,
        filename: image.filename.clone(),
        public_url: image.public_url.clone(),
        status: TaskStatus::Failed(ImageError::Aborted {
            filename: image.filename.clone(),
            detail: err.to_string(),
        }),
        metadata: None,
    }
}

/// Use the injected fetcher, or build the HTTP one from the config.
fn resolve_fetcher(config: &ProxyConfig) -> Result<Arc<dyn ImageFetcher>, ProxyError> {
    if let Some(ref fetcher) = config.fetcher {
        return Ok(Arc::clone(fetcher));
    }
    let fetcher = HttpFetcher::new(
        config.fetch_timeout(),
        config.max_image_bytes,
        &config.user_agent,
    )
    .map_err(|e| ProxyError::Internal(format!("HTTP client: {e}")))?;
    Ok(Arc::new(fetcher))
}

fn resolve_codec(config: &ProxyConfig) -> Arc<dyn ImageCodec> {
    match config.codec {
        Some(ref codec) => Arc::clone(codec),
        None => Arc::new(WebpCodec::default()),
    }
}

fn resolve_chapter_source(config: &ProxyConfig) -> Result<Arc<dyn ChapterSource>, ProxyError> {
    if let Some(ref source) = config.chapter_source {
        return Ok(Arc::clone(source));
    }
    let client = AtHomeClient::new(
        &config.api_base_url,
        config.fetch_timeout(),
        &config.user_agent,
    )?;
    Ok(Arc::new(client))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_batch_is_rejected() {
        let config = ProxyConfig::default();
        let err = process_batch(Vec::new(), &config).await.unwrap_err();
        assert!(matches!(err, ProxyError::EmptyBatch));

        let none: [&str; 0] = [];
        let err = process_urls(&none, &config).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn invalid_url_fails_the_whole_batch() {
        let config = ProxyConfig::default();
        let err = process_urls(&["https://h/a.png", "not a url"], &config)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn bad_chapter_id_never_reaches_the_network() {
        let config = ProxyConfig::builder()
            .api_base_url("http://127.0.0.1:1")
            .build()
            .unwrap();
        let err = process_chapter("../etc", &config).await.unwrap_err();
        assert!(matches!(err, ProxyError::InvalidChapterId(_)));
    }

    #[tokio::test]
    async fn background_wave_reports_join() {
        let wave = BackgroundWave {
            handle: tokio::spawn(async { WaveReport::default() }),
            len: 0,
        };
        assert!(wave.is_empty());
        assert_eq!(wave.join().await.unwrap(), WaveReport::default());
    }

    #[test]
    fn policy_constants() {
        assert_eq!(DISCLOSURE_HEIGHT, 3500);
        assert_eq!(PAGED_DISCLOSURE, 2);
    }
}
