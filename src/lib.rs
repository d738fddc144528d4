//! # panel-proxy
//!
//! Fetch, compact and cache remotely hosted comic and manga page images.
//!
//! ## Why this crate?
//!
//! Reader front-ends want page images from hosts that throttle hotlinking,
//! serve oversized files with wide white margins, and are slow. This crate
//! downloads each page once, trims and re-encodes regular pages to WebP,
//! stores the result under a stable path, and answers a batch request as
//! soon as the first screenful of pages is ready while the rest keeps
//! processing in the background.
//!
//! ## Pipeline Overview
//!
//! ```text
//! batch (URLs or chapter id)
//!  │
//!  ├─ 1. Resolve   source URL → cache path + public URL
//!  ├─ 2. Probe     already cached? skip
//!  ├─ 3. Fetch     GET with same-origin Referer
//!  ├─ 4. Classify  h/w > 1.6 → webtoon, else paged
//!  ├─ 5. Compact   paged: trim white (40) + WebP q75; webtoon: as is
//!  └─ 6. Persist   temp file + rename under the data root
//! ```
//!
//! Item 0 decides the batch mode. A webtoon batch answers once the pages
//! seen so far add up to 3500 px of height; a paged batch answers after two
//! pages. Everything else runs in a detached [`BackgroundWave`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use panel_proxy::{process_chapter, ProxyConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProxyConfig::builder()
//!         .data_root("./data")
//!         .site_origin("https://reader.example.org")
//!         .build()?;
//!     let dispatched = process_chapter("a1b2c3d4-0000-4000-8000-000000000000", &config).await?;
//!     println!("{}", serde_json::to_string_pretty(&dispatched.response)?);
//!     if let Some(wave) = dispatched.background {
//!         let report = wave.join().await?;
//!         eprintln!("{} more pages processed", report.processed);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `panel-proxy` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! panel-proxy = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod dispatch;
pub mod error;
pub mod limiter;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod upstream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ProxyConfig, ProxyConfigBuilder};
pub use dispatch::{
    process_batch, process_chapter, process_urls, BackgroundWave, Dispatched, DISCLOSURE_HEIGHT,
    PAGED_DISCLOSURE,
};
pub use error::{ImageError, ProxyError};
pub use limiter::ConcurrencyLimiter;
pub use output::{
    BatchMode, BatchResponse, ChapterData, DisclosureSummary, ImageMetadata, ImageOutcome,
    TaskStatus, WaveReport,
};
pub use pipeline::cache::{content_type_for, CacheStore, CACHE_CONTROL};
pub use pipeline::classify::{classify, Classification};
pub use pipeline::fetch::{HttpFetcher, ImageFetcher};
pub use pipeline::path::{ImageRef, PathResolver};
pub use pipeline::transform::{ImageCodec, WebpCodec};
pub use progress::{NoopProgressCallback, ProgressCallback, ProxyProgressCallback};
pub use upstream::{AtHomeClient, ChapterManifest, ChapterSource};
