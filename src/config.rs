//! Configuration types for the image pipeline.
//!
//! All tunable behaviour is controlled through [`ProxyConfig`], built via its
//! [`ProxyConfigBuilder`]. The classification, disclosure and encoding policy
//! values are deliberately *not* here: they are constants in the modules
//! that apply them, so two deployments never disagree about what a webtoon
//! is or how many pages a reader waits for.

use crate::error::ProxyError;
use crate::pipeline::cache::{CacheStore, WaitPolicy};
use crate::pipeline::fetch::ImageFetcher;
use crate::pipeline::transform::ImageCodec;
use crate::progress::ProgressCallback;
use crate::upstream::ChapterSource;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for the limiter width.
pub const MAX_CONCURRENCY: usize = 64;

/// Configuration for the proxy pipeline.
///
/// Built via [`ProxyConfig::builder()`] or using [`ProxyConfig::default()`].
///
/// # Example
/// ```rust
/// use panel_proxy::ProxyConfig;
///
/// let config = ProxyConfig::builder()
///     .data_root("/var/cache/panels")
///     .site_origin("https://panels.example.org")
///     .concurrency(3)
///     .build()
///     .unwrap();
/// assert_eq!(config.concurrency, 3);
/// ```
#[derive(Clone)]
pub struct ProxyConfig {
    /// Root directory of the artifact cache. Default: `./data`.
    pub data_root: PathBuf,

    /// Externally visible origin used to build public URLs. Default:
    /// `http://localhost:3000`. Stored without a trailing slash.
    pub site_origin: String,

    /// Origin of the chapter API. Default: `https://api.mangadex.org`.
    pub api_base_url: String,

    /// Limiter width K: images in flight per batch. Default: 5.
    ///
    /// Each batch gets its own limiter, so the process-wide worst case is
    /// K × concurrent batches. Image hosts throttle aggressive clients;
    /// 3–5 keeps a chapter moving without tripping rate limits.
    pub concurrency: usize,

    /// Per-request timeout for image and chapter fetches. Default: 30 s.
    pub fetch_timeout_secs: u64,

    /// Largest accepted image body in bytes. Default: 64 MiB.
    pub max_image_bytes: usize,

    /// How long a served-artifact lookup waits for a file. Default: 10 000 ms.
    pub artifact_wait_timeout_ms: u64,

    /// First poll interval of the artifact wait. Default: 100 ms.
    pub artifact_poll_initial_ms: u64,

    /// Poll interval ceiling of the artifact wait. Default: 800 ms.
    pub artifact_poll_max_ms: u64,

    /// `User-Agent` sent upstream.
    pub user_agent: String,

    /// Pre-constructed image fetcher. Takes precedence over the HTTP default.
    pub fetcher: Option<Arc<dyn ImageFetcher>>,

    /// Pre-constructed codec. Takes precedence over the WebP default.
    pub codec: Option<Arc<dyn ImageCodec>>,

    /// Pre-constructed chapter source. Takes precedence over the at-home client.
    pub chapter_source: Option<Arc<dyn ChapterSource>>,

    /// Receives per-image events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data"),
            site_origin: "http://localhost:3000".to_string(),
            api_base_url: "https://api.mangadex.org".to_string(),
            concurrency: 5,
            fetch_timeout_secs: 30,
            max_image_bytes: 64 * 1024 * 1024,
            artifact_wait_timeout_ms: 10_000,
            artifact_poll_initial_ms: 100,
            artifact_poll_max_ms: 800,
            user_agent: concat!("panel-proxy/", env!("CARGO_PKG_VERSION")).to_string(),
            fetcher: None,
            codec: None,
            chapter_source: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("data_root", &self.data_root)
            .field("site_origin", &self.site_origin)
            .field("api_base_url", &self.api_base_url)
            .field("concurrency", &self.concurrency)
            .field("fetch_timeout_secs", &self.fetch_timeout_secs)
            .field("max_image_bytes", &self.max_image_bytes)
            .field("artifact_wait_timeout_ms", &self.artifact_wait_timeout_ms)
            .field("fetcher", &self.fetcher.as_ref().map(|_| "<dyn ImageFetcher>"))
            .field("codec", &self.codec.as_ref().map(|_| "<dyn ImageCodec>"))
            .field(
                "chapter_source",
                &self.chapter_source.as_ref().map(|_| "<dyn ChapterSource>"),
            )
            .finish()
    }
}

impl ProxyConfig {
    /// Create a new builder for `ProxyConfig`.
    pub fn builder() -> ProxyConfigBuilder {
        ProxyConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy {
            timeout: Duration::from_millis(self.artifact_wait_timeout_ms),
            initial_interval: Duration::from_millis(self.artifact_poll_initial_ms),
            max_interval: Duration::from_millis(self.artifact_poll_max_ms),
        }
    }

    /// Artifact cache rooted at `data_root`.
    pub fn cache_store(&self) -> CacheStore {
        CacheStore::new(self.data_root.clone(), self.wait_policy())
    }
}

/// Builder for [`ProxyConfig`].
pub struct ProxyConfigBuilder {
    config: ProxyConfig,
}

impl fmt::Debug for ProxyConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl ProxyConfigBuilder {
    pub fn data_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.data_root = root.into();
        self
    }

    pub fn site_origin(mut self, origin: impl Into<String>) -> Self {
        self.config.site_origin = origin.into().trim_end_matches('/').to_string();
        self
    }

    pub fn api_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.api_base_url = url.into();
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.clamp(1, MAX_CONCURRENCY);
        self
    }

    pub fn fetch_timeout_secs(mut self, secs: u64) -> Self {
        self.config.fetch_timeout_secs = secs.max(1);
        self
    }

    pub fn max_image_bytes(mut self, n: usize) -> Self {
        self.config.max_image_bytes = n;
        self
    }

    pub fn artifact_wait_timeout_ms(mut self, ms: u64) -> Self {
        self.config.artifact_wait_timeout_ms = ms;
        self
    }

    pub fn artifact_poll_ms(mut self, initial: u64, max: u64) -> Self {
        self.config.artifact_poll_initial_ms = initial.max(1);
        self.config.artifact_poll_max_ms = max.max(initial.max(1));
        self
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.config.user_agent = ua.into();
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn ImageFetcher>) -> Self {
        self.config.fetcher = Some(fetcher);
        self
    }

    pub fn codec(mut self, codec: Arc<dyn ImageCodec>) -> Self {
        self.config.codec = Some(codec);
        self
    }

    pub fn chapter_source(mut self, source: Arc<dyn ChapterSource>) -> Self {
        self.config.chapter_source = Some(source);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ProxyConfig, ProxyError> {
        let c = &self.config;
        if c.concurrency == 0 || c.concurrency > MAX_CONCURRENCY {
            return Err(ProxyError::InvalidConfig(format!(
                "Concurrency must be 1–{MAX_CONCURRENCY}, got {}",
                c.concurrency
            )));
        }
        if !(c.site_origin.starts_with("http://") || c.site_origin.starts_with("https://")) {
            return Err(ProxyError::InvalidConfig(format!(
                "Site origin must be an http(s) URL, got '{}'",
                c.site_origin
            )));
        }
        if c.max_image_bytes == 0 {
            return Err(ProxyError::InvalidConfig(
                "max_image_bytes must be > 0".into(),
            ));
        }
        if c.data_root.as_os_str().is_empty() {
            return Err(ProxyError::InvalidConfig("data_root must not be empty".into()));
        }
        Ok(self.config)
    }
}
