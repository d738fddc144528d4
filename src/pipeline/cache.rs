//! The on-disk cache: existence probe, atomic persist, artifact lookup.
//!
//! There is no index. A readable file at `<root>/<relative>` *is* the cache
//! entry, so the only way to get a partially written entry would be to write
//! in place. We never do: artifacts go to a temp file in the target
//! directory and are renamed over the final path once complete. Two tasks
//! racing on the same image both produce complete files; the last rename wins.
//!
//! Next to each produced artifact we keep a small JSON record of the source
//! image's size and classification under [`METADATA_DIR`]. A trimmed page
//! no longer has its source's aspect ratio, so a warm cache needs the record
//! to classify item 0 the way a cold one did.

use crate::error::{ImageError, ProxyError};
use crate::output::ImageMetadata;
use crate::pipeline::classify::Classification;
use crate::pipeline::path::{sanitize_relative, ImageRef};
use image::ImageFormat;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Cache-control directive for served artifacts (one year).
pub const CACHE_CONTROL: &str = "public, max-age=31536000";

/// Directory below the root holding the per-artifact metadata records.
///
/// Escaped path segments only ever contain `%` followed by two uppercase
/// hex digits, so no resolved image can land in this tree.
pub const METADATA_DIR: &str = "%meta";

/// Backoff schedule used while waiting for an artifact to appear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub timeout: Duration,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(10_000),
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(800),
        }
    }
}

/// Handle to the cache directory tree.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
    wait: WaitPolicy,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>, wait: WaitPolicy) -> Self {
        Self {
            root: root.into(),
            wait,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where `image` lives on disk.
    pub fn path_for(&self, image: &ImageRef) -> PathBuf {
        image.cache_path(&self.root)
    }

    /// Whether a completed artifact exists for `image`.
    ///
    /// Any error (missing file, permission problem) reads as "not cached";
    /// the task then tries to produce the artifact and surfaces the real
    /// problem as a fetch or persist error.
    pub async fn exists(&self, image: &ImageRef) -> bool {
        match tokio::fs::metadata(self.path_for(image)).await {
            Ok(meta) => meta.is_file(),
            Err(_) => false,
        }
    }

    fn metadata_path(&self, image: &ImageRef) -> PathBuf {
        let mut path = image.cache_path(&self.root.join(METADATA_DIR)).into_os_string();
        path.push(".json");
        PathBuf::from(path)
    }

    /// Source size and classification of a cached artifact.
    ///
    /// Prefers the record written when the artifact was produced. Without
    /// one, the artifact header is read with the format sniffed from its
    /// content: a WebP body under a non-WebP name is a compacted page and
    /// counts as paged; anything else was stored verbatim and is classified
    /// by its own size.
    pub async fn cached_metadata(&self, image: &ImageRef) -> Option<ImageMetadata> {
        if let Ok(json) = tokio::fs::read(self.metadata_path(image)).await {
            match serde_json::from_slice(&json) {
                Ok(metadata) => return Some(metadata),
                Err(e) => debug!("Ignoring metadata record for '{}': {}", image.relative_path, e),
            }
        }

        let path = self.path_for(image);
        let result = tokio::task::spawn_blocking(move || sniff_artifact(&path)).await;
        match result {
            Ok(Ok(metadata)) => Some(metadata),
            Ok(Err(e)) => {
                debug!("Cannot read dimensions of cached '{}': {}", image.relative_path, e);
                None
            }
            Err(e) => {
                warn!("Dimension probe for '{}' panicked: {}", image.relative_path, e);
                None
            }
        }
    }

    /// Record the source metadata for `image`.
    ///
    /// Best effort: the artifact alone is the cache entry, and a missing
    /// record only makes [`CacheStore::cached_metadata`] fall back to the
    /// artifact header.
    pub async fn record_metadata(&self, image: &ImageRef, metadata: &ImageMetadata) {
        let result = match serde_json::to_vec(metadata) {
            Ok(json) => write_atomic(self.metadata_path(image), json).await,
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = result {
            warn!("Cannot record metadata for '{}': {}", image.relative_path, e);
        }
    }

    /// Write `bytes` as the artifact for `image`.
    ///
    /// Creates missing parent directories, writes a sibling temp file and
    /// renames it into place. On any error the temp file is removed and the
    /// final path is left untouched.
    pub async fn persist(&self, image: &ImageRef, bytes: Vec<u8>) -> Result<PathBuf, ImageError> {
        let target = self.path_for(image);
        write_atomic(target.clone(), bytes)
            .await
            .map_err(|detail| ImageError::Persist {
                path: target.clone(),
                detail,
            })?;
        debug!("Persisted {}", target.display());
        Ok(target)
    }

    /// Turn a client-supplied relative path into a confined on-disk path.
    ///
    /// Metadata records under [`METADATA_DIR`] are not served.
    pub fn resolve_served(&self, raw: &str) -> Result<PathBuf, ProxyError> {
        let relative = sanitize_relative(raw)
            .filter(|r| r.split('/').next() != Some(METADATA_DIR))
            .ok_or_else(|| ProxyError::InvalidPath {
                path: raw.to_string(),
            })?;
        let mut path = self.root.clone();
        for segment in relative.split('/') {
            path.push(segment);
        }
        if !path.starts_with(&self.root) {
            return Err(ProxyError::InvalidPath {
                path: raw.to_string(),
            });
        }
        Ok(path)
    }

    /// Wait for the artifact at `raw` to appear, polling with exponential
    /// backoff. Returns `Ok(None)` when the wait budget runs out.
    ///
    /// Background waves keep writing after the batch response went out, so
    /// a client may ask for an image a little before it exists.
    pub async fn wait_for_artifact(&self, raw: &str) -> Result<Option<PathBuf>, ProxyError> {
        let path = self.resolve_served(raw)?;
        let deadline = Instant::now() + self.wait.timeout;
        let mut interval = self.wait.initial_interval;

        loop {
            if tokio::fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false) {
                return Ok(Some(path));
            }
            let now = Instant::now();
            if now >= deadline {
                debug!("Gave up waiting for {}", path.display());
                return Ok(None);
            }
            sleep(interval.min(deadline - now)).await;
            interval = (interval * 2).min(self.wait.max_interval);
        }
    }
}

async fn write_atomic(target: PathBuf, bytes: Vec<u8>) -> Result<(), String> {
    let parent = target
        .parent()
        .ok_or_else(|| "target has no parent directory".to_string())?
        .to_path_buf();
    tokio::fs::create_dir_all(&parent)
        .await
        .map_err(|e| e.to_string())?;

    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let mut tmp = tempfile::Builder::new()
            .prefix(".partial-")
            .tempfile_in(&parent)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&target).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| format!("write task panicked: {e}"))?
    .map_err(|e| e.to_string())
}

fn sniff_artifact(path: &Path) -> image::ImageResult<ImageMetadata> {
    let reader = image::ImageReader::open(path)?.with_guessed_format()?;
    let compacted = reader.format() == Some(ImageFormat::WebP)
        && !path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("webp"));
    let (width, height) = reader.into_dimensions()?;
    if compacted {
        return Ok(ImageMetadata {
            width,
            height,
            classification: Classification::Paged,
        });
    }
    Ok(ImageMetadata::from_dimensions((width, height)))
}

/// MIME type for a served artifact, inferred from its extension.
///
/// Compacted pages keep their source file name, so a `.png` or `.jpg`
/// artifact may hold WebP bytes and be served under the source's type.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("avif") => "image/avif",
        Some("bmp") => "image/bmp",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::path::PathResolver;
    use tempfile::TempDir;

    fn image(rel_url: &str) -> ImageRef {
        PathResolver::new("https://p.example")
            .resolve_url(&format!("https://src.example/{rel_url}"))
            .unwrap()
    }

    fn quick_wait() -> WaitPolicy {
        WaitPolicy {
            timeout: Duration::from_millis(300),
            initial_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(40),
        }
    }

    #[tokio::test]
    async fn persist_then_exists() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::new(dir.path(), WaitPolicy::default());
        let img = image("a/b/c.png");

        assert!(!store.exists(&img).await);
        let path = store.persist(&img, b"payload".to_vec()).await.unwrap();
        assert!(store.exists(&img).await);
        assert_eq!(std::fs::read(&path).unwrap(), b"payload");
        assert_eq!(path, dir.path().join("a").join("b").join("c.png"));
    }

    #[tokio::test]
    async fn persist_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::new(dir.path(), WaitPolicy::default());
        let img = image("x/y.png");
        store.persist(&img, vec![1, 2, 3]).await.unwrap();
        store.persist(&img, vec![4, 5, 6]).await.unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path().join("x"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["y.png".to_string()]);
        // Last writer wins.
        assert_eq!(std::fs::read(dir.path().join("x/y.png")).unwrap(), vec![4, 5, 6]);
    }

    #[tokio::test]
    async fn persist_failure_reports_target_path() {
        let dir = TempDir::new().unwrap();
        // A regular file where the parent directory should be.
        std::fs::write(dir.path().join("blocked"), b"").unwrap();
        let store = CacheStore::new(dir.path(), WaitPolicy::default());
        let img = image("blocked/page.png");

        let err = store.persist(&img, vec![0]).await.unwrap_err();
        assert_eq!(err.kind(), "persist");
        assert!(!store.exists(&img).await);
    }

    #[test]
    fn served_paths_stay_under_root() {
        let store = CacheStore::new("/srv/data", WaitPolicy::default());
        let p = store.resolve_served("../../etc/passwd").unwrap();
        assert!(p.starts_with("/srv/data"));
        assert_eq!(p, Path::new("/srv/data/etc/passwd"));
        assert!(store.resolve_served("../..").is_err());
        assert!(store.resolve_served("").is_err());
        assert!(store.resolve_served("%meta/a/b.png.json").is_err());
    }

    #[tokio::test]
    async fn wait_finds_file_written_later() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::new(dir.path(), quick_wait());
        let img = image("late/page.png");

        let writer = store.clone();
        let img2 = img.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            writer.persist(&img2, vec![9]).await.unwrap();
        });

        let found = store.wait_for_artifact("late/page.png").await.unwrap();
        assert_eq!(found, Some(store.path_for(&img)));
    }

    #[tokio::test]
    async fn wait_times_out_with_none() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::new(dir.path(), quick_wait());
        let started = std::time::Instant::now();
        let found = store.wait_for_artifact("never/there.png").await.unwrap();
        assert!(found.is_none());
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn recorded_metadata_wins_over_the_artifact_header() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::new(dir.path(), WaitPolicy::default());
        let img = image("r/page.png");
        store.persist(&img, b"not an image".to_vec()).await.unwrap();
        assert_eq!(store.cached_metadata(&img).await, None);

        let recorded = ImageMetadata::from_dimensions((1000, 1500));
        store.record_metadata(&img, &recorded).await;
        assert_eq!(store.cached_metadata(&img).await, Some(recorded));
        assert!(dir.path().join(METADATA_DIR).join("r/page.png.json").is_file());
        // The record never shows up among the artifacts themselves.
        let names: Vec<_> = std::fs::read_dir(dir.path().join("r"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["page.png".to_string()]);
    }

    #[test]
    fn content_types() {
        assert_eq!(content_type_for(Path::new("a/b.JPG")), "image/jpeg");
        assert_eq!(content_type_for(Path::new("a/b.webp")), "image/webp");
        assert_eq!(content_type_for(Path::new("a/b")), "application/octet-stream");
    }
}
