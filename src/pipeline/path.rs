//! Path resolution: source URL → cache-relative path → public URL.
//!
//! Pure functions, no I/O. The relative path is the single key that ties the
//! three views of an image together: the on-disk artifact lives at
//! `<data_root>/<relative>` and the client fetches it from
//! `<site_origin>/data/<relative>` (each segment percent-encoded). Segments
//! are escaped rather than stripped: characters that are unsafe in a file
//! name become `%XX`, and `%` itself is escaped, so two different source
//! paths never share a cache path and no segment can climb out of the data
//! root. Segments that cannot be made safe this way (`.`, `..`, Windows
//! device names, over-long names) are rejected.

use crate::error::ProxyError;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use std::path::{Path, PathBuf};

/// Public URL prefix under which cached artifacts are served.
pub const PUBLIC_PREFIX: &str = "/data/";

/// Longest segment we keep, in bytes.
const MAX_SEGMENT_BYTES: usize = 255;

/// One source image and the places it will live once processed.
///
/// Immutable once constructed; cloned freely into spawned tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// URL the bytes are fetched from.
    pub source_url: String,
    /// Escaped last segment of the relative path.
    pub filename: String,
    /// Forward-slash separated, escaped path below the data root.
    pub relative_path: String,
    /// Where clients will find the artifact.
    pub public_url: String,
}

impl ImageRef {
    /// On-disk location of this image below `data_root`.
    ///
    /// Segments are pushed one by one so the host separator is used and no
    /// segment is ever interpreted as absolute.
    pub fn cache_path(&self, data_root: &Path) -> PathBuf {
        let mut path = data_root.to_path_buf();
        for segment in self.relative_path.split('/') {
            path.push(segment);
        }
        path
    }
}

/// Maps source URLs and chapter/filename pairs onto [`ImageRef`]s.
#[derive(Debug, Clone)]
pub struct PathResolver {
    site_origin: String,
}

impl PathResolver {
    /// `site_origin` is the externally visible origin, e.g. `https://cdn.example.org`.
    pub fn new(site_origin: impl Into<String>) -> Self {
        let site_origin = site_origin.into().trim_end_matches('/').to_string();
        Self { site_origin }
    }

    /// Resolve an explicit source URL.
    ///
    /// The scheme and host are dropped; the remaining path (leading slashes
    /// stripped) becomes the relative path. `https://h/a/b/c.png` resolves to
    /// `a/b/c.png`. Each segment is percent-decoded, then escaped with
    /// [`escape_segment`].
    pub fn resolve_url(&self, input: &str) -> Result<ImageRef, ProxyError> {
        let invalid = |reason: &str| ProxyError::InvalidUrl {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let url = Url::parse(input.trim()).map_err(|e| invalid(&e.to_string()))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(invalid("only http and https URLs are supported"));
        }

        // Empty segments are separators: `a//b.png` and `a/b.png` are the
        // same resource.
        let raw = url.path().trim_start_matches('/');
        let mut raw_segments: Vec<&str> = raw.split('/').collect();
        let raw_filename = raw_segments.pop().unwrap_or_default();
        if raw_filename.is_empty() {
            return Err(invalid("URL path has no file name"));
        }

        let mut segments = Vec::with_capacity(raw_segments.len() + 1);
        for raw_segment in raw_segments.into_iter().filter(|s| !s.is_empty()) {
            segments.push(url_segment(raw_segment).map_err(invalid)?);
        }
        let filename = url_segment(raw_filename).map_err(invalid)?;
        segments.push(filename.clone());

        Ok(self.build(url.to_string(), filename, segments.join("/")))
    }

    /// Resolve a chapter image served by an at-home node.
    ///
    /// Source is `<base_url>/data/<hash>/<filename>`; the relative path is
    /// `<hash>/<filename>`.
    pub fn resolve_chapter(
        &self,
        base_url: &str,
        chapter_hash: &str,
        filename: &str,
    ) -> Result<ImageRef, ProxyError> {
        let source_url = format!(
            "{}/data/{}/{}",
            base_url.trim_end_matches('/'),
            chapter_hash,
            filename
        );

        let invalid = |reason: &str| ProxyError::InvalidUrl {
            input: source_url.clone(),
            reason: reason.to_string(),
        };
        let hash = escape_segment(chapter_hash).map_err(invalid)?;
        let file = escape_segment(filename).map_err(invalid)?;

        let relative = format!("{hash}/{file}");
        Ok(self.build(source_url, file, relative))
    }

    /// Public URL for an already-escaped relative path.
    pub fn public_url(&self, relative_path: &str) -> String {
        let encoded: Vec<_> = relative_path.split('/').map(urlencoding::encode).collect();
        format!("{}{}{}", self.site_origin, PUBLIC_PREFIX, encoded.join("/"))
    }

    fn build(&self, source_url: String, filename: String, relative_path: String) -> ImageRef {
        ImageRef {
            source_url,
            filename,
            public_url: self.public_url(&relative_path),
            relative_path,
        }
    }
}

// ── Segment escaping ─────────────────────────────────────────────────────────

static RE_DOTS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\.+$").unwrap());
static RE_WINDOWS_RESERVED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(con|prn|aux|nul|com[0-9]|lpt[0-9])(\..*)?$").unwrap());
static RE_ILLEGAL: Lazy<Regex> = Lazy::new(|| Regex::new(r#"[/?<>\\:*|"]"#).unwrap());
static RE_CONTROL: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\x00-\x1f\x80-\x9f]").unwrap());
static RE_WINDOWS_TRAILING: Lazy<Regex> = Lazy::new(|| Regex::new(r"[. ]+$").unwrap());

/// Decode one percent-encoded URL path segment and escape it.
fn url_segment(raw: &str) -> Result<String, &'static str> {
    let decoded = urlencoding::decode(raw).map_err(|_| "URL path is not valid UTF-8")?;
    escape_segment(&decoded)
}

/// Make one path segment safe to join below the data root.
///
/// `%`, separators, reserved and control characters, and a trailing run of
/// dots or spaces are written as `%XX` per UTF-8 byte. Escaping is
/// reversible, so distinct inputs give distinct outputs. Empty segments,
/// `.`/`..`, Windows device names and results over 255 bytes are rejected.
pub fn escape_segment(segment: &str) -> Result<String, &'static str> {
    if segment.is_empty() {
        return Err("empty path segment");
    }
    if RE_DOTS.is_match(segment) {
        return Err("dot segments are not allowed");
    }
    if RE_WINDOWS_RESERVED.is_match(segment) {
        return Err("reserved device name");
    }

    let body_len = segment.trim_end_matches(['.', ' ']).len();
    let mut out = String::with_capacity(segment.len());
    for (i, c) in segment.char_indices() {
        if i >= body_len || needs_escape(c) {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                out.push_str(&format!("%{byte:02X}"));
            }
        } else {
            out.push(c);
        }
    }

    if out.len() > MAX_SEGMENT_BYTES {
        return Err("path segment is longer than 255 bytes");
    }
    Ok(out)
}

fn needs_escape(c: char) -> bool {
    c == '%' || c.is_control() || matches!(c, '/' | '?' | '<' | '>' | '\\' | ':' | '*' | '|' | '"')
}

/// Lossy sanitising for a client-requested relative path.
///
/// Only confines the lookup to the data root: separators, reserved and
/// control characters are removed, `.`/`..`, device names and empty segments
/// are dropped. Returns `None` when nothing is left.
pub fn sanitize_relative(raw: &str) -> Option<String> {
    let segments: Vec<String> = raw
        .split(['/', '\\'])
        .map(strip_segment)
        .filter(|s| !s.is_empty())
        .collect();
    if segments.is_empty() {
        None
    } else {
        Some(segments.join("/"))
    }
}

fn strip_segment(segment: &str) -> String {
    let s = RE_ILLEGAL.replace_all(segment, "");
    let s = RE_CONTROL.replace_all(&s, "");
    let s = RE_DOTS.replace(&s, "");
    let s = RE_WINDOWS_RESERVED.replace(&s, "");
    let s = RE_WINDOWS_TRAILING.replace(&s, "");
    truncate_bytes(&s, MAX_SEGMENT_BYTES).to_string()
}

fn truncate_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> PathResolver {
        PathResolver::new("https://proxy.example/")
    }

    #[test]
    fn url_path_becomes_relative_path() {
        let r = resolver()
            .resolve_url("https://img.host/covers/abc/001.jpg")
            .unwrap();
        assert_eq!(r.relative_path, "covers/abc/001.jpg");
        assert_eq!(r.filename, "001.jpg");
        assert_eq!(r.public_url, "https://proxy.example/data/covers/abc/001.jpg");
    }

    #[test]
    fn leading_slashes_are_stripped() {
        let r = resolver().resolve_url("https://img.host//x//y.png").unwrap();
        assert_eq!(r.relative_path, "x/y.png");
    }

    #[test]
    fn query_string_is_not_part_of_the_path() {
        let r = resolver().resolve_url("https://img.host/a/b.png?token=1").unwrap();
        assert_eq!(r.relative_path, "a/b.png");
        assert!(r.source_url.ends_with("?token=1"));
    }

    #[test]
    fn chapter_pair_maps_to_hash_folder() {
        let r = resolver()
            .resolve_chapter("https://node.at-home.net/", "deadbeef", "1-abc.png")
            .unwrap();
        assert_eq!(r.source_url, "https://node.at-home.net/data/deadbeef/1-abc.png");
        assert_eq!(r.relative_path, "deadbeef/1-abc.png");
        assert_eq!(r.public_url, "https://proxy.example/data/deadbeef/1-abc.png");
    }

    #[test]
    fn traversal_in_chapter_filename_is_neutralised() {
        assert!(resolver()
            .resolve_chapter("https://n.net", "..", "0.png")
            .is_err());

        let r = resolver()
            .resolve_chapter("https://n.net", "h", "../../etc/passwd")
            .unwrap();
        assert_eq!(r.relative_path, "h/..%2F..%2Fetc%2Fpasswd");
        assert_eq!(r.public_url, "https://proxy.example/data/h/..%252F..%252Fetc%252Fpasswd");
        let root = Path::new("/srv/data");
        assert!(r.cache_path(root).starts_with(root));
    }

    #[test]
    fn distinct_url_paths_never_share_a_cache_path() {
        let inputs = [
            "https://h/a/b.png",
            "https://h/a*/b.png",
            "https://h/a%252A/b.png",
            "https://h/a%2Fb.png",
            "https://h/a:/b.png",
            "https://h/a./b.png",
            "https://h/a%20/b.png",
        ];
        let paths: Vec<String> = inputs
            .iter()
            .map(|u| resolver().resolve_url(u).unwrap().relative_path)
            .collect();
        let unique: std::collections::HashSet<_> = paths.iter().collect();
        assert_eq!(unique.len(), inputs.len(), "{paths:?}");

        assert_eq!(paths[1], "a%2A/b.png");
        assert_eq!(paths[2], "a%252A/b.png");
        assert_eq!(paths[3], "a%2Fb.png");
    }

    #[test]
    fn percent_encoded_and_literal_spellings_agree() {
        let plain = resolver().resolve_url("https://h/my%20page.png").unwrap();
        assert_eq!(plain.relative_path, "my page.png");
        assert_eq!(plain.public_url, "https://proxy.example/data/my%20page.png");
    }

    #[test]
    fn unsafe_segments_are_rejected_not_dropped() {
        for input in ["https://h/a/CON/b.png", "https://h/a/lpt1.txt", "https://h/a/%FF.png"] {
            assert!(
                matches!(resolver().resolve_url(input), Err(ProxyError::InvalidUrl { .. })),
                "{input} accepted"
            );
        }
        let long = format!("https://h/{}.png", "x".repeat(300));
        assert!(resolver().resolve_url(&long).is_err());
    }

    #[test]
    fn directory_url_is_rejected() {
        assert!(matches!(
            resolver().resolve_url("https://img.host/dir/"),
            Err(ProxyError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn non_http_scheme_is_rejected() {
        assert!(resolver().resolve_url("file:///etc/passwd").is_err());
        assert!(resolver().resolve_url("not a url").is_err());
    }

    #[test]
    fn escape_segment_rules() {
        assert!(escape_segment("..").is_err());
        assert!(escape_segment(".").is_err());
        assert!(escape_segment("").is_err());
        assert!(escape_segment("CON").is_err());
        assert_eq!(escape_segment("a\\b").unwrap(), "a%5Cb");
        assert_eq!(escape_segment("page. ").unwrap(), "page%2E%20");
        assert_eq!(escape_segment("p\u{0007}age.png").unwrap(), "p%07age.png");
        assert_eq!(escape_segment("100%").unwrap(), "100%25");
        assert_eq!(escape_segment("ok-1.webp").unwrap(), "ok-1.webp");
        assert_eq!(escape_segment("page_001.jpg").unwrap(), "page_001.jpg");
    }

    #[test]
    fn sanitize_relative_drops_dot_segments() {
        assert_eq!(sanitize_relative("a/../b/./c.png").as_deref(), Some("a/b/c.png"));
        assert_eq!(sanitize_relative("..\\..\\x.png").as_deref(), Some("x.png"));
        assert_eq!(sanitize_relative("../.."), None);
    }
}
