//! Chapter resolution through the upstream at-home API.
//!
//! `GET {api}/at-home/server/{chapterId}` answers with the node that serves
//! the chapter (`baseUrl`), the chapter hash and its ordered page filenames.
//! A non-"ok" `result` is a client-visible error carrying the upstream
//! `errors` array verbatim.

use crate::error::ProxyError;
use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

/// Ordered page list of one chapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterManifest {
    /// Node the page files are fetched from.
    pub base_url: String,
    pub hash: String,
    /// Page filenames in reading order.
    pub filenames: Vec<String>,
}

/// Resolves a chapter id to its page list.
#[async_trait]
pub trait ChapterSource: Send + Sync {
    async fn resolve(&self, chapter_id: &str) -> Result<ChapterManifest, ProxyError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AtHomeResponse {
    result: String,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    chapter: Option<AtHomeChapter>,
    #[serde(default)]
    errors: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct AtHomeChapter {
    hash: String,
    #[serde(default)]
    data: Vec<String>,
}

/// reqwest-backed client for the at-home endpoint.
#[derive(Debug, Clone)]
pub struct AtHomeClient {
    client: reqwest::Client,
    api_base: Url,
}

impl AtHomeClient {
    pub fn new(api_base: &str, timeout: Duration, user_agent: &str) -> Result<Self, ProxyError> {
        let api_base = Url::parse(api_base)
            .map_err(|e| ProxyError::InvalidConfig(format!("api base URL '{api_base}': {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| ProxyError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self { client, api_base })
    }

    /// Endpoint URL for `chapter_id`, with the id percent-encoded as a
    /// single path segment.
    pub fn endpoint(&self, chapter_id: &str) -> Result<Url, ProxyError> {
        let mut url = self.api_base.clone();
        url.path_segments_mut()
            .map_err(|_| ProxyError::InvalidConfig("api base URL cannot be a base".into()))?
            .pop_if_empty()
            .extend(["at-home", "server", chapter_id]);
        Ok(url)
    }
}

#[async_trait]
impl ChapterSource for AtHomeClient {
    async fn resolve(&self, chapter_id: &str) -> Result<ChapterManifest, ProxyError> {
        validate_chapter_id(chapter_id)?;
        let url = self.endpoint(chapter_id)?;
        info!("Resolving chapter {} via {}", chapter_id, url);

        let unavailable = |reason: String| ProxyError::UpstreamUnavailable {
            url: url.to_string(),
            reason,
        };

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        let status = response.status();

        // Error documents come with 4xx statuses, so parse the body whatever
        // the status and let `result` decide.
        let body: AtHomeResponse = response
            .json()
            .await
            .map_err(|e| unavailable(format!("HTTP {status}: {e}")))?;
        debug!("Chapter API answered {} with result '{}'", status, body.result);

        into_manifest(chapter_id, body)
    }
}

fn into_manifest(chapter_id: &str, body: AtHomeResponse) -> Result<ChapterManifest, ProxyError> {
    if body.result != "ok" {
        return Err(ProxyError::UpstreamApi {
            chapter_id: chapter_id.to_string(),
            errors: body.errors,
        });
    }

    match (body.base_url, body.chapter) {
        (Some(base_url), Some(chapter)) => Ok(ChapterManifest {
            base_url,
            hash: chapter.hash,
            filenames: chapter.data,
        }),
        _ => Err(ProxyError::UpstreamApi {
            chapter_id: chapter_id.to_string(),
            errors: vec![serde_json::Value::String(
                "response is missing baseUrl or chapter".into(),
            )],
        }),
    }
}

/// Chapter ids are UUID-like tokens; anything else never reaches the network.
pub fn validate_chapter_id(chapter_id: &str) -> Result<(), ProxyError> {
    let ok = !chapter_id.is_empty()
        && chapter_id.len() <= 64
        && chapter_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(ProxyError::InvalidChapterId(chapter_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> AtHomeClient {
        AtHomeClient::new(base, Duration::from_secs(5), "test").unwrap()
    }

    #[test]
    fn endpoint_appends_segments() {
        let c = client("https://api.example.org");
        assert_eq!(
            c.endpoint("a1b2").unwrap().as_str(),
            "https://api.example.org/at-home/server/a1b2"
        );
        let c = client("https://api.example.org/v5/");
        assert_eq!(
            c.endpoint("a1b2").unwrap().as_str(),
            "https://api.example.org/v5/at-home/server/a1b2"
        );
    }

    #[test]
    fn chapter_id_validation() {
        assert!(validate_chapter_id("0b5b8a5c-5d3a-4f7a-9f2e-1c2d3e4f5a6b").is_ok());
        assert!(validate_chapter_id("").is_err());
        assert!(validate_chapter_id("../secret").is_err());
        assert!(validate_chapter_id("a b").is_err());
    }

    #[test]
    fn ok_body_becomes_manifest() {
        let body: AtHomeResponse = serde_json::from_value(serde_json::json!({
            "result": "ok",
            "baseUrl": "https://node.example",
            "chapter": { "hash": "h", "data": ["1.png", "2.png"], "dataSaver": [] }
        }))
        .unwrap();
        let m = into_manifest("c", body).unwrap();
        assert_eq!(m.base_url, "https://node.example");
        assert_eq!(m.filenames, vec!["1.png", "2.png"]);
    }

    #[test]
    fn error_body_keeps_upstream_errors() {
        let body: AtHomeResponse = serde_json::from_value(serde_json::json!({
            "result": "error",
            "errors": [{ "status": 404, "detail": "Chapter not found" }]
        }))
        .unwrap();
        match into_manifest("c", body) {
            Err(ProxyError::UpstreamApi { errors, .. }) => {
                assert_eq!(errors[0]["detail"], "Chapter not found");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
