//! Source fetching: download the raw bytes of one image.
//!
//! Image hosts commonly reject requests without a same-origin `Referer`
//! (hotlink protection), so every request carries `Referer: <origin>/` of the
//! URL being fetched. The body is buffered in full before it is handed to the
//! transformer; a body larger than the configured cap is treated as a fetch
//! failure rather than risking unbounded memory on a misbehaving host.

use crate::error::ImageError;
use crate::pipeline::path::ImageRef;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::header::REFERER;
use reqwest::Url;
use std::time::Duration;
use tracing::debug;

/// Retrieves the raw bytes of a source image.
///
/// The default implementation is [`HttpFetcher`]; tests and embedders can
/// inject their own through [`crate::config::ProxyConfigBuilder::fetcher`].
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, image: &ImageRef) -> Result<Bytes, ImageError>;
}

/// reqwest-backed fetcher.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    max_bytes: usize,
}

impl HttpFetcher {
    /// Build a fetcher with a per-request timeout and a body-size cap.
    pub fn new(timeout: Duration, max_bytes: usize, user_agent: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;
        Ok(Self { client, max_bytes })
    }

    /// Wrap an existing client (shared connection pool).
    pub fn with_client(client: reqwest::Client, max_bytes: usize) -> Self {
        Self { client, max_bytes }
    }
}

#[async_trait]
impl ImageFetcher for HttpFetcher {
    async fn fetch(&self, image: &ImageRef) -> Result<Bytes, ImageError> {
        let fail = |reason: String| ImageError::Fetch {
            url: image.source_url.clone(),
            reason,
        };

        let url = Url::parse(&image.source_url).map_err(|e| fail(e.to_string()))?;
        let referer = referer_for(&url);

        let response = self
            .client
            .get(url)
            .header(REFERER, &referer)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    fail("request timed out".into())
                } else {
                    fail(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(fail(format!("HTTP {}", response.status())));
        }

        if let Some(len) = response.content_length() {
            if len > self.max_bytes as u64 {
                return Err(fail(format!(
                    "body of {len} bytes exceeds the {} byte limit",
                    self.max_bytes
                )));
            }
        }

        let mut body = BytesMut::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| fail(e.to_string()))?;
            if body.len() + chunk.len() > self.max_bytes {
                return Err(fail(format!(
                    "body exceeds the {} byte limit",
                    self.max_bytes
                )));
            }
            body.extend_from_slice(&chunk);
        }

        debug!("Fetched {} ({} bytes)", image.source_url, body.len());
        Ok(body.freeze())
    }
}

/// `Referer` value for a URL: its own origin followed by `/`.
pub fn referer_for(url: &Url) -> String {
    format!("{}/", url.origin().ascii_serialization())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn referer_is_origin_with_slash() {
        let url = Url::parse("https://uploads.example.org/data/abc/1.png").unwrap();
        assert_eq!(referer_for(&url), "https://uploads.example.org/");

        let url = Url::parse("http://127.0.0.1:8080/x/y.jpg?z=1").unwrap();
        assert_eq!(referer_for(&url), "http://127.0.0.1:8080/");
    }
}
