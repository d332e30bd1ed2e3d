//! Remote source fetching.
//!
//! The scheduler only reaches this stage on a true source-cache miss. A
//! record may carry several URLs (mirror hosts, alternate scans); they are
//! tried in order and the first successful body wins. Transport timeouts
//! surface as an ordinary [`ImageError::Fetch`]; nothing here retries.

use crate::card::ImageId;
use crate::error::ImageError;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Obtains raw source bytes for a URL.
///
/// Implemented over HTTP by [`HttpFetcher`]; tests substitute scripted
/// fetchers.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, String>;
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// `reqwest`-backed fetcher with a per-request timeout.
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout_secs: u64,
}

impl HttpFetcher {
    pub fn new(timeout_secs: u64) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            client,
            timeout_secs,
        })
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, String> {
        if !is_url(url) {
            return Err(format!("'{url}' is not an HTTP/HTTPS URL"));
        }
        info!("Downloading source from: {}", url);

        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                format!("timed out after {}s", self.timeout_secs)
            } else {
                e.to_string()
            }
        })?;

        if !response.status().is_success() {
            return Err(format!("HTTP {}", response.status()));
        }

        let bytes = response.bytes().await.map_err(|e| e.to_string())?;
        debug!("Downloaded {} bytes from {}", bytes.len(), url);
        Ok(bytes.to_vec())
    }
}

/// Try each URL in order and return the first non-empty body.
pub async fn fetch_first(
    fetcher: &dyn SourceFetcher,
    id: &ImageId,
    urls: &[String],
) -> Result<Vec<u8>, ImageError> {
    if urls.is_empty() {
        return Err(ImageError::Fetch {
            id: id.clone(),
            detail: "no cached source and no URL to fetch from".into(),
        });
    }

    let mut last_err = String::new();
    for url in urls {
        match fetcher.fetch(url).await {
            Ok(bytes) if !bytes.is_empty() => return Ok(bytes),
            Ok(_) => {
                warn!("Image {}: {} returned an empty body", id, url);
                last_err = format!("{url}: empty body");
            }
            Err(e) => {
                warn!("Image {}: fetch from {} failed: {}", id, url, e);
                last_err = format!("{url}: {e}");
            }
        }
    }

    Err(ImageError::Fetch {
        id: id.clone(),
        detail: last_err,
    })
}
