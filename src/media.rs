use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// External media/vision analysis used to derive text from video and images.
#[async_trait]
pub trait MediaAnalyzer: Send + Sync {
    async fn summarize_video(&self, media_ref: &str, max_duration_seconds: u32) -> Result<String>;

    async fn summarize_image(&self, image_ref: &str) -> Result<String>;
}

/// Used when no media endpoint is configured; every request fails, so the
/// resolver simply omits the derived sources.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMediaAnalyzer;

#[async_trait]
impl MediaAnalyzer for NoMediaAnalyzer {
    async fn summarize_video(&self, _media_ref: &str, _max_duration_seconds: u32) -> Result<String> {
        Err(anyhow!("media analysis is not configured"))
    }

    async fn summarize_image(&self, _image_ref: &str) -> Result<String> {
        Err(anyhow!("media analysis is not configured"))
    }
}

#[derive(Clone)]
pub struct HttpMediaAnalyzer {
    http: Client,
    base_url: Url,
}

impl fmt::Debug for HttpMediaAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpMediaAnalyzer")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct SummaryResponse {
    summary: String,
}

impl HttpMediaAnalyzer {
    pub fn new(base_url: Url) -> Result<Self> {
        let http = Client::builder()
            .user_agent("content-enricher/0.1")
            .timeout(Duration::from_secs(180))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http, base_url })
    }

    pub fn from_endpoint(endpoint: &str) -> Result<Self> {
        let base_url =
            Url::parse(endpoint).with_context(|| format!("invalid media endpoint {}", endpoint))?;
        Self::new(base_url)
    }

    async fn post_summary(&self, path: &str, body: serde_json::Value) -> Result<String> {
        let url = self.base_url.join(path).context("invalid media base URL")?;
        debug!(url=%url, "requesting media summary");
        let res = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .context("failed to reach media service")?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("media service error {}: {}", status, body));
        }
        let payload: SummaryResponse = res.json().await.context("invalid media response")?;
        let summary = payload.summary.trim().to_string();
        if summary.is_empty() {
            return Err(anyhow!("media service returned an empty summary"));
        }
        Ok(summary)
    }
}

#[async_trait]
impl MediaAnalyzer for HttpMediaAnalyzer {
    async fn summarize_video(&self, media_ref: &str, max_duration_seconds: u32) -> Result<String> {
        self.post_summary(
            "v1/summarize/video",
            json!({ "url": media_ref, "max_duration_seconds": max_duration_seconds }),
        )
        .await
    }

    async fn summarize_image(&self, image_ref: &str) -> Result<String> {
        self.post_summary("v1/summarize/image", json!({ "url": image_ref }))
            .await
    }
}
