use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider rate limited the request: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },
    #[error("provider rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    /// Auth, config and bad-request failures will not improve on retry.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ProviderError::Rejected { .. })
    }
}

#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn complete(
        &self,
        prompt: &str,
        model: &str,
        max_output_tokens: u32,
    ) -> Result<String, ProviderError>;

    /// Cheapest possible round-trip used as a pre-flight check.
    async fn ping(&self) -> Result<(), ProviderError>;
}

/// Rough token estimate used for budgeting (about four characters per token).
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Per-million-token pricing for the configured model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostModel {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl CostModel {
    pub fn from_config(cfg: &config::Inference) -> Self {
        Self {
            input_per_mtok: cfg.input_cost_per_mtok,
            output_per_mtok: cfg.output_cost_per_mtok,
        }
    }

    /// Worst-case cost of one call: full prompt plus the whole output allowance.
    pub fn estimate(&self, input_tokens: u64, max_output_tokens: u32) -> f64 {
        (input_tokens as f64 * self.input_per_mtok
            + max_output_tokens as f64 * self.output_per_mtok)
            / 1_000_000.0
    }
}

#[derive(Clone)]
pub struct HttpInferenceClient {
    http: Client,
    base_url: Url,
    api_key: String,
    api_version: String,
}

impl fmt::Debug for HttpInferenceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpInferenceClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpInferenceClient {
    pub fn new(base_url: Url, api_key: String, api_version: String) -> Result<Self> {
        let http = Client::builder()
            .user_agent("content-enricher/0.1")
            .timeout(Duration::from_secs(300))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            api_key,
            api_version,
        })
    }

    pub fn from_config(cfg: &config::Inference) -> Result<Self> {
        let base_url = Url::parse(&cfg.endpoint)
            .with_context(|| format!("invalid inference endpoint {}", cfg.endpoint))?;
        Self::new(base_url, cfg.api_key.clone(), cfg.api_version.clone())
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .context("invalid inference base URL")
    }

    pub fn build_complete_request(
        &self,
        prompt: &str,
        model: &str,
        max_output_tokens: u32,
    ) -> Result<reqwest::Request> {
        let body = json!({
            "model": model,
            "max_tokens": max_output_tokens,
            "messages": [{ "role": "user", "content": prompt }],
        });
        self.http
            .post(self.endpoint("v1/messages")?)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.api_version)
            .header("Content-Type", "application/json")
            .json(&body)
            .build()
            .context("failed to build inference request")
    }

    pub fn build_ping_request(&self) -> Result<reqwest::Request> {
        self.http
            .get(self.endpoint("v1/models")?)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.api_version)
            .build()
            .context("failed to build health request")
    }

    async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response, ProviderError> {
        debug!(url=%request.url(), "sending inference request");
        let res = self
            .http
            .execute(request)
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;

        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }
        let retry_after = parse_retry_after(res.headers().get(reqwest::header::RETRY_AFTER));
        let body = res.text().await.unwrap_or_default();
        Err(classify_status(status, retry_after, body))
    }
}

/// Map a non-success HTTP status onto the failure taxonomy.
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: String) -> ProviderError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited {
            retry_after,
            message: body,
        },
        StatusCode::BAD_REQUEST
        | StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN
        | StatusCode::NOT_FOUND
        | StatusCode::UNPROCESSABLE_ENTITY => ProviderError::Rejected {
            status: status.as_u16(),
            message: body,
        },
        _ => ProviderError::Unavailable(format!("{}: {}", status, body)),
    }
}

fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    let secs: u64 = value?.to_str().ok()?.trim().parse().ok()?;
    Some(Duration::from_secs(secs))
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// Concatenate the text blocks of a messages-style response.
pub fn response_text(payload: &Value) -> Option<String> {
    let parsed: MessagesResponse = serde_json::from_value(payload.clone()).ok()?;
    let text: String = parsed
        .content
        .into_iter()
        .filter(|b| b.kind == "text")
        .filter_map(|b| b.text)
        .collect::<Vec<_>>()
        .join("");
    Some(text)
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn complete(
        &self,
        prompt: &str,
        model: &str,
        max_output_tokens: u32,
    ) -> Result<String, ProviderError> {
        let request = self
            .build_complete_request(prompt, model, max_output_tokens)
            .map_err(|e| ProviderError::Rejected {
                status: 0,
                message: e.to_string(),
            })?;
        let res = self.execute(request).await?;
        let payload: Value = res
            .json()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("invalid response body: {e}")))?;
        response_text(&payload)
            .ok_or_else(|| ProviderError::Unavailable("response has no content blocks".to_string()))
    }

    async fn ping(&self) -> Result<(), ProviderError> {
        let request = self.build_ping_request().map_err(|e| ProviderError::Rejected {
            status: 0,
            message: e.to_string(),
        })?;
        self.execute(request).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> HttpInferenceClient {
        HttpInferenceClient::new(
            Url::parse("https://inference.test/").unwrap(),
            "secret".into(),
            "2023-06-01".into(),
        )
        .unwrap()
    }

    #[test]
    fn complete_request_sets_headers_and_body() {
        let req = client().build_complete_request("hi", "model-a", 256).unwrap();
        assert_eq!(req.method(), reqwest::Method::POST);
        assert_eq!(req.url().as_str(), "https://inference.test/v1/messages");
        assert_eq!(req.headers().get("x-api-key").unwrap(), "secret");
        assert_eq!(req.headers().get("anthropic-version").unwrap(), "2023-06-01");
        let body: Value =
            serde_json::from_slice(req.body().unwrap().as_bytes().unwrap()).unwrap();
        assert_eq!(body["model"], "model-a");
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["messages"][0]["content"], "hi");
    }

    #[test]
    fn ping_hits_models_endpoint() {
        let req = client().build_ping_request().unwrap();
        assert_eq!(req.method(), reqwest::Method::GET);
        assert_eq!(req.url().path(), "/v1/models");
    }

    #[test]
    fn status_classification() {
        let err = classify_status(
            StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(30)),
            "slow down".into(),
        );
        assert_eq!(
            err,
            ProviderError::RateLimited {
                retry_after: Some(Duration::from_secs(30)),
                message: "slow down".into(),
            }
        );
        assert!(!err.is_permanent());

        assert!(classify_status(StatusCode::UNAUTHORIZED, None, String::new()).is_permanent());
        let err = classify_status(StatusCode::BAD_GATEWAY, None, String::new());
        assert!(matches!(err, ProviderError::Unavailable(_)));
    }

    #[test]
    fn response_text_joins_text_blocks() {
        let payload = json!({
            "content": [
                { "type": "text", "text": "{\"a\":" },
                { "type": "tool_use", "id": "x" },
                { "type": "text", "text": "1}" }
            ]
        });
        assert_eq!(response_text(&payload).as_deref(), Some("{\"a\":1}"));
    }

    #[test]
    fn cost_and_token_estimates() {
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens("abcdefghi"), 3);
        let cost = CostModel {
            input_per_mtok: 3.0,
            output_per_mtok: 15.0,
        };
        let usd = cost.estimate(1_000_000, 1_000);
        assert!((usd - 3.015).abs() < 1e-9);
    }
}
