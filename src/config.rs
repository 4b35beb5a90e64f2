//! Configuration loader and validator for the enrichment run.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Upper bound on in-flight items when batching is enabled.
pub const MAX_CONCURRENCY: usize = 20;

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub inference: Inference,
    pub budget: Budget,
    pub retry: Retry,
    #[serde(default)]
    pub media: Media,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub target_item_count: u64,
    #[serde(default = "default_inter_item_delay_ms")]
    pub inter_item_delay_ms: u64,
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

/// Inference provider settings and pricing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Inference {
    pub endpoint: String,
    pub api_key: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    pub model: String,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    pub input_cost_per_mtok: f64,
    pub output_cost_per_mtok: f64,
    #[serde(default = "default_health_timeout_seconds")]
    pub health_timeout_seconds: u64,
}

/// Throughput window and spend ceiling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Budget {
    #[serde(default = "default_requests_per_window")]
    pub requests_per_window: u32,
    pub tokens_per_window: u64,
    #[serde(default = "default_window_length_seconds")]
    pub window_length_seconds: u64,
    pub cost_ceiling_usd: f64,
}

/// Retry policy for a single inference call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Retry {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_seconds")]
    pub retry_delay_seconds: u64,
    #[serde(default = "default_rate_limit_retry_delay_seconds")]
    pub rate_limit_retry_delay_seconds: u64,
}

/// Optional media/vision analysis service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Media {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_max_video_seconds")]
    pub max_video_seconds: u32,
}

impl Default for Media {
    fn default() -> Self {
        Self {
            endpoint: None,
            max_video_seconds: default_max_video_seconds(),
        }
    }
}

fn default_inter_item_delay_ms() -> u64 {
    1500
}
fn default_checkpoint_every() -> u64 {
    10
}
fn default_page_size() -> u32 {
    50
}
fn default_concurrency() -> usize {
    1
}
fn default_api_version() -> String {
    "2023-06-01".to_string()
}
fn default_max_output_tokens() -> u32 {
    1024
}
fn default_health_timeout_seconds() -> u64 {
    15
}
fn default_requests_per_window() -> u32 {
    40
}
fn default_window_length_seconds() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_seconds() -> u64 {
    5
}
fn default_rate_limit_retry_delay_seconds() -> u64 {
    65
}
fn default_max_video_seconds() -> u32 {
    30
}

impl App {
    /// `data_dir` with a leading `~/` expanded against `$HOME`.
    pub fn resolved_data_dir(&self) -> String {
        if let Some(rest) = self.data_dir.strip_prefix("~/") {
            if let Ok(home) = std::env::var("HOME") {
                return format!("{}/{}", home.trim_end_matches('/'), rest);
            }
        }
        self.data_dir.clone()
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.target_item_count == 0 {
        return Err(ConfigError::Invalid("app.target_item_count must be > 0"));
    }
    if cfg.app.checkpoint_every == 0 {
        return Err(ConfigError::Invalid("app.checkpoint_every must be > 0"));
    }
    if cfg.app.page_size == 0 {
        return Err(ConfigError::Invalid("app.page_size must be > 0"));
    }
    if cfg.app.concurrency == 0 || cfg.app.concurrency > MAX_CONCURRENCY {
        return Err(ConfigError::Invalid("app.concurrency must be between 1 and 20"));
    }

    if cfg.inference.endpoint.trim().is_empty() {
        return Err(ConfigError::Invalid("inference.endpoint must be non-empty"));
    }
    if cfg.inference.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("inference.api_key must be non-empty"));
    }
    if cfg.inference.model.trim().is_empty() {
        return Err(ConfigError::Invalid("inference.model must be non-empty"));
    }
    if cfg.inference.max_output_tokens == 0 {
        return Err(ConfigError::Invalid("inference.max_output_tokens must be > 0"));
    }
    if cfg.inference.input_cost_per_mtok < 0.0 || cfg.inference.output_cost_per_mtok < 0.0 {
        return Err(ConfigError::Invalid("inference cost rates must be >= 0"));
    }

    if cfg.budget.requests_per_window == 0 {
        return Err(ConfigError::Invalid("budget.requests_per_window must be > 0"));
    }
    if cfg.budget.tokens_per_window == 0 {
        return Err(ConfigError::Invalid("budget.tokens_per_window must be > 0"));
    }
    if cfg.budget.window_length_seconds == 0 {
        return Err(ConfigError::Invalid("budget.window_length_seconds must be > 0"));
    }
    if !(cfg.budget.cost_ceiling_usd > 0.0) {
        return Err(ConfigError::Invalid("budget.cost_ceiling_usd must be > 0"));
    }

    if cfg.retry.max_retries == 0 {
        return Err(ConfigError::Invalid("retry.max_retries must be >= 1"));
    }

    if let Some(endpoint) = &cfg.media.endpoint {
        if endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid("media.endpoint must be non-empty when set"));
        }
    }

    Ok(())
}

/// Returns a complete example YAML configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  target_item_count: 500
  inter_item_delay_ms: 1500
  checkpoint_every: 10
  page_size: 50
  concurrency: 1

inference:
  endpoint: "https://api.example.com/"
  api_key: "YOUR_INFERENCE_API_KEY"
  api_version: "2023-06-01"
  model: "YOUR_MODEL_ID"
  max_output_tokens: 1024
  input_cost_per_mtok: 3.0
  output_cost_per_mtok: 15.0
  health_timeout_seconds: 15

budget:
  requests_per_window: 40
  tokens_per_window: 400000
  window_length_seconds: 60
  cost_ceiling_usd: 10.0

retry:
  max_retries: 3
  retry_delay_seconds: 5
  rate_limit_retry_delay_seconds: 65

media:
  endpoint: "http://localhost:8085/"
  max_video_seconds: 30
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn example_cfg() -> Config {
        serde_yaml::from_str(example()).unwrap()
    }

    #[test]
    fn parse_example_ok() {
        let cfg = example_cfg();
        validate(&cfg).unwrap();
        assert_eq!(cfg.budget.requests_per_window, 40);
        assert_eq!(cfg.retry.rate_limit_retry_delay_seconds, 65);
    }

    #[test]
    fn defaults_fill_optional_fields() {
        let yaml = r#"app:
  data_dir: "./data"
  target_item_count: 10
inference:
  endpoint: "https://api.example.com/"
  api_key: "k"
  model: "m"
  input_cost_per_mtok: 1.0
  output_cost_per_mtok: 2.0
budget:
  tokens_per_window: 1000
  cost_ceiling_usd: 1.0
retry: {}
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.app.checkpoint_every, 10);
        assert_eq!(cfg.app.concurrency, 1);
        assert_eq!(cfg.budget.window_length_seconds, 60);
        assert_eq!(cfg.retry.max_retries, 3);
        assert!(cfg.media.endpoint.is_none());
    }

    #[test]
    fn invalid_api_key() {
        let mut cfg = example_cfg();
        cfg.inference.api_key = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("inference.api_key")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_budget_values() {
        let mut cfg = example_cfg();
        cfg.budget.requests_per_window = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        cfg.budget.cost_ceiling_usd = 0.0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("cost_ceiling_usd")),
            _ => panic!("wrong error"),
        }

        let mut cfg = example_cfg();
        cfg.retry.max_retries = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn concurrency_is_bounded() {
        let mut cfg = example_cfg();
        cfg.app.concurrency = MAX_CONCURRENCY + 1;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
        cfg.app.concurrency = 3;
        validate(&cfg).unwrap();
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg = example_cfg();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.app.target_item_count, 500);
        assert_eq!(cfg.media.max_video_seconds, 30);
    }
}
