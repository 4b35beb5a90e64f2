use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::budget::{BudgetError, RateBudget};
use crate::config;
use crate::inference::{InferenceClient, ProviderError};
use crate::orchestrator::{PhaseReporter, RunPhase};
use crate::parser::ParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub rate_limit_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &config::Retry) -> Self {
        Self {
            max_attempts: cfg.max_retries.max(1),
            retry_delay: Duration::from_secs(cfg.retry_delay_seconds),
            rate_limit_delay: Duration::from_secs(cfg.rate_limit_retry_delay_seconds),
        }
    }
}

/// One costed inference call, with the estimates reserved per attempt.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub prompt: String,
    pub model: String,
    pub max_output_tokens: u32,
    pub estimated_tokens: u64,
    pub estimated_cost_usd: f64,
}

#[derive(Debug, Clone)]
pub struct Completion<T> {
    pub value: T,
    pub attempts: u32,
}

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error(transparent)]
    Budget(#[from] BudgetError),
    #[error("permanent failure: {0}")]
    Permanent(String),
    #[error("gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

impl InvokeError {
    /// Fatal errors end the whole run rather than the current item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, InvokeError::Budget(_))
    }
}

/// Wraps single inference calls with a bounded retry loop.
///
/// Every attempt reserves from the shared budget before it is issued. A
/// provider throttle exhausts the budget window and waits the longer
/// rate-limit delay; other transient failures wait the regular delay.
#[derive(Clone)]
pub struct RetryEngine {
    client: Arc<dyn InferenceClient>,
    budget: RateBudget,
    policy: RetryPolicy,
    phase: Option<PhaseReporter>,
}

impl RetryEngine {
    pub fn new(client: Arc<dyn InferenceClient>, budget: RateBudget, policy: RetryPolicy) -> Self {
        Self {
            client,
            budget,
            policy,
            phase: None,
        }
    }

    pub fn with_phase_reporter(mut self, phase: PhaseReporter) -> Self {
        self.phase = Some(phase);
        self
    }

    fn report(&self, phase: RunPhase) {
        if let Some(tx) = &self.phase {
            tx.send_replace(phase);
        }
    }

    /// Issue `request`, accepting the first reply that `parse` turns into a
    /// value. Retryable parse failures count as transient.
    pub async fn invoke<T, F>(
        &self,
        request: &InferenceRequest,
        parse: F,
    ) -> Result<Completion<T>, InvokeError>
    where
        F: Fn(&str) -> Result<T, ParseError>,
    {
        let mut last_error = String::new();
        for attempt in 1..=self.policy.max_attempts {
            self.report(RunPhase::RateGating);
            self.budget
                .reserve(request.estimated_tokens, request.estimated_cost_usd)
                .await?;

            self.report(RunPhase::Invoking);
            let reply = self
                .client
                .complete(&request.prompt, &request.model, request.max_output_tokens)
                .await;
            if reply.is_ok() {
                self.report(RunPhase::Parsing);
            }

            let delay = match reply {
                Ok(raw) => match parse(&raw) {
                    Ok(value) => {
                        debug!(attempt, reply_chars = raw.len(), "inference call succeeded");
                        return Ok(Completion {
                            value,
                            attempts: attempt,
                        });
                    }
                    Err(err) if err.is_retryable() => {
                        warn!(attempt, %err, "unusable reply; retrying");
                        last_error = err.to_string();
                        self.policy.retry_delay
                    }
                    Err(err) => return Err(InvokeError::Permanent(err.to_string())),
                },
                Err(ProviderError::RateLimited {
                    retry_after,
                    message,
                }) => {
                    self.budget.exhaust_window().await;
                    let delay = retry_after
                        .unwrap_or(self.policy.rate_limit_delay)
                        .max(self.policy.rate_limit_delay);
                    warn!(attempt, delay_s = delay.as_secs(), "provider rate limited; backing off");
                    last_error = format!("rate limited: {}", message);
                    delay
                }
                Err(err) if err.is_permanent() => return Err(InvokeError::Permanent(err.to_string())),
                Err(err) => {
                    warn!(attempt, %err, "transient provider failure; retrying");
                    last_error = err.to_string();
                    self.policy.retry_delay
                }
            };

            if attempt < self.policy.max_attempts {
                tokio::time::sleep(delay).await;
            }
        }

        Err(InvokeError::Exhausted {
            attempts: self.policy.max_attempts,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::BudgetLimits;
    use crate::parser;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct ScriptedClient {
        replies: Mutex<VecDeque<Result<String, ProviderError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedClient {
        fn new(replies: Vec<Result<String, ProviderError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(VecDeque::from(replies)),
                calls: Mutex::new(0),
            })
        }

        async fn calls(&self) -> u32 {
            *self.calls.lock().await
        }
    }

    #[async_trait]
    impl InferenceClient for ScriptedClient {
        async fn complete(&self, _p: &str, _m: &str, _t: u32) -> Result<String, ProviderError> {
            *self.calls.lock().await += 1;
            self.replies
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| Err(ProviderError::Unavailable("script exhausted".into())))
        }

        async fn ping(&self) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    const GOOD: &str = r#"{"classification":"x","primary_factors":["a"],"confidence":0.7}"#;

    fn throttled() -> Result<String, ProviderError> {
        Err(ProviderError::RateLimited {
            retry_after: None,
            message: "429".into(),
        })
    }

    fn engine(client: Arc<ScriptedClient>, ceiling: f64) -> (RetryEngine, RateBudget) {
        let budget = RateBudget::new(BudgetLimits {
            requests_per_window: 40,
            tokens_per_window: 1_000_000,
            window: Duration::from_secs(60),
            cost_ceiling_usd: ceiling,
        });
        let policy = RetryPolicy {
            max_attempts: 3,
            retry_delay: Duration::from_secs(2),
            rate_limit_delay: Duration::from_secs(65),
        };
        (RetryEngine::new(client, budget.clone(), policy), budget)
    }

    fn request() -> InferenceRequest {
        InferenceRequest {
            prompt: "analyze".into(),
            model: "m".into(),
            max_output_tokens: 100,
            estimated_tokens: 200,
            estimated_cost_usd: 0.01,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_twice_then_success_takes_three_attempts() {
        let client = ScriptedClient::new(vec![throttled(), throttled(), Ok(GOOD.into())]);
        let (engine, budget) = engine(client.clone(), 10.0);

        let started = tokio::time::Instant::now();
        let done = engine.invoke(&request(), parser::parse).await.unwrap();
        assert_eq!(done.attempts, 3);
        assert_eq!(client.calls().await, 3);
        assert_eq!(done.value.classification, "x");
        assert!(started.elapsed() >= Duration::from_secs(130));

        let snap = budget.snapshot().await;
        assert!(snap.rate_limit_pauses >= 2);
        assert!((snap.spent_usd - 0.03).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_rejection_is_not_retried() {
        let client = ScriptedClient::new(vec![Err(ProviderError::Rejected {
            status: 401,
            message: "bad key".into(),
        })]);
        let (engine, _) = engine(client.clone(), 10.0);
        let err = engine.invoke(&request(), parser::parse).await.unwrap_err();
        assert!(matches!(err, InvokeError::Permanent(_)));
        assert_eq!(client.calls().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refusal_is_not_retried() {
        let client = ScriptedClient::new(vec![Ok("I cannot analyze this content.".into())]);
        let (engine, _) = engine(client.clone(), 10.0);
        let err = engine.invoke(&request(), parser::parse).await.unwrap_err();
        assert!(matches!(err, InvokeError::Permanent(_)));
        assert!(!err.is_fatal());
        assert_eq!(client.calls().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unparseable_replies_exhaust_retries() {
        let garbled = "{\"classification\": \"x\", \"primary_factors\": [";
        let client = ScriptedClient::new(vec![
            Ok(garbled.into()),
            Err(ProviderError::Unavailable("502".into())),
            Ok(garbled.into()),
        ]);
        let (engine, _) = engine(client.clone(), 10.0);
        let err = engine.invoke(&request(), parser::parse).await.unwrap_err();
        match err {
            InvokeError::Exhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(client.calls().await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_breach_is_fatal_and_skips_the_call() {
        let client = ScriptedClient::new(vec![Ok(GOOD.into())]);
        let (engine, _) = engine(client.clone(), 0.005);
        let err = engine.invoke(&request(), parser::parse).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(client.calls().await, 0);
    }
}
