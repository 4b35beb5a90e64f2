use std::time::Duration;

use tracing::{info, warn};

use crate::inference::InferenceClient;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Unhealthy(String),
}

/// Pre-flight reachability check against the inference endpoint.
pub struct HealthGate<'a> {
    client: &'a dyn InferenceClient,
    timeout: Duration,
}

impl<'a> HealthGate<'a> {
    pub fn new(client: &'a dyn InferenceClient, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub async fn check(&self) -> Health {
        match tokio::time::timeout(self.timeout, self.client.ping()).await {
            Ok(Ok(())) => {
                info!("inference endpoint is reachable");
                Health::Healthy
            }
            Ok(Err(err)) => {
                warn!(%err, "inference health check failed");
                Health::Unhealthy(err.to_string())
            }
            Err(_) => {
                let reason = format!(
                    "inference endpoint did not answer within {}s",
                    self.timeout.as_secs()
                );
                warn!(%reason, "inference health check timed out");
                Health::Unhealthy(reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::ProviderError;
    use async_trait::async_trait;

    struct Probe(Option<ProviderError>, Duration);

    #[async_trait]
    impl InferenceClient for Probe {
        async fn complete(&self, _p: &str, _m: &str, _t: u32) -> Result<String, ProviderError> {
            unreachable!("health checks never complete prompts")
        }

        async fn ping(&self) -> Result<(), ProviderError> {
            tokio::time::sleep(self.1).await;
            match &self.0 {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_endpoint_passes() {
        let probe = Probe(None, Duration::ZERO);
        let gate = HealthGate::new(&probe, Duration::from_secs(5));
        assert_eq!(gate.check().await, Health::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_reason_is_surfaced_verbatim() {
        let err = ProviderError::Unavailable("connection refused".into());
        let probe = Probe(Some(err.clone()), Duration::ZERO);
        let gate = HealthGate::new(&probe, Duration::from_secs(5));
        assert_eq!(gate.check().await, Health::Unhealthy(err.to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_endpoint_times_out() {
        let probe = Probe(None, Duration::from_secs(60));
        let gate = HealthGate::new(&probe, Duration::from_secs(5));
        match gate.check().await {
            Health::Unhealthy(reason) => assert!(reason.contains("5s")),
            Health::Healthy => panic!("expected timeout"),
        }
    }
}
