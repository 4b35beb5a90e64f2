//! Request/token window accounting plus the cumulative spend governor.
//!
//! A single `RateBudget` is shared (by cloning the handle) between the
//! orchestrator and every retry engine. All counters live behind one mutex,
//! so concurrent callers never keep private tallies.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BudgetError {
    #[error("cost ceiling reached: spent ${spent_usd:.4} of ${ceiling_usd:.4}, next call needs ${requested_usd:.4}")]
    CeilingReached {
        spent_usd: f64,
        ceiling_usd: f64,
        requested_usd: f64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct BudgetLimits {
    pub requests_per_window: u32,
    pub tokens_per_window: u64,
    pub window: Duration,
    pub cost_ceiling_usd: f64,
}

impl BudgetLimits {
    pub fn from_config(cfg: &crate::config::Budget) -> Self {
        Self {
            requests_per_window: cfg.requests_per_window,
            tokens_per_window: cfg.tokens_per_window,
            window: Duration::from_secs(cfg.window_length_seconds),
            cost_ceiling_usd: cfg.cost_ceiling_usd,
        }
    }
}

/// Point-in-time view of the budget counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetSnapshot {
    pub requests_in_window: u32,
    pub tokens_in_window: u64,
    pub spent_usd: f64,
    pub rate_limit_pauses: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Granted,
    Wait(Duration),
}

#[derive(Debug)]
struct WindowState {
    window_start: Instant,
    requests: u32,
    tokens: u64,
    // Whole micro-dollars so repeated small charges never drift.
    spent_micros: u64,
    pauses: u64,
    // Window whose pause was already counted.
    paused_window: Option<Instant>,
}

impl WindowState {
    /// Count a pause at most once per window, however many callers wait on it.
    fn note_pause(&mut self) {
        if self.paused_window != Some(self.window_start) {
            self.pauses += 1;
            self.paused_window = Some(self.window_start);
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateBudget {
    limits: BudgetLimits,
    state: Arc<Mutex<WindowState>>,
}

fn to_micros(usd: f64) -> u64 {
    if usd <= 0.0 {
        return 0;
    }
    (usd * 1_000_000.0).round() as u64
}

fn to_usd(micros: u64) -> f64 {
    micros as f64 / 1_000_000.0
}

impl RateBudget {
    pub fn new(limits: BudgetLimits) -> Self {
        Self {
            limits,
            state: Arc::new(Mutex::new(WindowState {
                window_start: Instant::now(),
                requests: 0,
                tokens: 0,
                spent_micros: 0,
                pauses: 0,
                paused_window: None,
            })),
        }
    }

    /// Reserve capacity for one call, sleeping across window boundaries as
    /// needed. Counters and spend are charged before the call is issued.
    /// Returns the total time spent waiting.
    pub async fn reserve(
        &self,
        estimated_tokens: u64,
        estimated_cost_usd: f64,
    ) -> Result<Duration, BudgetError> {
        let mut waited = Duration::ZERO;
        loop {
            let decision = {
                let mut state = self.state.lock().await;
                let decision =
                    self.try_reserve(&mut state, estimated_tokens, estimated_cost_usd, Instant::now())?;
                if let Reservation::Wait(_) = decision {
                    state.note_pause();
                }
                decision
            };
            match decision {
                Reservation::Granted => return Ok(waited),
                Reservation::Wait(wait) => {
                    info!(
                        wait_ms = wait.as_millis() as u64,
                        estimated_tokens, "rate window full; pausing until it resets"
                    );
                    tokio::time::sleep(wait).await;
                    waited += wait;
                }
            }
        }
    }

    fn try_reserve(
        &self,
        state: &mut WindowState,
        estimated_tokens: u64,
        estimated_cost_usd: f64,
        now: Instant,
    ) -> Result<Reservation, BudgetError> {
        let window_end = state.window_start + self.limits.window;
        if now >= window_end {
            state.window_start = now;
            state.requests = 0;
            state.tokens = 0;
        }

        let cost = to_micros(estimated_cost_usd);
        let ceiling = to_micros(self.limits.cost_ceiling_usd);
        if state.spent_micros + cost > ceiling {
            return Err(BudgetError::CeilingReached {
                spent_usd: to_usd(state.spent_micros),
                ceiling_usd: self.limits.cost_ceiling_usd,
                requested_usd: estimated_cost_usd,
            });
        }

        let over_requests = state.requests + 1 > self.limits.requests_per_window;
        let over_tokens = state.tokens + estimated_tokens > self.limits.tokens_per_window;
        if over_requests || over_tokens {
            // A call larger than a whole window can never fit; let it run alone
            // in a fresh window instead of waiting forever.
            let oversized = state.requests == 0
                && state.tokens == 0
                && estimated_tokens > self.limits.tokens_per_window;
            if !oversized {
                let window_end = state.window_start + self.limits.window;
                return Ok(Reservation::Wait(window_end.saturating_duration_since(now)));
            }
            warn!(
                estimated_tokens,
                limit = self.limits.tokens_per_window,
                "single call exceeds the token window; admitting it alone"
            );
        }

        state.requests += 1;
        state.tokens += estimated_tokens;
        state.spent_micros += cost;
        Ok(Reservation::Granted)
    }

    /// Treat the current window as used up, e.g. after the provider reported
    /// throttling. The next reservation waits for the window boundary.
    pub async fn exhaust_window(&self) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        if now >= state.window_start + self.limits.window {
            state.window_start = now;
            state.tokens = 0;
        }
        state.requests = state.requests.max(self.limits.requests_per_window);
        state.note_pause();
    }

    pub async fn snapshot(&self) -> BudgetSnapshot {
        let state = self.state.lock().await;
        BudgetSnapshot {
            requests_in_window: state.requests,
            tokens_in_window: state.tokens,
            spent_usd: to_usd(state.spent_micros),
            rate_limit_pauses: state.pauses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(requests: u32, tokens: u64, ceiling: f64) -> BudgetLimits {
        BudgetLimits {
            requests_per_window: requests,
            tokens_per_window: tokens,
            window: Duration::from_secs(60),
            cost_ceiling_usd: ceiling,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn forty_first_request_waits_for_window_boundary() {
        let budget = RateBudget::new(limits(40, 1_000_000, 100.0));
        for _ in 0..40 {
            let waited = budget.reserve(100, 0.0).await.unwrap();
            assert_eq!(waited, Duration::ZERO);
        }
        assert_eq!(budget.snapshot().await.requests_in_window, 40);

        let started = Instant::now();
        let waited = budget.reserve(100, 0.0).await.unwrap();
        assert_eq!(waited, Duration::from_secs(60));
        assert!(started.elapsed() >= Duration::from_secs(60));

        let snap = budget.snapshot().await;
        assert_eq!(snap.requests_in_window, 1);
        assert_eq!(snap.tokens_in_window, 100);
        assert_eq!(snap.rate_limit_pauses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn token_ceiling_also_gates() {
        let budget = RateBudget::new(limits(100, 1_000, 100.0));
        budget.reserve(600, 0.0).await.unwrap();
        let waited = budget.reserve(600, 0.0).await.unwrap();
        assert_eq!(waited, Duration::from_secs(60));
        assert_eq!(budget.snapshot().await.tokens_in_window, 600);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_call_is_admitted_alone() {
        let budget = RateBudget::new(limits(10, 1_000, 100.0));
        let waited = budget.reserve(5_000, 0.0).await.unwrap();
        assert_eq!(waited, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn cost_ceiling_rejects_the_201st_call() {
        let budget = RateBudget::new(limits(1_000, 10_000_000, 10.0));
        for _ in 0..200 {
            budget.reserve(10, 0.05).await.unwrap();
        }
        let err = budget.reserve(10, 0.05).await.unwrap_err();
        match err {
            BudgetError::CeilingReached { spent_usd, .. } => assert!(spent_usd >= 10.0),
        }
        // Rejected calls are not charged.
        let snap = budget.snapshot().await;
        assert_eq!(snap.requests_in_window, 200);
        assert!((snap.spent_usd - 10.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_window_forces_a_pause() {
        let budget = RateBudget::new(limits(40, 1_000_000, 100.0));
        budget.reserve(1, 0.0).await.unwrap();
        budget.exhaust_window().await;
        let waited = budget.reserve(1, 0.0).await.unwrap();
        assert_eq!(waited, Duration::from_secs(60));
        // The throttle and the wait it caused are one pause.
        assert_eq!(budget.snapshot().await.rate_limit_pauses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_after_an_idle_window_still_blocks() {
        let budget = RateBudget::new(limits(40, 1_000_000, 100.0));
        budget.reserve(1, 0.0).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;

        budget.exhaust_window().await;
        let waited = budget.reserve(1, 0.0).await.unwrap();
        assert_eq!(waited, Duration::from_secs(60));
        assert_eq!(budget.snapshot().await.requests_in_window, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_waiters_count_one_pause_per_window() {
        let budget = RateBudget::new(limits(1, 1_000_000, 100.0));
        budget.reserve(1, 0.0).await.unwrap();

        let waiters = (0..3).map(|_| {
            let budget = budget.clone();
            tokio::spawn(async move { budget.reserve(1, 0.0).await.unwrap() })
        });
        for waiter in futures::future::join_all(waiters).await {
            waiter.unwrap();
        }

        // One waiter is granted per window, so three windows were waited on.
        assert_eq!(budget.snapshot().await.rate_limit_pauses, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn clones_share_one_counter() {
        let budget = RateBudget::new(limits(3, 1_000_000, 100.0));
        let other = budget.clone();
        budget.reserve(1, 0.01).await.unwrap();
        other.reserve(1, 0.01).await.unwrap();
        let snap = budget.snapshot().await;
        assert_eq!(snap.requests_in_window, 2);
        assert!((snap.spent_usd - 0.02).abs() < 1e-9);
    }
}
