//! Control loop for a bulk enrichment run.
//!
//! Phases: `Idle -> HealthChecking -> Fetching -> Resolving -> RateGating ->
//! Invoking -> Parsing -> Persisting -> CheckpointAdvancing -> (loop |
//! Draining -> Done)`, with `Aborted` reached on a failed health check or a
//! cost ceiling breach. Items run one at a time unless `concurrency > 1`, in
//! which case a chunk runs concurrently against the same shared budget while
//! checkpoint advancement stays in this loop, in fetch order.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::budget::{BudgetError, BudgetLimits, RateBudget};
use crate::checkpoint::{CheckpointTracker, ProgressCheckpoint};
use crate::config::{self, Config};
use crate::health::{Health, HealthGate};
use crate::inference::{estimate_tokens, CostModel, InferenceClient};
use crate::media::MediaAnalyzer;
use crate::model::{AnalysisResult, ItemOutcome, WorkItem};
use crate::parser;
use crate::prompt;
use crate::resolver::SourceResolver;
use crate::retry::{InferenceRequest, InvokeError, RetryEngine, RetryPolicy};
use crate::store::{ResultStore, WorkSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    HealthChecking,
    Fetching,
    Resolving,
    RateGating,
    Invoking,
    Parsing,
    Persisting,
    CheckpointAdvancing,
    Draining,
    Done,
    Aborted,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Idle => "idle",
            RunPhase::HealthChecking => "health_checking",
            RunPhase::Fetching => "fetching",
            RunPhase::Resolving => "resolving",
            RunPhase::RateGating => "rate_gating",
            RunPhase::Invoking => "invoking",
            RunPhase::Parsing => "parsing",
            RunPhase::Persisting => "persisting",
            RunPhase::CheckpointAdvancing => "checkpoint_advancing",
            RunPhase::Draining => "draining",
            RunPhase::Done => "done",
            RunPhase::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Done | RunPhase::Aborted)
    }
}

pub type PhaseReporter = Arc<watch::Sender<RunPhase>>;

/// Cooperative stop flag, checked between items.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub target_item_count: u64,
    pub page_size: u32,
    pub concurrency: usize,
    pub checkpoint_every: u64,
    pub inter_item_delay: Duration,
    pub health_timeout: Duration,
    pub model: String,
    pub max_output_tokens: u32,
    pub cost: CostModel,
    pub max_video_seconds: u32,
    pub budget: BudgetLimits,
    pub retry: RetryPolicy,
}

impl RunSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            target_item_count: cfg.app.target_item_count,
            page_size: cfg.app.page_size,
            concurrency: cfg.app.concurrency.clamp(1, config::MAX_CONCURRENCY),
            checkpoint_every: cfg.app.checkpoint_every,
            inter_item_delay: Duration::from_millis(cfg.app.inter_item_delay_ms),
            health_timeout: Duration::from_secs(cfg.inference.health_timeout_seconds),
            model: cfg.inference.model.clone(),
            max_output_tokens: cfg.inference.max_output_tokens,
            cost: CostModel::from_config(&cfg.inference),
            max_video_seconds: cfg.media.max_video_seconds,
            budget: BudgetLimits::from_config(&cfg.budget),
            retry: RetryPolicy::from_config(&cfg.retry),
        }
    }
}

/// External systems the orchestrator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub work_source: Arc<dyn WorkSource>,
    pub result_store: Arc<dyn ResultStore>,
    pub inference: Arc<dyn InferenceClient>,
    pub media: Arc<dyn MediaAnalyzer>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemError {
    pub external_id: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub checkpoint: ProgressCheckpoint,
    pub errors: Vec<ItemError>,
    pub stopped_early: bool,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("inference service unhealthy: {0}")]
    Unhealthy(String),
    #[error("run aborted: {0}")]
    CostCeiling(#[from] BudgetError),
    #[error("work source failed: {0:#}")]
    WorkSource(anyhow::Error),
}

enum ItemReport {
    Analyzed(AnalysisResult),
    Skipped(String),
    Failed(String),
    Fatal(BudgetError),
}

/// A result whose insert failed, held for the next flush.
struct Unsaved {
    result: AnalysisResult,
    // Whether the checkpoint already counted this item as a success.
    counted: bool,
    // Checkpoint cursor just before this item was advanced.
    cursor_before: Option<String>,
}

#[derive(Default)]
struct LoopState {
    cursor: Option<String>,
    queue: VecDeque<WorkItem>,
    excluded: HashSet<String>,
    pending: Vec<Unsaved>,
    errors: Vec<ItemError>,
    session_processed: u64,
}

pub struct Orchestrator {
    settings: RunSettings,
    work_source: Arc<dyn WorkSource>,
    result_store: Arc<dyn ResultStore>,
    inference: Arc<dyn InferenceClient>,
    resolver: SourceResolver,
    budget: RateBudget,
    retry: RetryEngine,
    stop: StopSignal,
    phase: PhaseReporter,
    run_id: Uuid,
}

impl Orchestrator {
    pub fn new(settings: RunSettings, collaborators: Collaborators) -> Self {
        let (tx, _) = watch::channel(RunPhase::Idle);
        let phase = Arc::new(tx);
        let budget = RateBudget::new(settings.budget.clone());
        let retry = RetryEngine::new(collaborators.inference.clone(), budget.clone(), settings.retry)
            .with_phase_reporter(phase.clone());
        let resolver = SourceResolver::new(collaborators.media, settings.max_video_seconds);
        Self {
            settings,
            work_source: collaborators.work_source,
            result_store: collaborators.result_store,
            inference: collaborators.inference,
            resolver,
            budget,
            retry,
            stop: StopSignal::new(),
            phase,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<RunPhase> {
        self.phase.subscribe()
    }

    pub fn phase(&self) -> RunPhase {
        *self.phase.borrow()
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    fn set_phase(&self, phase: RunPhase) {
        self.phase.send_replace(phase);
    }

    pub async fn run(&self) -> Result<RunReport, RunError> {
        info!(
            run_id = %self.run_id,
            target_items = self.settings.target_item_count,
            concurrency = self.settings.concurrency,
            model = %self.settings.model,
            "starting enrichment run"
        );

        self.set_phase(RunPhase::HealthChecking);
        let gate = HealthGate::new(self.inference.as_ref(), self.settings.health_timeout);
        if let Health::Unhealthy(reason) = gate.check().await {
            self.set_phase(RunPhase::Aborted);
            error!(%reason, "aborting run before any work: inference service unhealthy");
            return Err(RunError::Unhealthy(reason));
        }

        let store = self.result_store.as_ref();
        let mut tracker = match CheckpointTracker::resume_from(
            store,
            self.run_id,
            self.settings.target_item_count,
            self.settings.checkpoint_every,
        )
        .await
        {
            Ok(tracker) => tracker,
            Err(err) => {
                warn!(?err, "failed to load checkpoint; starting from the beginning");
                CheckpointTracker::new(
                    self.run_id,
                    self.settings.target_item_count,
                    self.settings.checkpoint_every,
                )
            }
        };

        let excluded = match self.work_source.list_already_analyzed_ids().await {
            Ok(ids) => ids.into_iter().collect::<HashSet<_>>(),
            Err(err) => {
                self.set_phase(RunPhase::Aborted);
                error!(?err, "failed to list analyzed items");
                return Err(RunError::WorkSource(err));
            }
        };
        info!(already_analyzed = excluded.len(), "loaded exclusion set");

        let mut state = LoopState {
            cursor: tracker.last_processed_id().map(str::to_string),
            excluded,
            ..Default::default()
        };

        let outcome = self.drive(&mut tracker, &mut state).await;
        if outcome.is_ok() {
            self.set_phase(RunPhase::Draining);
        }
        self.retry_pending(&mut state.pending).await;
        if !state.pending.is_empty() {
            self.release_unsaved(&mut tracker, &mut state);
        }
        self.save_checkpoint(&mut tracker).await;

        let checkpoint = tracker.snapshot();
        match outcome {
            Ok(stopped_early) => {
                self.set_phase(RunPhase::Done);
                info!(
                    processed = checkpoint.processed_count,
                    success = checkpoint.success_count,
                    error = checkpoint.error_count,
                    skipped = checkpoint.skipped_count,
                    cost_usd = checkpoint.estimated_cost_usd,
                    stopped_early,
                    "enrichment run finished"
                );
                Ok(RunReport {
                    run_id: self.run_id,
                    checkpoint,
                    errors: state.errors,
                    stopped_early,
                })
            }
            Err(err) => {
                self.set_phase(RunPhase::Aborted);
                error!(
                    %err,
                    processed = checkpoint.processed_count,
                    item_errors = state.errors.len(),
                    "enrichment run aborted"
                );
                Err(err)
            }
        }
    }

    /// Main loop. Returns whether the run was stopped early by request.
    async fn drive(
        &self,
        tracker: &mut CheckpointTracker,
        state: &mut LoopState,
    ) -> Result<bool, RunError> {
        loop {
            if self.stop.is_raised() {
                info!("stop requested; leaving after the last completed item");
                return Ok(true);
            }
            let remaining = self
                .settings
                .target_item_count
                .saturating_sub(state.session_processed);
            if remaining == 0 {
                info!(target_items = self.settings.target_item_count, "target count reached");
                return Ok(false);
            }

            if state.queue.is_empty() {
                self.set_phase(RunPhase::Fetching);
                let page = self
                    .work_source
                    .fetch_backlog(state.cursor.as_deref(), self.settings.page_size, &state.excluded)
                    .await
                    .map_err(RunError::WorkSource)?;
                let Some(last) = page.last() else {
                    info!("backlog exhausted");
                    return Ok(false);
                };
                state.cursor = Some(last.external_id.clone());
                state.queue.extend(page);
            }

            let take = self
                .settings
                .concurrency
                .min(state.queue.len())
                .min(usize::try_from(remaining).unwrap_or(usize::MAX));
            let chunk: Vec<WorkItem> = state.queue.drain(..take).collect();
            let reports = join_all(chunk.iter().map(|item| self.process_item(item))).await;

            let mut fatal: Option<BudgetError> = None;
            for (item, report) in chunk.iter().zip(reports) {
                let outcome = match report {
                    ItemReport::Analyzed(result) => {
                        let unsaved = Unsaved {
                            result,
                            counted: fatal.is_none(),
                            cursor_before: tracker.last_processed_id().map(str::to_string),
                        };
                        self.persist(unsaved, &mut state.pending).await;
                        ItemOutcome::Success
                    }
                    ItemReport::Skipped(reason) => {
                        info!(external_id = %item.external_id, %reason, "skipping item");
                        ItemOutcome::Skipped
                    }
                    ItemReport::Failed(message) => {
                        warn!(external_id = %item.external_id, %message, "item failed");
                        state.errors.push(ItemError {
                            external_id: item.external_id.clone(),
                            message,
                        });
                        ItemOutcome::Error
                    }
                    ItemReport::Fatal(err) => {
                        if fatal.is_none() {
                            fatal = Some(err);
                        }
                        continue;
                    }
                };
                // Once an item was cut off by the ceiling, later items must not
                // move the cursor past it.
                if fatal.is_some() {
                    continue;
                }

                self.set_phase(RunPhase::CheckpointAdvancing);
                let budget = self.budget.snapshot().await;
                tracker.advance(outcome, &item.external_id, &budget);
                state.excluded.insert(item.external_id.clone());
                state.session_processed += 1;
                if tracker.flush_due() {
                    self.flush(tracker, &mut state.pending).await;
                }
            }

            if let Some(err) = fatal {
                return Err(RunError::CostCeiling(err));
            }
            if !self.settings.inter_item_delay.is_zero() {
                tokio::time::sleep(self.settings.inter_item_delay).await;
            }
        }
    }

    #[instrument(skip_all, fields(external_id = %item.external_id))]
    async fn process_item(&self, item: &WorkItem) -> ItemReport {
        self.set_phase(RunPhase::Resolving);
        let input = self.resolver.resolve(item).await;
        let Some(primary_source) = input.primary_source else {
            return ItemReport::Skipped("no usable source beyond the caption".to_string());
        };

        let prompt = prompt::build(item, &input);
        let input_tokens = estimate_tokens(&prompt);
        let request = InferenceRequest {
            prompt,
            model: self.settings.model.clone(),
            max_output_tokens: self.settings.max_output_tokens,
            estimated_tokens: input_tokens + u64::from(self.settings.max_output_tokens),
            estimated_cost_usd: self
                .settings
                .cost
                .estimate(input_tokens, self.settings.max_output_tokens),
        };

        match self.retry.invoke(&request, parser::parse).await {
            Ok(done) => {
                info!(
                    primary_source = %primary_source,
                    attempts = done.attempts,
                    classification = %done.value.classification,
                    "item analyzed"
                );
                ItemReport::Analyzed(AnalysisResult::new(
                    item,
                    primary_source,
                    done.value,
                    input.render(),
                    &self.settings.model,
                ))
            }
            Err(InvokeError::Budget(err)) => ItemReport::Fatal(err),
            Err(err) => ItemReport::Failed(err.to_string()),
        }
    }

    async fn persist(&self, unsaved: Unsaved, pending: &mut Vec<Unsaved>) {
        self.set_phase(RunPhase::Persisting);
        if let Err(err) = self.result_store.insert(&unsaved.result).await {
            warn!(?err, external_id = %unsaved.result.external_id, "failed to persist analysis; will retry at next flush");
            pending.push(unsaved);
        }
    }

    /// Retry unsaved results, then write the checkpoint. Failures are logged
    /// and left for the next flush.
    async fn flush(&self, tracker: &mut CheckpointTracker, pending: &mut Vec<Unsaved>) {
        self.retry_pending(pending).await;
        self.save_checkpoint(tracker).await;
    }

    async fn retry_pending(&self, pending: &mut Vec<Unsaved>) {
        let store = self.result_store.as_ref();
        let mut still_unsaved = Vec::new();
        for unsaved in pending.drain(..) {
            if let Err(err) = store.insert(&unsaved.result).await {
                warn!(?err, external_id = %unsaved.result.external_id, "analysis still not persisted");
                still_unsaved.push(unsaved);
            }
        }
        *pending = still_unsaved;
    }

    /// Give up on results that never reached the store. Their successes
    /// become errors and the cursor moves back before the earliest of them,
    /// so the next run analyzes them again.
    fn release_unsaved(&self, tracker: &mut CheckpointTracker, state: &mut LoopState) {
        let mut rewind_to: Option<Option<String>> = None;
        for unsaved in state.pending.drain(..) {
            if unsaved.counted {
                tracker.demote_success();
                if rewind_to.is_none() {
                    rewind_to = Some(unsaved.cursor_before);
                }
            }
            state.errors.push(ItemError {
                external_id: unsaved.result.external_id,
                message: "analysis could not be persisted".to_string(),
            });
        }
        if let Some(cursor) = rewind_to {
            warn!(
                cursor = cursor.as_deref().unwrap_or(""),
                "rewinding checkpoint cursor before unsaved analyses"
            );
            tracker.rewind_cursor(cursor);
        }
    }

    async fn save_checkpoint(&self, tracker: &mut CheckpointTracker) {
        tracker.sync_budget(&self.budget.snapshot().await);
        match tracker.flush(self.result_store.as_ref()).await {
            Ok(()) => {
                let cp = tracker.snapshot();
                info!(
                    processed = cp.processed_count,
                    success = cp.success_count,
                    error = cp.error_count,
                    skipped = cp.skipped_count,
                    cost_usd = cp.estimated_cost_usd,
                    rate_limit_pauses = cp.rate_limit_pauses,
                    last_processed_id = cp.last_processed_id.as_deref().unwrap_or(""),
                    "checkpoint saved"
                );
            }
            Err(err) => warn!(?err, "failed to save checkpoint; will retry at next flush"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_signal_is_shared_between_clones() {
        let stop = StopSignal::new();
        let other = stop.clone();
        assert!(!other.is_raised());
        stop.raise();
        assert!(other.is_raised());
    }

    #[test]
    fn settings_from_example_config() {
        let cfg: Config = serde_yaml::from_str(config::example()).unwrap();
        let settings = RunSettings::from_config(&cfg);
        assert_eq!(settings.budget.requests_per_window, 40);
        assert_eq!(settings.budget.window, Duration::from_secs(60));
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.retry.rate_limit_delay, Duration::from_secs(65));
        assert_eq!(settings.inter_item_delay, Duration::from_millis(1500));
    }

    #[test]
    fn terminal_phases() {
        assert!(RunPhase::Done.is_terminal());
        assert!(RunPhase::Aborted.is_terminal());
        assert!(!RunPhase::Draining.is_terminal());
    }
}
