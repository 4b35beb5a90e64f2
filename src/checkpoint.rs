use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::budget::BudgetSnapshot;
use crate::model::ItemOutcome;
use crate::store::ResultStore;

/// Durable cursor and counters describing backlog progress.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressCheckpoint {
    pub run_id: Uuid,
    pub target_count: u64,
    pub processed_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub skipped_count: u64,
    pub estimated_cost_usd: f64,
    pub last_processed_id: Option<String>,
    pub rate_limit_pauses: u64,
    pub updated_at: DateTime<Utc>,
}

impl ProgressCheckpoint {
    pub fn new(run_id: Uuid, target_count: u64) -> Self {
        Self {
            run_id,
            target_count,
            processed_count: 0,
            success_count: 0,
            error_count: 0,
            skipped_count: 0,
            estimated_cost_usd: 0.0,
            last_processed_id: None,
            rate_limit_pauses: 0,
            updated_at: Utc::now(),
        }
    }

    /// processed == success + error + skipped
    pub fn is_consistent(&self) -> bool {
        self.processed_count == self.success_count + self.error_count + self.skipped_count
    }
}

/// Owns the in-memory checkpoint for a run. The orchestrator's control loop
/// is its only caller, which keeps advancement serialized.
#[derive(Debug)]
pub struct CheckpointTracker {
    current: ProgressCheckpoint,
    // Spend and pauses carried over from earlier runs.
    base_cost_usd: f64,
    base_pauses: u64,
    flush_every: u64,
    since_flush: u64,
    dirty: bool,
}

impl CheckpointTracker {
    pub fn new(run_id: Uuid, target_count: u64, flush_every: u64) -> Self {
        Self::from_checkpoint(ProgressCheckpoint::new(run_id, target_count), flush_every)
    }

    fn from_checkpoint(checkpoint: ProgressCheckpoint, flush_every: u64) -> Self {
        Self {
            base_cost_usd: checkpoint.estimated_cost_usd,
            base_pauses: checkpoint.rate_limit_pauses,
            current: checkpoint,
            flush_every: flush_every.max(1),
            since_flush: 0,
            dirty: false,
        }
    }

    /// Continue from the latest stored checkpoint, if any. Counters and the
    /// cursor carry over; the run id and target belong to the new run.
    pub async fn resume_from(
        store: &dyn ResultStore,
        run_id: Uuid,
        target_count: u64,
        flush_every: u64,
    ) -> Result<Self> {
        match store.load_latest_checkpoint().await? {
            Some(mut previous) => {
                info!(
                    previous_run = %previous.run_id,
                    processed = previous.processed_count,
                    last_processed_id = previous.last_processed_id.as_deref().unwrap_or(""),
                    "resuming from checkpoint"
                );
                previous.run_id = run_id;
                previous.target_count = target_count;
                Ok(Self::from_checkpoint(previous, flush_every))
            }
            None => Ok(Self::new(run_id, target_count, flush_every)),
        }
    }

    /// Record one finished item.
    pub fn advance(&mut self, outcome: ItemOutcome, external_id: &str, budget: &BudgetSnapshot) {
        let cp = &mut self.current;
        match outcome {
            ItemOutcome::Success => cp.success_count += 1,
            ItemOutcome::Error => cp.error_count += 1,
            ItemOutcome::Skipped => cp.skipped_count += 1,
        }
        cp.processed_count += 1;
        cp.last_processed_id = Some(external_id.to_string());
        self.since_flush += 1;
        self.dirty = true;
        self.sync_budget(budget);
        debug!(external_id, outcome = outcome.as_str(), "checkpoint advanced");
    }

    /// Turn one counted success into an error, for a result that never reached the store.
    pub fn demote_success(&mut self) {
        let cp = &mut self.current;
        if cp.success_count > 0 {
            cp.success_count -= 1;
            cp.error_count += 1;
            self.dirty = true;
        }
    }

    pub fn rewind_cursor(&mut self, last_processed_id: Option<String>) {
        self.current.last_processed_id = last_processed_id;
        self.dirty = true;
    }

    pub fn sync_budget(&mut self, budget: &BudgetSnapshot) {
        self.current.estimated_cost_usd = self.base_cost_usd + budget.spent_usd;
        self.current.rate_limit_pauses = self.base_pauses + budget.rate_limit_pauses;
        self.current.updated_at = Utc::now();
    }

    pub fn snapshot(&self) -> ProgressCheckpoint {
        self.current.clone()
    }

    pub fn last_processed_id(&self) -> Option<&str> {
        self.current.last_processed_id.as_deref()
    }

    pub fn flush_due(&self) -> bool {
        self.since_flush >= self.flush_every
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Write the current checkpoint. On failure the tracker stays dirty and
    /// the write is attempted again at the next flush.
    pub async fn flush(&mut self, store: &dyn ResultStore) -> Result<()> {
        store.insert_checkpoint(&self.current).await?;
        self.since_flush = 0;
        self.dirty = false;
        Ok(())
    }
}
