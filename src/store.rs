//! Collaborator seams for the backlog and for durable results.
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;

use crate::checkpoint::ProgressCheckpoint;
use crate::model::{AnalysisResult, WorkItem};

#[async_trait]
pub trait WorkSource: Send + Sync {
    /// Next page of backlog items strictly after `after_id` (by backlog
    /// order), skipping any external id in `exclude_ids`.
    async fn fetch_backlog(
        &self,
        after_id: Option<&str>,
        limit: u32,
        exclude_ids: &HashSet<String>,
    ) -> Result<Vec<WorkItem>>;

    /// External ids that already have a persisted analysis.
    async fn list_already_analyzed_ids(&self) -> Result<Vec<String>>;
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn insert(&self, result: &AnalysisResult) -> Result<()>;

    async fn insert_checkpoint(&self, checkpoint: &ProgressCheckpoint) -> Result<()>;

    async fn load_latest_checkpoint(&self) -> Result<Option<ProgressCheckpoint>>;
}
