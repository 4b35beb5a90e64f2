//! Database module: row models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: row shapes returned by queries and their domain conversions.
//! - `repo`: SQL-only functions over the pool.
//!
//! `SqliteStore` adapts the repository functions to the `WorkSource` and
//! `ResultStore` seams used by the orchestrator.

pub mod model;
pub mod repo;

pub use repo::*;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;

use crate::checkpoint::ProgressCheckpoint;
use crate::model::{AnalysisResult, WorkItem};
use crate::store::{ResultStore, WorkSource};

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl WorkSource for SqliteStore {
    async fn fetch_backlog(
        &self,
        after_id: Option<&str>,
        limit: u32,
        exclude_ids: &HashSet<String>,
    ) -> Result<Vec<WorkItem>> {
        repo::fetch_backlog(&self.pool, after_id, limit, exclude_ids).await
    }

    async fn list_already_analyzed_ids(&self) -> Result<Vec<String>> {
        repo::list_analyzed_external_ids(&self.pool).await
    }
}

#[async_trait]
impl ResultStore for SqliteStore {
    async fn insert(&self, result: &AnalysisResult) -> Result<()> {
        repo::insert_analysis_result(&self.pool, result).await
    }

    async fn insert_checkpoint(&self, checkpoint: &ProgressCheckpoint) -> Result<()> {
        repo::insert_checkpoint(&self.pool, checkpoint).await
    }

    async fn load_latest_checkpoint(&self) -> Result<Option<ProgressCheckpoint>> {
        repo::load_latest_checkpoint(&self.pool).await
    }
}
