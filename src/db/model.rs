//! Row shapes returned by repository queries.
//!
//! Keep these structs focused on the data returned by queries. Conversion
//! into domain types lives here too so repositories stay SQL-only.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::checkpoint::ProgressCheckpoint;
use crate::model::{EngagementStats, WorkItem};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WorkItemRow {
    pub id: i64,
    pub external_id: String,
    pub title: Option<String>,
    pub caption: Option<String>,
    pub transcript: Option<String>,
    pub video_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub views: i64,
    pub likes: i64,
    pub comments: i64,
    pub shares: i64,
    pub duration_seconds: i64,
}

impl From<WorkItemRow> for WorkItem {
    fn from(row: WorkItemRow) -> Self {
        WorkItem {
            id: row.id,
            external_id: row.external_id,
            title: row.title,
            caption: row.caption,
            transcript: row.transcript,
            video_url: row.video_url,
            thumbnail_url: row.thumbnail_url,
            stats: EngagementStats {
                views: row.views,
                likes: row.likes,
                comments: row.comments,
                shares: row.shares,
                duration_seconds: row.duration_seconds,
            },
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CheckpointRow {
    pub run_id: String,
    pub target_count: i64,
    pub processed_count: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub skipped_count: i64,
    pub estimated_cost_usd: f64,
    pub last_processed_id: Option<String>,
    pub rate_limit_pauses: i64,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<CheckpointRow> for ProgressCheckpoint {
    type Error = anyhow::Error;

    fn try_from(row: CheckpointRow) -> Result<Self> {
        let run_id = Uuid::parse_str(&row.run_id)
            .with_context(|| format!("checkpoint has malformed run id {:?}", row.run_id))?;
        Ok(ProgressCheckpoint {
            run_id,
            target_count: count(row.target_count),
            processed_count: count(row.processed_count),
            success_count: count(row.success_count),
            error_count: count(row.error_count),
            skipped_count: count(row.skipped_count),
            estimated_cost_usd: row.estimated_cost_usd,
            last_processed_id: row.last_processed_id,
            rate_limit_pauses: count(row.rate_limit_pauses),
            updated_at: row.updated_at,
        })
    }
}

fn count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}
