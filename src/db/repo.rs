use super::model::{CheckpointRow, WorkItemRow};
use crate::checkpoint::ProgressCheckpoint;
use crate::model::{AnalysisResult, WorkItem};
use anyhow::{Context, Result};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::HashSet;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    // An in-memory database exists per connection, so keep it to one.
    let max_connections = if normalized.starts_with("sqlite::memory") { 1 } else { 5 };
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(&normalized)
        .await
        .with_context(|| format!("failed to open database {normalized}"))?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/`, ensure the parent
/// directory exists and ask sqlx to create the file. In-memory URLs pass through.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let query = match query {
        Some(q) if q.contains("mode=") => q.to_string(),
        Some(q) => format!("{q}&mode=rwc"),
        None => "mode=rwc".to_string(),
    };
    format!("sqlite://{path}?{query}")
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Insert or refresh a backlog item keyed by its external id. Returns the
/// internal id, which never changes for an existing item.
#[instrument(skip_all, fields(external_id = %item.external_id))]
pub async fn upsert_work_item(pool: &Pool, item: &WorkItem) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO work_items \
            (external_id, title, caption, transcript, video_url, thumbnail_url, \
             views, likes, comments, shares, duration_seconds) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(external_id) DO UPDATE SET \
            title = excluded.title, \
            caption = excluded.caption, \
            transcript = excluded.transcript, \
            video_url = excluded.video_url, \
            thumbnail_url = excluded.thumbnail_url, \
            views = excluded.views, \
            likes = excluded.likes, \
            comments = excluded.comments, \
            shares = excluded.shares, \
            duration_seconds = excluded.duration_seconds, \
            updated_at = CURRENT_TIMESTAMP \
         RETURNING id",
    )
    .bind(&item.external_id)
    .bind(&item.title)
    .bind(&item.caption)
    .bind(&item.transcript)
    .bind(&item.video_url)
    .bind(&item.thumbnail_url)
    .bind(item.stats.views)
    .bind(item.stats.likes)
    .bind(item.stats.comments)
    .bind(item.stats.shares)
    .bind(item.stats.duration_seconds)
    .fetch_one(pool)
    .await
    .context("failed to upsert work item")?;
    Ok(id)
}

/// Backlog page in insertion order, strictly after the item whose external
/// id is `after_id`, leaving out everything in `exclude_ids`.
#[instrument(skip_all, fields(after_id = after_id.unwrap_or(""), limit = limit))]
pub async fn fetch_backlog(
    pool: &Pool,
    after_id: Option<&str>,
    limit: u32,
    exclude_ids: &HashSet<String>,
) -> Result<Vec<WorkItem>> {
    let excluded = serde_json::to_string(exclude_ids)?;
    let rows: Vec<WorkItemRow> = sqlx::query_as(
        "SELECT id, external_id, title, caption, transcript, video_url, thumbnail_url, \
                views, likes, comments, shares, duration_seconds \
         FROM work_items \
         WHERE id > COALESCE((SELECT id FROM work_items WHERE external_id = ?), 0) \
           AND external_id NOT IN (SELECT value FROM json_each(?)) \
         ORDER BY id ASC \
         LIMIT ?",
    )
    .bind(after_id)
    .bind(excluded)
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await
    .context("failed to fetch backlog page")?;
    Ok(rows.into_iter().map(WorkItem::from).collect())
}

#[instrument(skip_all)]
pub async fn list_analyzed_external_ids(pool: &Pool) -> Result<Vec<String>> {
    let ids: Vec<String> =
        sqlx::query_scalar("SELECT external_id FROM analysis_results ORDER BY id ASC")
            .fetch_all(pool)
            .await
            .context("failed to list analyzed items")?;
    Ok(ids)
}

/// Store one analysis. A second result for the same item is ignored.
#[instrument(skip_all, fields(external_id = %result.external_id))]
pub async fn insert_analysis_result(pool: &Pool, result: &AnalysisResult) -> Result<()> {
    let payload = serde_json::to_string(&result.payload)?;
    sqlx::query(
        "INSERT INTO analysis_results \
            (work_item_id, external_id, primary_source, payload, raw_input, model, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(external_id) DO NOTHING",
    )
    .bind(result.work_item_id)
    .bind(&result.external_id)
    .bind(result.primary_source.as_str())
    .bind(payload)
    .bind(&result.raw_input)
    .bind(&result.model)
    .bind(result.created_at)
    .execute(pool)
    .await
    .context("failed to insert analysis result")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn count_analysis_results(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM analysis_results")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[instrument(skip_all, fields(processed = checkpoint.processed_count))]
pub async fn insert_checkpoint(pool: &Pool, checkpoint: &ProgressCheckpoint) -> Result<()> {
    sqlx::query(
        "INSERT INTO progress_checkpoints \
            (run_id, target_count, processed_count, success_count, error_count, skipped_count, \
             estimated_cost_usd, last_processed_id, rate_limit_pauses, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(checkpoint.run_id.to_string())
    .bind(checkpoint.target_count as i64)
    .bind(checkpoint.processed_count as i64)
    .bind(checkpoint.success_count as i64)
    .bind(checkpoint.error_count as i64)
    .bind(checkpoint.skipped_count as i64)
    .bind(checkpoint.estimated_cost_usd)
    .bind(&checkpoint.last_processed_id)
    .bind(checkpoint.rate_limit_pauses as i64)
    .bind(checkpoint.updated_at)
    .execute(pool)
    .await
    .context("failed to insert checkpoint")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn load_latest_checkpoint(pool: &Pool) -> Result<Option<ProgressCheckpoint>> {
    let row: Option<CheckpointRow> = sqlx::query_as(
        "SELECT run_id, target_count, processed_count, success_count, error_count, \
                skipped_count, estimated_cost_usd, last_processed_id, rate_limit_pauses, updated_at \
         FROM progress_checkpoints ORDER BY id DESC LIMIT 1",
    )
    .fetch_optional(pool)
    .await
    .context("failed to load checkpoint")?;
    row.map(ProgressCheckpoint::try_from).transpose()
}
