use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use content_enricher::config;
use content_enricher::db;
use content_enricher::model::WorkItem;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Load newline-delimited JSON work items into the backlog"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// JSONL file with one work item per line
    #[arg(long)]
    input: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/enricher.db", cfg.app.resolved_data_dir()));
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let file = tokio::fs::File::open(&args.input)
        .await
        .with_context(|| format!("failed to open {}", args.input.display()))?;
    let mut lines = BufReader::new(file).lines();

    let mut line_no = 0usize;
    let mut imported = 0usize;
    let mut rejected = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let item: WorkItem = match serde_json::from_str(&line) {
            Ok(item) => item,
            Err(err) => {
                warn!(line = line_no, %err, "skipping malformed record");
                rejected += 1;
                continue;
            }
        };
        if item.external_id.trim().is_empty() {
            warn!(line = line_no, "skipping record without external_id");
            rejected += 1;
            continue;
        }
        db::upsert_work_item(&pool, &item).await?;
        imported += 1;
    }

    info!(imported, rejected, input = %args.input.display(), "backlog import finished");
    Ok(())
}
