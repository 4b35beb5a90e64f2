use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use content_enricher::config;
use content_enricher::db::{self, SqliteStore};
use content_enricher::inference::HttpInferenceClient;
use content_enricher::media::{HttpMediaAnalyzer, MediaAnalyzer, NoMediaAnalyzer};
use content_enricher::orchestrator::{Collaborators, Orchestrator, RunSettings};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Enrich the content backlog with structured analyses and exit when done"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Override app.target_item_count for this run
    #[arg(long)]
    target: Option<u64>,

    /// Override app.concurrency for this run (1-20)
    #[arg(long)]
    concurrency: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let mut cfg = config::load(Some(&args.config))?;
    if let Some(target) = args.target {
        cfg.app.target_item_count = target;
    }
    if let Some(concurrency) = args.concurrency {
        cfg.app.concurrency = concurrency;
    }
    config::validate(&cfg)?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/enricher.db", cfg.app.resolved_data_dir()));
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;
    let store = Arc::new(SqliteStore::new(pool));

    let media: Arc<dyn MediaAnalyzer> = match &cfg.media.endpoint {
        Some(endpoint) => Arc::new(HttpMediaAnalyzer::from_endpoint(endpoint)?),
        None => {
            info!("no media endpoint configured; derived summaries disabled");
            Arc::new(NoMediaAnalyzer)
        }
    };

    let orchestrator = Orchestrator::new(
        RunSettings::from_config(&cfg),
        Collaborators {
            work_source: store.clone(),
            result_store: store,
            inference: Arc::new(HttpInferenceClient::from_config(&cfg.inference)?),
            media,
        },
    );

    let stop = orchestrator.stop_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing the current item");
            stop.raise();
        }
    });

    match orchestrator.run().await {
        Ok(report) => {
            let cp = &report.checkpoint;
            info!(
                run_id = %report.run_id,
                processed = cp.processed_count,
                success = cp.success_count,
                error = cp.error_count,
                skipped = cp.skipped_count,
                cost_usd = cp.estimated_cost_usd,
                stopped_early = report.stopped_early,
                "run complete"
            );
            for item in &report.errors {
                warn!(external_id = %item.external_id, message = %item.message, "item not analyzed");
            }
            Ok(())
        }
        Err(err) => {
            error!(%err, "run failed");
            Err(err.into())
        }
    }
}
