// float_cmp: only in tests where assert_eq! on f64 is intentional.
#![cfg_attr(test, allow(clippy::float_cmp))]

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{self, EnvFilter};

use quantback::config::Config;
use quantback::data::sqlite::SqliteStore;
use quantback::job::{Coordinator, JobOutcome, JobRequest, LogNotifier};
use quantback::report::store::ReportStore;

/// Run one backtest described by a TOML job file against the configured
/// cache database and print the persisted report as JSON.
#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let Some(job_path) = args.next() else {
        bail!("usage: quantback <job.toml> [config.toml]");
    };
    let config = match args.next() {
        Some(path) => Config::load(Path::new(&path))?,
        None => Config::from_env(),
    };

    let request = load_request(Path::new(&job_path))?;
    let db_path = PathBuf::from(&config.db_url);
    let market = Arc::new(SqliteStore::open(&db_path)?);
    let entities = Arc::new(SqliteStore::open(&db_path)?);
    let reports = Arc::new(ReportStore::open(&db_path)?);

    let coordinator = Coordinator::new(
        config,
        market,
        entities,
        Arc::clone(&reports),
        Arc::new(LogNotifier),
    );

    let cancel = CancellationToken::new();
    let guard = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("cancellation requested");
        guard.cancel();
    });

    match coordinator.run(request, cancel).await {
        Ok(JobOutcome::Completed { report_id }) => {
            let row = reports
                .fetch(&report_id)?
                .context("completed report row missing")?;
            let charts = reports.chart_json(&report_id)?;
            let artifact = serde_json::json!({ "report": row, "charts": charts });
            println!("{}", serde_json::to_string_pretty(&artifact)?);
            Ok(())
        }
        Ok(JobOutcome::Cancelled) => {
            tracing::info!("backtest cancelled, nothing persisted");
            Ok(())
        }
        Err(e) => bail!("backtest failed: {e}"),
    }
}

fn load_request(path: &Path) -> Result<JobRequest> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read job file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("failed to parse job file {}", path.display()))
}
