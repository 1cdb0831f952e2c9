use anyhow::{Context, Result};
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use websentinel::{
    config::{Cli, Config, FetchMode},
    fetcher::fetcher_from_config,
    monitor::{MonitorCycle, MonitorOptions},
    notifier::notifier_from_config,
    scheduler::{SchedulerOptions, spawn_scheduler},
    snapshot::JsonSnapshotStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is normal; real env vars and flags still apply.
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = Cli::parse()
        .into_config()
        .context("invalid configuration")?;
    run_monitor(config).await
}

async fn run_monitor(config: Config) -> Result<()> {
    let store = JsonSnapshotStore::open(&config.snapshot_path).with_context(|| {
        format!(
            "prepare snapshot store at {}",
            config.snapshot_path.display()
        )
    })?;
    let fetcher = fetcher_from_config(&config).context("build content fetcher")?;
    let notifier = notifier_from_config(&config).context("build notifier")?;

    let cycle = Arc::new(MonitorCycle::new(
        fetcher.clone(),
        notifier.clone(),
        Box::new(store),
        MonitorOptions {
            target_url: config.target_url.clone(),
            fetch_timeout: config.fetch_timeout,
        },
    ));

    info!(
        target_url = %config.target_url,
        selector = %config.target_selector,
        snapshot_path = %config.snapshot_path.display(),
        interval_secs = config.check_interval.as_secs(),
        fetcher = fetcher.name(),
        notifier = notifier.name(),
        "websentinel monitor started"
    );

    if config.fetch_mode == FetchMode::Http {
        warn!("http fetch mode reads the served HTML; content added by scripts is not watched");
    }

    let (status, task) = spawn_scheduler(cycle, SchedulerOptions::from_config(&config));

    tokio::select! {
        res = task => {
            res.context("monitor task failed")?;
            anyhow::bail!("monitor task exited unexpectedly");
        }
        _ = shutdown_signal() => {
            let status = status.snapshot().await;
            info!(
                cycles_run = status.cycles_run,
                last_outcome = status.last_outcome.map(|o| o.as_str()),
                last_run_at = ?status.last_run_at,
                last_change_at = ?status.last_change_at,
                consecutive_failures = status.consecutive_failures,
                last_error = status.last_error.as_deref(),
                "monitor stopped by user"
            );
        }
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).compact().init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
