use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use alert_sync::{
    EngineDeps, HttpAlertApi, LogNotifier, SyncConfig, SyncEngine, UnavailableFeed,
};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Session identity (email) whose alerts are mirrored
    #[arg(long)]
    identity: String,

    /// Path to a TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Base URL of the alert API (overrides ALERT_SYNC_API_URL)
    #[arg(long)]
    api_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = SyncConfig::load(args.config.as_deref())?;
    if let Some(url) = args.api_url {
        config.api_base_url = url;
        config.validate()?;
    }
    info!(
        api = %config.api_base_url,
        max_retries = config.max_retries,
        poll_interval_secs = config.poll_interval.as_secs(),
        "starting alert sync"
    );

    let api = Arc::new(HttpAlertApi::new(&config).context("building alert API client")?);
    let deps = EngineDeps {
        identity: api.clone(),
        alerts: api,
        feed: Arc::new(UnavailableFeed),
        notifier: Arc::new(LogNotifier),
    };
    let engine = SyncEngine::spawn(config, deps, args.identity);

    let mut updates = engine.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                info!(
                    connection = %snapshot.connection,
                    unread = snapshot.unread_count,
                    total = snapshot.alerts.len(),
                    polling = snapshot.polling,
                    failures = snapshot.failure_count,
                    "engine state"
                );
            }
        }
    }

    let report = engine.shutdown().await;
    info!(remaining_tasks = report.remaining_tasks, "alert sync stopped");
    Ok(())
}
