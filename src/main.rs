// src/main.rs

use anyhow::{bail, Context, Result};
use clap::Parser;
use odm_batch::config::load_json;
use odm_batch::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Download a batch of files and verify each against its checksum.
#[derive(Debug, Parser)]
#[command(name = "odm-batch", version)]
struct Cli {
    /// JSON array of descriptors: `[{"url": ..., "destination": ..., "fileSize": ..., "checksum": ...}]`
    descriptors: PathBuf,
    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Directory destinations are resolved against.
    #[arg(short, long)]
    root: Option<PathBuf>,
    /// md5, sha1, sha256 or sha512.
    #[arg(short, long, value_parser = parse_algorithm)]
    algorithm: Option<HashAlgorithm>,
    /// Cap on simultaneous transfers.
    #[arg(long)]
    max_concurrent: Option<usize>,
    /// SQLite file used to resume transfers across runs.
    #[arg(long)]
    state_db: Option<PathBuf>,
}

fn parse_algorithm(raw: &str) -> Result<HashAlgorithm, String> {
    serde_json::from_value(serde_json::Value::String(raw.to_ascii_lowercase()))
        .map_err(|_| format!("unknown hash algorithm `{}`", raw))
}

struct ConsoleUi {
    done: Arc<Notify>,
}

impl UiObserver for ConsoleUi {
    fn on_all_complete(&self) {
        println!("[DONE] every file downloaded and verified");
        self.done.notify_one();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("odm_batch=info")))
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => load_json::<AppConfig>(path).await?,
        None => AppConfig::default(),
    };
    if let Some(root) = cli.root {
        config.manager.download_root = root;
    }
    if let Some(algorithm) = cli.algorithm {
        config.manager.hash_algorithm = algorithm;
    }
    if cli.max_concurrent.is_some() {
        config.transport.max_concurrent_transfers = cli.max_concurrent;
    }
    if cli.state_db.is_some() {
        config.transport.state_db = cli.state_db;
    }

    let descriptors: Vec<TaskDescriptor> = load_json(&cli.descriptors)
        .await
        .with_context(|| format!("reading descriptors from {}", cli.descriptors.display()))?;
    if descriptors.is_empty() {
        bail!("no descriptors in {}", cli.descriptors.display());
    }

    let (transport, events) = HttpTransport::new(config.transport.clone()).await?;
    let manager = DownloadManager::new(config.manager.clone(), Arc::new(transport));

    let done = Arc::new(Notify::new());
    let (dispatcher, _ui_loop) = UiDispatcher::spawn();
    let hooks = UiHooks::new()
        .on_aggregate_progress(|progress| info!("overall progress {:.1}%", progress * 100.0))
        .on_task_complete(|task| println!("[OK] {}", task.destination.display()))
        .on_task_error(|task| println!("[ERROR] {}: {}", task.url, task.full_error_description()));
    manager
        .set_ui_observer(Arc::new(ConsoleUi { done: done.clone() }), hooks, dispatcher.clone())
        .await;

    let event_loop = manager.spawn_event_loop(events);
    let tasks = manager.download_batch(&descriptors).await;
    println!("Downloading {} files into {}", tasks.len(), config.manager.download_root.display());

    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    let outcome = loop {
        tokio::select! {
            _ = done.notified() => break Ok(()),
            _ = tokio::signal::ctrl_c() => {
                let suspended = manager.suspend_all_ongoing_downloads().await;
                println!("Interrupted; suspended {} transfers", suspended);
                break Ok(());
            }
            _ = ticker.tick() => {
                if let Some(report) = manager.download_rate_and_remaining_time().await {
                    println!("{} - {} remaining", report.rate, report.remaining);
                }
                let tasks = manager.downloading_tasks().await;
                let settled = tasks
                    .iter()
                    .all(|task| matches!(task.status(), TaskStatus::Completed | TaskStatus::Failed { .. }));
                if settled && tasks.iter().any(|task| !task.completed) {
                    let failed = tasks.iter().filter(|task| !task.completed).count();
                    break Err(anyhow::anyhow!("{} of {} downloads failed", failed, tasks.len()));
                }
            }
        }
    };

    dispatcher.flush().await;
    event_loop.abort();
    outcome
}
