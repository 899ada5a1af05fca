mod args;
mod handlers;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use jobforge_infra::config::StoreConfig;
use jobforge_infra::jobs::{QueueManager, RetryBackoff, Worker, WorkerSummary};

use crate::args::Args;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging
    jobforge_observability::init_with(args.debug);

    // Ctrl-C drains the worker: the current job finishes, nothing new is claimed.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            };
            info!("shutdown requested");
            cancel.cancel();
        });
    }

    match begin(args, cancel).await {
        Ok(summary) => {
            info!(
                processed = summary.processed,
                succeeded = summary.succeeded,
                failed = summary.failed,
                dead_lettered = summary.dead_lettered,
                "worker exited cleanly"
            );
            ExitCode::SUCCESS
        }
        Err(error) => {
            error!(error = format!("{error:#}"), "worker failed to start");
            ExitCode::FAILURE
        }
    }
}

async fn begin(args: Args, cancel: CancellationToken) -> Result<WorkerSummary> {
    let store_config = StoreConfig::from_env().context("invalid store configuration")?;
    let backoff = RetryBackoff::from_env().context("invalid retry configuration")?;
    let store = store_config
        .open(backoff)
        .await
        .context("failed to open job store")?;

    let manager = Arc::new(QueueManager::new(store));
    let registry = Arc::new(handlers::registry());
    let worker = Worker::new(manager, registry, args.worker_config()).with_cancellation(cancel);

    Ok(worker.run().await)
}
