use crate::cli::Commands;
use crate::config::HubConfig;
use crate::hub::{joined, Hub};
use crate::k8s::{KubeCluster, WorkloadSpec};
use crate::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub async fn handle_command(command: Commands, config: HubConfig) -> Result<()> {
    let cancel = CancellationToken::new();

    match command {
        Commands::Standalone => handle_standalone(config, cancel).await,
        Commands::Hub { daemon } => handle_hub(config, daemon, cancel).await,
        Commands::Replay { dir } => handle_replay(config, dir, cancel).await,
    }
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        warn!("Cannot listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

async fn finish(hub: Hub) {
    let stats = hub.shutdown().await;
    info!(
        received = stats.received,
        published = stats.published,
        "tapscope stopped"
    );
}

async fn handle_standalone(config: HubConfig, cancel: CancellationToken) -> Result<()> {
    info!("Running standalone: capture and aggregation in one process");
    let exhaustion_policy = config.delivery_exhaustion_policy;

    let mut hub = Hub::new(config, cancel);
    let entries = hub.start_aggregation().await?;
    let mut delivery = hub.start_capture(entries).await?;

    let outcome = tokio::select! {
        _ = shutdown_signal() => None,
        finished = &mut delivery => Some(finished),
    };
    finish(hub).await;

    if let Some(finished) = outcome {
        exhaustion_policy.apply(joined(finished)?)?;
    }
    Ok(())
}

async fn handle_hub(config: HubConfig, daemon: bool, cancel: CancellationToken) -> Result<()> {
    let daemon = daemon || config.daemon_mode;
    info!(daemon, "Running hub");

    let mut hub = Hub::new(config.clone(), cancel);
    let entries = hub.start_aggregation().await?;
    hub.start_ingest(entries).await?;

    if !daemon {
        shutdown_signal().await;
        finish(hub).await;
        return Ok(());
    }

    let cluster = match KubeCluster::try_default(WorkloadSpec::from_config(&config)).await {
        Ok(cluster) => Arc::new(cluster),
        Err(e) => {
            finish(hub).await;
            return Err(e);
        }
    };
    let mut fleet = match hub.start_fleet(cluster).await {
        Ok(fleet) => fleet,
        Err(e) => {
            finish(hub).await;
            return Err(e);
        }
    };

    let outcome = tokio::select! {
        _ = shutdown_signal() => None,
        finished = &mut fleet => Some(finished),
    };
    finish(hub).await;

    match outcome {
        Some(finished) => joined(finished)?,
        None => Ok(()),
    }
}

async fn handle_replay(config: HubConfig, dir: PathBuf, cancel: CancellationToken) -> Result<()> {
    info!(dir = %dir.display(), "Running replay");

    let mut hub = Hub::new(config, cancel);
    let entries = hub.start_aggregation().await?;
    let replay = hub.start_replay(dir, entries);

    let finished = tokio::select! {
        _ = shutdown_signal() => None,
        finished = replay => Some(finished),
    };
    let Some(finished) = finished else {
        finish(hub).await;
        return Ok(());
    };

    match joined(finished).and_then(|summary| summary) {
        Ok(summary) => {
            info!(
                files = summary.files,
                entries = summary.entries,
                "Replay complete, serving observers until interrupted"
            );
            shutdown_signal().await;
            finish(hub).await;
            Ok(())
        }
        Err(e) => {
            finish(hub).await;
            Err(e)
        }
    }
}
