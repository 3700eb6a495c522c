//! tapscope-agent - capture-only node agent
//!
//! The agent runs on each tapped node and:
//! - Loads the dissector registry
//! - Accepts capture events from the node's capture primitive
//! - Dissects connections into entries and filters them
//! - Streams entries to the hub, reconnecting on broken pipes

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::sync::Arc;
use tapscope_agent::capture::FeedListener;
use tapscope_agent::config::{load_registry, AgentArgs, AgentConfig};
use tapscope_agent::delivery::{delivery_channel, ExhaustionPolicy, TcpConnector};
use tapscope_agent::filter::run_filter;
use tapscope_agent::{EntryFilter, Pipeline, ServiceAddresses};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Entries between the pipeline and the filter stage
const ENTRY_QUEUE_SIZE: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    let args = AgentArgs::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let config = AgentConfig::from_args(args).context("Invalid agent configuration")?;

    info!(
        "tapscope-agent starting on node {}, hub at {}",
        config.node_name,
        config.hub_address()
    );
    if let Some(addresses) = config.tap_targets.addresses() {
        info!("Filtering for the following addresses: {:?}", addresses);
    }

    let registry = load_registry(config.dissectors_dir.as_deref())
        .context("Failed to load dissectors")?;

    let service = match ServiceAddresses::resolve(config.hub_address()).await {
        Ok(service) => service,
        Err(e) => {
            warn!("Could not resolve hub address {}: {}", config.hub_address(), e);
            ServiceAddresses::default()
        }
    };

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    let feed = FeedListener::bind(&config.capture_addr, cancel.clone(), &tracker).await?;

    let (entries_tx, entries_rx) = mpsc::channel(ENTRY_QUEUE_SIZE);
    let (queue, forwarder) = delivery_channel(config.delivery.clone(), Arc::new(TcpConnector));
    let delivery_metrics = forwarder.metrics();

    let pipeline = Pipeline::new(registry, config.pipeline.clone())
        .with_tap_targets(config.tap_targets.clone());
    let stats = pipeline.stats();

    tracker.spawn(pipeline.run(feed, entries_tx, cancel.clone()));
    tracker.spawn(run_filter(
        entries_rx,
        queue,
        EntryFilter::new(&config.filtering, service),
        cancel.clone(),
    ));
    let mut delivery = tracker.spawn(forwarder.run(cancel.clone()));

    info!("tapscope-agent running. Press Ctrl+C to exit.");

    let outcome = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received");
            None
        }
        finished = &mut delivery => Some(finished),
    };

    cancel.cancel();
    tracker.close();
    tracker.wait().await;

    let pipeline_stats = stats.snapshot();
    let delivery_stats = delivery_metrics.snapshot();
    info!(
        "tapscope-agent stopped: {} connections, {} entries dissected, {} sent, {} dropped",
        pipeline_stats.connections_opened,
        pipeline_stats.entries_emitted,
        delivery_stats.sent,
        delivery_stats.dropped
    );

    if let Some(finished) = outcome {
        let result = finished.context("Delivery task panicked")?;
        ExhaustionPolicy::Fatal
            .apply(result)
            .context("Delivery to hub failed")?;
    }

    Ok(())
}
