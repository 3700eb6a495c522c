//! The hub: aggregation of entries and fan-out to observers
//!
//! A `Hub` owns the cancellation scope and task tracker of the process.
//! Every part is started through it so shutdown cancels and joins all of
//! them:
//! - aggregation (observer endpoint + aggregator stage), always
//! - ingestion from remote agents
//! - co-located capture (standalone mode)
//! - replay of recorded entries
//! - the fleet syncer and its event consumer (daemon mode)

pub mod aggregator;
pub mod broadcaster;
pub mod daemon;
pub mod ingest;
pub mod observer;
pub mod replay;

pub use aggregator::{Aggregator, AggregatorSnapshot, AggregatorStats};
pub use broadcaster::{ObserverId, StatusBroadcaster};
pub use ingest::{IngestServer, IngestStats};
pub use observer::ObserverServer;
pub use replay::{EntryReader, ReplaySummary};

use crate::config::HubConfig;
use crate::k8s::{ClusterApi, SyncerConfig, TapperSyncer};
use crate::{Result, TapscopeError};
use std::path::PathBuf;
use std::sync::Arc;
use tapscope_agent::capture::FeedListener;
use tapscope_agent::config::load_registry;
use tapscope_agent::delivery::delivery_channel;
use tapscope_agent::{
    run_filter, DeliveryConfig, DeliveryError, DeliverySummary, EntryFilter, LocalConnector,
    Pipeline, PipelineConfig, ServiceAddresses, UnknownPolicy,
};
use tapscope_common::Entry;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

/// Entries queued between producers and the aggregator
pub const ENTRY_QUEUE_SIZE: usize = 4096;

const LOCAL_DELIVERY_ADDRESS: &str = "local";

pub struct Hub {
    config: HubConfig,
    broadcaster: StatusBroadcaster,
    aggregator_stats: AggregatorStats,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Hub {
    pub fn new(config: HubConfig, cancel: CancellationToken) -> Self {
        Self {
            config,
            broadcaster: StatusBroadcaster::default(),
            aggregator_stats: AggregatorStats::default(),
            cancel,
            tracker: TaskTracker::new(),
        }
    }

    pub fn broadcaster(&self) -> StatusBroadcaster {
        self.broadcaster.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn service_addresses(&self) -> ServiceAddresses {
        ServiceAddresses::new(self.config.service_addresses.iter().copied())
    }

    /// Start the observer endpoint and the aggregator.
    ///
    /// Returns the sender every entry producer feeds.
    pub async fn start_aggregation(&mut self) -> Result<mpsc::Sender<Entry>> {
        ObserverServer::bind(
            &self.config.observer_addr,
            self.broadcaster.clone(),
            self.cancel.clone(),
            &self.tracker,
        )
        .await?;

        let (tx, rx) = mpsc::channel(ENTRY_QUEUE_SIZE);
        let aggregator = Aggregator::new(self.broadcaster.clone(), self.service_addresses());
        self.aggregator_stats = aggregator.stats();
        self.tracker.spawn(aggregator.run(rx, self.cancel.clone()));
        Ok(tx)
    }

    pub async fn start_ingest(&self, entries: mpsc::Sender<Entry>) -> Result<IngestServer> {
        let server = IngestServer::bind(
            &self.config.ingest_addr,
            entries,
            self.cancel.clone(),
            &self.tracker,
        )
        .await?;
        Ok(server)
    }

    /// Capture, dissect and filter in-process, delivering straight into
    /// `entries`.
    pub async fn start_capture(
        &self,
        entries: mpsc::Sender<Entry>,
    ) -> Result<JoinHandle<std::result::Result<DeliverySummary, DeliveryError>>> {
        let registry = load_registry(self.config.dissectors_dir.as_deref())?;
        info!(dissectors = ?registry.names(), "Dissector registry loaded");

        let feed =
            FeedListener::bind(&self.config.capture_addr, self.cancel.clone(), &self.tracker)
                .await?;

        let unknown_policy = if self.config.tag_unknown {
            UnknownPolicy::Tag
        } else {
            UnknownPolicy::Drop
        };
        let pipeline = Pipeline::new(
            registry,
            PipelineConfig::default().with_unknown_policy(unknown_policy),
        );

        let (dissected_tx, dissected_rx) = mpsc::channel(ENTRY_QUEUE_SIZE);
        let (queue, forwarder) = delivery_channel(
            DeliveryConfig::new(LOCAL_DELIVERY_ADDRESS),
            Arc::new(LocalConnector::new(entries)),
        );
        let filter = EntryFilter::new(&self.config.effective_filtering(), self.service_addresses());

        self.tracker
            .spawn(pipeline.run(feed, dissected_tx, self.cancel.clone()));
        self.tracker
            .spawn(run_filter(dissected_rx, queue, filter, self.cancel.clone()));
        Ok(self.tracker.spawn(forwarder.run(self.cancel.clone())))
    }

    pub fn start_replay(
        &self,
        dir: PathBuf,
        entries: mpsc::Sender<Entry>,
    ) -> JoinHandle<Result<ReplaySummary>> {
        self.tracker
            .spawn(EntryReader::new(dir).run(entries, self.cancel.clone()))
    }

    /// Start the fleet syncer and the consumer of its events
    pub async fn start_fleet<C: ClusterApi>(
        &self,
        cluster: Arc<C>,
    ) -> Result<JoinHandle<Result<()>>> {
        let syncer_config = SyncerConfig::from_hub_config(&self.config)?;
        let handle =
            TapperSyncer::start(cluster, syncer_config, self.cancel.clone(), &self.tracker)
                .await?;

        Ok(self.tracker.spawn(daemon::run_daemon(
            handle,
            self.broadcaster.clone(),
            self.config.reconciliation_error_policy,
            self.cancel.clone(),
        )))
    }

    /// Cancel every task and wait for all of them to finish
    pub async fn shutdown(self) -> AggregatorSnapshot {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.aggregator_stats.snapshot()
    }
}

/// Flatten a joined task result
pub fn joined<T>(result: std::result::Result<T, tokio::task::JoinError>) -> Result<T> {
    result.map_err(|e| TapscopeError::TaskFailed(e.to_string()))
}
