//! Aggregator stage: entries from ingestion, replay or the co-located
//! pipeline are filtered once more and published to observers.

use crate::hub::broadcaster::StatusBroadcaster;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tapscope_agent::{EntryFilter, ServiceAddresses};
use tapscope_common::{Entry, FilteringOptions};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct AggregatorStats {
    received: Arc<AtomicU64>,
    filtered: Arc<AtomicU64>,
    published: Arc<AtomicU64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AggregatorSnapshot {
    pub received: u64,
    pub filtered: u64,
    pub published: u64,
}

impl AggregatorStats {
    pub fn snapshot(&self) -> AggregatorSnapshot {
        AggregatorSnapshot {
            received: self.received.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
        }
    }
}

pub struct Aggregator {
    broadcaster: StatusBroadcaster,
    filter: EntryFilter,
    stats: AggregatorStats,
}

impl Aggregator {
    /// Drops outgoing traffic addressed to the hub's own `service` addresses
    pub fn new(broadcaster: StatusBroadcaster, service: ServiceAddresses) -> Self {
        Self {
            broadcaster,
            filter: EntryFilter::new(&FilteringOptions::default(), service),
            stats: AggregatorStats::default(),
        }
    }

    pub fn stats(&self) -> AggregatorStats {
        self.stats.clone()
    }

    /// Publish entries from `input` until it closes or `cancel` fires
    pub async fn run(
        self,
        mut input: mpsc::Receiver<Entry>,
        cancel: CancellationToken,
    ) -> AggregatorSnapshot {
        loop {
            let entry = tokio::select! {
                _ = cancel.cancelled() => break,
                entry = input.recv() => entry,
            };
            let Some(entry) = entry else {
                break;
            };
            self.stats.received.fetch_add(1, Ordering::Relaxed);

            if !self.filter.admits(&entry) {
                self.stats.filtered.fetch_add(1, Ordering::Relaxed);
                debug!(
                    protocol = %entry.protocol_name,
                    connection = %entry.connection_info,
                    "Filtered entry to hub service"
                );
                continue;
            }

            match self.broadcaster.publish_entry(entry) {
                Ok(_) => {
                    self.stats.published.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => warn!("Cannot publish entry: {}", e),
            }
        }

        let snapshot = self.stats.snapshot();
        info!(
            received = snapshot.received,
            filtered = snapshot.filtered,
            published = snapshot.published,
            "Aggregator stopped"
        );
        snapshot
    }
}
