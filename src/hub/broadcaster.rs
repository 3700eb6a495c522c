//! Fan-out of entries and status snapshots to connected observers
//!
//! Every observer has its own bounded queue of encoded, newline-terminated
//! JSON messages. Publishing never waits: a full queue loses that message
//! for that observer only, and closed queues are removed.

use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tapscope_common::{CodecError, Entry, TapStatus, WireMessage};
use tokio::sync::{mpsc, watch};
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

pub const DEFAULT_OBSERVER_QUEUE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Clone)]
pub struct StatusBroadcaster {
    observers: Arc<DashMap<ObserverId, mpsc::Sender<Bytes>>>,
    latest_status: Arc<watch::Sender<TapStatus>>,
    next_id: Arc<AtomicU64>,
    queue_capacity: usize,
    published: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_OBSERVER_QUEUE)
    }
}

fn encode_line(message: &WireMessage) -> Result<Bytes, CodecError> {
    let mut line = message.encode()?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}

impl StatusBroadcaster {
    pub fn new(queue_capacity: usize) -> Self {
        let (latest_status, _) = watch::channel(TapStatus::default());
        Self {
            observers: Arc::new(DashMap::new()),
            latest_status: Arc::new(latest_status),
            next_id: Arc::new(AtomicU64::new(0)),
            queue_capacity: queue_capacity.max(1),
            published: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register an observer. The latest status is already queued for it.
    pub fn subscribe(&self) -> Result<(ObserverId, mpsc::Receiver<Bytes>), CodecError> {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));

        // holding the borrow keeps publish_status out until the observer is registered
        let status = self.latest_status.borrow();
        let line = encode_line(&WireMessage::Status(status.clone()))?;
        if tx.try_send(line).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.observers.insert(id, tx);
        drop(status);

        debug!(observer = id.0, "Observer subscribed");
        Ok((id, rx))
    }

    pub fn unsubscribe(&self, id: ObserverId) {
        if self.observers.remove(&id).is_some() {
            debug!(observer = id.0, "Observer unsubscribed");
        }
    }

    /// Queue `message` for every observer; returns how many accepted it
    pub fn publish(&self, message: &WireMessage) -> Result<usize, CodecError> {
        let line = encode_line(message)?;
        let mut delivered = 0;

        self.observers.retain(|id, tx| match tx.try_send(line.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(observer = id.0, "Observer queue full, message dropped");
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!(observer = id.0, "Observer gone");
                false
            }
        });

        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(delivered)
    }

    pub fn publish_entry(&self, entry: Entry) -> Result<usize, CodecError> {
        self.publish(&WireMessage::entry(entry))
    }

    /// Record `status` as the latest snapshot and push it to observers.
    ///
    /// Runs under the status write lock, so concurrent status updates reach
    /// every observer in the order they were recorded.
    pub fn publish_status(&self, status: TapStatus) -> Result<usize, CodecError> {
        let message = WireMessage::Status(status);
        let mut result = Ok(0);
        self.latest_status.send_modify(|latest| {
            if let WireMessage::Status(status) = &message {
                *latest = status.clone();
            }
            result = self.publish(&message);
        });
        result
    }

    pub fn latest_status(&self) -> TapStatus {
        self.latest_status.borrow().clone()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Messages lost to full observer queues
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
