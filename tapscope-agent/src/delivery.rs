//! Delivery of filtered entries to the hub
//!
//! Entries are offered to a bounded `DeliveryQueue` by the filter stage and
//! drained by a single `Forwarder` that owns the duplex channel to the hub.
//!
//! # Protocol
//!
//! ```text
//! [4 bytes: length (big-endian)][N bytes: JSON WireMessage]
//! ```
//!
//! # Failure handling
//!
//! - broken-pipe-class send errors trigger a reconnect of up to
//!   `retry_attempts` attempts spaced by `retry_delay`
//! - the entry whose send failed is not resent, and nothing sent before the
//!   fault is replayed (at-most-once)
//! - exhausted retries end the delivery session with
//!   `DeliveryError::RetriesExhausted`
//! - while the forwarder reconnects, new entries wait in the queue; once it
//!   is full they are dropped and counted

use async_trait::async_trait;
use bytes::Bytes;
use futures::SinkExt;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tapscope_common::{CodecError, Entry, WireMessage};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::{FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_RETRY_ATTEMPTS: usize = 10;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_BUFFER_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Hub ingest address (host:port)
    pub address: String,
    /// Connection attempts per (re)connect before giving up
    pub retry_attempts: usize,
    /// Fixed wait between attempts
    pub retry_delay: Duration,
    /// Bound on a single connection attempt
    pub handshake_timeout: Duration,
    /// Entries buffered while the channel is down
    pub buffer_capacity: usize,
}

impl DeliveryConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }

    #[must_use]
    pub fn with_retry_attempts(mut self, attempts: usize) -> Self {
        self.retry_attempts = attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity.max(1);
        self
    }
}

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("connection failed to {address}: {source}")]
    Connection {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection to {address} timed out after {timeout:?}")]
    HandshakeTimeout { address: String, timeout: Duration },

    #[error("send failed: {0}")]
    Send(#[from] std::io::Error),

    #[error(transparent)]
    Encode(#[from] CodecError),

    #[error("all {attempts} connection attempts to {address} failed: {last_error}")]
    RetriesExhausted {
        address: String,
        attempts: usize,
        last_error: String,
    },
}

impl DeliveryError {
    /// Whether the channel is gone and must be re-established
    pub fn is_broken_pipe(&self) -> bool {
        match self {
            DeliveryError::Send(e) => matches!(
                e.kind(),
                ErrorKind::BrokenPipe
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::NotConnected
                    | ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// What the process does when a delivery session ends with exhausted retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExhaustionPolicy {
    /// Propagate the error; the process exits non-zero
    #[default]
    #[serde(rename = "fatal")]
    Fatal,
    /// Log the error and carry on without delivery
    #[serde(rename = "log")]
    LogAndStop,
}

impl ExhaustionPolicy {
    pub fn apply(self, result: Result<DeliverySummary, DeliveryError>) -> Result<(), DeliveryError> {
        match (self, result) {
            (_, Ok(summary)) => {
                debug!("Delivery session ended: {:?}", summary);
                Ok(())
            }
            (ExhaustionPolicy::Fatal, Err(e)) => Err(e),
            (ExhaustionPolicy::LogAndStop, Err(e)) => {
                error!("Delivery stopped: {}", e);
                Ok(())
            }
        }
    }
}

/// One established duplex channel to the hub
#[async_trait]
pub trait EntryChannel: Send {
    async fn send(&mut self, message: &WireMessage) -> Result<(), DeliveryError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        address: &str,
        handshake_timeout: Duration,
    ) -> Result<Box<dyn EntryChannel>, DeliveryError>;
}

/// Connects to the hub over TCP
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        address: &str,
        handshake_timeout: Duration,
    ) -> Result<Box<dyn EntryChannel>, DeliveryError> {
        let stream = match timeout(handshake_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(DeliveryError::Connection {
                    address: address.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(DeliveryError::HandshakeTimeout {
                    address: address.to_string(),
                    timeout: handshake_timeout,
                })
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on {}: {}", address, e);
        }

        Ok(Box::new(FramedChannel {
            frames: FramedWrite::new(stream, LengthDelimitedCodec::new()),
        }))
    }
}

struct FramedChannel {
    frames: FramedWrite<TcpStream, LengthDelimitedCodec>,
}

#[async_trait]
impl EntryChannel for FramedChannel {
    async fn send(&mut self, message: &WireMessage) -> Result<(), DeliveryError> {
        let payload = message.encode()?;
        self.frames.send(Bytes::from(payload)).await?;
        Ok(())
    }
}

/// Co-located delivery: entries go straight into the hub's ingest channel
#[derive(Debug, Clone)]
pub struct LocalConnector {
    ingest: mpsc::Sender<Entry>,
}

impl LocalConnector {
    pub fn new(ingest: mpsc::Sender<Entry>) -> Self {
        Self { ingest }
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(
        &self,
        address: &str,
        _handshake_timeout: Duration,
    ) -> Result<Box<dyn EntryChannel>, DeliveryError> {
        if self.ingest.is_closed() {
            return Err(DeliveryError::Connection {
                address: address.to_string(),
                source: std::io::Error::new(ErrorKind::ConnectionRefused, "hub ingest closed"),
            });
        }
        Ok(Box::new(LocalChannel {
            ingest: self.ingest.clone(),
        }))
    }
}

struct LocalChannel {
    ingest: mpsc::Sender<Entry>,
}

#[async_trait]
impl EntryChannel for LocalChannel {
    async fn send(&mut self, message: &WireMessage) -> Result<(), DeliveryError> {
        let WireMessage::TappedEntry(entry) = message else {
            return Ok(());
        };
        self.ingest
            .send(entry.as_ref().clone())
            .await
            .map_err(|_| std::io::Error::new(ErrorKind::BrokenPipe, "hub ingest closed").into())
    }
}

/// Delivery counters
#[derive(Debug, Default)]
pub struct DeliveryMetrics {
    entries_sent: AtomicU64,
    entries_failed: AtomicU64,
    entries_dropped: AtomicU64,
    reconnects: AtomicU64,
}

/// Point-in-time snapshot of delivery counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeliverySummary {
    pub sent: u64,
    pub failed: u64,
    pub dropped: u64,
    pub reconnects: u64,
}

impl DeliveryMetrics {
    pub fn snapshot(&self) -> DeliverySummary {
        DeliverySummary {
            sent: self.entries_sent.load(Ordering::Relaxed),
            failed: self.entries_failed.load(Ordering::Relaxed),
            dropped: self.entries_dropped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Producer side of the delivery buffer
#[derive(Debug, Clone)]
pub struct DeliveryQueue {
    sender: mpsc::Sender<Entry>,
    metrics: Arc<DeliveryMetrics>,
}

impl DeliveryQueue {
    /// Enqueue without blocking. Returns false if the entry was dropped.
    pub fn offer(&self, entry: Entry) -> bool {
        match self.sender.try_send(entry) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(entry)) => {
                let dropped = self.metrics.entries_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    warn!(
                        "Delivery buffer full, dropped {} entries so far (last on {})",
                        dropped, entry.connection_info
                    );
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.metrics.entries_dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Create the bounded queue and the forwarder draining it
pub fn delivery_channel(
    config: DeliveryConfig,
    connector: Arc<dyn Connector>,
) -> (DeliveryQueue, Forwarder) {
    let (sender, receiver) = mpsc::channel(config.buffer_capacity.max(1));
    let metrics = Arc::new(DeliveryMetrics::default());

    let queue = DeliveryQueue {
        sender,
        metrics: Arc::clone(&metrics),
    };
    let forwarder = Forwarder {
        config,
        connector,
        receiver,
        metrics,
    };
    (queue, forwarder)
}

/// Connect with up to `retry_attempts` attempts spaced by `retry_delay`.
///
/// Returns `Ok(None)` if cancelled while waiting.
pub async fn connect_with_retry(
    connector: &dyn Connector,
    config: &DeliveryConfig,
    cancel: &CancellationToken,
) -> Result<Option<Box<dyn EntryChannel>>, DeliveryError> {
    let attempts = config.retry_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        let result = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            result = connector.connect(&config.address, config.handshake_timeout) => result,
        };

        match result {
            Ok(channel) => {
                info!("Connected to hub at {} (attempt {})", config.address, attempt);
                return Ok(Some(channel));
            }
            Err(e) => {
                warn!(
                    "Connection attempt {}/{} to {} failed: {}",
                    attempt, attempts, config.address, e
                );
                last_error = e.to_string();
            }
        }

        if attempt < attempts {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(config.retry_delay) => {}
            }
        }
    }

    Err(DeliveryError::RetriesExhausted {
        address: config.address.clone(),
        attempts,
        last_error,
    })
}

/// Drains the delivery queue into the hub channel
pub struct Forwarder {
    config: DeliveryConfig,
    connector: Arc<dyn Connector>,
    receiver: mpsc::Receiver<Entry>,
    metrics: Arc<DeliveryMetrics>,
}

impl Forwarder {
    /// Counters, valid after `run` consumes the forwarder
    pub fn metrics(&self) -> Arc<DeliveryMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Forward entries until the queue closes or `cancel` fires
    pub async fn run(mut self, cancel: CancellationToken) -> Result<DeliverySummary, DeliveryError> {
        info!("Delivering entries to {}", self.config.address);

        let Some(mut channel) =
            connect_with_retry(self.connector.as_ref(), &self.config, &cancel).await?
        else {
            return Ok(self.metrics.snapshot());
        };

        loop {
            let entry = tokio::select! {
                _ = cancel.cancelled() => break,
                entry = self.receiver.recv() => entry,
            };
            let Some(entry) = entry else {
                break;
            };

            let message = WireMessage::entry(entry);
            match channel.send(&message).await {
                Ok(()) => {
                    self.metrics.entries_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) if e.is_broken_pipe() => {
                    self.metrics.entries_failed.fetch_add(1, Ordering::Relaxed);
                    warn!("Channel to {} broken ({}), reconnecting", self.config.address, e);

                    match connect_with_retry(self.connector.as_ref(), &self.config, &cancel).await {
                        Ok(Some(reconnected)) => {
                            self.metrics.reconnects.fetch_add(1, Ordering::Relaxed);
                            channel = reconnected;
                        }
                        Ok(None) => break,
                        Err(e) => {
                            error!("Giving up on {}: {}", self.config.address, e);
                            return Err(e);
                        }
                    }
                }
                Err(e) => {
                    self.metrics.entries_failed.fetch_add(1, Ordering::Relaxed);
                    warn!("Skipping entry for {}: {}", self.config.address, e);
                }
            }
        }

        let summary = self.metrics.snapshot();
        info!(
            "Delivery to {} stopped: sent={}, failed={}, dropped={}, reconnects={}",
            self.config.address, summary.sent, summary.failed, summary.dropped, summary.reconnects
        );
        Ok(summary)
    }
}
