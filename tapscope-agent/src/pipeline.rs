//! Capture pipeline: captured payloads to protocol entries
//!
//! A dispatcher task owns the connection table and routes every capture
//! event to the worker that owns the connection. Each worker classifies its
//! connection once (first dissector in priority order that accepts the
//! buffered sample), then feeds every chunk through the bound session and
//! forwards the entries in capture order.

use crate::capture::{CaptureEvent, CaptureSource, CapturedConnection, ConnectionId, Peer, TapTargets};
use crate::dissector::registry::Registry;
use crate::dissector::{preview, DissectorSession};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tapscope_common::{Entry, UNKNOWN_PROTOCOL};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Bytes of raw payload copied into an `unknown` entry
const RAW_PREVIEW: usize = 2048;

/// What happens to connections no dissector accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownPolicy {
    #[default]
    Drop,
    /// Emit one `unknown` entry per payload chunk
    Tag,
}

/// What happens to partial exchanges when a connection closes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushPolicy {
    Discard,
    #[default]
    Flush,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub unknown_policy: UnknownPolicy,
    pub flush_policy: FlushPolicy,
    /// Bytes buffered per connection before giving up on classification
    pub classify_window: usize,
    /// A connection with no events for this long is closed
    pub idle_timeout: Duration,
    /// Capacity of each worker's inbound queue
    pub connection_queue: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            unknown_policy: UnknownPolicy::default(),
            flush_policy: FlushPolicy::default(),
            classify_window: 4096,
            idle_timeout: Duration::from_secs(120),
            connection_queue: 256,
        }
    }
}

impl PipelineConfig {
    pub fn with_unknown_policy(mut self, policy: UnknownPolicy) -> Self {
        self.unknown_policy = policy;
        self
    }

    pub fn with_flush_policy(mut self, policy: FlushPolicy) -> Self {
        self.flush_policy = policy;
        self
    }

    pub fn with_classify_window(mut self, bytes: usize) -> Self {
        self.classify_window = bytes;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

/// Pipeline counters, shared between the dispatcher and its workers
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    connections_opened: Arc<AtomicU64>,
    connections_skipped: Arc<AtomicU64>,
    connections_classified: Arc<AtomicU64>,
    connections_unclassified: Arc<AtomicU64>,
    dissect_errors: Arc<AtomicU64>,
    entries_emitted: Arc<AtomicU64>,
}

/// Point-in-time copy of `PipelineStats`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineSnapshot {
    pub connections_opened: u64,
    pub connections_skipped: u64,
    pub connections_classified: u64,
    pub connections_unclassified: u64,
    pub dissect_errors: u64,
    pub entries_emitted: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_skipped: self.connections_skipped.load(Ordering::Relaxed),
            connections_classified: self.connections_classified.load(Ordering::Relaxed),
            connections_unclassified: self.connections_unclassified.load(Ordering::Relaxed),
            dissect_errors: self.dissect_errors.load(Ordering::Relaxed),
            entries_emitted: self.entries_emitted.load(Ordering::Relaxed),
        }
    }
}

pub struct Pipeline {
    registry: Registry,
    config: PipelineConfig,
    targets: TapTargets,
    stats: PipelineStats,
}

impl Pipeline {
    pub fn new(registry: Registry, config: PipelineConfig) -> Self {
        Self {
            registry,
            config,
            targets: TapTargets::all(),
            stats: PipelineStats::default(),
        }
    }

    pub fn with_tap_targets(mut self, targets: TapTargets) -> Self {
        self.targets = targets;
        self
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats.clone()
    }

    /// Run until the source is exhausted or `cancel` fires.
    ///
    /// On exhaustion every open connection is closed (flushed per policy) and
    /// all workers are joined before returning. On cancellation workers exit
    /// without flushing.
    pub async fn run<S: CaptureSource>(
        self,
        mut source: S,
        output: mpsc::Sender<Entry>,
        cancel: CancellationToken,
    ) {
        let tracker = TaskTracker::new();
        let mut connections: HashMap<ConnectionId, mpsc::Sender<Chunk>> = HashMap::new();

        info!("Pipeline started with dissectors {:?}", self.registry.names());

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Pipeline cancelled");
                    break;
                }
                event = source.next_event() => event,
            };

            let Some(event) = event else {
                debug!("Capture source exhausted");
                break;
            };

            match event {
                CaptureEvent::Opened { connection } => {
                    if !self.targets.admits(&connection.info) {
                        self.stats.connections_skipped.fetch_add(1, Ordering::Relaxed);
                        debug!("Skipping {}: not a tap target", connection);
                        continue;
                    }
                    self.stats.connections_opened.fetch_add(1, Ordering::Relaxed);

                    let (tx, rx) = mpsc::channel(self.config.connection_queue);
                    if connections.insert(connection.id, tx).is_some() {
                        warn!("Connection {} reopened, closing previous worker", connection.id);
                    }

                    let worker = Worker::new(
                        connection,
                        self.registry.clone(),
                        self.config.clone(),
                        self.stats.clone(),
                        output.clone(),
                    );
                    tracker.spawn(worker.run(rx, cancel.clone()));
                }
                CaptureEvent::Data {
                    id,
                    peer,
                    timestamp,
                    payload,
                } => {
                    let Some(tx) = connections.get(&id) else {
                        continue;
                    };
                    let chunk = Chunk {
                        peer,
                        timestamp,
                        payload,
                    };
                    let delivered = tokio::select! {
                        _ = cancel.cancelled() => break,
                        sent = tx.send(chunk) => sent.is_ok(),
                    };
                    if !delivered {
                        // worker already finished (idle, abandoned or output closed)
                        connections.remove(&id);
                    }
                }
                CaptureEvent::Closed { id } => {
                    connections.remove(&id);
                }
            }
        }

        connections.clear();
        tracker.close();
        tracker.wait().await;

        let stats = self.stats.snapshot();
        info!(
            "Pipeline stopped: {} connections, {} entries, {} dissect errors",
            stats.connections_opened, stats.entries_emitted, stats.dissect_errors
        );
    }
}

struct Chunk {
    peer: Peer,
    timestamp: DateTime<Utc>,
    payload: Bytes,
}

enum WorkerState {
    Classifying { pending: Vec<Chunk>, buffered: usize },
    Dissecting {
        protocol: String,
        session: Box<dyn DissectorSession>,
    },
    Unknown,
    Abandoned,
}

struct Worker {
    connection: CapturedConnection,
    registry: Registry,
    config: PipelineConfig,
    stats: PipelineStats,
    output: mpsc::Sender<Entry>,
    state: WorkerState,
}

/// Output channel is gone; the worker stops
struct OutputClosed;

impl Worker {
    fn new(
        connection: CapturedConnection,
        registry: Registry,
        config: PipelineConfig,
        stats: PipelineStats,
        output: mpsc::Sender<Entry>,
    ) -> Self {
        let mut worker = Self {
            connection,
            registry,
            config,
            stats,
            output,
            state: WorkerState::Classifying {
                pending: Vec::new(),
                buffered: 0,
            },
        };
        worker.bind_from_hint();
        worker
    }

    fn bind_from_hint(&mut self) {
        let Some(hint) = self.connection.protocol_hint.as_deref() else {
            return;
        };
        match self.registry.lookup(hint) {
            Ok(dissector) => {
                self.stats
                    .connections_classified
                    .fetch_add(1, Ordering::Relaxed);
                self.state = WorkerState::Dissecting {
                    protocol: dissector.name().to_string(),
                    session: dissector.session(&self.connection),
                };
            }
            Err(e) => debug!("{}: ignoring protocol hint: {}", self.connection, e),
        }
    }

    async fn run(mut self, mut input: mpsc::Receiver<Chunk>, cancel: CancellationToken) {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return,
                next = tokio::time::timeout(self.config.idle_timeout, input.recv()) => next,
            };

            match next {
                Ok(Some(chunk)) => {
                    if self.handle(chunk).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    debug!("{} idle for {:?}, closing", self.connection, self.config.idle_timeout);
                    break;
                }
            }
        }

        let _ = self.close().await;
    }

    async fn handle(&mut self, chunk: Chunk) -> Result<(), OutputClosed> {
        match &mut self.state {
            WorkerState::Classifying { pending, buffered } => {
                *buffered += chunk.payload.len();
                pending.push(chunk);
                self.try_classify().await
            }
            WorkerState::Dissecting { .. } => self.dissect(chunk).await,
            WorkerState::Unknown => self.emit_unknown(chunk).await,
            WorkerState::Abandoned => Ok(()),
        }
    }

    async fn try_classify(&mut self) -> Result<(), OutputClosed> {
        let WorkerState::Classifying { pending, buffered } = &self.state else {
            return Ok(());
        };

        let mut chosen = None;
        for peer in [Peer::Client, Peer::Server] {
            let sample: Vec<u8> = pending
                .iter()
                .filter(|c| c.peer == peer)
                .flat_map(|c| c.payload.iter().copied())
                .collect();
            if sample.is_empty() {
                continue;
            }
            if let Some(dissector) = self.registry.classify(peer, &sample) {
                chosen = Some(dissector.clone());
                break;
            }
        }
        let window_full = *buffered >= self.config.classify_window;

        let pending = match (&chosen, window_full) {
            (None, false) => return Ok(()),
            _ => match std::mem::replace(&mut self.state, WorkerState::Abandoned) {
                WorkerState::Classifying { pending, .. } => pending,
                other => {
                    self.state = other;
                    return Ok(());
                }
            },
        };

        match chosen {
            Some(dissector) => {
                debug!("{} classified as {}", self.connection, dissector.name());
                self.stats
                    .connections_classified
                    .fetch_add(1, Ordering::Relaxed);
                self.state = WorkerState::Dissecting {
                    protocol: dissector.name().to_string(),
                    session: dissector.session(&self.connection),
                };
                for chunk in pending {
                    self.dissect(chunk).await?;
                }
            }
            None => {
                debug!("{} matched no dissector", self.connection);
                self.mark_unknown();
                for chunk in pending {
                    self.emit_unknown(chunk).await?;
                }
            }
        }
        Ok(())
    }

    fn mark_unknown(&mut self) {
        self.stats
            .connections_unclassified
            .fetch_add(1, Ordering::Relaxed);
        self.state = WorkerState::Unknown;
    }

    async fn dissect(&mut self, chunk: Chunk) -> Result<(), OutputClosed> {
        let WorkerState::Dissecting { protocol, session } = &mut self.state else {
            return Ok(());
        };

        match session.feed(chunk.peer, &chunk.payload, chunk.timestamp) {
            Ok(entries) => {
                let protocol = protocol.clone();
                self.emit(entries, &protocol).await
            }
            Err(e) => {
                warn!(
                    "Dissection failed on {} (protocol {}): {}; dropping connection",
                    self.connection.info, protocol, e
                );
                self.stats.dissect_errors.fetch_add(1, Ordering::Relaxed);
                self.state = WorkerState::Abandoned;
                Ok(())
            }
        }
    }

    async fn emit_unknown(&mut self, chunk: Chunk) -> Result<(), OutputClosed> {
        if self.config.unknown_policy == UnknownPolicy::Drop {
            return Ok(());
        }

        let raw = json!({ "raw": preview(&chunk.payload, RAW_PREVIEW) });
        let (request, response) = match chunk.peer {
            Peer::Client => (raw, Value::Null),
            Peer::Server => (Value::Null, raw),
        };
        let entry = Entry::new(
            self.connection.info.clone(),
            UNKNOWN_PROTOCOL,
            chunk.timestamp,
            request,
            response,
        );
        self.emit(vec![entry], UNKNOWN_PROTOCOL).await
    }

    async fn emit(&mut self, entries: Vec<Entry>, protocol: &str) -> Result<(), OutputClosed> {
        for mut entry in entries {
            if entry.protocol_name.is_empty() {
                entry.protocol_name = protocol.to_string();
            }
            self.output.send(entry).await.map_err(|_| OutputClosed)?;
            self.stats.entries_emitted.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), OutputClosed> {
        match std::mem::replace(&mut self.state, WorkerState::Abandoned) {
            WorkerState::Dissecting {
                protocol,
                mut session,
            } => {
                let leftover = session.finish();
                if self.config.flush_policy == FlushPolicy::Flush {
                    self.emit(leftover, &protocol).await?;
                } else if !leftover.is_empty() {
                    debug!(
                        "{}: discarding {} partial {} exchanges",
                        self.connection,
                        leftover.len(),
                        protocol
                    );
                }
            }
            WorkerState::Classifying { pending, .. } if !pending.is_empty() => {
                self.mark_unknown();
                for chunk in pending {
                    self.emit_unknown(chunk).await?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ChannelSource;
    use std::net::IpAddr;
    use tapscope_common::ConnectionInfo;

    fn connection(id: u64, hint: Option<&str>) -> CapturedConnection {
        CapturedConnection {
            id: ConnectionId(id),
            info: ConnectionInfo {
                client_ip: "10.0.0.1".parse().unwrap(),
                client_port: 40000 + id as u16,
                server_ip: "10.0.0.2".parse().unwrap(),
                server_port: 80,
                is_outgoing: false,
            },
            protocol_hint: hint.map(String::from),
        }
    }

    fn data(id: u64, peer: Peer, payload: &'static [u8]) -> CaptureEvent {
        CaptureEvent::Data {
            id: ConnectionId(id),
            peer,
            timestamp: Utc::now(),
            payload: Bytes::from_static(payload),
        }
    }

    async fn run_events(pipeline: Pipeline, events: Vec<CaptureEvent>) -> Vec<Entry> {
        let (tx, source) = ChannelSource::channel(64);
        let (out_tx, mut out_rx) = mpsc::channel(64);
        let handle = tokio::spawn(pipeline.run(source, out_tx, CancellationToken::new()));

        for event in events {
            tx.send(event).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        let mut entries = Vec::new();
        while let Ok(entry) = out_rx.try_recv() {
            entries.push(entry);
        }
        entries
    }

    #[tokio::test]
    async fn test_http_exchange() {
        let pipeline = Pipeline::new(Registry::builtin().unwrap(), PipelineConfig::default());
        let stats = pipeline.stats();

        let entries = run_events(
            pipeline,
            vec![
                CaptureEvent::Opened {
                    connection: connection(1, None),
                },
                data(1, Peer::Client, b"GET /ping HTTP/1.1\r\nHost: a\r\n\r\n"),
                data(1, Peer::Server, b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n"),
                CaptureEvent::Closed { id: ConnectionId(1) },
            ],
        )
        .await;

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].protocol_name, "http");
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.connections_classified, 1);
        assert_eq!(snapshot.entries_emitted, 1);
    }

    #[tokio::test]
    async fn test_unknown_dropped_by_default() {
        let pipeline = Pipeline::new(Registry::builtin().unwrap(), PipelineConfig::default());
        let stats = pipeline.stats();

        let entries = run_events(
            pipeline,
            vec![
                CaptureEvent::Opened {
                    connection: connection(1, None),
                },
                data(1, Peer::Client, b"\x16\x03\x01 tls hello"),
                CaptureEvent::Closed { id: ConnectionId(1) },
            ],
        )
        .await;

        assert!(entries.is_empty());
        assert_eq!(stats.snapshot().connections_unclassified, 1);
    }

    #[tokio::test]
    async fn test_unknown_tagged() {
        let config = PipelineConfig::default()
            .with_unknown_policy(UnknownPolicy::Tag)
            .with_classify_window(8);
        let pipeline = Pipeline::new(Registry::builtin().unwrap(), config);

        let entries = run_events(
            pipeline,
            vec![
                CaptureEvent::Opened {
                    connection: connection(1, None),
                },
                data(1, Peer::Client, b"\x16\x03\x01 tls hello"),
                data(1, Peer::Server, b"\x16\x03\x01 server"),
            ],
        )
        .await;

        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.protocol_name == UNKNOWN_PROTOCOL));
        assert!(entries[1].request_payload.is_null());
    }

    #[tokio::test]
    async fn test_hint_binds_without_probe() {
        let pipeline = Pipeline::new(Registry::builtin().unwrap(), PipelineConfig::default());

        let entries = run_events(
            pipeline,
            vec![
                CaptureEvent::Opened {
                    connection: connection(1, Some("redis")),
                },
                data(1, Peer::Client, b"PING\r\n"),
                data(1, Peer::Server, b"+PONG\r\n"),
            ],
        )
        .await;

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].protocol_name, "redis");
    }

    #[tokio::test]
    async fn test_flush_policy_discard() {
        let config = PipelineConfig::default().with_flush_policy(FlushPolicy::Discard);
        let pipeline = Pipeline::new(Registry::builtin().unwrap(), config);

        let entries = run_events(
            pipeline,
            vec![
                CaptureEvent::Opened {
                    connection: connection(1, None),
                },
                data(1, Peer::Client, b"GET / HTTP/1.1\r\n\r\n"),
                CaptureEvent::Closed { id: ConnectionId(1) },
            ],
        )
        .await;

        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_dissect_error_isolated() {
        let pipeline = Pipeline::new(Registry::builtin().unwrap(), PipelineConfig::default());
        let stats = pipeline.stats();

        let entries = run_events(
            pipeline,
            vec![
                CaptureEvent::Opened {
                    connection: connection(1, None),
                },
                CaptureEvent::Opened {
                    connection: connection(2, None),
                },
                data(1, Peer::Client, b"GET / HTTP/1.1\r\nbroken header\r\n\r\n"),
                data(2, Peer::Client, b"GET /ok HTTP/1.1\r\n\r\n"),
                data(1, Peer::Client, b"GET /later HTTP/1.1\r\n\r\n"),
                data(2, Peer::Server, b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n"),
            ],
        )
        .await;

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].request_payload["path"], "/ok");
        assert_eq!(stats.snapshot().dissect_errors, 1);
    }

    #[tokio::test]
    async fn test_tap_targets_skip() {
        let targets = TapTargets::only(vec!["192.168.0.1".parse::<IpAddr>().unwrap()]);
        let pipeline = Pipeline::new(Registry::builtin().unwrap(), PipelineConfig::default())
            .with_tap_targets(targets);
        let stats = pipeline.stats();

        let entries = run_events(
            pipeline,
            vec![
                CaptureEvent::Opened {
                    connection: connection(1, None),
                },
                data(1, Peer::Client, b"GET / HTTP/1.1\r\n\r\n"),
            ],
        )
        .await;

        assert!(entries.is_empty());
        assert_eq!(stats.snapshot().connections_skipped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_closed() {
        let config = PipelineConfig::default().with_idle_timeout(Duration::from_secs(5));
        let pipeline = Pipeline::new(Registry::builtin().unwrap(), config);

        let (tx, source) = ChannelSource::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(pipeline.run(source, out_tx, cancel.clone()));

        tx.send(CaptureEvent::Opened {
            connection: connection(1, None),
        })
        .await
        .unwrap();
        tx.send(data(1, Peer::Client, b"GET /slow HTTP/1.1\r\n\r\n"))
            .await
            .unwrap();

        // unanswered request flushed when the idle timer fires
        let entry = out_rx.recv().await.unwrap();
        assert_eq!(entry.request_payload["path"], "/slow");
        assert!(entry.response_payload.is_null());

        cancel.cancel();
        handle.await.unwrap();
    }
}
