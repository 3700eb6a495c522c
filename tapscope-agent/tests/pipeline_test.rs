use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tapscope_agent::capture::ChannelSource;
use tapscope_agent::delivery::delivery_channel;
use tapscope_agent::{
    run_filter, CaptureEvent, CapturedConnection, Confidence, ConnectionId, DeliveryConfig,
    DissectError, Dissector, DissectorSession, EntryFilter, LocalConnector, Peer, Pipeline,
    PipelineConfig, ProtocolDescriptor, Registry, RegistrationContext, ServiceAddresses,
};
use tapscope_common::{ConnectionInfo, Entry, FilteringOptions};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Newline-framed test protocol. Accepts every sample.
struct LineDissector {
    name: &'static str,
    priority: u32,
    stamp_name: bool,
}

struct LineSession {
    info: ConnectionInfo,
    name: &'static str,
    stamp_name: bool,
    buffer: Vec<u8>,
}

impl DissectorSession for LineSession {
    fn feed(
        &mut self,
        _peer: Peer,
        payload: &[u8],
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<Entry>, DissectError> {
        self.buffer.extend_from_slice(payload);
        let mut entries = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            // leave the name empty so the pipeline has to stamp it
            let protocol = if self.stamp_name { self.name } else { "" };
            entries.push(Entry::new(
                self.info.clone(),
                protocol,
                timestamp,
                json!({ "line": text }),
                Value::Null,
            ));
        }
        Ok(entries)
    }

    fn finish(&mut self) -> Vec<Entry> {
        Vec::new()
    }
}

impl Dissector for LineDissector {
    fn register(&self, ctx: &mut RegistrationContext) {
        ctx.declare(ProtocolDescriptor::new(self.name, "line protocol", self.priority));
    }

    fn can_dissect(&self, _peer: Peer, _sample: &[u8]) -> Confidence {
        Confidence::Certain
    }

    fn session(&self, connection: &CapturedConnection) -> Box<dyn DissectorSession> {
        Box::new(LineSession {
            info: connection.info.clone(),
            name: self.name,
            stamp_name: self.stamp_name,
            buffer: Vec::new(),
        })
    }
}

fn registry() -> Registry {
    Registry::from_dissectors(vec![
        Arc::new(LineDissector {
            name: "line-b",
            priority: 2,
            stamp_name: true,
        }) as Arc<dyn Dissector>,
        Arc::new(LineDissector {
            name: "line-a",
            priority: 1,
            stamp_name: false,
        }),
    ])
    .unwrap()
}

fn connection(id: u64) -> CapturedConnection {
    CapturedConnection {
        id: ConnectionId(id),
        info: ConnectionInfo {
            client_ip: format!("10.0.0.{}", id).parse().unwrap(),
            client_port: 50000 + id as u16,
            server_ip: "10.0.1.1".parse().unwrap(),
            server_port: 7000,
            is_outgoing: false,
        },
        protocol_hint: None,
    }
}

/// Interleaved events for `counts[i]` lines on connection `i + 1`, with
/// some lines split across chunks.
fn interleaved(counts: &[usize]) -> Vec<CaptureEvent> {
    let mut events: Vec<CaptureEvent> = (1..=counts.len() as u64)
        .map(|id| CaptureEvent::Opened {
            connection: connection(id),
        })
        .collect();

    let max = counts.iter().copied().max().unwrap_or(0);
    for n in 0..max {
        for (i, &count) in counts.iter().enumerate() {
            if n >= count {
                continue;
            }
            let id = i as u64 + 1;
            let line = format!("c{}-{}\n", id, n);
            let (head, tail) = line.split_at(line.len() / 2);
            for part in [head, tail] {
                events.push(CaptureEvent::Data {
                    id: ConnectionId(id),
                    peer: Peer::Client,
                    timestamp: Utc::now(),
                    payload: Bytes::from(part.to_string()),
                });
            }
        }
    }

    for id in 1..=counts.len() as u64 {
        events.push(CaptureEvent::Closed { id: ConnectionId(id) });
    }
    events
}

async fn run_pipeline(events: Vec<CaptureEvent>) -> Vec<Entry> {
    let (tx, source) = ChannelSource::channel(16);
    let (out_tx, mut out_rx) = mpsc::channel(16);
    let pipeline = Pipeline::new(registry(), PipelineConfig::default());
    let handle = tokio::spawn(pipeline.run(source, out_tx, CancellationToken::new()));

    let feeder = tokio::spawn(async move {
        for event in events {
            tx.send(event).await.unwrap();
        }
    });

    let mut entries = Vec::new();
    while let Some(entry) = out_rx.recv().await {
        entries.push(entry);
    }
    feeder.await.unwrap();
    handle.await.unwrap();
    entries
}

fn lines_by_connection(entries: &[Entry]) -> HashMap<u16, Vec<String>> {
    let mut by_conn: HashMap<u16, Vec<String>> = HashMap::new();
    for entry in entries {
        by_conn
            .entry(entry.connection_info.client_port)
            .or_default()
            .push(entry.request_payload["line"].as_str().unwrap().to_string());
    }
    by_conn
}

#[tokio::test]
async fn test_end_to_end_priority_order_and_isolation() {
    let counts = [5, 3, 7];
    let entries = run_pipeline(interleaved(&counts)).await;

    assert_eq!(entries.len(), counts.iter().sum::<usize>());

    // both dissectors accept everything, the lower priority value wins
    assert!(entries.iter().all(|e| e.protocol_name == "line-a"));

    let by_conn = lines_by_connection(&entries);
    for (i, &count) in counts.iter().enumerate() {
        let id = i + 1;
        let expected: Vec<String> = (0..count).map(|n| format!("c{}-{}", id, n)).collect();
        assert_eq!(by_conn[&(50000 + id as u16)], expected);
    }
}

#[tokio::test]
async fn test_every_entry_has_protocol_name() {
    let entries = run_pipeline(interleaved(&[4])).await;
    assert_eq!(entries.len(), 4);
    assert!(entries.iter().all(|e| !e.protocol_name.is_empty()));
}

#[tokio::test]
async fn test_single_connection_order() {
    let entries = run_pipeline(interleaved(&[50])).await;
    let lines: Vec<String> = entries
        .iter()
        .map(|e| e.request_payload["line"].as_str().unwrap().to_string())
        .collect();
    let expected: Vec<String> = (0..50).map(|n| format!("c1-{}", n)).collect();
    assert_eq!(lines, expected);
}

#[tokio::test]
async fn test_capture_to_local_delivery() {
    let cancel = CancellationToken::new();
    let (capture_tx, source) = ChannelSource::channel(16);
    let (entries_tx, entries_rx) = mpsc::channel(16);
    let (ingest_tx, mut ingest_rx) = mpsc::channel(64);

    let options = FilteringOptions {
        excluded_ips: ["10.0.0.2".parse().unwrap()].into_iter().collect(),
        ..Default::default()
    };
    let (queue, forwarder) = delivery_channel(
        DeliveryConfig::new("local"),
        Arc::new(LocalConnector::new(ingest_tx)),
    );

    let pipeline = tokio::spawn(
        Pipeline::new(registry(), PipelineConfig::default()).run(source, entries_tx, cancel.clone()),
    );
    let filter = tokio::spawn(run_filter(
        entries_rx,
        queue,
        EntryFilter::new(&options, ServiceAddresses::default()),
        cancel.clone(),
    ));
    let delivery = tokio::spawn(forwarder.run(cancel.clone()));

    for event in interleaved(&[3, 3, 3]) {
        capture_tx.send(event).await.unwrap();
    }
    drop(capture_tx);

    pipeline.await.unwrap();
    assert_eq!(filter.await.unwrap(), 3);
    let summary = delivery.await.unwrap().unwrap();
    assert_eq!(summary.sent, 6);

    let mut delivered = Vec::new();
    while let Ok(entry) = ingest_rx.try_recv() {
        delivered.push(entry);
    }
    let by_conn = lines_by_connection(&delivered);
    assert_eq!(by_conn.len(), 2);
    assert!(!by_conn.contains_key(&50002));
    assert_eq!(by_conn[&50003], vec!["c3-0", "c3-1", "c3-2"]);
}

fn data(id: u64, peer: Peer, payload: &'static [u8]) -> CaptureEvent {
    CaptureEvent::Data {
        id: ConnectionId(id),
        peer,
        timestamp: Utc::now(),
        payload: Bytes::from_static(payload),
    }
}

#[tokio::test]
async fn test_malformed_connection_does_not_stop_siblings() {
    let (tx, source) = ChannelSource::channel(16);
    let (out_tx, mut out_rx) = mpsc::channel(16);
    let pipeline = Pipeline::new(Registry::builtin().unwrap(), PipelineConfig::default());
    let stats = pipeline.stats();
    let handle = tokio::spawn(pipeline.run(source, out_tx, CancellationToken::new()));

    let events = vec![
        CaptureEvent::Opened { connection: connection(1) },
        CaptureEvent::Opened { connection: connection(2) },
        data(1, Peer::Client, b"GET /a HTTP/1.1\r\nHost: a\r\n\r\n"),
        data(2, Peer::Client, b"GET /b HTTP/1.1\r\nHost: b\r\n\r\n"),
        data(
            1,
            Peer::Server,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\nx",
        ),
        data(1, Peer::Client, b"GET /after HTTP/1.1\r\n\r\n"),
        data(2, Peer::Server, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"),
        CaptureEvent::Closed { id: ConnectionId(1) },
        CaptureEvent::Closed { id: ConnectionId(2) },
    ];
    for event in events {
        tx.send(event).await.unwrap();
    }
    drop(tx);

    let mut entries = Vec::new();
    while let Some(entry) = out_rx.recv().await {
        entries.push(entry);
    }
    handle.await.unwrap();

    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].connection_info.client_port, 50002);
    assert_eq!(entries[0].request_payload["path"], "/b");
    assert_eq!(entries[0].response_payload["status"], 200);

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.dissect_errors, 1);
    assert_eq!(snapshot.connections_classified, 2);
}
