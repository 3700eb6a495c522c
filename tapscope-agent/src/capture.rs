//! Boundary to the packet-capture primitive
//!
//! The capture primitive itself (raw sockets, AF_PACKET, eBPF, ...) lives
//! outside the agent. It reports flows as a sequence of `CaptureEvent`s:
//! a connection is opened, payload chunks arrive tagged with the peer that
//! sent them, and the connection is closed.
//!
//! Two sources are provided:
//! - `ChannelSource` for in-process producers (and tests)
//! - `FeedListener`, a TCP listener accepting length-delimited JSON events

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use tapscope_common::ConnectionInfo;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Capacity of the queue between feed connections and the pipeline
const FEED_QUEUE_SIZE: usize = 4096;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to bind capture feed on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Identifier assigned to a flow by the capture primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Which side of the connection sent a payload chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Peer {
    Client,
    Server,
}

/// A flow reported by the capture primitive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedConnection {
    pub id: ConnectionId,
    pub info: ConnectionInfo,
    /// Protocol guessed by the capture primitive (e.g. from the port)
    #[serde(default)]
    pub protocol_hint: Option<String>,
}

impl fmt::Display for CapturedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.info)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum CaptureEvent {
    Opened {
        connection: CapturedConnection,
    },
    Data {
        id: ConnectionId,
        peer: Peer,
        timestamp: DateTime<Utc>,
        payload: Bytes,
    },
    Closed {
        id: ConnectionId,
    },
}

impl CaptureEvent {
    pub fn connection_id(&self) -> ConnectionId {
        match self {
            CaptureEvent::Opened { connection } => connection.id,
            CaptureEvent::Data { id, .. } | CaptureEvent::Closed { id } => *id,
        }
    }
}

/// A continuous producer of capture events
#[async_trait]
pub trait CaptureSource: Send {
    /// Next event, or `None` once the producer is exhausted
    async fn next_event(&mut self) -> Option<CaptureEvent>;
}

/// In-process capture source backed by a channel
pub struct ChannelSource {
    receiver: mpsc::Receiver<CaptureEvent>,
}

impl ChannelSource {
    pub fn new(receiver: mpsc::Receiver<CaptureEvent>) -> Self {
        Self { receiver }
    }

    /// Create a sender/source pair
    pub fn channel(capacity: usize) -> (mpsc::Sender<CaptureEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl CaptureSource for ChannelSource {
    async fn next_event(&mut self) -> Option<CaptureEvent> {
        self.receiver.recv().await
    }
}

/// TCP endpoint the external capture primitive streams events into.
///
/// Each frame is a 4-byte big-endian length followed by one JSON-encoded
/// `CaptureEvent`. Connection ids are scoped to the feed, so a single
/// capture primitive is expected per agent.
pub struct FeedListener {
    receiver: mpsc::Receiver<CaptureEvent>,
    local_addr: SocketAddr,
}

impl FeedListener {
    /// Bind the feed and start accepting capture producers
    pub async fn bind(
        addr: &str,
        cancel: CancellationToken,
        tracker: &TaskTracker,
    ) -> Result<Self, CaptureError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| CaptureError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| CaptureError::Bind {
            addr: addr.to_string(),
            source,
        })?;

        info!("Capture feed listening on {}", local_addr);

        let (tx, rx) = mpsc::channel(FEED_QUEUE_SIZE);
        let inner_tracker = tracker.clone();
        tracker.spawn(accept_loop(listener, tx, cancel, inner_tracker));

        Ok(Self {
            receiver: rx,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl CaptureSource for FeedListener {
    async fn next_event(&mut self) -> Option<CaptureEvent> {
        self.receiver.recv().await
    }
}

async fn accept_loop(
    listener: TcpListener,
    tx: mpsc::Sender<CaptureEvent>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Capture feed accept loop stopping");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!("Capture producer connected from {}", peer);
                    tracker.spawn(read_feed(stream, tx.clone(), cancel.clone()));
                }
                Err(e) => warn!("Failed to accept capture producer: {}", e),
            }
        }
    }
}

async fn read_feed(stream: TcpStream, tx: mpsc::Sender<CaptureEvent>, cancel: CancellationToken) {
    let mut frames = FramedRead::new(stream, LengthDelimitedCodec::new());

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = frames.next() => frame,
        };

        match frame {
            Some(Ok(bytes)) => match serde_json::from_slice::<CaptureEvent>(&bytes) {
                Ok(event) => {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                Err(e) => warn!("Skipping malformed capture event: {}", e),
            },
            Some(Err(e)) => {
                warn!("Capture producer stream failed: {}", e);
                return;
            }
            None => {
                info!("Capture producer disconnected");
                return;
            }
        }
    }
}

/// Addresses this node is asked to capture.
///
/// `TapTargets::all()` admits every connection; otherwise a connection is
/// admitted when either endpoint is a target address.
#[derive(Debug, Clone, Default)]
pub struct TapTargets {
    addresses: Option<HashSet<IpAddr>>,
}

impl TapTargets {
    pub fn all() -> Self {
        Self { addresses: None }
    }

    pub fn only(addresses: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            addresses: Some(addresses.into_iter().collect()),
        }
    }

    pub fn admits(&self, info: &ConnectionInfo) -> bool {
        match &self.addresses {
            None => true,
            Some(set) => set.contains(&info.client_ip) || set.contains(&info.server_ip),
        }
    }

    pub fn addresses(&self) -> Option<&HashSet<IpAddr>> {
        self.addresses.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::SinkExt;
    use std::net::Ipv4Addr;
    use tokio_util::codec::FramedWrite;

    fn info(client: [u8; 4], server: [u8; 4]) -> ConnectionInfo {
        ConnectionInfo {
            client_ip: IpAddr::V4(Ipv4Addr::from(client)),
            client_port: 40000,
            server_ip: IpAddr::V4(Ipv4Addr::from(server)),
            server_port: 6379,
            is_outgoing: false,
        }
    }

    #[test]
    fn test_tap_targets_all() {
        assert!(TapTargets::all().admits(&info([10, 0, 0, 1], [10, 0, 0, 2])));
    }

    #[test]
    fn test_tap_targets_match_either_side() {
        let targets = TapTargets::only(vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))]);

        assert!(targets.admits(&info([10, 0, 0, 1], [10, 0, 0, 2])));
        assert!(targets.admits(&info([10, 0, 0, 2], [10, 0, 0, 9])));
        assert!(!targets.admits(&info([10, 0, 0, 1], [10, 0, 0, 3])));
    }

    #[test]
    fn test_capture_event_json_shape() {
        let event = CaptureEvent::Closed { id: ConnectionId(7) };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "closed");
        assert_eq!(value["id"], 7);
    }

    #[tokio::test]
    async fn test_feed_listener_receives_frames() {
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let mut feed = FeedListener::bind("127.0.0.1:0", cancel.clone(), &tracker)
            .await
            .unwrap();

        let stream = TcpStream::connect(feed.local_addr()).await.unwrap();
        let mut writer = FramedWrite::new(stream, LengthDelimitedCodec::new());

        let opened = CaptureEvent::Opened {
            connection: CapturedConnection {
                id: ConnectionId(1),
                info: info([10, 0, 0, 1], [10, 0, 0, 2]),
                protocol_hint: None,
            },
        };
        writer
            .send(Bytes::from(serde_json::to_vec(&opened).unwrap()))
            .await
            .unwrap();
        writer.send(Bytes::from_static(b"garbage")).await.unwrap();
        writer
            .send(Bytes::from(
                serde_json::to_vec(&CaptureEvent::Closed { id: ConnectionId(1) }).unwrap(),
            ))
            .await
            .unwrap();

        assert_eq!(feed.next_event().await, Some(opened));
        assert_eq!(
            feed.next_event().await,
            Some(CaptureEvent::Closed { id: ConnectionId(1) })
        );

        cancel.cancel();
        tracker.close();
        tracker.wait().await;
    }
}
