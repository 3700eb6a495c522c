//! Ingestion of entries delivered by tapper agents
//!
//! Agents connect over TCP and send length-delimited JSON `WireMessage`s.
//! Each agent connection is read by its own task and its entries are pushed
//! into the hub's entry channel in arrival order.

use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tapscope_common::{Entry, WireMessage};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct IngestStats {
    pub agents_connected: AtomicU64,
    pub entries_received: AtomicU64,
    pub malformed_frames: AtomicU64,
}

pub struct IngestServer {
    local_addr: SocketAddr,
    stats: Arc<IngestStats>,
}

impl IngestServer {
    pub async fn bind(
        addr: &str,
        entries: mpsc::Sender<Entry>,
        cancel: CancellationToken,
        tracker: &TaskTracker,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Ingest endpoint listening on {}", local_addr);

        let stats = Arc::new(IngestStats::default());
        tracker.spawn(accept_loop(
            listener,
            entries,
            Arc::clone(&stats),
            cancel,
            tracker.clone(),
        ));

        Ok(Self { local_addr, stats })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }
}

async fn accept_loop(
    listener: TcpListener,
    entries: mpsc::Sender<Entry>,
    stats: Arc<IngestStats>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Ingest accept loop stopping");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!(%peer, "Agent connected");
                    stats.agents_connected.fetch_add(1, Ordering::Relaxed);
                    tracker.spawn(read_agent(
                        stream,
                        peer,
                        entries.clone(),
                        Arc::clone(&stats),
                        cancel.clone(),
                    ));
                }
                Err(e) => warn!("Failed to accept agent: {}", e),
            }
        }
    }
}

async fn read_agent(
    stream: TcpStream,
    peer: SocketAddr,
    entries: mpsc::Sender<Entry>,
    stats: Arc<IngestStats>,
    cancel: CancellationToken,
) {
    let mut frames = FramedRead::new(stream, LengthDelimitedCodec::new());

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = frames.next() => frame,
        };

        match frame {
            Some(Ok(bytes)) => match WireMessage::decode(&bytes) {
                Ok(WireMessage::TappedEntry(entry)) => {
                    stats.entries_received.fetch_add(1, Ordering::Relaxed);
                    if entries.send(*entry).await.is_err() {
                        return;
                    }
                }
                Ok(WireMessage::Status(_)) => debug!(%peer, "Ignoring status from agent"),
                Err(e) => {
                    stats.malformed_frames.fetch_add(1, Ordering::Relaxed);
                    warn!(%peer, "Skipping malformed frame: {}", e);
                }
            },
            Some(Err(e)) => {
                warn!(%peer, "Agent stream failed: {}", e);
                return;
            }
            None => {
                info!(%peer, "Agent disconnected");
                return;
            }
        }
    }
}
