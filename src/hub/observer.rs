//! TCP endpoint for observer clients
//!
//! Observers connect and receive newline-delimited JSON `WireMessage`s: the
//! latest tap status first, then entries and status changes as they are
//! published. Anything an observer sends is ignored.

use crate::hub::broadcaster::StatusBroadcaster;
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

pub struct ObserverServer {
    local_addr: SocketAddr,
}

impl ObserverServer {
    pub async fn bind(
        addr: &str,
        broadcaster: StatusBroadcaster,
        cancel: CancellationToken,
        tracker: &TaskTracker,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Observer endpoint listening on {}", local_addr);

        tracker.spawn(accept_loop(listener, broadcaster, cancel, tracker.clone()));
        Ok(Self { local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn accept_loop(
    listener: TcpListener,
    broadcaster: StatusBroadcaster,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Observer accept loop stopping");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => match broadcaster.subscribe() {
                    Ok((id, queue)) => {
                        info!(%peer, "Observer connected");
                        let broadcaster = broadcaster.clone();
                        let cancel = cancel.clone();
                        tracker.spawn(async move {
                            serve_observer(stream, queue, cancel).await;
                            broadcaster.unsubscribe(id);
                            info!(%peer, "Observer disconnected");
                        });
                    }
                    Err(e) => warn!(%peer, "Cannot subscribe observer: {}", e),
                },
                Err(e) => warn!("Failed to accept observer: {}", e),
            }
        }
    }
}

async fn serve_observer(
    stream: TcpStream,
    mut queue: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut discard = [0u8; 512];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            read = reader.read(&mut discard) => match read {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            },
            line = queue.recv() => {
                let Some(line) = line else {
                    return;
                };
                if let Err(e) = writer.write_all(&line).await {
                    debug!("Observer write failed: {}", e);
                    return;
                }
            }
        }
    }
}
