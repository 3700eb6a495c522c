//! Consumer of fleet syncer events
//!
//! Pod changes become tap status snapshots for observers. Reconciliation
//! errors are handled per `ReconciliationErrorPolicy`: `Fatal` cancels the
//! whole process and returns the error, `Continue` only logs it.

use crate::config::ReconciliationErrorPolicy;
use crate::hub::broadcaster::StatusBroadcaster;
use crate::k8s::SyncerHandle;
use crate::Result;
use tapscope_common::TapStatus;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub async fn run_daemon(
    handle: SyncerHandle,
    broadcaster: StatusBroadcaster,
    policy: ReconciliationErrorPolicy,
    cancel: CancellationToken,
) -> Result<()> {
    let SyncerHandle {
        mut errors,
        mut pod_changes,
        ..
    } = handle;
    let mut changes_open = true;
    let mut errors_open = true;

    while changes_open || errors_open {
        tokio::select! {
            _ = cancel.cancelled() => break,

            change = pod_changes.recv(), if changes_open => match change {
                Some(change) => {
                    let status = TapStatus::from_pods(change.tapped);
                    info!(pods = status.pods.len(), "Publishing tap status");
                    if let Err(e) = broadcaster.publish_status(status) {
                        warn!("Cannot publish tap status: {}", e);
                    }
                }
                None => changes_open = false,
            },

            failure = errors.recv(), if errors_open => match failure {
                Some(e) => match policy {
                    ReconciliationErrorPolicy::Fatal => {
                        error!("Fleet syncer failed: {}", e);
                        cancel.cancel();
                        return Err(e.into());
                    }
                    ReconciliationErrorPolicy::Continue => {
                        warn!("Fleet syncer error (continuing): {}", e);
                    }
                },
                None => errors_open = false,
            },
        }
    }

    info!("Fleet syncer events closed");
    Ok(())
}
