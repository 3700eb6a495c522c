//! Fleet syncer
//!
//! Keeps the tapper workloads consistent with the pods that match the tap
//! filter. The loop owns the set of currently tapped pods and publishes it
//! only through the `pod_changes` channel; failures go out on `errors`.
//! Both channels close when the loop stops.

use crate::config::{HubConfig, ReconciliationErrorPolicy};
use crate::k8s::cluster::{ClusterApi, ClusterError, PodEventStream};
use crate::k8s::types::{ClusterPod, PodEvent};
use crate::k8s::workload::TapperPlan;
use futures::StreamExt;
use regex::Regex;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tapscope_common::PodInfo;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

const DEFAULT_MAX_TRANSIENT_FAILURES: u32 = 3;
const DEFAULT_EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncerState {
    Initializing,
    Watching,
    Reconciling,
    Degraded,
    Stopped,
}

/// What the loop does after reporting an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Stop the loop
    #[default]
    Halt,
    /// Keep watching and retry on the next event or tick
    Continue,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconciliationError {
    #[error("cannot list pods: {0}")]
    ListFailed(ClusterError),

    #[error("cannot claim tap coordination: {0}")]
    ClaimFailed(ClusterError),

    #[error("cannot apply tapper for {pods} pods: {source}")]
    ApplyFailed { pods: usize, source: ClusterError },

    #[error("cannot remove tapper: {0}")]
    RemoveFailed(ClusterError),

    #[error("pod watch failed: {0}")]
    WatchFailed(ClusterError),

    #[error("tap coordination conflict: {0}")]
    Conflict(ClusterError),
}

impl ReconciliationError {
    fn cause(&self) -> &ClusterError {
        match self {
            ReconciliationError::ListFailed(e)
            | ReconciliationError::ClaimFailed(e)
            | ReconciliationError::RemoveFailed(e)
            | ReconciliationError::WatchFailed(e)
            | ReconciliationError::Conflict(e) => e,
            ReconciliationError::ApplyFailed { source, .. } => source,
        }
    }

    pub fn is_irrecoverable(&self) -> bool {
        matches!(self, ReconciliationError::Conflict(_)) || self.cause().is_irrecoverable()
    }
}

/// The tapped pod set after a successful convergence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodChange {
    pub tapped: Vec<PodInfo>,
    pub added: Vec<PodInfo>,
    pub removed: Vec<PodInfo>,
}

impl PodChange {
    fn between(previous: &[PodInfo], current: &[PodInfo]) -> Self {
        Self {
            tapped: current.to_vec(),
            added: current
                .iter()
                .filter(|p| !previous.contains(p))
                .cloned()
                .collect(),
            removed: previous
                .iter()
                .filter(|p| !current.contains(p))
                .cloned()
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncerConfig {
    pub target_namespaces: Vec<String>,
    pub pod_regex: Regex,
    pub resync_interval: Duration,
    pub error_policy: ErrorPolicy,
    pub owner_id: String,
    /// Consecutive recoverable failures tolerated before an error is reported
    pub max_transient_failures: u32,
    pub event_buffer: usize,
}

impl SyncerConfig {
    pub fn new(target_namespaces: Vec<String>, pod_regex: Regex) -> Self {
        Self {
            target_namespaces,
            pod_regex,
            resync_interval: Duration::from_secs(30),
            error_policy: ErrorPolicy::default(),
            owner_id: "tapscope-hub".to_string(),
            max_transient_failures: DEFAULT_MAX_TRANSIENT_FAILURES,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    pub fn from_hub_config(config: &HubConfig) -> crate::Result<Self> {
        let error_policy = match config.reconciliation_error_policy {
            ReconciliationErrorPolicy::Fatal => ErrorPolicy::Halt,
            ReconciliationErrorPolicy::Continue => ErrorPolicy::Continue,
        };
        Ok(
            Self::new(config.target_namespaces.clone(), config.pod_regex()?)
                .with_resync_interval(config.resync_interval())
                .with_error_policy(error_policy)
                .with_owner_id(config.syncer_id.clone()),
        )
    }

    #[must_use]
    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    #[must_use]
    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    #[must_use]
    pub fn with_owner_id(mut self, owner: impl Into<String>) -> Self {
        self.owner_id = owner.into();
        self
    }

    #[must_use]
    pub fn with_max_transient_failures(mut self, failures: u32) -> Self {
        self.max_transient_failures = failures.max(1);
        self
    }

    /// Whether `pod` belongs in the tapped set
    pub fn selects(&self, pod: &ClusterPod) -> bool {
        self.target_namespaces.contains(&pod.namespace) && self.pod_regex.is_match(&pod.name)
    }
}

/// Receiving ends of a running syncer
pub struct SyncerHandle {
    pub errors: mpsc::Receiver<ReconciliationError>,
    pub pod_changes: mpsc::Receiver<PodChange>,
    pub state: watch::Receiver<SyncerState>,
    pub join: JoinHandle<()>,
}

pub struct TapperSyncer;

impl TapperSyncer {
    /// Claim coordination, take the initial pod list, subscribe to pod
    /// changes and spawn the loop on `tracker`.
    ///
    /// Failures before the loop starts are returned, never retried.
    pub async fn start<C: ClusterApi>(
        cluster: Arc<C>,
        config: SyncerConfig,
        cancel: CancellationToken,
        tracker: &TaskTracker,
    ) -> Result<SyncerHandle, ReconciliationError> {
        let (state_tx, state_rx) = watch::channel(SyncerState::Initializing);

        cluster
            .claim_coordination(&config.owner_id)
            .await
            .map_err(|e| match e {
                ClusterError::Conflict { .. } => ReconciliationError::Conflict(e),
                e => ReconciliationError::ClaimFailed(e),
            })?;

        let pods = cluster
            .list_pods(&config.target_namespaces)
            .await
            .map_err(ReconciliationError::ListFailed)?;

        let watch = cluster
            .watch_pods(&config.target_namespaces)
            .await
            .map_err(ReconciliationError::WatchFailed)?;

        info!(
            namespaces = ?config.target_namespaces,
            regex = %config.pod_regex,
            pods = pods.len(),
            "Fleet syncer started"
        );

        let (errors_tx, errors_rx) = mpsc::channel(config.event_buffer.max(1));
        let (changes_tx, changes_rx) = mpsc::channel(config.event_buffer.max(1));

        let mut sync_loop = SyncLoop {
            cluster,
            config,
            cancel,
            pods: BTreeMap::new(),
            deployed: None,
            tapped: Vec::new(),
            transient_failures: 0,
            halted: false,
            errors: errors_tx,
            changes: changes_tx,
            state: state_tx,
        };
        sync_loop.replace_pods(pods);

        let join = tracker.spawn(sync_loop.run(watch));

        Ok(SyncerHandle {
            errors: errors_rx,
            pod_changes: changes_rx,
            state: state_rx,
            join,
        })
    }
}

struct SyncLoop<C> {
    cluster: Arc<C>,
    config: SyncerConfig,
    cancel: CancellationToken,
    /// Watched pods by `namespace/name`
    pods: BTreeMap<String, ClusterPod>,
    /// Last successfully applied plan; `None` until the first reconcile
    deployed: Option<TapperPlan>,
    tapped: Vec<PodInfo>,
    transient_failures: u32,
    halted: bool,
    errors: mpsc::Sender<ReconciliationError>,
    changes: mpsc::Sender<PodChange>,
    state: watch::Sender<SyncerState>,
}

async fn next_event(
    watch: &mut Option<PodEventStream>,
) -> Option<Result<PodEvent, ClusterError>> {
    match watch {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

impl<C: ClusterApi> SyncLoop<C> {
    async fn run(mut self, watch: PodEventStream) {
        let mut watch = Some(watch);

        self.reconcile().await;

        let mut ticker = interval(self.config.resync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        while !self.halted {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    debug!("Fleet syncer cancelled");
                    break;
                }

                event = next_event(&mut watch) => match event {
                    Some(Ok(event)) => {
                        self.apply_event(event);
                        self.reconcile().await;
                    }
                    Some(Err(e)) => {
                        self.fail(ReconciliationError::WatchFailed(e)).await;
                    }
                    None => {
                        warn!("Pod watch ended, resubscribing on next resync");
                        watch = None;
                    }
                },

                _ = ticker.tick() => {
                    self.resync(&mut watch).await;
                }
            }
        }

        if self.halted {
            info!("Fleet syncer halted");
        }
        self.set_state(SyncerState::Stopped);
        info!("Fleet syncer stopped");
    }

    /// Run `call` unless the loop is cancelled first
    async fn cancellable<T>(&self, call: impl Future<Output = T>) -> Option<T> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            result = call => Some(result),
        }
    }

    fn set_state(&self, state: SyncerState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                debug!(from = ?*current, to = ?state, "Syncer state change");
                *current = state;
                true
            }
        });
    }

    fn replace_pods(&mut self, pods: Vec<ClusterPod>) {
        self.pods = pods.into_iter().map(|pod| (pod.key(), pod)).collect();
    }

    fn apply_event(&mut self, event: PodEvent) {
        match event {
            PodEvent::Applied(pod) => {
                self.pods.insert(pod.key(), pod);
            }
            PodEvent::Deleted(pod) => {
                self.pods.remove(&pod.key());
            }
            PodEvent::Restarted(pods) => {
                debug!(pods = pods.len(), "Pod watch restarted");
                self.replace_pods(pods);
            }
        }
    }

    fn desired_plan(&self) -> TapperPlan {
        TapperPlan::from_pods(
            self.pods
                .values()
                .filter(|pod| self.config.selects(pod))
                .filter_map(ClusterPod::tap_target),
        )
    }

    /// Re-list pods, resubscribe a lost watch and reconcile
    async fn resync(&mut self, watch: &mut Option<PodEventStream>) {
        let namespaces = self.config.target_namespaces.clone();

        let Some(listed) = self.cancellable(self.cluster.list_pods(&namespaces)).await else {
            return;
        };
        match listed {
            Ok(pods) => self.replace_pods(pods),
            Err(e) => {
                self.fail(ReconciliationError::ListFailed(e)).await;
                return;
            }
        }

        if watch.is_none() {
            let Some(subscribed) = self.cancellable(self.cluster.watch_pods(&namespaces)).await
            else {
                return;
            };
            match subscribed {
                Ok(stream) => {
                    info!("Pod watch resubscribed");
                    *watch = Some(stream);
                }
                Err(e) => {
                    self.fail(ReconciliationError::WatchFailed(e)).await;
                    return;
                }
            }
        }

        self.reconcile().await;
    }

    async fn reconcile(&mut self) {
        let plan = self.desired_plan();
        if self.deployed.as_ref() == Some(&plan) {
            self.transient_failures = 0;
            self.set_state(SyncerState::Watching);
            return;
        }

        self.set_state(SyncerState::Reconciling);

        let owner = self.config.owner_id.clone();
        let cluster = Arc::clone(&self.cluster);
        let result = if plan.is_empty() {
            self.cancellable(cluster.remove_tapper(&owner))
                .await
                .map(|r| r.map_err(ReconciliationError::RemoveFailed))
        } else {
            self.cancellable(cluster.apply_tapper(&owner, &plan))
                .await
                .map(|r| {
                    r.map_err(|source| ReconciliationError::ApplyFailed {
                        pods: plan.pods.len(),
                        source,
                    })
                })
        };

        match result {
            None => {}
            Some(Ok(())) => {
                self.transient_failures = 0;
                let changed = plan.pods != self.tapped;
                let change = PodChange::between(&self.tapped, &plan.pods);
                self.tapped = plan.pods.clone();
                self.deployed = Some(plan);
                self.set_state(SyncerState::Watching);

                if changed {
                    info!(
                        tapped = change.tapped.len(),
                        added = change.added.len(),
                        removed = change.removed.len(),
                        "Tapped pods changed"
                    );
                    if let Some(Err(_)) = self.cancellable(self.changes.send(change)).await {
                        debug!("Pod change receiver dropped, stopping");
                        self.halted = true;
                    }
                }
            }
            Some(Err(e)) => self.fail(e).await,
        }
    }

    /// Report `error` once it is irrecoverable or has repeated too often
    async fn fail(&mut self, error: ReconciliationError) {
        if !error.is_irrecoverable() {
            self.transient_failures += 1;
            if self.transient_failures < self.config.max_transient_failures {
                warn!(
                    attempt = self.transient_failures,
                    limit = self.config.max_transient_failures,
                    "Reconciliation failed, will retry: {}",
                    error
                );
                return;
            }
        }

        error!("Reconciliation error: {}", error);
        self.transient_failures = 0;
        self.set_state(SyncerState::Degraded);

        // a closed receiver means nobody is left to decide; stop either way
        let delivered = self.cancellable(self.errors.send(error)).await;
        if !matches!(delivered, Some(Ok(()))) {
            self.halted = true;
            return;
        }

        if self.config.error_policy == ErrorPolicy::Halt {
            self.halted = true;
        }
    }
}
