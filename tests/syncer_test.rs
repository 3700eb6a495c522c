use async_trait::async_trait;
use futures::channel::mpsc as watch_channel;
use futures::StreamExt;
use regex::Regex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tapscope::k8s::{
    ClusterApi, ClusterError, ClusterPod, ErrorPolicy, PodEvent, PodEventStream,
    ReconciliationError, SyncerConfig, SyncerHandle, SyncerState, TapperPlan, TapperSyncer,
};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

type WatchSender = watch_channel::UnboundedSender<Result<PodEvent, ClusterError>>;

#[derive(Default)]
struct FakeCluster {
    pods: Mutex<Vec<ClusterPod>>,
    watch: Mutex<Option<WatchSender>>,
    applied: Mutex<Vec<TapperPlan>>,
    removals: AtomicUsize,
    apply_failures: Mutex<VecDeque<ClusterError>>,
    existing_owner: Mutex<Option<String>>,
}

impl FakeCluster {
    fn with_pods(pods: Vec<ClusterPod>) -> Arc<Self> {
        let cluster = Self::default();
        *cluster.pods.lock().unwrap() = pods;
        Arc::new(cluster)
    }

    fn fail_next_apply(&self, error: ClusterError) {
        self.apply_failures.lock().unwrap().push_back(error);
    }

    fn send(&self, event: PodEvent) {
        {
            let mut pods = self.pods.lock().unwrap();
            match &event {
                PodEvent::Applied(pod) => {
                    pods.retain(|p| p.key() != pod.key());
                    pods.push(pod.clone());
                }
                PodEvent::Deleted(pod) => pods.retain(|p| p.key() != pod.key()),
                PodEvent::Restarted(all) => *pods = all.clone(),
            }
        }
        let watch = self.watch.lock().unwrap();
        watch
            .as_ref()
            .expect("watch not started")
            .unbounded_send(Ok(event))
            .unwrap();
    }

    fn apply_count(&self) -> usize {
        self.applied.lock().unwrap().len()
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_pods(&self, namespaces: &[String]) -> Result<Vec<ClusterPod>, ClusterError> {
        Ok(self
            .pods
            .lock()
            .unwrap()
            .iter()
            .filter(|p| namespaces.contains(&p.namespace))
            .cloned()
            .collect())
    }

    async fn watch_pods(&self, _namespaces: &[String]) -> Result<PodEventStream, ClusterError> {
        let (tx, rx) = watch_channel::unbounded();
        *self.watch.lock().unwrap() = Some(tx);
        Ok(rx.boxed())
    }

    async fn claim_coordination(&self, owner: &str) -> Result<(), ClusterError> {
        let mut existing = self.existing_owner.lock().unwrap();
        match existing.as_deref() {
            Some(current) if current != owner => Err(ClusterError::Conflict {
                name: "tapscope-tap-targets".to_string(),
                owner: current.to_string(),
            }),
            _ => {
                *existing = Some(owner.to_string());
                Ok(())
            }
        }
    }

    async fn apply_tapper(&self, _owner: &str, plan: &TapperPlan) -> Result<(), ClusterError> {
        if let Some(error) = self.apply_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.applied.lock().unwrap().push(plan.clone());
        Ok(())
    }

    async fn remove_tapper(&self, _owner: &str) -> Result<(), ClusterError> {
        self.removals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn pod(ns: &str, name: &str, ip: &str) -> ClusterPod {
    ClusterPod {
        name: name.to_string(),
        namespace: ns.to_string(),
        node_name: Some("node-a".to_string()),
        pod_ip: Some(ip.to_string()),
        phase: "Running".to_string(),
    }
}

fn config() -> SyncerConfig {
    SyncerConfig::new(vec!["shop".to_string()], Regex::new("^front-").unwrap())
        .with_resync_interval(Duration::from_secs(30))
}

async fn start(cluster: &Arc<FakeCluster>, config: SyncerConfig) -> (SyncerHandle, CancellationToken, TaskTracker) {
    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();
    let handle = TapperSyncer::start(Arc::clone(cluster), config, cancel.clone(), &tracker)
        .await
        .unwrap();
    (handle, cancel, tracker)
}

fn names(change: &tapscope::k8s::PodChange) -> Vec<String> {
    change.tapped.iter().map(|p| p.name.clone()).collect()
}

#[tokio::test(start_paused = true)]
async fn test_tapped_set_matches_regex_and_namespaces() {
    let cluster = FakeCluster::with_pods(vec![
        pod("shop", "front-1", "10.1.0.1"),
        pod("shop", "back-1", "10.1.0.2"),
        pod("other", "front-2", "10.1.0.3"),
    ]);
    let (mut handle, cancel, tracker) = start(&cluster, config()).await;

    let change = handle.pod_changes.recv().await.unwrap();
    assert_eq!(names(&change), vec!["front-1"]);
    assert_eq!(cluster.apply_count(), 1);
    assert_eq!(
        cluster.applied.lock().unwrap()[0].addresses_per_node["node-a"],
        vec!["10.1.0.1"]
    );

    cancel.cancel();
    tracker.close();
    tracker.wait().await;
}

#[tokio::test(start_paused = true)]
async fn test_one_event_per_change() {
    let cluster = FakeCluster::with_pods(vec![pod("shop", "front-1", "10.1.0.1")]);
    let (mut handle, cancel, tracker) = start(&cluster, config()).await;
    assert_eq!(names(&handle.pod_changes.recv().await.unwrap()), vec!["front-1"]);

    cluster.send(PodEvent::Applied(pod("shop", "front-2", "10.1.0.2")));
    let added = handle.pod_changes.recv().await.unwrap();
    assert_eq!(names(&added), vec!["front-1", "front-2"]);
    assert_eq!(added.added.len(), 1);

    // neither of these changes the tapped set
    cluster.send(PodEvent::Applied(pod("shop", "back-1", "10.1.0.3")));
    cluster.send(PodEvent::Applied(pod("shop", "front-2", "10.1.0.2")));

    cluster.send(PodEvent::Deleted(pod("shop", "front-1", "10.1.0.1")));
    let removed = handle.pod_changes.recv().await.unwrap();
    assert_eq!(names(&removed), vec!["front-2"]);
    assert_eq!(removed.removed[0].name, "front-1");

    assert_eq!(cluster.apply_count(), 3);
    assert!(handle.errors.try_recv().is_err());

    cancel.cancel();
    tracker.close();
    tracker.wait().await;
    assert!(handle.pod_changes.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_empty_initial_set_removes_tapper_without_event() {
    let cluster = FakeCluster::with_pods(vec![pod("shop", "back-1", "10.1.0.1")]);
    let (mut handle, cancel, tracker) = start(&cluster, config()).await;

    cluster.send(PodEvent::Applied(pod("shop", "front-1", "10.1.0.2")));
    let change = handle.pod_changes.recv().await.unwrap();
    assert_eq!(names(&change), vec!["front-1"]);
    assert_eq!(cluster.removals.load(Ordering::SeqCst), 1);

    cluster.send(PodEvent::Deleted(pod("shop", "front-1", "10.1.0.2")));
    assert!(handle.pod_changes.recv().await.unwrap().tapped.is_empty());
    assert_eq!(cluster.removals.load(Ordering::SeqCst), 2);

    cancel.cancel();
    tracker.close();
    tracker.wait().await;
}

#[tokio::test(start_paused = true)]
async fn test_halt_policy_emits_one_error_and_stops() {
    let cluster = FakeCluster::with_pods(vec![pod("shop", "front-1", "10.1.0.1")]);
    cluster.fail_next_apply(ClusterError::Forbidden("daemonsets".to_string()));
    let (mut handle, _cancel, tracker) =
        start(&cluster, config().with_error_policy(ErrorPolicy::Halt)).await;

    let error = handle.errors.recv().await.unwrap();
    assert!(matches!(error, ReconciliationError::ApplyFailed { pods: 1, .. }));

    // loop terminated: both channels close
    assert!(handle.errors.recv().await.is_none());
    assert!(handle.pod_changes.recv().await.is_none());

    tracker.close();
    tracker.wait().await;
    assert_eq!(*handle.state.borrow(), SyncerState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_continue_policy_recovers() {
    let cluster = FakeCluster::with_pods(vec![pod("shop", "front-1", "10.1.0.1")]);
    cluster.fail_next_apply(ClusterError::Forbidden("daemonsets".to_string()));
    let (mut handle, cancel, tracker) =
        start(&cluster, config().with_error_policy(ErrorPolicy::Continue)).await;

    assert!(handle.errors.recv().await.is_some());
    assert_eq!(*handle.state.borrow(), SyncerState::Degraded);

    // the next resync retries and succeeds
    let change = handle.pod_changes.recv().await.unwrap();
    assert_eq!(names(&change), vec!["front-1"]);
    assert_eq!(*handle.state.borrow(), SyncerState::Watching);
    assert!(handle.errors.try_recv().is_err());

    cancel.cancel();
    tracker.close();
    tracker.wait().await;
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_below_threshold_are_not_reported() {
    let cluster = FakeCluster::with_pods(vec![pod("shop", "front-1", "10.1.0.1")]);
    cluster.fail_next_apply(ClusterError::Unavailable("connection reset".to_string()));
    cluster.fail_next_apply(ClusterError::Unavailable("connection reset".to_string()));
    let (mut handle, cancel, tracker) =
        start(&cluster, config().with_max_transient_failures(3)).await;

    let change = handle.pod_changes.recv().await.unwrap();
    assert_eq!(names(&change), vec!["front-1"]);
    assert!(handle.errors.try_recv().is_err());

    cancel.cancel();
    tracker.close();
    tracker.wait().await;
}

#[tokio::test(start_paused = true)]
async fn test_repeated_transient_failures_reported_once() {
    let cluster = FakeCluster::with_pods(vec![pod("shop", "front-1", "10.1.0.1")]);
    for _ in 0..3 {
        cluster.fail_next_apply(ClusterError::Unavailable("timeout".to_string()));
    }
    let (mut handle, _cancel, tracker) = start(
        &cluster,
        config()
            .with_max_transient_failures(3)
            .with_error_policy(ErrorPolicy::Halt),
    )
    .await;

    assert!(handle.errors.recv().await.is_some());
    assert!(handle.errors.recv().await.is_none());
    assert_eq!(cluster.apply_count(), 0);

    tracker.close();
    tracker.wait().await;
}

#[tokio::test(start_paused = true)]
async fn test_watch_restart_replaces_pod_set() {
    let cluster = FakeCluster::with_pods(vec![pod("shop", "front-1", "10.1.0.1")]);
    let (mut handle, cancel, tracker) = start(&cluster, config()).await;
    handle.pod_changes.recv().await.unwrap();

    cluster.send(PodEvent::Restarted(vec![pod("shop", "front-9", "10.1.0.9")]));
    let change = handle.pod_changes.recv().await.unwrap();
    assert_eq!(names(&change), vec!["front-9"]);
    assert_eq!(change.removed[0].name, "front-1");

    cancel.cancel();
    tracker.close();
    tracker.wait().await;
}

#[tokio::test]
async fn test_coordination_conflict_is_fatal_at_start() {
    let cluster = Arc::new(FakeCluster::default());
    *cluster.existing_owner.lock().unwrap() = Some("someone-else".to_string());

    let result = TapperSyncer::start(
        cluster,
        config(),
        CancellationToken::new(),
        &TaskTracker::new(),
    )
    .await;
    assert!(matches!(result, Err(ReconciliationError::Conflict(_))));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_loop() {
    let cluster = FakeCluster::with_pods(vec![]);
    let (mut handle, cancel, tracker) = start(&cluster, config()).await;

    cancel.cancel();
    tracker.close();
    tracker.wait().await;

    assert!(handle.pod_changes.recv().await.is_none());
    assert!(handle.errors.recv().await.is_none());
    assert_eq!(*handle.state.borrow(), SyncerState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_change_receiver_stops_loop() {
    let cluster = FakeCluster::with_pods(vec![pod("shop", "front-1", "10.1.0.1")]);
    let (handle, cancel, tracker) = start(&cluster, config()).await;
    let SyncerHandle {
        errors,
        mut pod_changes,
        state,
        join,
    } = handle;
    assert_eq!(names(&pod_changes.recv().await.unwrap()), vec!["front-1"]);
    drop(pod_changes);

    cluster.send(PodEvent::Applied(pod("shop", "front-2", "10.1.0.2")));
    join.await.unwrap();

    assert_eq!(*state.borrow(), SyncerState::Stopped);
    assert_eq!(cluster.apply_count(), 2);
    assert!(!cancel.is_cancelled());
    drop(errors);
    tracker.close();
    tracker.wait().await;
}
