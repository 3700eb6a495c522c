pub mod client;
pub mod cluster;
pub mod syncer;
pub mod types;
pub mod watcher;
pub mod workload;

pub use client::KubeCluster;
pub use cluster::{ClusterApi, ClusterError, PodEventStream};
pub use syncer::{
    ErrorPolicy, PodChange, ReconciliationError, SyncerConfig, SyncerHandle, SyncerState,
    TapperSyncer,
};
pub use types::{ClusterPod, PodEvent};
pub use watcher::PodWatcher;
pub use workload::{TapperPlan, WorkloadSpec};
