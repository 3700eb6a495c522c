//! Tapped pod descriptions and status snapshots

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Pod IP addresses to capture, keyed by node name
pub type AddressesPerNode = BTreeMap<String, Vec<String>>;

/// A pod selected for capture
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodInfo {
    pub namespace: String,
    pub name: String,
    pub node_name: String,
    pub ip: String,
}

impl PodInfo {
    /// `namespace/name`, unique within a cluster
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Snapshot of currently tapped pods, pushed to observers on every change
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapStatus {
    pub pods: Vec<PodInfo>,
}

impl TapStatus {
    /// Build a status with pods in a stable order
    pub fn from_pods(pods: impl IntoIterator<Item = PodInfo>) -> Self {
        let mut pods: Vec<PodInfo> = pods.into_iter().collect();
        pods.sort();
        Self { pods }
    }
}
