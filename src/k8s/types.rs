use serde::{Deserialize, Serialize};
use tapscope_common::PodInfo;

/// Pod as seen through the cluster API, before tap selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterPod {
    pub name: String,
    pub namespace: String,
    pub node_name: Option<String>,
    pub pod_ip: Option<String>,
    pub phase: String,
}

impl ClusterPod {
    pub fn from_k8s_pod(pod: &k8s_openapi::api::core::v1::Pod) -> Self {
        let metadata = &pod.metadata;
        let spec = pod.spec.as_ref();
        let status = pod.status.as_ref();

        Self {
            name: metadata.name.clone().unwrap_or_default(),
            namespace: metadata.namespace.clone().unwrap_or_default(),
            node_name: spec.and_then(|s| s.node_name.clone()),
            pod_ip: status.and_then(|s| s.pod_ip.clone()),
            phase: status
                .and_then(|s| s.phase.clone())
                .unwrap_or_else(|| "Unknown".to_string()),
        }
    }

    /// `namespace/name`
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// The tap target for this pod, if it is scheduled and has an address.
    ///
    /// Finished pods are never tapped.
    pub fn tap_target(&self) -> Option<PodInfo> {
        if self.phase == "Succeeded" || self.phase == "Failed" {
            return None;
        }
        let node_name = self.node_name.as_ref().filter(|n| !n.is_empty())?;
        let ip = self.pod_ip.as_ref().filter(|ip| !ip.is_empty())?;

        Some(PodInfo {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            node_name: node_name.clone(),
            ip: ip.clone(),
        })
    }
}

/// Change to the watched pod set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodEvent {
    Applied(ClusterPod),
    Deleted(ClusterPod),
    /// The watch restarted; this is the complete current pod set
    Restarted(Vec<ClusterPod>),
}
