use crate::k8s::cluster::{ClusterApi, ClusterError, PodEventStream};
use crate::k8s::types::ClusterPod;
use crate::k8s::watcher::PodWatcher;
use crate::k8s::workload::{
    build_config_map, build_daemon_set, claim_config_map, coordination_owner, TapperPlan,
    WorkloadSpec,
    COORDINATION_NAME, FIELD_MANAGER, TAPPER_NAME,
};
use crate::{Result, TapscopeError};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client};
use tracing::{debug, info};

impl From<kube::Error> for ClusterError {
    fn from(e: kube::Error) -> Self {
        match &e {
            kube::Error::Api(response) if response.code == 401 || response.code == 403 => {
                ClusterError::Forbidden(response.message.clone())
            }
            kube::Error::HyperError(_) | kube::Error::Service(_) => {
                ClusterError::Unavailable(e.to_string())
            }
            _ => ClusterError::Api(e.to_string()),
        }
    }
}

fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(response) if response.code == 404)
}

fn is_conflict(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(response) if response.code == 409)
}

/// Cluster access through the kube client
pub struct KubeCluster {
    client: Client,
    spec: WorkloadSpec,
}

impl KubeCluster {
    pub async fn try_default(spec: WorkloadSpec) -> Result<Self> {
        debug!("Initializing Kubernetes client");

        let client = Client::try_default().await.map_err(|e| {
            TapscopeError::KubernetesError(format!("Failed to create K8s client: {}", e))
        })?;

        info!("Successfully connected to Kubernetes cluster");

        Ok(Self { client, spec })
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn daemon_sets(&self) -> Api<DaemonSet> {
        Api::namespaced(self.client.clone(), &self.spec.namespace)
    }

    fn config_maps(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.spec.namespace)
    }

    fn apply_params() -> PatchParams {
        PatchParams::apply(FIELD_MANAGER).force()
    }

    /// Conflict naming whoever holds the coordination object now
    async fn claim_conflict(&self) -> ClusterError {
        let owner = match self.config_maps().get_opt(COORDINATION_NAME).await {
            Ok(Some(current)) => coordination_owner(&current)
                .unwrap_or("unknown")
                .to_string(),
            _ => "unknown".to_string(),
        };
        ClusterError::Conflict {
            name: COORDINATION_NAME.to_string(),
            owner,
        }
    }

    async fn apply_config_map(&self, owner: &str, plan: &TapperPlan) -> std::result::Result<(), ClusterError> {
        let config_map = build_config_map(&self.spec, owner, plan)?;
        self.config_maps()
            .patch(COORDINATION_NAME, &Self::apply_params(), &Patch::Apply(&config_map))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn list_pods(&self, namespaces: &[String]) -> std::result::Result<Vec<ClusterPod>, ClusterError> {
        let mut pods = Vec::new();
        for namespace in namespaces {
            let list = self.pods(namespace).list(&ListParams::default()).await?;
            pods.extend(list.items.iter().map(ClusterPod::from_k8s_pod));
        }
        debug!(count = pods.len(), "Listed pods");
        Ok(pods)
    }

    async fn watch_pods(&self, namespaces: &[String]) -> std::result::Result<PodEventStream, ClusterError> {
        let watcher = match namespaces {
            [namespace] => PodWatcher::new(self.pods(namespace), namespaces.to_vec()),
            _ => PodWatcher::new(Api::all(self.client.clone()), namespaces.to_vec()),
        };
        Ok(watcher.events())
    }

    async fn claim_coordination(&self, owner: &str) -> std::result::Result<(), ClusterError> {
        let config_maps = self.config_maps();
        let existing = config_maps.get_opt(COORDINATION_NAME).await?;
        let claim = claim_config_map(&self.spec, owner, existing.as_ref())?;

        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        // create fails if another hub created it first, replace if it changed since the read
        let written = match existing {
            None => config_maps.create(&params, &claim).await,
            Some(_) => config_maps.replace(COORDINATION_NAME, &params, &claim).await,
        };
        match written {
            Ok(_) => {}
            Err(e) if is_conflict(&e) => return Err(self.claim_conflict().await),
            Err(e) => return Err(e.into()),
        }

        info!(owner, namespace = %self.spec.namespace, "Claimed tap coordination");
        Ok(())
    }

    async fn apply_tapper(&self, owner: &str, plan: &TapperPlan) -> std::result::Result<(), ClusterError> {
        self.apply_config_map(owner, plan).await?;

        let daemon_set = build_daemon_set(&self.spec, owner, plan)?;
        self.daemon_sets()
            .patch(TAPPER_NAME, &Self::apply_params(), &Patch::Apply(&daemon_set))
            .await?;

        info!(
            nodes = plan.addresses_per_node.len(),
            pods = plan.pods.len(),
            "Applied tapper workload"
        );
        Ok(())
    }

    async fn remove_tapper(&self, owner: &str) -> std::result::Result<(), ClusterError> {
        match self
            .daemon_sets()
            .delete(TAPPER_NAME, &DeleteParams::default())
            .await
        {
            Ok(_) => info!("Removed tapper workload"),
            Err(e) if is_not_found(&e) => debug!("Tapper workload already absent"),
            Err(e) => return Err(e.into()),
        }

        self.apply_config_map(owner, &TapperPlan::default()).await
    }
}
