use crate::k8s::cluster::{ClusterError, PodEventStream};
use crate::k8s::types::{ClusterPod, PodEvent};
use futures::{future, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::Api;
use tracing::{debug, info, warn};

pub struct PodWatcher {
    api: Api<Pod>,
    namespaces: Vec<String>,
}

impl PodWatcher {
    /// Watch `api`, keeping only pods in `namespaces`
    pub fn new(api: Api<Pod>, namespaces: Vec<String>) -> Self {
        Self { api, namespaces }
    }

    /// Pod events with relists folded into a single `Restarted`
    pub fn events(self) -> PodEventStream {
        info!(namespaces = ?self.namespaces, "Starting pod watcher");

        let namespaces = self.namespaces;
        let in_scope = move |pod: &Pod| {
            pod.metadata
                .namespace
                .as_ref()
                .is_some_and(|ns| namespaces.contains(ns))
        };

        watcher::watcher(self.api, watcher::Config::default())
            .default_backoff()
            .scan(None, move |relist: &mut Option<Vec<ClusterPod>>, event| {
                let out = match event {
                    Ok(Event::Apply(pod)) if in_scope(&pod) => {
                        Some(Ok(PodEvent::Applied(ClusterPod::from_k8s_pod(&pod))))
                    }
                    Ok(Event::Delete(pod)) if in_scope(&pod) => {
                        Some(Ok(PodEvent::Deleted(ClusterPod::from_k8s_pod(&pod))))
                    }
                    Ok(Event::Apply(_)) | Ok(Event::Delete(_)) => None,
                    Ok(Event::Init) => {
                        debug!("Pod watch relisting");
                        *relist = Some(Vec::new());
                        None
                    }
                    Ok(Event::InitApply(pod)) => {
                        if in_scope(&pod) {
                            if let Some(pods) = relist.as_mut() {
                                pods.push(ClusterPod::from_k8s_pod(&pod));
                            }
                        }
                        None
                    }
                    Ok(Event::InitDone) => relist.take().map(|pods| Ok(PodEvent::Restarted(pods))),
                    Err(e) => {
                        warn!("Pod watch error: {}", e);
                        Some(Err(watch_error(e)))
                    }
                };
                future::ready(Some(out))
            })
            .filter_map(future::ready)
            .boxed()
    }
}

fn watch_error(e: watcher::Error) -> ClusterError {
    match e {
        watcher::Error::InitialListFailed(source)
        | watcher::Error::WatchStartFailed(source)
        | watcher::Error::WatchFailed(source) => match ClusterError::from(source) {
            ClusterError::Api(message) => ClusterError::Watch(message),
            other => other,
        },
        other => ClusterError::Watch(other.to_string()),
    }
}
