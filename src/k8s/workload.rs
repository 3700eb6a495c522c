//! Desired capture workloads and their Kubernetes manifests

use crate::config::{HubConfig, TapperResources};
use crate::k8s::cluster::ClusterError;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Capabilities, ConfigMap, Container, EnvVar, EnvVarSource, NodeAffinity,
    NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, ObjectFieldSelector, PodSpec,
    PodTemplateSpec, ResourceRequirements, SecurityContext,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use std::collections::BTreeMap;
use tapscope_common::{env, AddressesPerNode, FilteringOptions, PodInfo};

pub const TAPPER_NAME: &str = "tapscope-tapper";
pub const COORDINATION_NAME: &str = "tapscope-tap-targets";
pub const OWNER_ANNOTATION: &str = "tapscope.io/owner";
pub const FIELD_MANAGER: &str = "tapscope";

const APP_LABEL: &str = "app.kubernetes.io/name";
const ADDRESSES_KEY: &str = "addressesPerNode";

/// The pods to capture and, derived from them, the addresses per node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TapperPlan {
    pub pods: Vec<PodInfo>,
    pub addresses_per_node: AddressesPerNode,
}

impl TapperPlan {
    pub fn from_pods(pods: impl IntoIterator<Item = PodInfo>) -> Self {
        let mut pods: Vec<PodInfo> = pods.into_iter().collect();
        pods.sort();
        pods.dedup();

        let mut addresses_per_node = AddressesPerNode::new();
        for pod in &pods {
            addresses_per_node
                .entry(pod.node_name.clone())
                .or_default()
                .push(pod.ip.clone());
        }
        for addresses in addresses_per_node.values_mut() {
            addresses.sort();
            addresses.dedup();
        }

        Self {
            pods,
            addresses_per_node,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }

    /// Nodes that need a capture pod
    pub fn nodes(&self) -> Vec<String> {
        self.addresses_per_node.keys().cloned().collect()
    }
}

/// Everything about the tapper workload that does not depend on the plan
#[derive(Debug, Clone)]
pub struct WorkloadSpec {
    pub namespace: String,
    pub agent_image: String,
    pub image_pull_policy: String,
    pub hub_address: String,
    pub filtering_options: FilteringOptions,
    pub resources: TapperResources,
}

impl WorkloadSpec {
    pub fn from_config(config: &HubConfig) -> Self {
        Self {
            namespace: config.resources_namespace.clone(),
            agent_image: config.agent_image.clone(),
            image_pull_policy: config.image_pull_policy.clone(),
            hub_address: config.hub_address(),
            filtering_options: config.effective_filtering(),
            resources: config.tapper_resources.clone(),
        }
    }
}

fn labels() -> BTreeMap<String, String> {
    BTreeMap::from([(APP_LABEL.to_string(), TAPPER_NAME.to_string())])
}

fn owner_annotations(owner: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(OWNER_ANNOTATION.to_string(), owner.to_string())])
}

fn to_json<T: serde::Serialize>(what: &str, value: &T) -> Result<String, ClusterError> {
    serde_json::to_string(value)
        .map_err(|e| ClusterError::Api(format!("cannot encode {}: {}", what, e)))
}

fn plain_env(name: &str, value: String) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value),
        ..Default::default()
    }
}

fn quantities(cpu: &str, memory: &str) -> BTreeMap<String, Quantity> {
    BTreeMap::from([
        ("cpu".to_string(), Quantity(cpu.to_string())),
        ("memory".to_string(), Quantity(memory.to_string())),
    ])
}

/// One capture pod on each node of the plan, pinned by node affinity
pub fn build_daemon_set(
    spec: &WorkloadSpec,
    owner: &str,
    plan: &TapperPlan,
) -> Result<DaemonSet, ClusterError> {
    let env_vars = vec![
        plain_env(env::HUB_ADDRESS, spec.hub_address.clone()),
        plain_env(
            env::TAPPED_ADDRESSES_PER_NODE,
            to_json("tapped addresses", &plan.addresses_per_node)?,
        ),
        plain_env(
            env::FILTERING_OPTIONS,
            to_json("filtering options", &spec.filtering_options)?,
        ),
        EnvVar {
            name: env::NODE_NAME.to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "spec.nodeName".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];

    let container = Container {
        name: "tapper".to_string(),
        image: Some(spec.agent_image.clone()),
        image_pull_policy: Some(spec.image_pull_policy.clone()),
        env: Some(env_vars),
        resources: Some(ResourceRequirements {
            requests: Some(quantities(
                &spec.resources.cpu_request,
                &spec.resources.memory_request,
            )),
            limits: Some(quantities(
                &spec.resources.cpu_limit,
                &spec.resources.memory_limit,
            )),
            ..Default::default()
        }),
        security_context: Some(SecurityContext {
            capabilities: Some(Capabilities {
                add: Some(vec!["NET_RAW".to_string(), "NET_ADMIN".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    let affinity = Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_fields: Some(vec![NodeSelectorRequirement {
                        key: "metadata.name".to_string(),
                        operator: "In".to_string(),
                        values: Some(plan.nodes()),
                    }]),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    Ok(DaemonSet {
        metadata: ObjectMeta {
            name: Some(TAPPER_NAME.to_string()),
            namespace: Some(spec.namespace.clone()),
            labels: Some(labels()),
            annotations: Some(owner_annotations(owner)),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    host_network: Some(true),
                    dns_policy: Some("ClusterFirstWithHostNet".to_string()),
                    affinity: Some(affinity),
                    termination_grace_period_seconds: Some(0),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// The coordination object; records the owner and the tapped addresses
pub fn build_config_map(
    spec: &WorkloadSpec,
    owner: &str,
    plan: &TapperPlan,
) -> Result<ConfigMap, ClusterError> {
    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(COORDINATION_NAME.to_string()),
            namespace: Some(spec.namespace.clone()),
            labels: Some(labels()),
            annotations: Some(owner_annotations(owner)),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            ADDRESSES_KEY.to_string(),
            to_json("tapped addresses", &plan.addresses_per_node)?,
        )])),
        ..Default::default()
    })
}

/// Owner recorded on an existing coordination object
pub fn coordination_owner(config_map: &ConfigMap) -> Option<&str> {
    config_map
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(OWNER_ANNOTATION))
        .map(String::as_str)
}

/// Coordination object claiming it for `owner`.
///
/// A claim on an existing object carries its resourceVersion, so a
/// concurrent write by another hub makes the update fail instead of
/// silently taking the object over.
pub fn claim_config_map(
    spec: &WorkloadSpec,
    owner: &str,
    existing: Option<&ConfigMap>,
) -> Result<ConfigMap, ClusterError> {
    let mut config_map = build_config_map(spec, owner, &TapperPlan::default())?;
    if let Some(existing) = existing {
        if let Some(current) = coordination_owner(existing) {
            if current != owner {
                return Err(ClusterError::Conflict {
                    name: COORDINATION_NAME.to_string(),
                    owner: current.to_string(),
                });
            }
        }
        config_map.metadata.resource_version = existing.metadata.resource_version.clone();
    }
    Ok(config_map)
}
