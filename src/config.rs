//! Hub configuration
//!
//! Loaded once at startup from a YAML file, then overridden by environment
//! variables. The result is validated as a whole; any problem aborts startup
//! before a task is spawned.

use crate::{Result, TapscopeError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tapscope_agent::ExhaustionPolicy;
use tapscope_common::FilteringOptions;
use tracing::{debug, info};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/tapscope/config.yaml";

const ENV_TARGET_NAMESPACES: &str = "TAPSCOPE_TARGET_NAMESPACES";
const ENV_TAP_TARGET_REGEX: &str = "TAPSCOPE_TAP_TARGET_REGEX";
const ENV_AGENT_IMAGE: &str = "TAPSCOPE_AGENT_IMAGE";
const ENV_DAEMON_MODE: &str = "TAPSCOPE_DAEMON_MODE";
const ENV_INGEST_ADDR: &str = "TAPSCOPE_INGEST_ADDR";
const ENV_OBSERVER_ADDR: &str = "TAPSCOPE_OBSERVER_ADDR";

const PULL_POLICIES: &[&str] = &["Always", "IfNotPresent", "Never"];

/// What the hub does when the fleet syncer reports a reconciliation error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconciliationErrorPolicy {
    /// Stop every task and exit non-zero
    #[default]
    Fatal,
    /// Log the error; the syncer keeps running
    Continue,
}

/// Requests and limits for the tapper containers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TapperResources {
    pub cpu_request: String,
    pub cpu_limit: String,
    pub memory_request: String,
    pub memory_limit: String,
}

impl Default for TapperResources {
    fn default() -> Self {
        Self {
            cpu_request: "50m".to_string(),
            cpu_limit: "750m".to_string(),
            memory_request: "50Mi".to_string(),
            memory_limit: "1Gi".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HubConfig {
    /// Namespaces whose pods may be tapped
    pub target_namespaces: Vec<String>,
    /// Pods whose name matches are tapped
    pub tap_target_regex: String,
    /// Namespace the tapper workloads are deployed into
    pub resources_namespace: String,
    pub agent_image: String,
    pub image_pull_policy: String,
    pub tapper_resources: TapperResources,
    /// Run the fleet syncer on top of the ingest server
    pub daemon_mode: bool,
    /// Merged into `filtering_options.ignored_user_agents`
    pub ignored_user_agents: Vec<String>,
    pub filtering_options: FilteringOptions,
    /// The hub's own addresses; outgoing traffic to them is not tapped
    pub service_addresses: Vec<IpAddr>,
    /// Address tappers dial; defaults to the hub service in `resources_namespace`
    pub hub_service_address: Option<String>,
    /// Identity written on the coordination object
    pub syncer_id: String,
    pub resync_interval_secs: u64,
    pub reconciliation_error_policy: ReconciliationErrorPolicy,
    pub delivery_exhaustion_policy: ExhaustionPolicy,
    pub ingest_addr: String,
    pub observer_addr: String,
    /// Capture feed address in standalone mode
    pub capture_addr: String,
    pub dissectors_dir: Option<PathBuf>,
    pub tag_unknown: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            target_namespaces: vec!["default".to_string()],
            tap_target_regex: ".*".to_string(),
            resources_namespace: "tapscope".to_string(),
            agent_image: "ghcr.io/tapscope/tapscope-agent:latest".to_string(),
            image_pull_policy: "IfNotPresent".to_string(),
            tapper_resources: TapperResources::default(),
            daemon_mode: false,
            ignored_user_agents: Vec::new(),
            filtering_options: FilteringOptions::default(),
            service_addresses: Vec::new(),
            hub_service_address: None,
            syncer_id: "tapscope-hub".to_string(),
            resync_interval_secs: 30,
            reconciliation_error_policy: ReconciliationErrorPolicy::default(),
            delivery_exhaustion_policy: ExhaustionPolicy::default(),
            ingest_addr: "0.0.0.0:8899".to_string(),
            observer_addr: "0.0.0.0:8898".to_string(),
            capture_addr: tapscope_agent::config::DEFAULT_CAPTURE_ADDR.to_string(),
            dissectors_dir: None,
            tag_unknown: false,
        }
    }
}

impl HubConfig {
    /// Load from `path` (or the default path), apply environment overrides
    /// and validate.
    ///
    /// An explicitly given path must exist; a missing default file means
    /// defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    debug!("No config file at {}, using defaults", DEFAULT_CONFIG_PATH);
                    Self::default()
                }
            }
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            TapscopeError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_yaml(&contents)
            .map_err(|e| TapscopeError::ConfigError(format!("{}: {}", path.display(), e)))?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> std::result::Result<Self, serde_yaml::Error> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml)
    }

    /// Override fields from environment variables, looked up through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(namespaces) = lookup(ENV_TARGET_NAMESPACES) {
            self.target_namespaces = namespaces
                .split(',')
                .map(|ns| ns.trim().to_string())
                .filter(|ns| !ns.is_empty())
                .collect();
        }
        if let Some(regex) = lookup(ENV_TAP_TARGET_REGEX) {
            self.tap_target_regex = regex;
        }
        if let Some(image) = lookup(ENV_AGENT_IMAGE) {
            self.agent_image = image;
        }
        if let Some(daemon) = lookup(ENV_DAEMON_MODE) {
            self.daemon_mode = parse_bool(ENV_DAEMON_MODE, &daemon)?;
        }
        if let Some(addr) = lookup(ENV_INGEST_ADDR) {
            self.ingest_addr = addr;
        }
        if let Some(addr) = lookup(ENV_OBSERVER_ADDR) {
            self.observer_addr = addr;
        }
        if let Some(json) = lookup(tapscope_common::env::FILTERING_OPTIONS) {
            self.filtering_options =
                tapscope_agent::config::parse_filtering_options(Some(&json))
                    .map_err(|e| TapscopeError::ConfigError(e.to_string()))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.target_namespaces.is_empty() {
            return Err(TapscopeError::ConfigError(
                "target_namespaces must not be empty".to_string(),
            ));
        }
        if let Some(bad) = self.target_namespaces.iter().find(|ns| ns.trim().is_empty()) {
            return Err(TapscopeError::ConfigError(format!(
                "invalid namespace {:?} in target_namespaces",
                bad
            )));
        }
        self.pod_regex()?;
        if !PULL_POLICIES.contains(&self.image_pull_policy.as_str()) {
            return Err(TapscopeError::ConfigError(format!(
                "image_pull_policy must be one of {:?}, got {:?}",
                PULL_POLICIES, self.image_pull_policy
            )));
        }
        if self.resync_interval_secs == 0 {
            return Err(TapscopeError::ConfigError(
                "resync_interval_secs must be positive".to_string(),
            ));
        }
        if self.resources_namespace.trim().is_empty() {
            return Err(TapscopeError::ConfigError(
                "resources_namespace must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn pod_regex(&self) -> Result<Regex> {
        Regex::new(&self.tap_target_regex).map_err(|e| {
            TapscopeError::ConfigError(format!(
                "invalid tap_target_regex {:?}: {}",
                self.tap_target_regex, e
            ))
        })
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    /// Filtering options with `ignored_user_agents` merged in
    pub fn effective_filtering(&self) -> FilteringOptions {
        let mut options = self.filtering_options.clone();
        options
            .ignored_user_agents
            .extend(self.ignored_user_agents.iter().cloned());
        options
    }

    /// Address the tapper agents dial
    pub fn hub_address(&self) -> String {
        match &self.hub_service_address {
            Some(address) => address.clone(),
            None => {
                let port = self.ingest_addr.rsplit(':').next().unwrap_or("8899");
                format!(
                    "tapscope-hub.{}.svc.cluster.local:{}",
                    self.resources_namespace, port
                )
            }
        }
    }
}

fn parse_bool(var: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(TapscopeError::ConfigError(format!(
            "{} must be a boolean, got {:?}",
            var, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = HubConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.reconciliation_error_policy, ReconciliationErrorPolicy::Fatal);
        assert_eq!(config.delivery_exhaustion_policy, ExhaustionPolicy::Fatal);
    }

    #[test]
    fn test_from_yaml() {
        let config = HubConfig::from_yaml(
            r#"
target_namespaces: [shop, payments]
tap_target_regex: "^front-.*"
daemon_mode: true
ignored_user_agents: [kube-probe]
reconciliation_error_policy: continue
delivery_exhaustion_policy: log
tapper_resources:
  memory_limit: 2Gi
"#,
        )
        .unwrap();

        assert_eq!(config.target_namespaces, vec!["shop", "payments"]);
        assert!(config.daemon_mode);
        assert_eq!(config.reconciliation_error_policy, ReconciliationErrorPolicy::Continue);
        assert_eq!(config.delivery_exhaustion_policy, ExhaustionPolicy::LogAndStop);
        assert_eq!(config.tapper_resources.memory_limit, "2Gi");
        assert_eq!(config.tapper_resources.cpu_limit, "750m");
        assert!(config
            .effective_filtering()
            .ignored_user_agents
            .contains("kube-probe"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(HubConfig::from_yaml("target_namespace: [typo]\n").is_err());
    }

    #[test]
    fn test_invalid_regex_rejected() {
        let config = HubConfig {
            tap_target_regex: "front-(".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(TapscopeError::ConfigError(_))));
    }

    #[test]
    fn test_empty_namespaces_rejected() {
        let config = HubConfig {
            target_namespaces: vec![],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_pull_policy_rejected() {
        let config = HubConfig {
            image_pull_policy: "Sometimes".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = HubConfig::default();
        config
            .apply_env(lookup(&[
                (ENV_TARGET_NAMESPACES, "a, b,,c"),
                (ENV_DAEMON_MODE, "1"),
                (
                    tapscope_common::env::FILTERING_OPTIONS,
                    r#"{"ignoredUserAgents": ["Prometheus"]}"#,
                ),
            ]))
            .unwrap();

        assert_eq!(config.target_namespaces, vec!["a", "b", "c"]);
        assert!(config.daemon_mode);
        assert!(config.filtering_options.ignored_user_agents.contains("Prometheus"));
    }

    #[test]
    fn test_env_bad_values_rejected() {
        let mut config = HubConfig::default();
        assert!(config.apply_env(lookup(&[(ENV_DAEMON_MODE, "maybe")])).is_err());
        assert!(config
            .apply_env(lookup(&[(tapscope_common::env::FILTERING_OPTIONS, "{")]))
            .is_err());
    }

    #[test]
    fn test_load_explicit_missing_file_fails() {
        let result = HubConfig::load(Some(Path::new("/nonexistent/tapscope.yaml")));
        assert!(matches!(result, Err(TapscopeError::ConfigError(_))));
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "resync_interval_secs: 5\n").unwrap();

        let config = HubConfig::from_file(&path).unwrap();
        assert_eq!(config.resync_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_hub_address_default() {
        let config = HubConfig::default();
        assert_eq!(
            config.hub_address(),
            "tapscope-hub.tapscope.svc.cluster.local:8899"
        );
    }
}
