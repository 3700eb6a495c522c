//! Agent configuration from command line and environment
//!
//! Every setting can be given as a flag or through the environment variable
//! the hub renders into the tapper workload. Values are validated once at
//! startup; a bad value aborts the agent before anything is started.

use crate::capture::TapTargets;
use crate::delivery::DeliveryConfig;
use crate::dissector::registry::{DissectorCatalog, LoadError, Registry};
use crate::pipeline::{FlushPolicy, PipelineConfig, UnknownPolicy};
use clap::builder::BoolishValueParser;
use clap::Parser;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tapscope_common::{env, AddressesPerNode, FilteringOptions};
use thiserror::Error;

pub const DEFAULT_CAPTURE_ADDR: &str = "0.0.0.0:8897";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{var} must be set")]
    Missing { var: &'static str },

    #[error("{var} is invalid: {source}")]
    InvalidJson {
        var: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{var} contains invalid address {value:?}")]
    InvalidAddress { var: &'static str, value: String },

    #[error("cannot determine node name: {0}")]
    NodeName(String),
}

#[derive(Debug, Clone, Parser)]
#[command(name = "tapscope-agent")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Captures, dissects and forwards traffic on one cluster node", long_about = None)]
pub struct AgentArgs {
    #[arg(long, env = env::HUB_ADDRESS, help = "Hub ingest address (host:port)")]
    pub hub_address: Option<String>,

    #[arg(long, env = env::NODE_NAME, help = "Name of this node (defaults to hostname)")]
    pub node_name: Option<String>,

    #[arg(long, env = env::TAPPED_ADDRESSES_PER_NODE, help = "JSON map of node name to pod IPs")]
    pub tapped_addresses_per_node: Option<String>,

    #[arg(long, env = env::FILTERING_OPTIONS, help = "JSON traffic filtering options")]
    pub filtering_options: Option<String>,

    #[arg(long, env = env::DISSECTORS_DIR, help = "Directory of dissector manifests")]
    pub dissectors_dir: Option<PathBuf>,

    #[arg(long, env = env::CAPTURE_ADDR, default_value = DEFAULT_CAPTURE_ADDR, help = "Capture feed listen address")]
    pub capture_addr: String,

    #[arg(long, help = "Emit entries for traffic no dissector recognizes")]
    pub tag_unknown: bool,

    #[arg(long, help = "Discard partial exchanges when a connection closes")]
    pub discard_partial: bool,

    #[arg(
        short,
        long,
        env = env::DEBUG,
        value_parser = BoolishValueParser::new(),
        help = "Enable debug logging"
    )]
    pub debug: bool,
}

/// Validated agent settings
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub node_name: String,
    pub tap_targets: TapTargets,
    pub filtering: FilteringOptions,
    pub dissectors_dir: Option<PathBuf>,
    pub capture_addr: String,
    pub pipeline: PipelineConfig,
    pub delivery: DeliveryConfig,
    pub debug: bool,
}

impl AgentConfig {
    pub fn from_args(args: AgentArgs) -> Result<Self, ConfigError> {
        let hub_address = args
            .hub_address
            .filter(|a| !a.trim().is_empty())
            .ok_or(ConfigError::Missing {
                var: env::HUB_ADDRESS,
            })?;

        let node_name = match args.node_name.filter(|n| !n.is_empty()) {
            Some(name) => name,
            None => hostname::get()
                .map_err(|e| ConfigError::NodeName(e.to_string()))?
                .to_string_lossy()
                .into_owned(),
        };

        let tap_targets = parse_tap_targets(args.tapped_addresses_per_node.as_deref(), &node_name)?;
        let filtering = parse_filtering_options(args.filtering_options.as_deref())?;

        let pipeline = PipelineConfig::default()
            .with_unknown_policy(if args.tag_unknown {
                UnknownPolicy::Tag
            } else {
                UnknownPolicy::Drop
            })
            .with_flush_policy(if args.discard_partial {
                FlushPolicy::Discard
            } else {
                FlushPolicy::Flush
            });

        Ok(Self {
            node_name,
            tap_targets,
            filtering,
            dissectors_dir: args.dissectors_dir,
            capture_addr: args.capture_addr,
            pipeline,
            delivery: DeliveryConfig::new(hub_address),
            debug: args.debug,
        })
    }

    pub fn hub_address(&self) -> &str {
        &self.delivery.address
    }
}

/// Addresses to tap on `node`. A node missing from the map taps everything.
pub fn parse_tap_targets(json: Option<&str>, node: &str) -> Result<TapTargets, ConfigError> {
    let Some(json) = json.filter(|j| !j.trim().is_empty()) else {
        return Ok(TapTargets::all());
    };

    let per_node: AddressesPerNode =
        serde_json::from_str(json).map_err(|source| ConfigError::InvalidJson {
            var: env::TAPPED_ADDRESSES_PER_NODE,
            source,
        })?;

    let Some(addresses) = per_node.get(node) else {
        return Ok(TapTargets::all());
    };

    let ips = addresses
        .iter()
        .map(|a| {
            a.parse::<IpAddr>().map_err(|_| ConfigError::InvalidAddress {
                var: env::TAPPED_ADDRESSES_PER_NODE,
                value: a.clone(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(TapTargets::only(ips))
}

/// Absent or empty input ignores nothing
pub fn parse_filtering_options(json: Option<&str>) -> Result<FilteringOptions, ConfigError> {
    match json.filter(|j| !j.trim().is_empty()) {
        None => Ok(FilteringOptions::default()),
        Some(json) => FilteringOptions::from_json(json).map_err(|source| ConfigError::InvalidJson {
            var: env::FILTERING_OPTIONS,
            source,
        }),
    }
}

/// Registry from a manifest directory, or every built-in dissector
pub fn load_registry(dir: Option<&Path>) -> Result<Registry, LoadError> {
    match dir {
        Some(dir) => Registry::load(dir, &DissectorCatalog::builtin()),
        None => Registry::builtin(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> AgentArgs {
        AgentArgs {
            hub_address: Some("tapscope-hub.tapscope:8899".to_string()),
            node_name: Some("node-a".to_string()),
            tapped_addresses_per_node: None,
            filtering_options: None,
            dissectors_dir: None,
            capture_addr: DEFAULT_CAPTURE_ADDR.to_string(),
            tag_unknown: false,
            discard_partial: false,
            debug: false,
        }
    }

    #[test]
    fn test_minimal() {
        let config = AgentConfig::from_args(args()).unwrap();
        assert_eq!(config.hub_address(), "tapscope-hub.tapscope:8899");
        assert!(config.tap_targets.addresses().is_none());
        assert!(config.filtering.ignores_nothing());
        assert_eq!(config.pipeline.unknown_policy, UnknownPolicy::Drop);
    }

    #[test]
    fn test_hub_address_required() {
        let mut a = args();
        a.hub_address = None;
        assert!(matches!(
            AgentConfig::from_args(a),
            Err(ConfigError::Missing { .. })
        ));
    }

    #[test]
    fn test_tap_targets_for_node() {
        let json = r#"{"node-a": ["10.1.0.4", "10.1.0.5"], "node-b": ["10.2.0.4"]}"#;

        let targets = parse_tap_targets(Some(json), "node-a").unwrap();
        assert_eq!(targets.addresses().unwrap().len(), 2);

        let other = parse_tap_targets(Some(json), "node-c").unwrap();
        assert!(other.addresses().is_none());
    }

    #[test]
    fn test_tap_targets_invalid() {
        assert!(matches!(
            parse_tap_targets(Some("[1, 2]"), "node-a"),
            Err(ConfigError::InvalidJson { .. })
        ));
        assert!(matches!(
            parse_tap_targets(Some(r#"{"node-a": ["not-an-ip"]}"#), "node-a"),
            Err(ConfigError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn test_filtering_options() {
        assert!(parse_filtering_options(None).unwrap().ignores_nothing());
        assert!(parse_filtering_options(Some("")).unwrap().ignores_nothing());

        let options = parse_filtering_options(Some(r#"{"ignoredUserAgents": ["kube-probe"]}"#)).unwrap();
        assert!(options.ignored_user_agents.contains("kube-probe"));

        assert!(parse_filtering_options(Some("{")).is_err());
    }

    #[test]
    fn test_flags_map_to_policies() {
        let mut a = args();
        a.tag_unknown = true;
        a.discard_partial = true;
        let config = AgentConfig::from_args(a).unwrap();
        assert_eq!(config.pipeline.unknown_policy, UnknownPolicy::Tag);
        assert_eq!(config.pipeline.flush_policy, FlushPolicy::Discard);
    }

    #[test]
    fn test_parse_from_command_line() {
        let parsed = AgentArgs::try_parse_from([
            "tapscope-agent",
            "--hub-address",
            "hub:8899",
            "--node-name",
            "node-z",
        ])
        .unwrap();
        assert_eq!(parsed.node_name.as_deref(), Some("node-z"));
        assert_eq!(parsed.capture_addr, DEFAULT_CAPTURE_ADDR);
    }

    #[test]
    fn test_debug_from_numeric_env() {
        std::env::set_var(env::DEBUG, "1");
        let parsed = AgentArgs::try_parse_from(["tapscope-agent"]);
        std::env::remove_var(env::DEBUG);
        assert!(parsed.unwrap().debug);

        let parsed = AgentArgs::try_parse_from(["tapscope-agent", "--debug"]).unwrap();
        assert!(parsed.debug);
    }

    #[test]
    fn test_load_registry_default() {
        let registry = load_registry(None).unwrap();
        assert_eq!(registry.names(), vec!["http", "redis"]);
    }
}
