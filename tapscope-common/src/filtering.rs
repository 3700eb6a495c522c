//! Traffic filtering configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;

/// Options consulted by the filter stage for every entry.
///
/// Missing fields default to "ignore nothing".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilteringOptions {
    /// Entries whose request User-Agent contains any of these are dropped
    pub ignored_user_agents: BTreeSet<String>,
    /// Entries with either endpoint in this list are dropped
    pub excluded_ips: BTreeSet<IpAddr>,
}

impl FilteringOptions {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn ignores_nothing(&self) -> bool {
        self.ignored_user_agents.is_empty() && self.excluded_ips.is_empty()
    }
}
