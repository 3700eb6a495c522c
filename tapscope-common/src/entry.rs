//! Dissected traffic entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::net::IpAddr;

/// Protocol name given to traffic no dissector recognized.
pub const UNKNOWN_PROTOCOL: &str = "unknown";

/// Endpoints of the connection an entry was captured on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionInfo {
    #[serde(rename = "clientIP")]
    pub client_ip: IpAddr,
    #[serde(rename = "clientPort")]
    pub client_port: u16,
    #[serde(rename = "serverIP")]
    pub server_ip: IpAddr,
    #[serde(rename = "serverPort")]
    pub server_port: u16,
    /// True when the capturing node initiated the connection
    #[serde(rename = "isOutgoing")]
    pub is_outgoing: bool,
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.client_ip, self.client_port, self.server_ip, self.server_port
        )
    }
}

/// One reconstructed request/response exchange.
///
/// Entries are moved between pipeline stages and never mutated after the
/// dissection stage hands them off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub connection_info: ConnectionInfo,
    pub protocol_name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub request_payload: Value,
    #[serde(default)]
    pub response_payload: Value,
}

impl Entry {
    pub fn new(
        connection_info: ConnectionInfo,
        protocol_name: impl Into<String>,
        timestamp: DateTime<Utc>,
        request_payload: Value,
        response_payload: Value,
    ) -> Self {
        Self {
            connection_info,
            protocol_name: protocol_name.into(),
            timestamp,
            request_payload,
            response_payload,
        }
    }

    /// Whether the entry went through a dissector that recognized it
    pub fn is_classified(&self) -> bool {
        !self.protocol_name.is_empty() && self.protocol_name != UNKNOWN_PROTOCOL
    }

    /// Look up a request header by case-insensitive name.
    ///
    /// Dissectors that expose headers put them under `request.headers` as a
    /// JSON object of string values.
    pub fn request_header(&self, name: &str) -> Option<&str> {
        self.request_payload
            .get("headers")?
            .as_object()?
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .and_then(|(_, value)| value.as_str())
    }
}
