//! Entry filtering between dissection and delivery

use crate::delivery::DeliveryQueue;
use async_trait::async_trait;
use log::debug;
use std::collections::HashSet;
use std::net::IpAddr;
use tapscope_common::{Entry, FilteringOptions};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The aggregator's own addresses. Outgoing traffic to them is the
/// agent's delivery channel and is never tapped.
#[derive(Debug, Clone, Default)]
pub struct ServiceAddresses {
    addresses: HashSet<IpAddr>,
}

impl ServiceAddresses {
    pub fn new(addresses: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            addresses: addresses.into_iter().collect(),
        }
    }

    /// Resolve `host:port` (or a bare host) to its addresses
    pub async fn resolve(address: &str) -> std::io::Result<Self> {
        if let Ok(ip) = address.parse::<IpAddr>() {
            return Ok(Self::new([ip]));
        }
        let target = if address.contains(':') {
            address.to_string()
        } else {
            format!("{}:0", address)
        };
        let resolved = tokio::net::lookup_host(target).await?;
        Ok(Self::new(resolved.map(|addr| addr.ip())))
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.addresses.contains(ip)
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

/// Pure predicate over entries
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    ignored_user_agents: Vec<String>,
    excluded_ips: HashSet<IpAddr>,
    service: ServiceAddresses,
}

impl EntryFilter {
    pub fn new(options: &FilteringOptions, service: ServiceAddresses) -> Self {
        Self {
            ignored_user_agents: options
                .ignored_user_agents
                .iter()
                .filter(|ua| !ua.is_empty())
                .map(|ua| ua.to_lowercase())
                .collect(),
            excluded_ips: options.excluded_ips.iter().copied().collect(),
            service,
        }
    }

    pub fn admits(&self, entry: &Entry) -> bool {
        let conn = &entry.connection_info;

        if conn.is_outgoing && self.service.contains(&conn.server_ip) {
            return false;
        }

        if self.excluded_ips.contains(&conn.client_ip) || self.excluded_ips.contains(&conn.server_ip)
        {
            return false;
        }

        if !self.ignored_user_agents.is_empty() {
            if let Some(user_agent) = entry.request_header("user-agent") {
                let user_agent = user_agent.to_lowercase();
                if self
                    .ignored_user_agents
                    .iter()
                    .any(|ignored| user_agent.contains(ignored.as_str()))
                {
                    return false;
                }
            }
        }

        true
    }
}

/// Downstream of the filter stage
#[async_trait]
pub trait EntrySink: Send {
    /// Hand over one entry. Returns false once the sink is closed.
    async fn accept(&mut self, entry: Entry) -> bool;
}

#[async_trait]
impl EntrySink for mpsc::Sender<Entry> {
    async fn accept(&mut self, entry: Entry) -> bool {
        self.send(entry).await.is_ok()
    }
}

#[async_trait]
impl EntrySink for DeliveryQueue {
    async fn accept(&mut self, entry: Entry) -> bool {
        // full queue drops (and counts) the entry without blocking capture
        self.offer(entry);
        !self.is_closed()
    }
}

/// Forward admitted entries from `input` to `sink`, preserving order.
///
/// Returns the number of entries filtered out.
pub async fn run_filter<S: EntrySink>(
    mut input: mpsc::Receiver<Entry>,
    mut sink: S,
    filter: EntryFilter,
    cancel: CancellationToken,
) -> u64 {
    let mut rejected = 0u64;

    loop {
        let entry = tokio::select! {
            _ = cancel.cancelled() => break,
            entry = input.recv() => entry,
        };
        let Some(entry) = entry else {
            break;
        };

        if !filter.admits(&entry) {
            rejected += 1;
            debug!(
                "Filtered {} entry on {}",
                entry.protocol_name, entry.connection_info
            );
            continue;
        }

        if !sink.accept(entry).await {
            debug!("Entry sink closed, stopping filter");
            break;
        }
    }

    rejected
}
