//! Protocol dissector contract
//!
//! A dissector recognizes one application-layer protocol and turns the
//! payload chunks of a connection into entries. Dissectors are compiled into
//! the agent and selected at startup by the registry; they are never loaded
//! or unloaded while the process runs.
//!
//! Lifecycle:
//! 1. `register` is called exactly once at load time and must declare one
//!    `ProtocolDescriptor` through the `RegistrationContext`.
//! 2. `can_dissect` is probed with the first bytes of unclassified
//!    connections, in ascending priority order.
//! 3. The first dissector that answers at least `Confidence::Maybe` is bound
//!    to the connection and a `DissectorSession` is created for it.

pub mod http;
pub mod redis;
pub mod registry;

use crate::capture::{CapturedConnection, Peer};
use chrono::{DateTime, Utc};
use tapscope_common::Entry;
use thiserror::Error;

/// How sure a dissector is that a sample belongs to its protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Confidence {
    No,
    Maybe,
    Certain,
}

impl Confidence {
    pub fn accepts(self) -> bool {
        self >= Confidence::Maybe
    }
}

/// Protocol metadata a dissector declares at registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolDescriptor {
    /// Short unique name, stamped on every entry (e.g. "http")
    pub name: String,
    pub long_name: String,
    /// Lower values are probed first
    pub priority: u32,
}

impl ProtocolDescriptor {
    pub fn new(name: impl Into<String>, long_name: impl Into<String>, priority: u32) -> Self {
        Self {
            name: name.into(),
            long_name: long_name.into(),
            priority,
        }
    }
}

/// Collects the descriptors a dissector declares from `register`
#[derive(Debug, Default)]
pub struct RegistrationContext {
    declared: Vec<ProtocolDescriptor>,
}

impl RegistrationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, descriptor: ProtocolDescriptor) {
        self.declared.push(descriptor);
    }

    pub(crate) fn into_declared(self) -> Vec<ProtocolDescriptor> {
        self.declared
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DissectError {
    #[error("{protocol}: malformed {peer:?} data: {reason}")]
    Malformed {
        protocol: String,
        peer: Peer,
        reason: String,
    },

    #[error("{protocol}: buffered {peer:?} data exceeds {limit} bytes")]
    BufferOverflow {
        protocol: String,
        peer: Peer,
        limit: usize,
    },

    #[error("{protocol}: payload did not contain a complete exchange")]
    Incomplete { protocol: String },
}

/// Per-connection dissection state. Owned by exactly one pipeline worker.
pub trait DissectorSession: Send {
    /// Consume one payload chunk and return the entries it completed
    fn feed(
        &mut self,
        peer: Peer,
        payload: &[u8],
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<Entry>, DissectError>;

    /// Best-effort entries for exchanges still incomplete at close
    fn finish(&mut self) -> Vec<Entry>;
}

pub trait Dissector: Send + Sync {
    /// Declare this dissector's protocol descriptor
    fn register(&self, ctx: &mut RegistrationContext);

    /// Probe whether `sample`, sent by `peer`, looks like this protocol
    fn can_dissect(&self, peer: Peer, sample: &[u8]) -> Confidence;

    /// Start dissecting a newly classified connection
    fn session(&self, connection: &CapturedConnection) -> Box<dyn DissectorSession>;

    /// One-shot dissection of a client payload followed by an optional
    /// server payload, returning the first entry produced.
    fn dissect(
        &self,
        connection: &CapturedConnection,
        request: &[u8],
        response: Option<&[u8]>,
        timestamp: DateTime<Utc>,
    ) -> Result<Entry, DissectError> {
        let mut session = self.session(connection);
        let mut entries = session.feed(Peer::Client, request, timestamp)?;
        if let Some(response) = response {
            entries.extend(session.feed(Peer::Server, response, timestamp)?);
        }
        entries.extend(session.finish());

        entries.into_iter().next().ok_or_else(|| {
            let mut ctx = RegistrationContext::new();
            self.register(&mut ctx);
            DissectError::Incomplete {
                protocol: ctx
                    .into_declared()
                    .into_iter()
                    .next()
                    .map(|d| d.name)
                    .unwrap_or_default(),
            }
        })
    }
}

/// Render a payload for inclusion in an entry, lossy and bounded
pub(crate) fn preview(payload: &[u8], limit: usize) -> String {
    let end = payload.len().min(limit);
    String::from_utf8_lossy(&payload[..end]).into_owned()
}
