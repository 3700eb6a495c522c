//! Node agent for tapscope (DaemonSet)
//!
//! Responsibilities:
//! - Load the dissector registry once at startup
//! - Accept connection-tagged payloads from the capture primitive
//! - Classify and dissect each connection into entries
//! - Filter entries against the configured options
//! - Deliver entries to the hub, reconnecting on broken pipes

pub mod capture;
pub mod config;
pub mod delivery;
pub mod dissector;
pub mod filter;
pub mod pipeline;

pub use capture::{
    CaptureError, CaptureEvent, CaptureSource, CapturedConnection, ConnectionId, Peer, TapTargets,
};
pub use config::{AgentArgs, AgentConfig, ConfigError};
pub use delivery::{
    Connector, DeliveryConfig, DeliveryError, DeliveryQueue, DeliverySummary, EntryChannel,
    ExhaustionPolicy, Forwarder, LocalConnector, TcpConnector,
};
pub use dissector::registry::{DissectorCatalog, LoadError, LoadedDissector, NotFound, Registry};
pub use dissector::{
    Confidence, DissectError, Dissector, DissectorSession, ProtocolDescriptor, RegistrationContext,
};
pub use filter::{run_filter, EntryFilter, EntrySink, ServiceAddresses};
pub use pipeline::{
    FlushPolicy, Pipeline, PipelineConfig, PipelineSnapshot, PipelineStats, UnknownPolicy,
};
