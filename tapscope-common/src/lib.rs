//! Shared types between the node agent and the hub
//!
//! This crate defines the structures that cross process boundaries:
//! - `Entry` - one dissected request/response exchange
//! - `PodInfo` / `TapStatus` - the set of pods currently being captured
//! - `FilteringOptions` - traffic filtering configuration
//! - `WireMessage` - the self-describing envelope sent over delivery and
//!   observer channels
//!
//! Everything here serializes with serde so the agent, the hub and observer
//! clients agree on one JSON representation.

pub mod entry;
pub mod filtering;
pub mod message;
pub mod pod;

pub use entry::{ConnectionInfo, Entry, UNKNOWN_PROTOCOL};
pub use filtering::FilteringOptions;
pub use message::{CodecError, WireMessage};
pub use pod::{AddressesPerNode, PodInfo, TapStatus};

/// Environment variables shared between the hub (which renders them into the
/// tapper workload) and the agent (which reads them at startup).
pub mod env {
    pub const HUB_ADDRESS: &str = "TAPSCOPE_HUB_ADDRESS";
    pub const NODE_NAME: &str = "NODE_NAME";
    pub const TAPPED_ADDRESSES_PER_NODE: &str = "TAPSCOPE_TAPPED_ADDRESSES_PER_NODE";
    pub const FILTERING_OPTIONS: &str = "TAPSCOPE_FILTERING_OPTIONS";
    pub const DISSECTORS_DIR: &str = "TAPSCOPE_DISSECTORS_DIR";
    pub const CAPTURE_ADDR: &str = "TAPSCOPE_CAPTURE_ADDR";
    pub const DEBUG: &str = "TAPSCOPE_DEBUG";
}
