pub mod cli;
pub mod config;
pub mod error;
pub mod hub;
pub mod k8s;

pub use config::{HubConfig, ReconciliationErrorPolicy};
pub use error::{Result, TapscopeError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
