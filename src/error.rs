use crate::k8s::syncer::ReconciliationError;
use tapscope_agent::{CaptureError, DeliveryError, LoadError};
use tapscope_common::CodecError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TapscopeError {
    #[error("Kubernetes error: {0}")]
    KubernetesError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Failed to load dissectors: {0}")]
    RegistryLoadFailed(#[from] LoadError),

    #[error("Reconciliation failed: {0}")]
    ReconciliationFailed(#[from] ReconciliationError),

    #[error("Delivery failed: {0}")]
    DeliveryFailed(#[from] DeliveryError),

    #[error("Capture feed error: {0}")]
    CaptureFailed(#[from] CaptureError),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Task failed: {0}")]
    TaskFailed(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<CodecError> for TapscopeError {
    fn from(e: CodecError) -> Self {
        TapscopeError::SerializationError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TapscopeError>;
