//! Envelope for everything sent between agent, hub and observers

use crate::{Entry, TapStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Self-describing message carried over delivery and observer channels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "messageType", content = "data", rename_all = "camelCase")]
pub enum WireMessage {
    TappedEntry(Box<Entry>),
    Status(TapStatus),
}

impl WireMessage {
    pub fn entry(entry: Entry) -> Self {
        WireMessage::TappedEntry(Box::new(entry))
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(CodecError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(bytes).map_err(CodecError::Decode)
    }
}
