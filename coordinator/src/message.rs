//! Payloads of the coordination messages.

use serde::{Deserialize, Serialize};

/// Payload of a [`TssStart`](comm::MessageType::TssStart) message.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartMessage {
    /// Process-defined start parameters.
    #[serde(
        serialize_with = "serdect::slice::serialize_hex_lower_or_bin",
        deserialize_with = "serdect::slice::deserialize_hex_or_bin_vec"
    )]
    pub params: Vec<u8>,
}

impl StartMessage {
    pub fn new(params: Vec<u8>) -> Self {
        Self { params }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Wrapper for the round messages a process exchanges.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TssMessage {
    #[serde(
        serialize_with = "serdect::slice::serialize_hex_lower_or_bin",
        deserialize_with = "serdect::slice::deserialize_hex_or_bin_vec"
    )]
    pub msg_bytes: Vec<u8>,
    pub is_broadcast: bool,
}

impl TssMessage {
    pub fn new(msg_bytes: Vec<u8>, is_broadcast: bool) -> Self {
        Self {
            msg_bytes,
            is_broadcast,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
