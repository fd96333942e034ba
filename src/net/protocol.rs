//! Wire envelope shared by client interactions and server events
//!
//! Every text frame is one JSON object:
//! `{ "Route": "...", "UserId": "...", "Data": "...", "IsSuccess": true }`.
//! `Data` is itself a JSON document encoded as a string, so any payload shape
//! travels through the same envelope field.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Route of the synthetic interaction dispatched when a client registers
pub const CLIENT_CONNECTED: &str = "client_connected";
/// Route of the synthetic interaction dispatched when a client unregisters
pub const CLIENT_DISCONNECTED: &str = "client_disconnected";
/// Route carrying the serialized lobby after every lobby mutation
pub const LOBBY_UPDATED: &str = "updated";

/// One message travelling in either direction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DispatchMessage {
    /// '/'-delimited route
    pub route: String,
    /// Sender for interactions, recipient for events
    #[serde(default)]
    pub user_id: String,
    /// JSON-encoded payload
    #[serde(default)]
    pub data: String,
    #[serde(default = "default_success")]
    pub is_success: bool,
}

fn default_success() -> bool {
    true
}

impl DispatchMessage {
    pub fn new(route: impl Into<String>, user_id: impl Into<String>, data: String) -> Self {
        Self {
            route: route.into(),
            user_id: user_id.into(),
            data,
            is_success: true,
        }
    }

    /// Same message flagged as a failure reply
    pub fn failed(mut self) -> Self {
        self.is_success = false;
        self
    }

    /// Decode the `Data` field into a concrete payload type
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        decode_payload(&self.data)
    }
}

/// Encode a payload into the string carried in the `Data` field
pub fn encode_payload<T: Serialize + ?Sized>(payload: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(payload).map_err(ProtocolError::Encode)
}

/// Decode the string carried in the `Data` field
pub fn decode_payload<T: DeserializeOwned>(data: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(data).map_err(ProtocolError::Decode)
}

/// Encode a full envelope for the wire
pub fn encode(message: &DispatchMessage) -> Result<String, ProtocolError> {
    serde_json::to_string(message).map_err(ProtocolError::Encode)
}

/// Decode a full envelope from the wire
pub fn decode(raw: &str) -> Result<DispatchMessage, ProtocolError> {
    serde_json::from_str(raw).map_err(ProtocolError::Decode)
}

/// Protocol errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
}
