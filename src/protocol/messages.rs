//! Wire message types and the envelope codec
//!
//! Direct messages travel as `{"from": .., "payload": <hex>}` and presence
//! updates as `{"identity": .., "status": "online"|"offline"}`. The sealed
//! payload is opaque here; it is produced and consumed by the crypto collaborator.

use super::topics::Identity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Direct message as transported to a mailbox
///
/// # Examples
/// ```
/// use courier::protocol::{Identity, WireMessage};
///
/// let alice = Identity::new("alice").unwrap();
/// let wire = WireMessage::new(&alice, &[0xde, 0xad, 0xbe, 0xef]);
/// let bytes = wire.encode().unwrap();
/// let json = String::from_utf8(bytes.clone()).unwrap();
/// assert!(json.contains("\"payload\":\"deadbeef\""));
///
/// let decoded = WireMessage::decode(&bytes).unwrap();
/// assert_eq!(decoded.sealed_payload().unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireMessage {
    /// Sender identity
    pub from: String,
    /// Hex encoded sealed payload (older senders call this `message`)
    #[serde(alias = "message")]
    pub payload: String,
    /// Message id assigned at enqueue time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    /// Sender clock at publish time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
}

impl WireMessage {
    pub fn new(sender: &Identity, sealed_payload: &[u8]) -> Self {
        Self {
            from: sender.to_string(),
            payload: hex::encode(sealed_payload),
            id: None,
            sent_at: None,
        }
    }

    /// Build the wire form of an outbound message, stamping id and send time
    pub fn for_outbound(sender: &Identity, message: &OutboundMessage) -> Self {
        Self {
            from: sender.to_string(),
            payload: hex::encode(&message.sealed_payload),
            id: Some(message.id),
            sent_at: Some(Utc::now()),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(CodecError::Json)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let message: WireMessage = serde_json::from_slice(bytes).map_err(CodecError::Json)?;
        if message.from.is_empty() {
            return Err(CodecError::MissingSender);
        }
        Ok(message)
    }

    pub fn sealed_payload(&self) -> Result<Vec<u8>, CodecError> {
        hex::decode(&self.payload).map_err(CodecError::Hex)
    }
}

/// Presence status carried on the fanout topic
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PresenceStatus::Online => f.write_str("online"),
            PresenceStatus::Offline => f.write_str("offline"),
        }
    }
}

/// Transient presence update, published and observed but never stored
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceEvent {
    /// Identity whose status changed (older clients send this as `user`)
    #[serde(alias = "user")]
    pub identity: String,
    pub status: PresenceStatus,
}

impl PresenceEvent {
    pub fn new(identity: &Identity, status: PresenceStatus) -> Self {
        Self {
            identity: identity.to_string(),
            status,
        }
    }

    pub fn online(identity: &Identity) -> Self {
        Self::new(identity, PresenceStatus::Online)
    }

    pub fn offline(identity: &Identity) -> Self {
        Self::new(identity, PresenceStatus::Offline)
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(CodecError::Json)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(bytes).map_err(CodecError::Json)
    }
}

/// Message handed to the send worker by the application
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub id: Uuid,
    pub recipient: Identity,
    pub sealed_payload: Vec<u8>,
}

impl OutboundMessage {
    pub fn new(recipient: Identity, sealed_payload: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            recipient,
            sealed_payload,
        }
    }
}

/// Envelope encoding and decoding errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Invalid JSON: {0}")]
    Json(#[source] serde_json::Error),
    #[error("Payload is not valid hex: {0}")]
    Hex(#[source] hex::FromHexError),
    #[error("Message has no sender")]
    MissingSender,
}
