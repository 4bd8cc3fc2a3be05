//! Asynchronous conditions surfaced to the application

use crate::protocol::{Identity, PresenceStatus};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Terminal failure of one outbound message. Emitted exactly once per message.
    DeliveryExhausted {
        message_id: Uuid,
        recipient: Identity,
        attempts: u32,
        reason: String,
    },
    /// The consume loop gave up. Send and presence keep running.
    ListenerStopped { failures: u32, reason: String },
    /// The broker rejected our credentials. Emitted once per client.
    AuthenticationFailed { reason: String },
    /// Another identity went online or offline
    PresenceChanged {
        identity: String,
        status: PresenceStatus,
    },
}

/// Cloneable sending half of the client event channel
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<ClientEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Never blocks. Events are dropped once the application drops the receiver.
    pub fn emit(&self, event: ClientEvent) {
        if let Err(e) = self.tx.send(event) {
            debug!(event = ?e.0, "Client event receiver dropped");
        }
    }
}
