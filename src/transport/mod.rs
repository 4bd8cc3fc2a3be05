//! Broker transport abstraction
//!
//! The connection manager talks to the broker only through [`Connector`] and
//! [`BrokerSession`], which lets the MQTT binding and the in-memory test broker
//! be swapped without touching the delivery logic.

use crate::protocol::Identity;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mqtt;

/// Whether the broker should persist a published message across its own restarts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    Persistent,
    Transient,
}

/// Inbound unit handed to the consume loop
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Message taken from a mailbox
    Direct { mailbox: String, payload: Bytes },
    /// Update observed on the presence fanout
    Presence { payload: Bytes },
}

/// Stream of deliveries for one subscription. Closes when the session dies.
pub type Subscription = mpsc::Receiver<Delivery>;

/// Non-blocking view of session health
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionHealth {
    Alive,
    /// Session is up but the broker closed the logical channel
    ChannelClosed,
    Dead,
}

/// Opens broker sessions on behalf of one identity
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, identity: &Identity) -> Result<Box<dyn BrokerSession>, TransportError>;
}

/// One physical broker session plus its active channel
#[async_trait::async_trait]
pub trait BrokerSession: Send + Sync {
    /// Idempotently declare a durable mailbox
    async fn declare_mailbox(&self, mailbox: &str) -> Result<(), TransportError>;

    /// Idempotently declare a fanout destination
    async fn declare_fanout(&self, topic: &str) -> Result<(), TransportError>;

    async fn publish(
        &self,
        destination: &str,
        payload: Vec<u8>,
        durability: Durability,
    ) -> Result<(), TransportError>;

    /// Start consuming `mailbox`, and `fanout` when given, on this session
    async fn subscribe(
        &self,
        mailbox: &str,
        fanout: Option<&str>,
    ) -> Result<Subscription, TransportError>;

    /// Poll pending session events without blocking and report health
    fn probe(&self) -> SessionHealth;

    /// Reopen the logical channel on a live session
    async fn reopen_channel(&self) -> Result<(), TransportError>;

    /// Release the session. Never fails.
    async fn close(&self);
}

/// Errors raised at the broker boundary
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("Broker rejected credentials: {0}")]
    Authentication(String),
    #[error("Broker unreachable: {0}")]
    Unreachable(String),
    #[error("Channel closed by broker: {0}")]
    ChannelClosed(String),
    #[error("Session closed: {0}")]
    SessionClosed(String),
    #[error("Broker operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Invalid broker configuration: {0}")]
    InvalidConfig(String),
}

impl TransportError {
    /// Errors that retrying cannot fix
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Authentication(_) | TransportError::InvalidConfig(_)
        )
    }
}
