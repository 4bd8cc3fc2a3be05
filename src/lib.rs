//! courier - resilient per-identity messaging over a broker
//!
//! Each identity owns a durable mailbox on the broker. Messages sent to an
//! offline identity wait there until it reconnects, and a presence fanout tells
//! every connected client who is online.
//!
//! # Overview
//!
//! - Wire protocol: identities, mailbox naming and the JSON envelope codec
//! - Broker transport: MQTT v5 binding plus an in-memory broker for tests
//! - Client: connection manager, send worker, consume loop and presence monitor
//! - Crypto boundary: pluggable seal/open and key lookup
//!
//! # Quick Start
//!
//! ```rust
//! use courier::protocol::{Identity, PresenceEvent, PresenceStatus, WireMessage};
//!
//! let alice = Identity::new("alice").unwrap();
//! assert_eq!(alice.mailbox(), "mailbox.alice");
//!
//! let bytes = WireMessage::new(&alice, b"sealed").encode().unwrap();
//! let decoded = WireMessage::decode(&bytes).unwrap();
//! assert_eq!(decoded.from, "alice");
//! assert_eq!(decoded.sealed_payload().unwrap(), b"sealed");
//!
//! let online = PresenceEvent::online(&alice);
//! assert_eq!(online.status, PresenceStatus::Online);
//! ```

pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use client::{Client, ClientEvent, ConnectionState, HandlerError, InboundHandler};
pub use config::*;
pub use crypto::{KeyNotFound, KeyStore, SealedMessenger, Sealer};
pub use error::{ClientError, ClientResult};
pub use protocol::*;
