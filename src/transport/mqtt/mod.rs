//! MQTT v5 binding for the broker traits
//!
//! - [`connection`] - persistent-session options for an identity
//! - [`message_handler`] - pure routing of rumqttc events
//! - [`session`] - [`MqttConnector`] and the driver-backed [`MqttSession`]
//!
//! # Usage
//!
//! ```rust,no_run
//! use courier::config::BrokerSection;
//! use courier::protocol::Identity;
//! use courier::transport::mqtt::MqttConnector;
//! use courier::transport::{Connector, Durability};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let connector = MqttConnector::new(
//!     BrokerSection::new("localhost", 1883),
//!     Duration::from_secs(10),
//!     256,
//! );
//! let alice = Identity::new("alice")?;
//! let session = connector.open(&alice).await?;
//! session.declare_mailbox(&alice.mailbox()).await?;
//! session.publish("mailbox.bob", b"{}".to_vec(), Durability::Persistent).await?;
//! session.close().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod connection;
pub mod message_handler;
pub mod session;

pub use connection::configure_mqtt_options;
pub use message_handler::{route_mqtt_event, EventRoute};
pub use session::{MqttConnector, MqttSession};
