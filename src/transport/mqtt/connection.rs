//! MQTT connection options
//!
//! A mailbox is only durable if the broker keeps the session while the client is
//! offline, so the client id is stable per identity and every connection asks
//! for a persistent session.

use crate::config::BrokerSection;
use crate::protocol::{Identity, PresenceEvent, PRESENCE_TOPIC};
use crate::transport::TransportError;
use rumqttc::v5::mqttbytes::v5::{ConnectProperties, LastWill};
use rumqttc::v5::{mqttbytes::QoS, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;

/// Maximum packet size, large enough for sealed payloads with some headroom
pub const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Unacknowledged QoS 1 deliveries the broker may have in flight to us
pub const RECEIVE_MAXIMUM: u16 = 64;

/// Stable client id for an identity
pub fn client_id(identity: &Identity) -> String {
    format!("courier-{identity}")
}

pub fn configure_mqtt_options(
    identity: &Identity,
    config: &BrokerSection,
) -> Result<MqttOptions, TransportError> {
    if config.host.trim().is_empty() {
        return Err(TransportError::InvalidConfig(
            "broker host is empty".to_string(),
        ));
    }

    let mut mqtt_options = MqttOptions::new(client_id(identity), config.host.clone(), config.port);

    if config.tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some((username, password)) = config.credentials() {
        mqtt_options.set_credentials(username, password);
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));

    // Persistent session: subscriptions and queued QoS 1 messages survive disconnects.
    // An expiry of zero would let the broker drop the mailbox on every disconnect.
    mqtt_options.set_clean_start(false);
    let mut properties = ConnectProperties::new();
    properties.session_expiry_interval = Some(config.session_expiry_secs);
    properties.receive_maximum = Some(RECEIVE_MAXIMUM);
    properties.max_packet_size = Some(MAX_PACKET_SIZE);
    mqtt_options.set_connect_properties(properties);

    // Deliveries are acknowledged only once the consume loop has them
    mqtt_options.set_manual_acks(true);

    // Broker announces us offline if the session dies without a clean close
    let offline = PresenceEvent::offline(identity)
        .encode()
        .map_err(|e| TransportError::InvalidConfig(e.to_string()))?;
    mqtt_options.set_last_will(LastWill::new(
        PRESENCE_TOPIC,
        offline,
        QoS::AtMostOnce,
        false,
        None,
    ));

    Ok(mqtt_options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_is_stable() {
        let alice = Identity::new("alice").unwrap();
        assert_eq!(client_id(&alice), "courier-alice");
        assert_eq!(client_id(&alice), client_id(&alice));
    }

    #[test]
    fn test_configure_mqtt_options() {
        let alice = Identity::new("alice").unwrap();
        let config = BrokerSection::new("localhost", 1883);
        let options = configure_mqtt_options(&alice, &config).unwrap();

        assert_eq!(options.client_id(), "courier-alice");
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
        assert!(!options.clean_start());
        assert!(options.manual_acks());
        assert_eq!(options.keep_alive(), Duration::from_secs(30));

        let properties = options.connect_properties().unwrap();
        assert_eq!(
            properties.session_expiry_interval,
            Some(config.session_expiry_secs)
        );
        assert!(config.session_expiry_secs > 0);
        assert_eq!(properties.receive_maximum, Some(RECEIVE_MAXIMUM));
        assert_eq!(properties.max_packet_size, Some(MAX_PACKET_SIZE));
    }

    #[test]
    fn test_empty_host_is_rejected() {
        let alice = Identity::new("alice").unwrap();
        let config = BrokerSection::new("", 1883);
        assert!(matches!(
            configure_mqtt_options(&alice, &config),
            Err(TransportError::InvalidConfig(_))
        ));
    }
}
