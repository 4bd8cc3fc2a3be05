//! Pure routing of rumqttc events
//!
//! The session driver feeds every event loop result through these functions and
//! acts on the returned route, which keeps the I/O side small and the decisions
//! testable without a broker.

use crate::protocol::PRESENCE_TOPIC;
use crate::transport::{Delivery, TransportError};
use rumqttc::v5::mqttbytes::v5::{
    ConnectReturnCode, Packet, PubAckReason, Publish, SubscribeReasonCode,
};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{ConnectionError, Event};
use rumqttc::Outgoing;

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Broker accepted the session
    ConnectionAcknowledged { session_present: bool },
    /// Publish on a subscribed topic, already classified. `ack` carries the
    /// packet to acknowledge once the delivery has been handed over.
    Inbound {
        delivery: Delivery,
        ack: Option<Publish>,
    },
    /// Our QoS 1 publish went out under `packet_id`
    PublishSent { packet_id: u16 },
    /// Broker answered our QoS 1 publish; `rejection` is set for failure reason codes
    PublishAcknowledged {
        packet_id: u16,
        rejection: Option<TransportError>,
    },
    /// Broker sent DISCONNECT
    Disconnected(String),
    /// SUBACK; `rejected` counts filters the broker refused
    SubscriptionConfirmed { packet_id: u16, rejected: usize },
    /// PingResp, PubAck and friends
    InfrastructureEvent(String),
    OutgoingEvent,
}

pub fn route_mqtt_event(event: &Event) -> EventRoute {
    match event {
        Event::Incoming(incoming) => match incoming {
            Packet::ConnAck(connack) => EventRoute::ConnectionAcknowledged {
                session_present: connack.session_present,
            },
            Packet::Publish(publish) => {
                let topic = String::from_utf8_lossy(&publish.topic);
                EventRoute::Inbound {
                    delivery: classify_delivery(&topic, publish.payload.clone()),
                    ack: (publish.qos != QoS::AtMostOnce).then(|| publish.clone()),
                }
            }
            Packet::PubAck(puback) => EventRoute::PublishAcknowledged {
                packet_id: puback.pkid,
                rejection: classify_puback_reason(puback.reason),
            },
            Packet::Disconnect(disconnect) => {
                EventRoute::Disconnected(format!("{:?}", disconnect.reason_code))
            }
            Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                packet_id: suback.pkid,
                rejected: suback
                    .return_codes
                    .iter()
                    .filter(|code| !matches!(code, SubscribeReasonCode::Success(_)))
                    .count(),
            },
            other => EventRoute::InfrastructureEvent(format!("{other:?}")),
        },
        Event::Outgoing(Outgoing::Publish(packet_id)) if *packet_id != 0 => {
            EventRoute::PublishSent {
                packet_id: *packet_id,
            }
        }
        Event::Outgoing(_) => EventRoute::OutgoingEvent,
    }
}

/// `None` when the broker took responsibility for the message
pub fn classify_puback_reason(reason: PubAckReason) -> Option<TransportError> {
    match reason {
        PubAckReason::Success | PubAckReason::NoMatchingSubscribers => None,
        PubAckReason::NotAuthorized => Some(TransportError::Authentication(
            "broker refused publish: NotAuthorized".to_string(),
        )),
        other => Some(TransportError::ChannelClosed(format!(
            "broker refused publish: {other:?}"
        ))),
    }
}

/// Presence topic publishes become presence deliveries, everything else is mailbox traffic
pub fn classify_delivery(topic: &str, payload: bytes::Bytes) -> Delivery {
    if topic == PRESENCE_TOPIC {
        Delivery::Presence { payload }
    } else {
        Delivery::Direct {
            mailbox: topic.to_string(),
            payload,
        }
    }
}

/// Translate an event loop failure into a transport error
pub fn classify_connection_error(error: &ConnectionError) -> TransportError {
    match error {
        ConnectionError::ConnectionRefused(code) => classify_connect_code(*code),
        other => TransportError::Unreachable(other.to_string()),
    }
}

pub fn classify_connect_code(code: ConnectReturnCode) -> TransportError {
    match code {
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
            TransportError::Authentication(format!("{code:?}"))
        }
        other => TransportError::Unreachable(format!("Connection refused: {other:?}")),
    }
}
