//! In-memory broker for testing
//!
//! [`MemoryBroker`] models the parts of a broker the client depends on: durable
//! mailboxes that queue while nobody consumes, a transient presence fanout,
//! sessions that can die and channels that can be closed under the client.
//! Fault injection hooks drive the reconnect and retry paths without a real
//! broker.

use crate::protocol::{Identity, PresenceEvent, WireMessage, PRESENCE_TOPIC};
use crate::transport::{
    BrokerSession, Connector, Delivery, Durability, SessionHealth, Subscription, TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

const CONSUMER_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy)]
struct SessionRecord {
    alive: bool,
    channel_open: bool,
}

struct Consumer {
    mailbox: String,
    presence: bool,
    sender: mpsc::Sender<Delivery>,
}

#[derive(Default)]
struct BrokerState {
    mailboxes: HashMap<String, VecDeque<Bytes>>,
    declare_counts: HashMap<String, usize>,
    sessions: HashMap<u64, SessionRecord>,
    consumers: HashMap<u64, Consumer>,
    next_session_id: u64,
    open_count: usize,

    reject_auth: bool,
    unreachable: bool,
    failing_connects: u32,
    failing_publishes: u32,
    failing_subscribes: u32,
    failing_reopens: u32,

    published: Vec<(String, Bytes)>,
    presence_log: Vec<Bytes>,
}

impl BrokerState {
    fn health(&self, session_id: u64) -> SessionHealth {
        match self.sessions.get(&session_id) {
            Some(record) if record.alive && record.channel_open => SessionHealth::Alive,
            Some(record) if record.alive => SessionHealth::ChannelClosed,
            _ => SessionHealth::Dead,
        }
    }

    fn check_usable(&self, session_id: u64) -> Result<(), TransportError> {
        match self.health(session_id) {
            SessionHealth::Alive => Ok(()),
            SessionHealth::ChannelClosed => {
                Err(TransportError::ChannelClosed("channel closed by broker".to_string()))
            }
            SessionHealth::Dead => {
                Err(TransportError::SessionClosed("connection lost".to_string()))
            }
        }
    }

    fn declare(&mut self, mailbox: &str) {
        self.mailboxes.entry(mailbox.to_string()).or_default();
        *self.declare_counts.entry(mailbox.to_string()).or_default() += 1;
    }

    /// Hand queued messages to a live consumer of `mailbox`, oldest first
    fn flush(&mut self, mailbox: &str) {
        let Some(session_id) = self.consumers.iter().find_map(|(id, consumer)| {
            (consumer.mailbox == mailbox && self.health(*id) == SessionHealth::Alive).then_some(*id)
        }) else {
            return;
        };
        let (Some(queue), Some(consumer)) = (
            self.mailboxes.get_mut(mailbox),
            self.consumers.get(&session_id),
        ) else {
            return;
        };

        let mut consumer_gone = false;
        while let Some(payload) = queue.pop_front() {
            let delivery = Delivery::Direct {
                mailbox: mailbox.to_string(),
                payload: payload.clone(),
            };
            match consumer.sender.try_send(delivery) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    queue.push_front(payload);
                    break;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    queue.push_front(payload);
                    consumer_gone = true;
                    break;
                }
            }
        }

        if consumer_gone {
            self.consumers.remove(&session_id);
        }
    }

    fn fan_out_presence(&mut self, payload: &Bytes) {
        let mut gone = Vec::new();
        for (session_id, consumer) in &self.consumers {
            if !consumer.presence || self.health(*session_id) != SessionHealth::Alive {
                continue;
            }
            let delivery = Delivery::Presence {
                payload: payload.clone(),
            };
            if let Err(mpsc::error::TrySendError::Closed(_)) = consumer.sender.try_send(delivery) {
                gone.push(*session_id);
            }
        }
        for session_id in gone {
            self.consumers.remove(&session_id);
        }
    }

    fn drop_session(&mut self, session_id: u64) {
        if let Some(record) = self.sessions.get_mut(&session_id) {
            record.alive = false;
        }
        self.consumers.remove(&session_id);
    }
}

/// Shared in-memory broker. Clones observe the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector opening sessions against this broker
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut BrokerState) -> T) -> T {
        let mut state = match self.inner.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }

    /// Reject every connection attempt with an authentication error
    pub fn set_reject_auth(&self, reject: bool) {
        self.with_state(|state| state.reject_auth = reject);
    }

    /// Refuse every connection attempt as if the broker were down
    pub fn set_unreachable(&self, unreachable: bool) {
        self.with_state(|state| state.unreachable = unreachable);
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.with_state(|state| state.failing_connects = count);
    }

    /// Fail the next publishes without harming the session
    pub fn fail_next_publishes(&self, count: u32) {
        self.with_state(|state| state.failing_publishes = count);
    }

    pub fn fail_next_subscribes(&self, count: u32) {
        self.with_state(|state| state.failing_subscribes = count);
    }

    pub fn fail_next_channel_reopens(&self, count: u32) {
        self.with_state(|state| state.failing_reopens = count);
    }

    /// Drop every open session. Queued mailbox contents survive.
    pub fn kill_sessions(&self) {
        self.with_state(|state| {
            let ids: Vec<u64> = state.sessions.keys().copied().collect();
            for id in ids {
                state.drop_session(id);
            }
        });
    }

    /// Close the channel of every live session, keeping the sessions up
    pub fn close_channels(&self) {
        self.with_state(|state| {
            for record in state.sessions.values_mut() {
                record.channel_open = false;
            }
            state.consumers.clear();
        });
    }

    /// Number of connection attempts, failed ones included
    pub fn open_count(&self) -> usize {
        self.with_state(|state| state.open_count)
    }

    pub fn live_sessions(&self) -> usize {
        self.with_state(|state| state.sessions.values().filter(|record| record.alive).count())
    }

    /// True while a live session consumes `mailbox`
    pub fn is_consuming(&self, mailbox: &str) -> bool {
        self.with_state(|state| {
            state.consumers.iter().any(|(id, consumer)| {
                consumer.mailbox == mailbox && state.health(*id) == SessionHealth::Alive
            })
        })
    }

    pub fn mailbox_exists(&self, mailbox: &str) -> bool {
        self.with_state(|state| state.mailboxes.contains_key(mailbox))
    }

    pub fn declare_count(&self, mailbox: &str) -> usize {
        self.with_state(|state| state.declare_counts.get(mailbox).copied().unwrap_or(0))
    }

    /// Messages waiting in `mailbox` for a consumer
    pub fn queued(&self, mailbox: &str) -> usize {
        self.with_state(|state| state.mailboxes.get(mailbox).map_or(0, VecDeque::len))
    }

    /// Every message published to `mailbox`, decoded, in publish order
    pub fn direct_messages(&self, mailbox: &str) -> Vec<WireMessage> {
        self.with_state(|state| {
            state
                .published
                .iter()
                .filter(|(destination, _)| destination == mailbox)
                .filter_map(|(_, payload)| WireMessage::decode(payload).ok())
                .collect()
        })
    }

    /// Every presence update published on the fanout, decoded
    pub fn presence_events(&self) -> Vec<PresenceEvent> {
        self.with_state(|state| {
            state
                .presence_log
                .iter()
                .filter_map(|payload| PresenceEvent::decode(payload).ok())
                .collect()
        })
    }

    /// Enqueue a raw payload in `mailbox` as another client would
    pub fn inject_direct(&self, mailbox: &str, payload: Vec<u8>) {
        self.with_state(|state| {
            state.mailboxes.entry(mailbox.to_string()).or_default();
            if let Some(queue) = state.mailboxes.get_mut(mailbox) {
                queue.push_back(Bytes::from(payload));
            }
            state.flush(mailbox);
        });
    }

    /// Broadcast a raw payload on the presence fanout
    pub fn inject_presence(&self, payload: Vec<u8>) {
        self.with_state(|state| state.fan_out_presence(&Bytes::from(payload)));
    }
}

pub struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, identity: &Identity) -> Result<Box<dyn BrokerSession>, TransportError> {
        let session_id = self.broker.with_state(|state| {
            state.open_count += 1;
            if state.reject_auth {
                return Err(TransportError::Authentication(format!(
                    "not authorized: {identity}"
                )));
            }
            if state.unreachable {
                return Err(TransportError::Unreachable("connection refused".to_string()));
            }
            if state.failing_connects > 0 {
                state.failing_connects -= 1;
                return Err(TransportError::Unreachable(
                    "injected connect failure".to_string(),
                ));
            }

            state.next_session_id += 1;
            let id = state.next_session_id;
            state.sessions.insert(
                id,
                SessionRecord {
                    alive: true,
                    channel_open: true,
                },
            );
            Ok(id)
        })?;

        Ok(Box::new(MemorySession {
            id: session_id,
            broker: self.broker.clone(),
        }))
    }
}

pub struct MemorySession {
    id: u64,
    broker: MemoryBroker,
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn declare_mailbox(&self, mailbox: &str) -> Result<(), TransportError> {
        self.broker.with_state(|state| {
            state.check_usable(self.id)?;
            state.declare(mailbox);
            Ok(())
        })
    }

    async fn declare_fanout(&self, _topic: &str) -> Result<(), TransportError> {
        self.broker.with_state(|state| state.check_usable(self.id))
    }

    async fn publish(
        &self,
        destination: &str,
        payload: Vec<u8>,
        _durability: Durability,
    ) -> Result<(), TransportError> {
        // Mailboxes live as long as the broker value, so durability has no effect here
        self.broker.with_state(|state| {
            state.check_usable(self.id)?;
            if state.failing_publishes > 0 {
                state.failing_publishes -= 1;
                return Err(TransportError::Unreachable(
                    "injected publish failure".to_string(),
                ));
            }

            let payload = Bytes::from(payload);
            if destination == PRESENCE_TOPIC {
                state.presence_log.push(payload.clone());
                state.fan_out_presence(&payload);
                return Ok(());
            }

            // Unroutable messages are silently dropped, as a broker would
            let Some(queue) = state.mailboxes.get_mut(destination) else {
                return Ok(());
            };
            queue.push_back(payload.clone());
            state.published.push((destination.to_string(), payload));
            state.flush(destination);
            Ok(())
        })
    }

    async fn subscribe(
        &self,
        mailbox: &str,
        fanout: Option<&str>,
    ) -> Result<Subscription, TransportError> {
        self.broker.with_state(|state| {
            state.check_usable(self.id)?;
            if state.failing_subscribes > 0 {
                state.failing_subscribes -= 1;
                return Err(TransportError::Unreachable(
                    "injected subscribe failure".to_string(),
                ));
            }

            let (sender, receiver) = mpsc::channel(CONSUMER_BUFFER);
            state.consumers.insert(
                self.id,
                Consumer {
                    mailbox: mailbox.to_string(),
                    presence: fanout == Some(PRESENCE_TOPIC),
                    sender,
                },
            );
            state.flush(mailbox);
            Ok(receiver)
        })
    }

    fn probe(&self) -> SessionHealth {
        self.broker.with_state(|state| state.health(self.id))
    }

    async fn reopen_channel(&self) -> Result<(), TransportError> {
        self.broker.with_state(|state| {
            if state.health(self.id) == SessionHealth::Dead {
                return Err(TransportError::SessionClosed("connection lost".to_string()));
            }
            if state.failing_reopens > 0 {
                state.failing_reopens -= 1;
                return Err(TransportError::ChannelClosed(
                    "injected reopen failure".to_string(),
                ));
            }
            if let Some(record) = state.sessions.get_mut(&self.id) {
                record.channel_open = true;
            }
            Ok(())
        })
    }

    async fn close(&self) {
        self.broker.with_state(|state| state.drop_session(self.id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PresenceStatus;

    fn alice() -> Identity {
        Identity::new("alice").unwrap()
    }

    #[tokio::test]
    async fn test_mailbox_queues_until_consumed() {
        let broker = MemoryBroker::new();
        let session = broker.connector().open(&alice()).await.unwrap();
        session.declare_mailbox("mailbox.bob").await.unwrap();

        session
            .publish("mailbox.bob", b"one".to_vec(), Durability::Persistent)
            .await
            .unwrap();
        session
            .publish("mailbox.bob", b"two".to_vec(), Durability::Persistent)
            .await
            .unwrap();
        assert_eq!(broker.queued("mailbox.bob"), 2);

        let mut subscription = session.subscribe("mailbox.bob", None).await.unwrap();
        assert_eq!(
            subscription.recv().await,
            Some(Delivery::Direct {
                mailbox: "mailbox.bob".to_string(),
                payload: Bytes::from_static(b"one"),
            })
        );
        assert_eq!(
            subscription.recv().await,
            Some(Delivery::Direct {
                mailbox: "mailbox.bob".to_string(),
                payload: Bytes::from_static(b"two"),
            })
        );
        assert_eq!(broker.queued("mailbox.bob"), 0);
    }

    #[tokio::test]
    async fn test_publish_to_undeclared_mailbox_is_dropped() {
        let broker = MemoryBroker::new();
        let session = broker.connector().open(&alice()).await.unwrap();

        session
            .publish("mailbox.nobody", b"lost".to_vec(), Durability::Persistent)
            .await
            .unwrap();
        assert!(!broker.mailbox_exists("mailbox.nobody"));
        assert!(broker.direct_messages("mailbox.nobody").is_empty());
    }

    #[tokio::test]
    async fn test_killed_session_closes_subscription_and_keeps_queue() {
        let broker = MemoryBroker::new();
        let session = broker.connector().open(&alice()).await.unwrap();
        session.declare_mailbox("mailbox.alice").await.unwrap();
        let mut subscription = session.subscribe("mailbox.alice", None).await.unwrap();

        broker.kill_sessions();
        assert_eq!(subscription.recv().await, None);
        assert_eq!(session.probe(), SessionHealth::Dead);
        assert!(matches!(
            session
                .publish("mailbox.alice", b"x".to_vec(), Durability::Persistent)
                .await,
            Err(TransportError::SessionClosed(_))
        ));

        broker.inject_direct("mailbox.alice", b"waiting".to_vec());
        assert_eq!(broker.queued("mailbox.alice"), 1);
        assert_eq!(broker.live_sessions(), 0);
    }

    #[tokio::test]
    async fn test_closed_channel_can_be_reopened() {
        let broker = MemoryBroker::new();
        let session = broker.connector().open(&alice()).await.unwrap();

        broker.close_channels();
        assert_eq!(session.probe(), SessionHealth::ChannelClosed);
        assert!(matches!(
            session.declare_mailbox("mailbox.alice").await,
            Err(TransportError::ChannelClosed(_))
        ));

        broker.fail_next_channel_reopens(1);
        assert!(session.reopen_channel().await.is_err());
        session.reopen_channel().await.unwrap();
        assert_eq!(session.probe(), SessionHealth::Alive);
    }

    #[tokio::test]
    async fn test_presence_fans_out_to_every_subscriber() {
        let broker = MemoryBroker::new();
        let alice_session = broker.connector().open(&alice()).await.unwrap();
        let bob_session = broker
            .connector()
            .open(&Identity::new("bob").unwrap())
            .await
            .unwrap();
        alice_session.declare_mailbox("mailbox.alice").await.unwrap();
        bob_session.declare_mailbox("mailbox.bob").await.unwrap();

        let mut alice_sub = alice_session
            .subscribe("mailbox.alice", Some(PRESENCE_TOPIC))
            .await
            .unwrap();
        let mut bob_sub = bob_session
            .subscribe("mailbox.bob", Some(PRESENCE_TOPIC))
            .await
            .unwrap();

        let payload = PresenceEvent::online(&alice()).encode().unwrap();
        alice_session
            .publish(PRESENCE_TOPIC, payload.clone(), Durability::Transient)
            .await
            .unwrap();

        let expected = Some(Delivery::Presence {
            payload: Bytes::from(payload),
        });
        assert_eq!(alice_sub.recv().await, expected);
        assert_eq!(bob_sub.recv().await, expected);

        let events = broker.presence_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, PresenceStatus::Online);
    }

    #[tokio::test]
    async fn test_connect_faults() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(1);
        assert!(matches!(
            broker.connector().open(&alice()).await,
            Err(TransportError::Unreachable(_))
        ));
        assert!(broker.connector().open(&alice()).await.is_ok());

        broker.set_reject_auth(true);
        assert!(matches!(
            broker.connector().open(&alice()).await,
            Err(TransportError::Authentication(_))
        ));
        assert_eq!(broker.open_count(), 3);
    }
}
