//! MQTT broker session
//!
//! Each [`MqttSession`] owns one rumqttc client and a driver task polling its
//! event loop. The driver does not reconnect on its own: when the event loop
//! fails it marks the session dead and closes the inbound channel, and the
//! connection manager opens a fresh session.
//!
//! Acknowledgements are manual in both directions. An inbound mailbox message
//! is acked only after it is in the consume loop's channel, so mail the broker
//! replays before anyone subscribes waits in the driver. A persistent publish
//! resolves only when the broker's PubAck for its packet id arrives.

use super::connection::configure_mqtt_options;
use super::message_handler::{classify_connection_error, route_mqtt_event, EventRoute};
use crate::config::BrokerSection;
use crate::protocol::Identity;
use crate::transport::{
    BrokerSession, Connector, Delivery, Durability, SessionHealth, Subscription, TransportError,
};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::Publish;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the rumqttc request channel
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Opens MQTT sessions for one broker
pub struct MqttConnector {
    config: BrokerSection,
    connect_timeout: Duration,
    inbound_buffer: usize,
}

impl MqttConnector {
    pub fn new(config: BrokerSection, connect_timeout: Duration, inbound_buffer: usize) -> Self {
        Self {
            config,
            connect_timeout,
            inbound_buffer: inbound_buffer.max(1),
        }
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn open(&self, identity: &Identity) -> Result<Box<dyn BrokerSession>, TransportError> {
        let options = configure_mqtt_options(identity, &self.config)?;
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);

        let shared = Arc::new(DriverShared::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (connack_tx, connack_rx) = oneshot::channel();

        let driver = tokio::spawn(drive_event_loop(
            identity.to_string(),
            client.clone(),
            event_loop,
            shared.clone(),
            connack_tx,
            shutdown_rx,
        ));

        let outcome = tokio::time::timeout(self.connect_timeout, connack_rx).await;
        let result = match outcome {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(TransportError::SessionClosed(
                "event loop stopped before ConnAck".to_string(),
            )),
            Err(_) => Err(TransportError::Timeout(self.connect_timeout)),
        };

        if let Err(e) = result {
            let _ = shutdown_tx.send(true);
            driver.abort();
            return Err(e);
        }

        info!(identity = %identity, host = %self.config.host, port = self.config.port, "MQTT session established");

        Ok(Box::new(MqttSession {
            own_mailbox: identity.mailbox(),
            client,
            shared,
            subscriptions: StdMutex::new(Vec::new()),
            publish_gate: Mutex::new(()),
            driver: StdMutex::new(Some(driver)),
            shutdown_tx,
            operation_timeout: self.config.operation_timeout(),
            inbound_buffer: self.inbound_buffer,
        }))
    }
}

/// Presence updates held for a consumer that is not keeping up. Mailbox
/// traffic is bounded by the receive maximum instead.
const MAX_BACKLOG: usize = 1024;

type AckWaiter = oneshot::Sender<Result<(), TransportError>>;

/// State shared between a session and its driver task
struct DriverShared {
    alive: AtomicBool,
    channel_open: AtomicBool,
    inbound: StdMutex<Option<mpsc::Sender<Delivery>>>,
    consumer_attached: Notify,
    /// QoS 1 publishes handed to rumqttc that have no packet id yet, in request order
    unassigned_acks: StdMutex<VecDeque<AckWaiter>>,
}

impl Default for DriverShared {
    fn default() -> Self {
        Self {
            alive: AtomicBool::new(true),
            channel_open: AtomicBool::new(true),
            inbound: StdMutex::new(None),
            consumer_attached: Notify::new(),
            unassigned_acks: StdMutex::new(VecDeque::new()),
        }
    }
}

impl DriverShared {
    fn inbound_sender(&self) -> Option<mpsc::Sender<Delivery>> {
        self.inbound.lock().ok().and_then(|guard| guard.clone())
    }

    fn set_inbound(&self, sender: Option<mpsc::Sender<Delivery>>) {
        if let Ok(mut guard) = self.inbound.lock() {
            *guard = sender;
        }
    }

    fn attach_consumer(&self, sender: mpsc::Sender<Delivery>) {
        self.set_inbound(Some(sender));
        self.consumer_attached.notify_one();
    }

    fn drop_closed_consumer(&self) {
        if let Ok(mut guard) = self.inbound.lock() {
            if guard.as_ref().is_some_and(|sender| sender.is_closed()) {
                *guard = None;
            }
        }
    }

    fn push_ack_waiter(&self, waiter: AckWaiter) -> Result<(), TransportError> {
        let mut waiters = self
            .unassigned_acks
            .lock()
            .map_err(|_| TransportError::SessionClosed("ack bookkeeping poisoned".to_string()))?;
        // Checked under the lock so `mark_dead` cannot miss this waiter
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::SessionClosed(
                "MQTT event loop stopped".to_string(),
            ));
        }
        waiters.push_back(waiter);
        Ok(())
    }

    fn pop_last_ack_waiter(&self) {
        if let Ok(mut waiters) = self.unassigned_acks.lock() {
            waiters.pop_back();
        }
    }

    fn take_next_ack_waiter(&self) -> Option<AckWaiter> {
        self.unassigned_acks
            .lock()
            .ok()
            .and_then(|mut waiters| waiters.pop_front())
    }

    fn mark_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.set_inbound(None);
        // Dropped waiters resolve their publishes as failed
        if let Ok(mut waiters) = self.unassigned_acks.lock() {
            waiters.clear();
        }
    }
}

/// Delivery received from the broker but not yet handed to a consumer
struct PendingDelivery {
    delivery: Delivery,
    ack: Option<Publish>,
}

/// Wait for room in the consumer's channel; never resolves without a consumer
async fn reserve_slot(
    consumer: Option<&mpsc::Sender<Delivery>>,
) -> Option<mpsc::Permit<'_, Delivery>> {
    match consumer {
        Some(sender) => sender.reserve().await.ok(),
        None => std::future::pending().await,
    }
}

/// Acknowledge a delivery the consume loop now owns
fn acknowledge(client: &AsyncClient, identity: &str, ack: Option<Publish>) {
    if let Some(publish) = ack {
        if let Err(e) = client.try_ack(&publish) {
            warn!(identity = %identity, pkid = publish.pkid, error = %e, "Failed to acknowledge delivery, broker will redeliver it");
        }
    }
}

async fn drive_event_loop(
    identity: String,
    client: AsyncClient,
    mut event_loop: EventLoop,
    shared: Arc<DriverShared>,
    connack_tx: oneshot::Sender<Result<(), TransportError>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut connack_tx = Some(connack_tx);
    // Unacknowledged deliveries stay with the broker if this session dies
    let mut backlog: VecDeque<PendingDelivery> = VecDeque::new();
    let mut awaiting_ack: HashMap<u16, AckWaiter> = HashMap::new();
    debug!(identity = %identity, "MQTT driver started");

    loop {
        let consumer = if backlog.is_empty() {
            None
        } else {
            shared.inbound_sender()
        };

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!(identity = %identity, "MQTT driver received shutdown");
                    break;
                }
            }

            _ = shared.consumer_attached.notified() => {
                debug!(identity = %identity, backlog = backlog.len(), "Consumer attached");
            }

            permit = reserve_slot(consumer.as_ref()), if !backlog.is_empty() => match permit {
                Some(permit) => {
                    if let Some(pending) = backlog.pop_front() {
                        permit.send(pending.delivery);
                        acknowledge(&client, &identity, pending.ack);
                    }
                }
                None => {
                    debug!(identity = %identity, "Consumer went away, holding deliveries");
                    shared.drop_closed_consumer();
                }
            },

            result = event_loop.poll() => match result {
                Ok(event) => match route_mqtt_event(&event) {
                    EventRoute::ConnectionAcknowledged { session_present } => {
                        debug!(identity = %identity, session_present, "ConnAck received");
                        if let Some(tx) = connack_tx.take() {
                            let _ = tx.send(Ok(()));
                        }
                    }
                    EventRoute::Inbound { delivery, ack } => {
                        let presence = matches!(delivery, Delivery::Presence { .. });
                        if presence
                            && (backlog.len() >= MAX_BACKLOG || shared.inbound_sender().is_none())
                        {
                            tracing::trace!(identity = %identity, "Dropping presence update with no room for it");
                        } else {
                            if shared.inbound_sender().is_none() {
                                debug!(identity = %identity, "Holding delivery until a consumer attaches");
                            }
                            backlog.push_back(PendingDelivery { delivery, ack });
                        }
                    }
                    EventRoute::PublishSent { packet_id } => {
                        match shared.take_next_ack_waiter() {
                            Some(waiter) => {
                                awaiting_ack.insert(packet_id, waiter);
                            }
                            None => debug!(identity = %identity, packet_id, "Publish sent with nobody awaiting its ack"),
                        }
                    }
                    EventRoute::PublishAcknowledged { packet_id, rejection } => {
                        if let Some(waiter) = awaiting_ack.remove(&packet_id) {
                            let _ = waiter.send(rejection.map_or(Ok(()), Err));
                        }
                    }
                    EventRoute::Disconnected(reason) => {
                        warn!(identity = %identity, reason = %reason, "Broker closed the session");
                        break;
                    }
                    EventRoute::SubscriptionConfirmed { packet_id, rejected } => {
                        if rejected > 0 {
                            warn!(identity = %identity, packet_id, rejected, "Broker rejected subscription");
                            shared.channel_open.store(false, Ordering::SeqCst);
                        } else {
                            debug!(identity = %identity, packet_id, "Subscription confirmed");
                        }
                    }
                    EventRoute::InfrastructureEvent(event) => {
                        tracing::trace!(target: "mqtt_transport", "MQTT event: {}", event);
                    }
                    EventRoute::OutgoingEvent => {}
                },
                Err(e) => {
                    let error = classify_connection_error(&e);
                    warn!(identity = %identity, error = %e, "MQTT event loop error");
                    if let Some(tx) = connack_tx.take() {
                        let _ = tx.send(Err(error));
                    }
                    break;
                }
            }
        }
    }

    shared.mark_dead();
    if !backlog.is_empty() {
        debug!(identity = %identity, unacknowledged = backlog.len(), "Session ended with deliveries the broker will resend");
    }
    debug!(identity = %identity, "MQTT driver stopped");
}

/// One live MQTT connection plus its subscription set
pub struct MqttSession {
    own_mailbox: String,
    client: AsyncClient,
    shared: Arc<DriverShared>,
    subscriptions: StdMutex<Vec<(String, QoS)>>,
    /// Keeps ack waiters in the same order as publish requests
    publish_gate: Mutex<()>,
    driver: StdMutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    operation_timeout: Duration,
    inbound_buffer: usize,
}

impl MqttSession {
    fn ensure_alive(&self) -> Result<(), TransportError> {
        if self.shared.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::SessionClosed(
                "MQTT event loop stopped".to_string(),
            ))
        }
    }

    fn remember(&self, topic: &str, qos: QoS) {
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            if !subscriptions.iter().any(|(existing, _)| existing == topic) {
                subscriptions.push((topic.to_string(), qos));
            }
        }
    }

    /// QoS 1 publish that completes on the broker's PubAck
    async fn publish_confirmed(
        &self,
        destination: &str,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let _gate = self.publish_gate.lock().await;
            self.shared.push_ack_waiter(ack_tx)?;
            let sent = tokio::time::timeout(
                self.operation_timeout,
                self.client
                    .publish(destination, QoS::AtLeastOnce, false, payload),
            )
            .await;

            let failure = match sent {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(TransportError::SessionClosed(e.to_string())),
                Err(_) => Some(TransportError::Timeout(self.operation_timeout)),
            };
            if let Some(error) = failure {
                self.shared.pop_last_ack_waiter();
                return Err(error);
            }
        }

        match tokio::time::timeout(self.operation_timeout, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::SessionClosed(
                "session ended before the broker acknowledged the publish".to_string(),
            )),
            Err(_) => Err(TransportError::Timeout(self.operation_timeout)),
        }
    }

    async fn subscribe_topic(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.ensure_alive()?;
        tokio::time::timeout(self.operation_timeout, self.client.subscribe(topic, qos))
            .await
            .map_err(|_| TransportError::Timeout(self.operation_timeout))?
            .map_err(|e| TransportError::SessionClosed(e.to_string()))?;
        self.remember(topic, qos);
        Ok(())
    }
}

#[async_trait]
impl BrokerSession for MqttSession {
    async fn declare_mailbox(&self, mailbox: &str) -> Result<(), TransportError> {
        self.ensure_alive()?;
        if mailbox == self.own_mailbox {
            // The persistent subscription is what makes the broker hold our mail
            self.subscribe_topic(mailbox, QoS::AtLeastOnce).await
        } else {
            // Another identity's mailbox exists once its owner has connected
            debug!(mailbox = %mailbox, "Recipient mailbox is owned by its session");
            Ok(())
        }
    }

    async fn declare_fanout(&self, topic: &str) -> Result<(), TransportError> {
        self.ensure_alive()?;
        debug!(topic = %topic, "Fanout topics need no declaration");
        Ok(())
    }

    async fn publish(
        &self,
        destination: &str,
        payload: Vec<u8>,
        durability: Durability,
    ) -> Result<(), TransportError> {
        self.ensure_alive()?;
        match durability {
            Durability::Persistent => self.publish_confirmed(destination, payload).await,
            Durability::Transient => tokio::time::timeout(
                self.operation_timeout,
                self.client
                    .publish(destination, QoS::AtMostOnce, false, payload),
            )
            .await
            .map_err(|_| TransportError::Timeout(self.operation_timeout))?
            .map_err(|e| TransportError::SessionClosed(e.to_string())),
        }
    }

    async fn subscribe(
        &self,
        mailbox: &str,
        fanout: Option<&str>,
    ) -> Result<Subscription, TransportError> {
        self.ensure_alive()?;
        let (tx, rx) = mpsc::channel(self.inbound_buffer);
        self.shared.attach_consumer(tx);

        self.subscribe_topic(mailbox, QoS::AtLeastOnce).await?;
        if let Some(topic) = fanout {
            self.subscribe_topic(topic, QoS::AtMostOnce).await?;
        }

        Ok(rx)
    }

    fn probe(&self) -> SessionHealth {
        if !self.shared.alive.load(Ordering::SeqCst) {
            SessionHealth::Dead
        } else if !self.shared.channel_open.load(Ordering::SeqCst) {
            SessionHealth::ChannelClosed
        } else {
            SessionHealth::Alive
        }
    }

    async fn reopen_channel(&self) -> Result<(), TransportError> {
        self.ensure_alive()?;
        let topics = self
            .subscriptions
            .lock()
            .map(|subscriptions| subscriptions.clone())
            .unwrap_or_default();

        self.shared.channel_open.store(true, Ordering::SeqCst);
        for (topic, qos) in topics {
            self.subscribe_topic(&topic, qos).await?;
        }
        Ok(())
    }

    async fn close(&self) {
        if self.shared.alive.load(Ordering::SeqCst) {
            match tokio::time::timeout(self.operation_timeout, self.client.disconnect()).await {
                Ok(Ok(())) => debug!("MQTT disconnect requested"),
                Ok(Err(e)) => debug!(error = %e, "MQTT disconnect failed"),
                Err(_) => debug!("MQTT disconnect timed out"),
            }
        }

        let _ = self.shutdown_tx.send(true);
        let handle = self.driver.lock().ok().and_then(|mut guard| guard.take());
        if let Some(mut handle) = handle {
            if tokio::time::timeout(Duration::from_secs(2), &mut handle)
                .await
                .is_err()
            {
                warn!("MQTT driver did not stop in time, aborting");
                handle.abort();
            }
        }
        self.shared.mark_dead();
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.driver.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PRESENCE_TOPIC;
    use bytes::{Bytes, BytesMut};
    use rumqttc::v5::mqttbytes::v5::{
        ConnAck, ConnectReturnCode, Packet, PingResp, PubAck, SubAck, SubscribeReasonCode,
    };
    use rumqttc::v5::mqttbytes::Error as PacketError;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Behavior of the one-connection broker used by the wire-level tests
    #[derive(Default)]
    struct Script {
        /// Stored QoS 1 mail sent right after ConnAck
        replay: Vec<Publish>,
        ack_publishes: bool,
        hang_up_on_publish: bool,
    }

    async fn read_packet(stream: &mut TcpStream, buffer: &mut BytesMut) -> Option<Packet> {
        loop {
            match Packet::read(buffer, None) {
                Ok(packet) => return Some(packet),
                Err(PacketError::InsufficientBytes(_)) => {}
                Err(_) => return None,
            }
            match stream.read_buf(buffer).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    async fn write_packet(stream: &mut TcpStream, packet: Packet) {
        let mut out = BytesMut::new();
        packet.write(&mut out).unwrap();
        stream.write_all(&out).await.unwrap();
    }

    /// Accepts one client, follows `script`, and reports every packet the client sends
    async fn scripted_broker(script: Script) -> (u16, mpsc::UnboundedReceiver<Packet>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buffer = BytesMut::new();

            match read_packet(&mut stream, &mut buffer).await {
                Some(Packet::Connect(..)) => {}
                other => panic!("Expected CONNECT, got {other:?}"),
            }
            let connack = ConnAck {
                session_present: !script.replay.is_empty(),
                code: ConnectReturnCode::Success,
                properties: None,
            };
            write_packet(&mut stream, Packet::ConnAck(connack)).await;
            for stored in &script.replay {
                write_packet(&mut stream, Packet::Publish(stored.clone())).await;
            }

            while let Some(packet) = read_packet(&mut stream, &mut buffer).await {
                let _ = seen_tx.send(packet.clone());
                match packet {
                    Packet::Subscribe(subscribe) => {
                        let suback = SubAck {
                            pkid: subscribe.pkid,
                            return_codes: subscribe
                                .filters
                                .iter()
                                .map(|filter| SubscribeReasonCode::Success(filter.qos))
                                .collect(),
                            properties: None,
                        };
                        write_packet(&mut stream, Packet::SubAck(suback)).await;
                    }
                    Packet::PingReq(_) => write_packet(&mut stream, Packet::PingResp(PingResp)).await,
                    Packet::Publish(publish) if publish.qos == QoS::AtLeastOnce => {
                        if script.hang_up_on_publish {
                            break;
                        }
                        if script.ack_publishes {
                            let puback = PubAck::new(publish.pkid, None);
                            write_packet(&mut stream, Packet::PubAck(puback)).await;
                        }
                    }
                    _ => {}
                }
            }
        });

        (port, seen_rx)
    }

    fn connector(port: u16) -> MqttConnector {
        MqttConnector::new(
            BrokerSection::new("127.0.0.1", port),
            Duration::from_secs(2),
            8,
        )
    }

    fn stored_mail(pkid: u16, body: &'static str) -> Publish {
        let mut publish = Publish::new("mailbox.bob", QoS::AtLeastOnce, body, None);
        publish.pkid = pkid;
        publish
    }

    #[tokio::test]
    async fn test_replayed_mail_is_held_and_acked_only_after_handover() {
        let (port, mut seen) = scripted_broker(Script {
            replay: vec![stored_mail(1, "while you were out")],
            ..Script::default()
        })
        .await;
        let bob = Identity::new("bob").unwrap();
        let session = connector(port).open(&bob).await.unwrap();

        // The connect-time mailbox subscription must not swallow the replay
        session.declare_mailbox("mailbox.bob").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let early: Vec<Packet> = std::iter::from_fn(|| seen.try_recv().ok()).collect();
        assert!(
            !early.iter().any(|packet| matches!(packet, Packet::PubAck(_))),
            "mail acknowledged before any consumer had it: {early:?}"
        );

        let mut inbox = session
            .subscribe("mailbox.bob", Some(PRESENCE_TOPIC))
            .await
            .unwrap();
        let delivery = tokio::time::timeout(Duration::from_secs(2), inbox.recv())
            .await
            .unwrap();
        assert_eq!(
            delivery,
            Some(Delivery::Direct {
                mailbox: "mailbox.bob".to_string(),
                payload: Bytes::from("while you were out"),
            })
        );

        let acked = tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(packet) = seen.recv().await {
                if let Packet::PubAck(puback) = packet {
                    return Some(puback.pkid);
                }
            }
            None
        })
        .await
        .unwrap();
        assert_eq!(acked, Some(1));

        session.close().await;
    }

    #[tokio::test]
    async fn test_persistent_publish_completes_on_puback() {
        let (port, mut seen) = scripted_broker(Script {
            ack_publishes: true,
            ..Script::default()
        })
        .await;
        let alice = Identity::new("alice").unwrap();
        let session = connector(port).open(&alice).await.unwrap();

        session
            .publish("mailbox.carol", b"hello".to_vec(), Durability::Persistent)
            .await
            .unwrap();
        session
            .publish("mailbox.carol", b"again".to_vec(), Durability::Persistent)
            .await
            .unwrap();

        let published: Vec<Packet> = std::iter::from_fn(|| seen.try_recv().ok())
            .filter(|packet| matches!(packet, Packet::Publish(_)))
            .collect();
        assert_eq!(published.len(), 2);

        session.close().await;
    }

    #[tokio::test]
    async fn test_publish_fails_when_session_dies_before_puback() {
        let (port, _seen) = scripted_broker(Script {
            hang_up_on_publish: true,
            ..Script::default()
        })
        .await;
        let alice = Identity::new("alice").unwrap();
        let session = connector(port).open(&alice).await.unwrap();

        let result = session
            .publish("mailbox.carol", b"in flight".to_vec(), Durability::Persistent)
            .await;

        assert!(
            matches!(result, Err(TransportError::SessionClosed(_))),
            "unacknowledged publish must be reported for retry, got {result:?}"
        );
        assert_eq!(session.probe(), SessionHealth::Dead);
    }

    #[test]
    fn test_ack_waiter_after_death_is_refused() {
        let shared = DriverShared::default();
        shared.mark_dead();

        let (tx, _rx) = oneshot::channel();
        assert!(matches!(
            shared.push_ack_waiter(tx),
            Err(TransportError::SessionClosed(_))
        ));
    }

    #[test]
    fn test_driver_shared_starts_alive() {
        let shared = DriverShared::default();
        assert!(shared.alive.load(Ordering::SeqCst));
        assert!(shared.inbound_sender().is_none());
    }

    #[tokio::test]
    async fn test_mark_dead_closes_inbound_channel() {
        let shared = DriverShared::default();
        let (tx, mut rx) = mpsc::channel(4);
        shared.set_inbound(Some(tx));
        assert!(shared.inbound_sender().is_some());

        shared.mark_dead();
        assert!(!shared.alive.load(Ordering::SeqCst));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_open_times_out_without_broker() {
        // Port 1 on localhost refuses connections, so the driver reports an error quickly
        let connector = MqttConnector::new(
            BrokerSection::new("127.0.0.1", 1),
            Duration::from_millis(500),
            8,
        );
        let alice = Identity::new("alice").unwrap();

        let result = connector.open(&alice).await;
        assert!(matches!(
            result,
            Err(TransportError::Unreachable(_)) | Err(TransportError::Timeout(_))
        ));
    }
}
