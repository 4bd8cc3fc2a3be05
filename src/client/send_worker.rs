//! Background actor that drains the outbound queue
//!
//! The worker is the only consumer of the queue, so messages to any single
//! recipient leave in enqueue order. Each message is retried under the send
//! policy and ends in exactly one outcome: published, or one
//! [`ClientEvent::DeliveryExhausted`].

use super::connection_manager::ConnectionManager;
use super::events::{ClientEvent, EventSink};
use super::retry::{RetryDecision, RetryPolicy};
use crate::config::SendSection;
use crate::delivery_span;
use crate::error::{sanitize_error_message, ClientError};
use crate::observability::metrics;
use crate::protocol::{Identity, OutboundMessage, WireMessage};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Commands read by the worker
#[derive(Debug)]
pub enum SendCommand {
    Deliver(OutboundMessage),
    /// Sentinel: exit once everything queued before it is handled
    Shutdown,
}

pub struct SendWorker {
    identity: Identity,
    manager: Arc<ConnectionManager>,
    policy: RetryPolicy,
    throttle: Duration,
    dequeue_timeout: Duration,
    events: EventSink,
    shutdown_rx: watch::Receiver<bool>,
}

impl SendWorker {
    pub fn new(
        manager: Arc<ConnectionManager>,
        config: &SendSection,
        events: EventSink,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            identity: manager.identity().clone(),
            manager,
            policy: config.retry_policy(),
            throttle: config.throttle(),
            dequeue_timeout: config.dequeue_timeout(),
            events,
            shutdown_rx,
        }
    }

    pub fn spawn(self, queue: mpsc::UnboundedReceiver<SendCommand>) -> JoinHandle<()> {
        tokio::spawn(self.run(queue))
    }

    async fn run(mut self, mut queue: mpsc::UnboundedReceiver<SendCommand>) {
        info!(identity = %self.identity, "Send worker started");

        loop {
            let command = match tokio::time::timeout(self.dequeue_timeout, queue.recv()).await {
                Err(_) if *self.shutdown_rx.borrow() => {
                    debug!(identity = %self.identity, "Send worker idle after stop flag");
                    break;
                }
                Err(_) => continue,
                Ok(None) => {
                    debug!(identity = %self.identity, "Outbound queue closed");
                    break;
                }
                Ok(Some(command)) => command,
            };

            match command {
                SendCommand::Shutdown => {
                    debug!(identity = %self.identity, "Send worker received shutdown sentinel");
                    break;
                }
                SendCommand::Deliver(message) => {
                    let span = delivery_span!(
                        message_id = %message.id,
                        recipient = %message.recipient
                    );
                    self.deliver(message).instrument(span).await;
                    if !self.throttle.is_zero() {
                        tokio::time::sleep(self.throttle).await;
                    }
                }
            }
        }

        info!(identity = %self.identity, "Send worker stopped");
    }

    async fn deliver(&mut self, message: OutboundMessage) {
        let payload = match WireMessage::for_outbound(&self.identity, &message).encode() {
            Ok(payload) => payload,
            Err(e) => {
                self.exhausted(&message, 0, &e.to_string());
                return;
            }
        };

        let mut failures = 0u32;
        loop {
            let started = Instant::now();
            let error = match self
                .manager
                .publish_direct(&message.recipient, payload.clone())
                .await
            {
                Ok(()) => {
                    metrics().message_published(started.elapsed());
                    debug!(attempt = failures + 1, "Message published");
                    return;
                }
                Err(error) => error,
            };

            failures += 1;
            metrics().publish_failed();

            if error.is_fatal() {
                self.exhausted(&message, failures, &error.to_string());
                return;
            }

            match self.policy.decide(failures) {
                RetryDecision::Retry { attempt, delay } => {
                    warn!(attempt, error = %error, "Publish failed, reconnecting before retry");
                    if !self.interruptible_sleep(delay).await {
                        self.exhausted(&message, failures, "client closed before retry");
                        return;
                    }
                    if let Err(e) = self.manager.force_reconnect().await {
                        if matches!(e, ClientError::Authentication(_) | ClientError::Closed) {
                            self.exhausted(&message, failures, &e.to_string());
                            return;
                        }
                        debug!(error = %e, "Reconnect before retry failed");
                    }
                }
                RetryDecision::GiveUp => {
                    self.exhausted(&message, failures, &error.to_string());
                    return;
                }
            }
        }
    }

    /// Sleep unless shutdown is requested; returns false on shutdown
    async fn interruptible_sleep(&mut self, delay: Duration) -> bool {
        if *self.shutdown_rx.borrow() {
            return false;
        }

        tokio::select! {
            changed = self.shutdown_rx.changed() => {
                changed.is_ok() && !*self.shutdown_rx.borrow()
            }
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn exhausted(&self, message: &OutboundMessage, attempts: u32, reason: &str) {
        let reason = sanitize_error_message(reason);
        warn!(attempts, reason = %reason, "Dropping message after final failure");
        metrics().delivery_exhausted();
        self.events.emit(ClientEvent::DeliveryExhausted {
            message_id: message.id,
            recipient: message.recipient.clone(),
            attempts,
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::testing::MemoryBroker;

    fn config() -> ClientConfig {
        let mut config = ClientConfig::for_broker("memory", 1);
        config.connection.retry_delay_ms = 5;
        config.send.retry_delay_ms = 5;
        config.send.throttle_ms = 0;
        config.send.dequeue_timeout_ms = 20;
        config
    }

    async fn start(
        broker: &MemoryBroker,
        config: &ClientConfig,
    ) -> (
        mpsc::UnboundedSender<SendCommand>,
        mpsc::UnboundedReceiver<ClientEvent>,
        JoinHandle<()>,
        watch::Sender<bool>,
    ) {
        let (events, events_rx) = EventSink::channel();
        let manager = Arc::new(ConnectionManager::new(
            Identity::new("alice").unwrap(),
            Arc::new(broker.connector()),
            config,
            events.clone(),
        ));
        manager.connect().await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SendWorker::new(manager, &config.send, events, shutdown_rx).spawn(rx);
        (tx, events_rx, handle, shutdown_tx)
    }

    fn message(recipient: &str, body: &[u8]) -> OutboundMessage {
        OutboundMessage::new(Identity::new(recipient).unwrap(), body.to_vec())
    }

    #[tokio::test]
    async fn test_delivers_and_stops_on_sentinel() {
        let broker = MemoryBroker::new();
        let (tx, _events, handle, _shutdown) = start(&broker, &config()).await;

        tx.send(SendCommand::Deliver(message("bob", b"one"))).unwrap();
        tx.send(SendCommand::Deliver(message("bob", b"two"))).unwrap();
        tx.send(SendCommand::Shutdown).unwrap();
        handle.await.unwrap();

        let payloads: Vec<Vec<u8>> = broker
            .direct_messages("mailbox.bob")
            .iter()
            .map(|wire| wire.sealed_payload().unwrap())
            .collect();
        assert_eq!(payloads, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[tokio::test]
    async fn test_exhausted_after_max_attempts() {
        let broker = MemoryBroker::new();
        let (tx, mut events, handle, _shutdown) = start(&broker, &config()).await;
        broker.fail_next_publishes(3);

        let outbound = message("bob", b"lost");
        let id = outbound.id;
        tx.send(SendCommand::Deliver(outbound)).unwrap();
        tx.send(SendCommand::Shutdown).unwrap();
        handle.await.unwrap();

        match events.try_recv() {
            Ok(ClientEvent::DeliveryExhausted {
                message_id,
                attempts,
                ..
            }) => {
                assert_eq!(message_id, id);
                assert_eq!(attempts, 3);
            }
            other => panic!("Expected DeliveryExhausted, got {other:?}"),
        }
        assert!(events.try_recv().is_err());
        assert!(broker.direct_messages("mailbox.bob").is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let broker = MemoryBroker::new();
        let (tx, mut events, handle, _shutdown) = start(&broker, &config()).await;
        broker.fail_next_publishes(2);

        tx.send(SendCommand::Deliver(message("bob", b"late"))).unwrap();
        tx.send(SendCommand::Shutdown).unwrap();
        handle.await.unwrap();

        assert_eq!(broker.direct_messages("mailbox.bob").len(), 1);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_during_backoff_ends_retries() {
        let broker = MemoryBroker::new();
        let mut config = config();
        config.send.retry_delay_ms = 60_000;
        let (tx, mut events, handle, shutdown) = start(&broker, &config).await;
        broker.fail_next_publishes(1);

        tx.send(SendCommand::Deliver(message("bob", b"pending"))).unwrap();
        tx.send(SendCommand::Shutdown).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker should stop promptly")
            .unwrap();
        assert!(matches!(
            events.try_recv(),
            Ok(ClientEvent::DeliveryExhausted { attempts: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_idle_worker_exits_on_stop_flag_without_sentinel() {
        let broker = MemoryBroker::new();
        let (_tx, _events, handle, shutdown) = start(&broker, &config()).await;

        shutdown.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker should notice the stop flag on its next dequeue timeout")
            .unwrap();
    }
}
