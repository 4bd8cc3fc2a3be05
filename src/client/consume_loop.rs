//! Fault-tolerant consumer of the identity's own mailbox
//!
//! The outer loop (re)subscribes through the connection manager and backs off
//! linearly on consecutive failures. A subscription that dies before one poll
//! interval without delivering anything counts as a failure too, so a broker
//! that keeps dropping the session cannot spin the loop. The inner loop polls the subscription with
//! a timeout so shutdown is observed promptly, isolates the application
//! handler from errors and panics, and feeds presence updates into the roster.

use super::connection_manager::ConnectionManager;
use super::events::{ClientEvent, EventSink};
use super::presence::PresenceRoster;
use super::retry::{RetryDecision, RetryPolicy};
use crate::config::ConsumeSection;
use crate::consume_span;
use crate::error::{sanitize_error_message, ClientError};
use crate::observability::metrics;
use crate::protocol::{Identity, PresenceEvent, WireMessage};
use crate::transport::{Delivery, Subscription};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Application callback for direct messages
///
/// Receives the sender identity and the still-sealed payload. Errors and panics
/// are logged and never stop the loop.
pub trait InboundHandler: Send + Sync + 'static {
    fn on_message(&self, sender: &str, sealed_payload: &[u8]) -> Result<(), HandlerError>;
}

impl<F> InboundHandler for F
where
    F: Fn(&str, &[u8]) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn on_message(&self, sender: &str, sealed_payload: &[u8]) -> Result<(), HandlerError> {
        self(sender, sealed_payload)
    }
}

/// Handler of a running consume loop, swappable without resubscribing
#[derive(Clone)]
pub struct HandlerSlot(Arc<RwLock<Arc<dyn InboundHandler>>>);

impl HandlerSlot {
    pub fn new(handler: Arc<dyn InboundHandler>) -> Self {
        Self(Arc::new(RwLock::new(handler)))
    }

    /// Later deliveries go to `handler`
    pub fn replace(&self, handler: Arc<dyn InboundHandler>) {
        match self.0.write() {
            Ok(mut current) => *current = handler,
            Err(poisoned) => *poisoned.into_inner() = handler,
        }
    }

    fn current(&self) -> Arc<dyn InboundHandler> {
        match self.0.read() {
            Ok(current) => current.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

enum CycleOutcome {
    Shutdown,
    /// Subscription ran and then closed
    Lost { delivered: u64, lasted: Duration },
    Failed(ClientError),
}

pub struct ConsumeLoop {
    identity: Identity,
    manager: Arc<ConnectionManager>,
    policy: RetryPolicy,
    poll_interval: Duration,
    handler: HandlerSlot,
    roster: PresenceRoster,
    events: EventSink,
    shutdown_rx: watch::Receiver<bool>,
}

impl ConsumeLoop {
    pub fn new(
        manager: Arc<ConnectionManager>,
        config: &ConsumeSection,
        handler: HandlerSlot,
        roster: PresenceRoster,
        events: EventSink,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            identity: manager.identity().clone(),
            manager,
            policy: config.retry_policy(),
            poll_interval: config.poll_interval(),
            handler,
            roster,
            events,
            shutdown_rx,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!(identity = %self.identity, "Consume loop started");
        let mut failures = 0u32;
        let mut cycle = 0u64;

        loop {
            if self.shutdown_requested() {
                break;
            }

            cycle += 1;
            let span = consume_span!(identity = %self.identity, cycle);
            match self.run_cycle().instrument(span).await {
                CycleOutcome::Shutdown => break,
                CycleOutcome::Lost { delivered, lasted }
                    if delivered > 0 || lasted >= self.poll_interval =>
                {
                    info!(identity = %self.identity, delivered, "Subscription lost, resubscribing");
                    failures = 0;
                }
                CycleOutcome::Lost { lasted, .. } => {
                    failures += 1;
                    let reason = format!(
                        "subscription closed after {}ms without deliveries",
                        lasted.as_millis()
                    );
                    if !self.back_off(failures, reason).await {
                        break;
                    }
                }
                CycleOutcome::Failed(ClientError::Closed) => break,
                CycleOutcome::Failed(error) => {
                    failures += 1;
                    let reason = sanitize_error_message(&error.to_string());

                    if matches!(error, ClientError::Authentication(_)) {
                        self.stop(failures, reason);
                        break;
                    }
                    if !self.back_off(failures, reason).await {
                        break;
                    }
                }
            }
        }

        info!(identity = %self.identity, "Consume loop stopped");
    }

    /// Wait out the backoff for `failures`; false once the loop should end
    async fn back_off(&mut self, failures: u32, reason: String) -> bool {
        match self.policy.decide(failures) {
            RetryDecision::Retry { delay, .. } => {
                warn!(
                    identity = %self.identity,
                    failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    "Subscription failed, backing off"
                );
                self.interruptible_sleep(delay).await
            }
            RetryDecision::GiveUp => {
                self.stop(failures, reason);
                false
            }
        }
    }

    async fn run_cycle(&mut self) -> CycleOutcome {
        let mut subscription: Subscription = match self.manager.subscribe_own().await {
            Ok(subscription) => subscription,
            Err(error) => return CycleOutcome::Failed(error),
        };
        debug!(identity = %self.identity, "Subscribed to own mailbox");

        let started = Instant::now();
        let mut delivered = 0u64;
        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        return CycleOutcome::Shutdown;
                    }
                }
                polled = tokio::time::timeout(self.poll_interval, subscription.recv()) => {
                    match polled {
                        Err(_) => continue,
                        Ok(None) => {
                            return CycleOutcome::Lost {
                                delivered,
                                lasted: started.elapsed(),
                            }
                        }
                        Ok(Some(delivery)) => {
                            delivered += 1;
                            self.dispatch(delivery);
                        }
                    }
                }
            }
        }
    }

    fn dispatch(&self, delivery: Delivery) {
        match delivery {
            Delivery::Direct { mailbox, payload } => {
                let wire = match WireMessage::decode(&payload) {
                    Ok(wire) => wire,
                    Err(e) => {
                        warn!(mailbox = %mailbox, error = %e, "Skipping undecodable message");
                        return;
                    }
                };
                let sealed = match wire.sealed_payload() {
                    Ok(sealed) => sealed,
                    Err(e) => {
                        warn!(sender = %wire.from, error = %e, "Skipping message with invalid payload");
                        return;
                    }
                };
                metrics().message_received();
                self.invoke_handler(&wire.from, &sealed);
            }
            Delivery::Presence { payload } => match PresenceEvent::decode(&payload) {
                Ok(event) => self.observe_presence(event),
                Err(e) => debug!(error = %e, "Skipping undecodable presence update"),
            },
        }
    }

    fn invoke_handler(&self, sender: &str, sealed: &[u8]) {
        let handler = self.handler.current();
        match catch_unwind(AssertUnwindSafe(|| handler.on_message(sender, sealed))) {
            Ok(Ok(())) => debug!(sender = %sender, "Message handled"),
            Ok(Err(e)) => {
                metrics().handler_failed();
                warn!(sender = %sender, error = %e, "Message handler failed");
            }
            Err(panic) => {
                metrics().handler_failed();
                error!(sender = %sender, panic = %panic_message(panic.as_ref()), "Message handler panicked");
            }
        }
    }

    fn observe_presence(&self, event: PresenceEvent) {
        if event.identity == self.identity.as_str() {
            return;
        }

        if self.roster.apply(&event) {
            debug!(identity = %event.identity, status = %event.status, "Presence changed");
            self.events.emit(ClientEvent::PresenceChanged {
                identity: event.identity,
                status: event.status,
            });
        }
    }

    fn stop(&self, failures: u32, reason: String) {
        error!(identity = %self.identity, failures, reason = %reason, "Consume loop giving up");
        metrics().listener_stopped();
        self.events
            .emit(ClientEvent::ListenerStopped { failures, reason });
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    async fn interruptible_sleep(&mut self, delay: Duration) -> bool {
        tokio::select! {
            changed = self.shutdown_rx.changed() => {
                changed.is_ok() && !*self.shutdown_rx.borrow()
            }
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
