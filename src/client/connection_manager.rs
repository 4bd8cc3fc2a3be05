//! Single owner of the broker session
//!
//! Every broker operation goes through [`ConnectionManager`] and holds its one
//! `tokio::sync::Mutex` for the duration of the call, so connect, reconnect,
//! declare, publish and subscribe never interleave. Liveness checks use
//! `try_lock` and report [`Liveness::Busy`] instead of waiting.

use super::events::{ClientEvent, EventSink};
use super::mailbox::MailboxRegistry;
use super::retry::{retry, RetryError, RetryPolicy};
use super::state::{
    determine_next_state, log_state_transition, ConnectionEvent, ConnectionState, HealthMetrics,
};
use crate::config::ClientConfig;
use crate::connection_span;
use crate::error::{sanitize_error_message, ClientError};
use crate::observability::metrics;
use crate::protocol::{Identity, PresenceEvent, PresenceStatus, PRESENCE_TOPIC};
use crate::transport::{
    BrokerSession, Connector, Durability, SessionHealth, Subscription, TransportError,
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::{debug, info, warn, Instrument};

/// Result of a non-blocking liveness check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    ChannelClosed,
    Dead,
    /// Another task holds the connection lock
    Busy,
    Closed,
}

#[derive(Default)]
struct ConnectionSlot {
    session: Option<Box<dyn BrokerSession>>,
    connected_at: Option<Instant>,
    last_activity: Option<Instant>,
}

pub struct ConnectionManager {
    identity: Identity,
    connector: Arc<dyn Connector>,
    mailboxes: MailboxRegistry,
    connect_policy: RetryPolicy,
    slot: Mutex<ConnectionSlot>,
    state_tx: watch::Sender<ConnectionState>,
    events: EventSink,
    closed: AtomicBool,
    auth_reported: AtomicBool,
    reconnect_count: AtomicU32,
}

impl ConnectionManager {
    pub fn new(
        identity: Identity,
        connector: Arc<dyn Connector>,
        config: &ClientConfig,
        events: EventSink,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected(
            "not connected".to_string(),
        ));

        Self {
            mailboxes: MailboxRegistry::new(identity.clone()),
            identity,
            connector,
            connect_policy: config.connection.retry_policy(),
            slot: Mutex::new(ConnectionSlot::default()),
            state_tx,
            events,
            closed: AtomicBool::new(false),
            auth_reported: AtomicBool::new(false),
            reconnect_count: AtomicU32::new(0),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn reconnect_count(&self) -> u32 {
        self.reconnect_count.load(Ordering::SeqCst)
    }

    /// Establish the session, declaring the own mailbox and the presence fanout
    ///
    /// Attempts are bounded by the connect policy. Authentication failures
    /// return immediately.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let mut slot = self.slot.lock().await;
        self.connect_locked(&mut slot, false).await
    }

    /// Make sure a usable session exists, connecting or repairing as needed
    pub async fn ensure_usable(&self) -> Result<(), ClientError> {
        let mut slot = self.slot.lock().await;
        self.ensure_usable_locked(&mut slot).await
    }

    /// Reopen the channel on a live session, falling back to a full reconnect
    pub async fn recreate_channel(&self) -> Result<(), ClientError> {
        let mut slot = self.slot.lock().await;
        self.recreate_channel_locked(&mut slot).await
    }

    /// Drop the current session and connect a new one
    pub async fn force_reconnect(&self) -> Result<(), ClientError> {
        let mut slot = self.slot.lock().await;
        self.connect_locked(&mut slot, true).await
    }

    /// Declare the recipient's mailbox and publish a persistent message to it
    pub async fn publish_direct(
        &self,
        recipient: &Identity,
        payload: Vec<u8>,
    ) -> Result<(), ClientError> {
        let mut slot = self.slot.lock().await;
        self.ensure_usable_locked(&mut slot).await?;

        let result = async {
            let session = Self::session(&slot)?;
            self.mailboxes
                .declare_recipient(session, recipient)
                .await?;
            session
                .publish(&recipient.mailbox(), payload, Durability::Persistent)
                .await
        }
        .await;

        self.finish_operation(&mut slot, result)
    }

    /// Publish a transient presence update on the fanout
    pub async fn publish_presence(&self, status: PresenceStatus) -> Result<(), ClientError> {
        let payload = PresenceEvent::new(&self.identity, status).encode()?;
        let mut slot = self.slot.lock().await;
        self.ensure_usable_locked(&mut slot).await?;

        let result = match Self::session(&slot) {
            Ok(session) => {
                session
                    .publish(PRESENCE_TOPIC, payload, Durability::Transient)
                    .await
            }
            Err(e) => Err(e),
        };

        self.finish_operation(&mut slot, result)
    }

    /// Start consuming the own mailbox plus the presence fanout
    pub async fn subscribe_own(&self) -> Result<Subscription, ClientError> {
        let mut slot = self.slot.lock().await;
        self.ensure_usable_locked(&mut slot).await?;

        let result = match Self::session(&slot) {
            Ok(session) => {
                session
                    .subscribe(&self.identity.mailbox(), Some(PRESENCE_TOPIC))
                    .await
            }
            Err(e) => Err(e),
        };

        self.finish_operation(&mut slot, result)
    }

    /// Non-blocking health check. Tolerates racing with in-flight operations.
    pub fn check_liveness(&self) -> Liveness {
        if self.is_closed() {
            return Liveness::Closed;
        }

        match self.slot.try_lock() {
            Err(_) => Liveness::Busy,
            Ok(slot) => match slot.session.as_ref().map(|session| session.probe()) {
                None | Some(SessionHealth::Dead) => Liveness::Dead,
                Some(SessionHealth::ChannelClosed) => Liveness::ChannelClosed,
                Some(SessionHealth::Alive) => Liveness::Alive,
            },
        }
    }

    /// Snapshot of connection health, `None` while the lock is held elsewhere
    pub fn health(&self) -> Option<HealthMetrics> {
        let slot = self.slot.try_lock().ok()?;
        Some(HealthMetrics::calculate(
            self.state(),
            slot.connected_at,
            slot.last_activity,
            self.reconnect_count(),
        ))
    }

    /// Announce offline best-effort, then release the session. Idempotent.
    pub async fn close(&self, offline_timeout: Duration) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!(identity = %self.identity, "Connection already closed");
            return;
        }

        let slot = tokio::time::timeout(offline_timeout, self.slot.lock()).await;
        match slot {
            Ok(mut slot) => {
                if let Some(session) = slot.session.take() {
                    if session.probe() == SessionHealth::Alive {
                        self.announce_offline(session.as_ref(), offline_timeout)
                            .await;
                    }
                    session.close().await;
                }
                slot.connected_at = None;
            }
            Err(_) => {
                warn!(identity = %self.identity, "Connection busy during close, skipping offline announcement");
                // In-flight operations see the closed flag and finish without reconnecting
                let mut slot = self.slot.lock().await;
                if let Some(session) = slot.session.take() {
                    session.close().await;
                }
                slot.connected_at = None;
            }
        }

        metrics().connection_lost();
        self.transition(ConnectionEvent::CloseRequested);
    }

    async fn announce_offline(&self, session: &dyn BrokerSession, offline_timeout: Duration) {
        let payload = match PresenceEvent::offline(&self.identity).encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(identity = %self.identity, error = %e, "Failed to encode offline presence");
                return;
            }
        };

        match tokio::time::timeout(
            offline_timeout,
            session.publish(PRESENCE_TOPIC, payload, Durability::Transient),
        )
        .await
        {
            Ok(Ok(())) => {
                metrics().presence_announced();
                info!(identity = %self.identity, "Announced offline");
            }
            Ok(Err(e)) => {
                warn!(identity = %self.identity, error = %e, "Offline announcement failed");
            }
            Err(_) => {
                warn!(identity = %self.identity, "Offline announcement timed out");
            }
        }
    }

    fn session(slot: &ConnectionSlot) -> Result<&dyn BrokerSession, TransportError> {
        slot.session
            .as_deref()
            .ok_or_else(|| TransportError::SessionClosed("no active session".to_string()))
    }

    async fn ensure_usable_locked(
        &self,
        slot: &mut MutexGuard<'_, ConnectionSlot>,
    ) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }

        let health = slot.session.as_ref().map(|session| session.probe());
        match health {
            Some(SessionHealth::Alive) if self.state() == ConnectionState::Connected => Ok(()),
            Some(SessionHealth::Alive) => {
                self.transition(ConnectionEvent::Established);
                Ok(())
            }
            Some(SessionHealth::ChannelClosed) => self.recreate_channel_locked(slot).await,
            Some(SessionHealth::Dead) => {
                self.transition(ConnectionEvent::Lost("session died".to_string()));
                metrics().connection_lost();
                self.connect_locked(slot, true).await
            }
            None => {
                let reconnect = slot.connected_at.is_some() || self.reconnect_count() > 0;
                self.connect_locked(slot, reconnect).await
            }
        }
    }

    async fn recreate_channel_locked(
        &self,
        slot: &mut MutexGuard<'_, ConnectionSlot>,
    ) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }

        let result = async {
            let session = Self::session(slot)?;
            session.reopen_channel().await?;
            self.mailboxes.reset();
            self.mailboxes.declare_own(session).await
        }
        .instrument(connection_span!(identity = %self.identity, operation = "recreate_channel"))
        .await;

        match result {
            Ok(()) => {
                metrics().channel_recreated();
                slot.last_activity = Some(Instant::now());
                info!(identity = %self.identity, "Channel recreated");
                self.transition(ConnectionEvent::Established);
                Ok(())
            }
            Err(e) => {
                warn!(identity = %self.identity, error = %e, "Channel recreation failed, reconnecting");
                self.connect_locked(slot, true).await
            }
        }
    }

    async fn connect_locked(
        &self,
        slot: &mut MutexGuard<'_, ConnectionSlot>,
        reconnect: bool,
    ) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }

        if let Some(old) = slot.session.take() {
            old.close().await;
        }
        slot.connected_at = None;
        self.mailboxes.reset();

        if reconnect {
            let attempt = self.reconnect_count.fetch_add(1, Ordering::SeqCst) + 1;
            metrics().reconnect();
            self.transition(ConnectionEvent::ReconnectStarted(attempt));
        } else {
            self.transition(ConnectionEvent::ConnectStarted);
        }

        let outcome = retry(
            &self.connect_policy,
            |attempt| self.open_session(attempt),
            |error: &TransportError| !error.is_fatal(),
        )
        .instrument(connection_span!(identity = %self.identity, reconnect))
        .await;

        match outcome {
            Ok(session) => {
                let now = Instant::now();
                slot.session = Some(session);
                slot.connected_at = Some(now);
                slot.last_activity = Some(now);
                metrics().connection_established();
                self.transition(ConnectionEvent::Established);
                Ok(())
            }
            Err(failure) => {
                let attempts = failure.attempts();
                let fatal = matches!(failure, RetryError::Fatal { .. });
                let error = failure.into_error();
                let reason = sanitize_error_message(&error.to_string());
                self.transition(ConnectionEvent::ConnectFailed(reason.clone()));

                match error {
                    TransportError::Authentication(_) => {
                        self.report_authentication_failure(&reason);
                        Err(ClientError::Authentication(reason))
                    }
                    other if fatal => Err(other.into()),
                    _ => Err(ClientError::unreachable(attempts, reason)),
                }
            }
        }
    }

    async fn open_session(&self, attempt: u32) -> Result<Box<dyn BrokerSession>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::SessionClosed("client closed".to_string()));
        }

        metrics().connection_attempt();
        debug!(identity = %self.identity, attempt, "Opening broker session");

        let session = match self.connector.open(&self.identity).await {
            Ok(session) => session,
            Err(e) => {
                metrics().connection_failed();
                warn!(identity = %self.identity, attempt, error = %e, "Connection attempt failed");
                return Err(e);
            }
        };

        if let Err(e) = self.mailboxes.declare_own(session.as_ref()).await {
            metrics().connection_failed();
            warn!(identity = %self.identity, attempt, error = %e, "Mailbox declaration failed");
            session.close().await;
            return Err(e);
        }

        Ok(session)
    }

    /// Record the outcome of a broker operation and translate its error
    fn finish_operation<T>(
        &self,
        slot: &mut MutexGuard<'_, ConnectionSlot>,
        result: Result<T, TransportError>,
    ) -> Result<T, ClientError> {
        match result {
            Ok(value) => {
                slot.last_activity = Some(Instant::now());
                Ok(value)
            }
            Err(error) => {
                let health = slot.session.as_ref().map(|session| session.probe());
                if matches!(health, None | Some(SessionHealth::Dead)) {
                    metrics().connection_lost();
                    self.transition(ConnectionEvent::Lost(sanitize_error_message(
                        &error.to_string(),
                    )));
                }
                Err(error.into())
            }
        }
    }

    fn report_authentication_failure(&self, reason: &str) {
        if !self.auth_reported.swap(true, Ordering::SeqCst) {
            self.events.emit(ClientEvent::AuthenticationFailed {
                reason: reason.to_string(),
            });
        }
    }

    fn transition(&self, event: ConnectionEvent) {
        let current = self.state();
        let next = determine_next_state(&current, event);
        if next != current {
            log_state_transition(self.identity.as_str(), &current, &next);
            self.state_tx.send_replace(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryBroker;

    fn fast_config() -> ClientConfig {
        let mut config = ClientConfig::for_broker("memory", 1);
        config.connection.connect_attempts = 3;
        config.connection.retry_delay_ms = 5;
        config
    }

    fn manager(broker: &MemoryBroker, identity: &str) -> (ConnectionManager, tokio::sync::mpsc::UnboundedReceiver<ClientEvent>) {
        let (events, rx) = EventSink::channel();
        let manager = ConnectionManager::new(
            Identity::new(identity).unwrap(),
            Arc::new(broker.connector()),
            &fast_config(),
            events,
        );
        (manager, rx)
    }

    #[tokio::test]
    async fn test_connect_declares_mailbox() {
        let broker = MemoryBroker::new();
        let (manager, _events) = manager(&broker, "alice");

        manager.connect().await.unwrap();

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(broker.mailbox_exists("mailbox.alice"));
        assert_eq!(manager.check_liveness(), Liveness::Alive);
    }

    #[tokio::test]
    async fn test_connect_retries_transient_failures() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(2);
        let (manager, _events) = manager(&broker, "alice");

        manager.connect().await.unwrap();
        assert_eq!(broker.open_count(), 3);
    }

    #[tokio::test]
    async fn test_connect_gives_up_when_unreachable() {
        let broker = MemoryBroker::new();
        broker.set_unreachable(true);
        let (manager, _events) = manager(&broker, "alice");

        let result = manager.connect().await;
        assert!(matches!(
            result,
            Err(ClientError::Unreachable { attempts: 3, .. })
        ));
        assert!(matches!(manager.state(), ConnectionState::Disconnected(_)));
    }

    #[tokio::test]
    async fn test_authentication_failure_is_not_retried() {
        let broker = MemoryBroker::new();
        broker.set_reject_auth(true);
        let (manager, mut events) = manager(&broker, "alice");

        assert!(matches!(
            manager.connect().await,
            Err(ClientError::Authentication(_))
        ));
        assert!(matches!(
            manager.connect().await,
            Err(ClientError::Authentication(_))
        ));

        assert_eq!(broker.open_count(), 2);
        assert!(matches!(
            events.try_recv(),
            Ok(ClientEvent::AuthenticationFailed { .. })
        ));
        assert!(events.try_recv().is_err(), "authentication failure is reported once");
    }

    #[tokio::test]
    async fn test_ensure_usable_reconnects_dead_session() {
        let broker = MemoryBroker::new();
        let (manager, _events) = manager(&broker, "alice");
        manager.connect().await.unwrap();

        broker.kill_sessions();
        assert_eq!(manager.check_liveness(), Liveness::Dead);

        manager.ensure_usable().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.reconnect_count(), 1);
        assert_eq!(broker.open_count(), 2);
    }

    #[tokio::test]
    async fn test_closed_channel_is_reopened_without_reconnect() {
        let broker = MemoryBroker::new();
        let (manager, _events) = manager(&broker, "alice");
        manager.connect().await.unwrap();

        broker.close_channels();
        assert_eq!(manager.check_liveness(), Liveness::ChannelClosed);

        manager.ensure_usable().await.unwrap();
        assert_eq!(manager.check_liveness(), Liveness::Alive);
        assert_eq!(broker.open_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_channel_reopen_falls_back_to_reconnect() {
        let broker = MemoryBroker::new();
        let (manager, _events) = manager(&broker, "alice");
        manager.connect().await.unwrap();

        broker.close_channels();
        broker.fail_next_channel_reopens(1);
        manager.recreate_channel().await.unwrap();

        assert_eq!(manager.check_liveness(), Liveness::Alive);
        assert_eq!(broker.open_count(), 2);
    }

    #[tokio::test]
    async fn test_liveness_reports_busy_while_locked() {
        let broker = MemoryBroker::new();
        let (manager, _events) = manager(&broker, "alice");
        manager.connect().await.unwrap();

        let _guard = manager.slot.lock().await;
        assert_eq!(manager.check_liveness(), Liveness::Busy);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_with_single_offline() {
        let broker = MemoryBroker::new();
        let (manager, _events) = manager(&broker, "alice");
        manager.connect().await.unwrap();

        manager.close(Duration::from_millis(100)).await;
        manager.close(Duration::from_millis(100)).await;

        let offline: Vec<_> = broker
            .presence_events()
            .into_iter()
            .filter(|event| event.status == PresenceStatus::Offline)
            .collect();
        assert_eq!(offline.len(), 1);
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(manager.check_liveness(), Liveness::Closed);
        assert!(matches!(
            manager.ensure_usable().await,
            Err(ClientError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_state_changes_are_observable() {
        let broker = MemoryBroker::new();
        let (manager, _events) = manager(&broker, "alice");
        let mut state_rx = manager.subscribe_state();

        manager.connect().await.unwrap();
        state_rx.changed().await.unwrap();
        assert_eq!(*state_rx.borrow_and_update(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_close_releases_session_after_busy_lock_clears() {
        let broker = MemoryBroker::new();
        let (manager, _events) = manager(&broker, "alice");
        let manager = Arc::new(manager);
        manager.connect().await.unwrap();

        let guard = manager.slot.lock().await;
        let closing = tokio::spawn({
            let manager = manager.clone();
            async move { manager.close(Duration::from_millis(20)).await }
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(broker.live_sessions(), 1);
        drop(guard);

        tokio::time::timeout(Duration::from_secs(1), closing)
            .await
            .expect("close should finish once the lock is free")
            .unwrap();
        assert_eq!(broker.live_sessions(), 0);
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert!(broker
            .presence_events()
            .iter()
            .all(|event| event.status != PresenceStatus::Offline));
    }
}
