//! Per-identity messaging client
//!
//! [`Client`] ties the connection manager to three background actors: the send
//! worker, the presence monitor and (once [`Client::subscribe`] is called) the
//! consume loop. All of them share one broker session through the manager.
//!
//! ```rust,no_run
//! use courier::client::Client;
//! use courier::config::ClientConfig;
//! use courier::protocol::Identity;
//!
//! # tokio_test::block_on(async {
//! let config = ClientConfig::for_broker("localhost", 1883);
//! let client = Client::connect_mqtt(config, Identity::new("alice")?).await?;
//!
//! client
//!     .subscribe(|sender: &str, sealed: &[u8]| {
//!         println!("{sender} sent {} bytes", sealed.len());
//!         Ok::<(), courier::client::HandlerError>(())
//!     })
//!     .await?;
//! client.enqueue(Identity::new("bob")?, b"sealed bytes".to_vec())?;
//! client.close().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod connection_manager;
pub mod consume_loop;
pub mod events;
pub mod mailbox;
pub mod presence;
pub mod retry;
pub mod send_worker;
pub mod state;

pub use connection_manager::{ConnectionManager, Liveness};
pub use consume_loop::{HandlerError, InboundHandler};
pub use events::ClientEvent;
pub use presence::{PresenceEntry, PresenceRoster};
pub use retry::{Backoff, RetryDecision, RetryPolicy};
pub use state::{ConnectionState, HealthMetrics};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::observability::metrics;
use crate::protocol::{Identity, OutboundMessage, PresenceStatus};
use crate::transport::mqtt::MqttConnector;
use crate::transport::Connector;
use consume_loop::{ConsumeLoop, HandlerSlot};
use events::EventSink;
use presence::PresenceMonitor;
use send_worker::{SendCommand, SendWorker};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Default)]
struct BackgroundTasks {
    send_worker: Option<JoinHandle<()>>,
    announcer: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    consume_loop: Option<JoinHandle<()>>,
    handler: Option<HandlerSlot>,
}

impl BackgroundTasks {
    fn drain(&mut self) -> Vec<(&'static str, JoinHandle<()>)> {
        [
            ("send_worker", self.send_worker.take()),
            ("consume_loop", self.consume_loop.take()),
            ("announcer", self.announcer.take()),
            ("heartbeat", self.heartbeat.take()),
        ]
        .into_iter()
        .filter_map(|(name, handle)| handle.map(|handle| (name, handle)))
        .collect()
    }
}

pub struct Client {
    identity: Identity,
    config: ClientConfig,
    manager: Arc<ConnectionManager>,
    outbound: mpsc::UnboundedSender<SendCommand>,
    events: EventSink,
    events_rx: StdMutex<Option<mpsc::UnboundedReceiver<ClientEvent>>>,
    roster: PresenceRoster,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<BackgroundTasks>,
    closed: AtomicBool,
}

impl Client {
    /// Connect over MQTT using the broker section of `config`
    pub async fn connect_mqtt(config: ClientConfig, identity: Identity) -> Result<Self, ClientError> {
        let connector = MqttConnector::new(
            config.broker.clone(),
            config.connection.connect_timeout(),
            config.consume.inbound_buffer,
        );
        Self::connect(config, identity, Arc::new(connector)).await
    }

    /// Connect, announce online and start the send worker and presence monitor
    ///
    /// Fails with [`ClientError::Authentication`] or [`ClientError::Unreachable`]
    /// when the initial connect does not succeed.
    pub async fn connect(
        config: ClientConfig,
        identity: Identity,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ClientError> {
        config.validate()?;

        let (events, events_rx) = EventSink::channel();
        let manager = Arc::new(ConnectionManager::new(
            identity.clone(),
            connector,
            &config,
            events.clone(),
        ));
        manager.connect().await?;

        if let Err(e) =
            presence::announce(&manager, PresenceStatus::Online, &config.presence.retry_policy())
                .await
        {
            warn!(identity = %identity, error = %e, "Initial online announcement failed");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outbound, queue) = mpsc::unbounded_channel();

        let send_worker = SendWorker::new(
            manager.clone(),
            &config.send,
            events.clone(),
            shutdown_rx.clone(),
        )
        .spawn(queue);
        let (announcer, heartbeat) =
            PresenceMonitor::new(manager.clone(), &config.presence, shutdown_rx).spawn();

        info!(identity = %identity, "Client connected");

        Ok(Self {
            identity,
            config,
            manager,
            outbound,
            events,
            events_rx: StdMutex::new(Some(events_rx)),
            roster: PresenceRoster::new(),
            shutdown_tx,
            tasks: Mutex::new(BackgroundTasks {
                send_worker: Some(send_worker),
                announcer: Some(announcer),
                heartbeat: Some(heartbeat),
                consume_loop: None,
                handler: None,
            }),
            closed: AtomicBool::new(false),
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Queue a sealed payload for delivery. Never blocks.
    ///
    /// Returns the id carried by any later `DeliveryExhausted` event.
    pub fn enqueue(&self, recipient: Identity, sealed_payload: Vec<u8>) -> Result<Uuid, ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }

        let message = OutboundMessage::new(recipient, sealed_payload);
        let id = message.id;
        debug!(message_id = %id, recipient = %message.recipient, "Enqueued message");
        self.outbound
            .send(SendCommand::Deliver(message))
            .map_err(|_| ClientError::Closed)?;
        metrics().message_enqueued();
        Ok(id)
    }

    /// Start consuming the own mailbox
    ///
    /// Calling it again swaps the handler of the running loop without
    /// resubscribing. A loop that already stopped is started afresh.
    pub async fn subscribe<H: InboundHandler>(&self, handler: H) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }

        let handler: Arc<dyn InboundHandler> = Arc::new(handler);
        let mut tasks = self.tasks.lock().await;
        if let (Some(running), Some(slot)) = (&tasks.consume_loop, &tasks.handler) {
            if !running.is_finished() {
                debug!(identity = %self.identity, "Replacing handler of running consume loop");
                slot.replace(handler);
                return Ok(());
            }
        }

        let slot = HandlerSlot::new(handler);
        let consume_loop = ConsumeLoop::new(
            self.manager.clone(),
            &self.config.consume,
            slot.clone(),
            self.roster.clone(),
            self.events.clone(),
            self.shutdown_tx.subscribe(),
        );
        tasks.handler = Some(slot);
        tasks.consume_loop = Some(consume_loop.spawn());
        Ok(())
    }

    /// Publish a presence update now
    pub async fn announce(&self, status: PresenceStatus) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        presence::announce(&self.manager, status, &self.config.presence.retry_policy()).await
    }

    /// Take the event receiver. Returns `None` after the first call.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.events_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.manager.subscribe_state()
    }

    pub fn roster(&self) -> PresenceRoster {
        self.roster.clone()
    }

    pub fn health(&self) -> Option<HealthMetrics> {
        self.manager.health()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop background work, announce offline once and release the session
    ///
    /// Idempotent and never fails. Messages queued before the call are still
    /// attempted within the join timeout, but failed ones are not retried.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(identity = %self.identity, "Closing client");

        // The stop flag only cuts retry backoff short; queued messages ahead of
        // the sentinel are still published
        let _ = self.shutdown_tx.send(true);
        let _ = self.outbound.send(SendCommand::Shutdown);

        let handles = self.tasks.lock().await.drain();
        let join_timeout = self.config.shutdown.join_timeout();
        for (name, handle) in handles {
            join_with_timeout(name, handle, join_timeout).await;
        }

        self.manager
            .close(self.config.shutdown.offline_timeout())
            .await;
        info!(identity = %self.identity, "Client closed");
    }
}

async fn join_with_timeout(name: &str, mut handle: JoinHandle<()>, timeout: Duration) {
    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(())) => debug!(task = name, "Background task stopped"),
        Ok(Err(e)) => warn!(task = name, error = %e, "Background task ended abnormally"),
        Err(_) => {
            warn!(task = name, "Background task did not stop in time, aborting");
            handle.abort();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Ok(mut tasks) = self.tasks.try_lock() {
            for (_, handle) in tasks.drain() {
                handle.abort();
            }
        }
    }
}
