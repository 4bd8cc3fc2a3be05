//! Presence announcer, heartbeat checker and the roster of observed peers

use super::connection_manager::{ConnectionManager, Liveness};
use super::retry::{retry, RetryPolicy};
use crate::config::PresenceSection;
use crate::error::ClientError;
use crate::observability::metrics;
use crate::protocol::{PresenceEvent, PresenceStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceEntry {
    pub status: PresenceStatus,
    pub last_seen: DateTime<Utc>,
}

/// Last known status of every identity seen on the presence fanout
#[derive(Debug, Clone, Default)]
pub struct PresenceRoster {
    entries: Arc<Mutex<HashMap<String, PresenceEntry>>>,
}

impl PresenceRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an update; returns true when the status changed
    pub fn apply(&self, event: &PresenceEvent) -> bool {
        let Ok(mut entries) = self.entries.lock() else {
            return false;
        };

        let now = Utc::now();
        match entries.get_mut(&event.identity) {
            Some(entry) => {
                entry.last_seen = now;
                if entry.status == event.status {
                    false
                } else {
                    entry.status = event.status;
                    true
                }
            }
            None => {
                entries.insert(
                    event.identity.clone(),
                    PresenceEntry {
                        status: event.status,
                        last_seen: now,
                    },
                );
                true
            }
        }
    }

    pub fn status(&self, identity: &str) -> Option<PresenceStatus> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(identity).map(|entry| entry.status))
    }

    /// Identities currently believed online, sorted
    pub fn online(&self) -> Vec<String> {
        let mut online: Vec<String> = self
            .entries
            .lock()
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(_, entry)| entry.status == PresenceStatus::Online)
                    .map(|(identity, _)| identity.clone())
                    .collect()
            })
            .unwrap_or_default();
        online.sort();
        online
    }

    pub fn snapshot(&self) -> HashMap<String, PresenceEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

/// Periodic announcer and heartbeat tasks sharing the connection manager
pub struct PresenceMonitor {
    manager: Arc<ConnectionManager>,
    announce_interval: Duration,
    heartbeat_interval: Duration,
    announce_policy: RetryPolicy,
    shutdown_rx: watch::Receiver<bool>,
}

impl PresenceMonitor {
    pub fn new(
        manager: Arc<ConnectionManager>,
        config: &PresenceSection,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            manager,
            announce_interval: config.announce_interval(),
            heartbeat_interval: config.heartbeat_interval(),
            announce_policy: config.retry_policy(),
            shutdown_rx,
        }
    }

    /// Spawn the announcer and the heartbeat checker
    pub fn spawn(self) -> (JoinHandle<()>, JoinHandle<()>) {
        let announcer = tokio::spawn(run_announcer(
            self.manager.clone(),
            self.announce_interval,
            self.announce_policy,
            self.shutdown_rx.clone(),
        ));
        let heartbeat = tokio::spawn(run_heartbeat(
            self.manager,
            self.heartbeat_interval,
            self.shutdown_rx,
        ));
        (announcer, heartbeat)
    }
}

/// Publish one presence update under the announce policy
pub async fn announce(
    manager: &ConnectionManager,
    status: PresenceStatus,
    policy: &RetryPolicy,
) -> Result<(), ClientError> {
    let result = retry(
        policy,
        |_| manager.publish_presence(status),
        |error: &ClientError| !error.is_fatal(),
    )
    .await;

    match result {
        Ok(()) => {
            metrics().presence_announced();
            debug!(identity = %manager.identity(), status = %status, "Presence announced");
            Ok(())
        }
        Err(failure) => {
            metrics().presence_failed();
            Err(failure.into_error())
        }
    }
}

async fn run_announcer(
    manager: Arc<ConnectionManager>,
    interval: Duration,
    policy: RetryPolicy,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick completes immediately; online was already announced on connect
    ticker.tick().await;

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                match announce(&manager, PresenceStatus::Online, &policy).await {
                    Ok(()) => {}
                    Err(ClientError::Closed) => break,
                    Err(e) => warn!(identity = %manager.identity(), error = %e, "Presence announcement failed"),
                }
            }
        }
    }

    debug!(identity = %manager.identity(), "Presence announcer stopped");
}

async fn run_heartbeat(
    manager: Arc<ConnectionManager>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                metrics().heartbeat();
                match manager.check_liveness() {
                    Liveness::Alive | Liveness::Busy => {}
                    Liveness::Closed => break,
                    Liveness::Dead => {
                        info!(identity = %manager.identity(), "Heartbeat found dead session, reconnecting");
                        if let Err(e) = manager.ensure_usable().await {
                            warn!(identity = %manager.identity(), error = %e, "Heartbeat reconnect failed");
                        }
                    }
                    Liveness::ChannelClosed => {
                        info!(identity = %manager.identity(), "Heartbeat found closed channel, recreating");
                        if let Err(e) = manager.recreate_channel().await {
                            warn!(identity = %manager.identity(), error = %e, "Heartbeat channel recreation failed");
                        }
                    }
                }
            }
        }
    }

    debug!(identity = %manager.identity(), "Heartbeat checker stopped");
}
