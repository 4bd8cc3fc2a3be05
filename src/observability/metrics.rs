//! Thread-safe metrics collection
//!
//! Atomic counters for the connection, delivery and consume paths, plus a
//! bounded window of publish latencies for percentile reporting.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Latency samples kept for percentile calculations
const MAX_LATENCY_SAMPLES: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

pub struct MetricsCollector {
    // Connection
    connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    reconnects: AtomicU64,
    channel_recreations: AtomicU64,
    connection_start_time: AtomicU64,

    // Send path
    messages_enqueued: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    deliveries_exhausted: AtomicU64,
    publish_latencies: Mutex<Vec<u64>>,

    // Consume path
    messages_received: AtomicU64,
    handler_failures: AtomicU64,
    listener_stops: AtomicU64,

    // Presence
    presence_announcements: AtomicU64,
    presence_failures: AtomicU64,
    last_heartbeat: AtomicU64,

    uptime_start: AtomicU64,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            channel_recreations: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            messages_enqueued: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            deliveries_exhausted: AtomicU64::new(0),
            publish_latencies: Mutex::new(Vec::new()),
            messages_received: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            listener_stops: AtomicU64::new(0),
            presence_announcements: AtomicU64::new(0),
            presence_failures: AtomicU64::new(0),
            last_heartbeat: AtomicU64::new(0),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn connection_lost(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    pub fn reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn channel_recreated(&self) {
        self.channel_recreations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_enqueued(&self) {
        self.messages_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_published(&self, latency: Duration) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut latencies) = self.publish_latencies.lock() {
            latencies.push(latency.as_millis() as u64);
            if latencies.len() > MAX_LATENCY_SAMPLES {
                latencies.remove(0);
            }
        }
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivery_exhausted(&self) {
        self.deliveries_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_failed(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn listener_stopped(&self) {
        self.listener_stops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn presence_announced(&self) {
        self.presence_announcements.fetch_add(1, Ordering::Relaxed);
    }

    pub fn presence_failed(&self) {
        self.presence_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heartbeat(&self) {
        self.last_heartbeat
            .store(current_timestamp(), Ordering::Relaxed);
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.connection_attempts,
            &self.connections_established,
            &self.connection_failures,
            &self.reconnects,
            &self.channel_recreations,
            &self.connection_start_time,
            &self.messages_enqueued,
            &self.messages_published,
            &self.publish_failures,
            &self.deliveries_exhausted,
            &self.messages_received,
            &self.handler_failures,
            &self.listener_stops,
            &self.presence_announcements,
            &self.presence_failures,
            &self.last_heartbeat,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.connected.store(false, Ordering::Relaxed);
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
        if let Ok(mut latencies) = self.publish_latencies.lock() {
            latencies.clear();
        }
    }

    fn latency_statistics(&self) -> (f64, f64, f64) {
        let Ok(latencies) = self.publish_latencies.lock() else {
            return (0.0, 0.0, 0.0);
        };
        if latencies.is_empty() {
            return (0.0, 0.0, 0.0);
        }

        let mut sorted = latencies.clone();
        sorted.sort_unstable();
        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (avg, percentile(&sorted, 50.0), percentile(&sorted, 99.0))
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let connection_start = self.connection_start_time.load(Ordering::Relaxed);
        let (avg_publish_ms, p50_publish_ms, p99_publish_ms) = self.latency_statistics();

        MetricsSnapshot {
            timestamp: now,
            uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            connection: ConnectionMetrics {
                connected: self.connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                reconnects: self.reconnects.load(Ordering::Relaxed),
                channel_recreations: self.channel_recreations.load(Ordering::Relaxed),
                connection_uptime_seconds: if connection_start > 0 {
                    now.saturating_sub(connection_start)
                } else {
                    0
                },
            },
            delivery: DeliveryMetrics {
                messages_enqueued: self.messages_enqueued.load(Ordering::Relaxed),
                messages_published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                deliveries_exhausted: self.deliveries_exhausted.load(Ordering::Relaxed),
                avg_publish_ms,
                p50_publish_ms,
                p99_publish_ms,
            },
            consume: ConsumeMetrics {
                messages_received: self.messages_received.load(Ordering::Relaxed),
                handler_failures: self.handler_failures.load(Ordering::Relaxed),
                listener_stops: self.listener_stops.load(Ordering::Relaxed),
            },
            presence: PresenceMetrics {
                announcements: self.presence_announcements.load(Ordering::Relaxed),
                failures: self.presence_failures.load(Ordering::Relaxed),
                last_heartbeat: self.last_heartbeat.load(Ordering::Relaxed),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: u64,
    pub uptime_seconds: u64,
    pub connection: ConnectionMetrics,
    pub delivery: DeliveryMetrics,
    pub consume: ConsumeMetrics,
    pub presence: PresenceMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub reconnects: u64,
    pub channel_recreations: u64,
    pub connection_uptime_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryMetrics {
    pub messages_enqueued: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub deliveries_exhausted: u64,
    pub avg_publish_ms: f64,
    pub p50_publish_ms: f64,
    pub p99_publish_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumeMetrics {
    pub messages_received: u64,
    pub handler_failures: u64,
    pub listener_stops: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PresenceMetrics {
    pub announcements: u64,
    pub failures: u64,
    pub last_heartbeat: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Nearest-rank percentile of sorted samples
fn percentile(sorted: &[u64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((pct / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)] as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_counters() {
        let collector = MetricsCollector::new();
        collector.connection_attempt();
        collector.connection_attempt();
        collector.connection_failed();
        collector.connection_established();
        collector.reconnect();

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.connection.connection_attempts, 2);
        assert_eq!(snapshot.connection.connection_failures, 1);
        assert_eq!(snapshot.connection.connections_established, 1);
        assert_eq!(snapshot.connection.reconnects, 1);
        assert!(snapshot.connection.connected);

        collector.connection_lost();
        assert!(!collector.snapshot().connection.connected);
    }

    #[test]
    fn test_delivery_counters_and_latency() {
        let collector = MetricsCollector::new();
        collector.message_enqueued();
        collector.message_published(Duration::from_millis(10));
        collector.message_published(Duration::from_millis(30));
        collector.publish_failed();
        collector.delivery_exhausted();

        let delivery = collector.snapshot().delivery;
        assert_eq!(delivery.messages_enqueued, 1);
        assert_eq!(delivery.messages_published, 2);
        assert_eq!(delivery.publish_failures, 1);
        assert_eq!(delivery.deliveries_exhausted, 1);
        assert_eq!(delivery.avg_publish_ms, 20.0);
    }

    #[test]
    fn test_latency_window_is_bounded() {
        let collector = MetricsCollector::new();
        for i in 0..(MAX_LATENCY_SAMPLES + 50) {
            collector.message_published(Duration::from_millis(i as u64));
        }
        assert_eq!(
            collector.publish_latencies.lock().unwrap().len(),
            MAX_LATENCY_SAMPLES
        );
    }

    #[test]
    fn test_reset() {
        let collector = MetricsCollector::new();
        collector.message_received();
        collector.handler_failed();
        collector.presence_announced();
        collector.reset();

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.consume.messages_received, 0);
        assert_eq!(snapshot.consume.handler_failures, 0);
        assert_eq!(snapshot.presence.announcements, 0);
    }

    #[test]
    fn test_percentile() {
        let samples = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        assert_eq!(percentile(&samples, 0.0), 1.0);
        assert_eq!(percentile(&samples, 100.0), 10.0);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(MetricsCollector::new().snapshot()).unwrap();
        assert!(json.get("delivery").is_some());
        assert!(json.get("presence").is_some());
    }
}
