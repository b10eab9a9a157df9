//! Relay counters
//!
//! Atomic counters updated from the admission path and the session loops,
//! rendered in Prometheus text format.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Metrics registry for the relay
#[derive(Debug)]
pub struct Metrics {
    // Admission
    pub connections_admitted: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub bind_failures: AtomicU64,

    // Sessions
    pub sessions_active: AtomicU64,

    // Network stats
    pub datagrams_received: AtomicU64,
    pub datagrams_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,

    // Message handling
    pub messages_dispatched: AtomicU64,
    pub parse_failures: AtomicU64,
    pub action_rejections: AtomicU64,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_admitted: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            bind_failures: AtomicU64::new(0),
            sessions_active: AtomicU64::new(0),
            datagrams_received: AtomicU64::new(0),
            datagrams_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            messages_dispatched: AtomicU64::new(0),
            parse_failures: AtomicU64::new(0),
            action_rejections: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_received(&self, bytes: usize) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_sent(&self, bytes: usize) {
        self.datagrams_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn session_started(&self) {
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_ended(&self) {
        let _ = self
            .sessions_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(2048);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        metric!("kaillera_connections_admitted_total", "Connections granted a session port", "counter",
            self.connections_admitted.load(Ordering::Relaxed));
        metric!("kaillera_connections_rejected_total", "Connections refused during admission", "counter",
            self.connections_rejected.load(Ordering::Relaxed));
        metric!("kaillera_bind_failures_total", "Failed session port binds", "counter",
            self.bind_failures.load(Ordering::Relaxed));
        metric!("kaillera_sessions_active", "Running session handlers", "gauge",
            self.sessions_active.load(Ordering::Relaxed));

        metric!("kaillera_datagrams_received_total", "Datagrams received on session ports", "counter",
            self.datagrams_received.load(Ordering::Relaxed));
        metric!("kaillera_datagrams_sent_total", "Datagrams sent from session ports", "counter",
            self.datagrams_sent.load(Ordering::Relaxed));
        metric!("kaillera_bytes_received_total", "Bytes received on session ports", "counter",
            self.bytes_received.load(Ordering::Relaxed));
        metric!("kaillera_bytes_sent_total", "Bytes sent from session ports", "counter",
            self.bytes_sent.load(Ordering::Relaxed));

        metric!("kaillera_messages_dispatched_total", "Inbound messages handed to actions", "counter",
            self.messages_dispatched.load(Ordering::Relaxed));
        metric!("kaillera_parse_failures_total", "Malformed inbound datagrams", "counter",
            self.parse_failures.load(Ordering::Relaxed));
        metric!("kaillera_action_rejections_total", "Messages rejected by actions", "counter",
            self.action_rejections.load(Ordering::Relaxed));

        metric!("kaillera_uptime_seconds", "Server uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.sessions_active.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.datagrams_sent.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_traffic_counters() {
        let metrics = Metrics::new();
        metrics.record_received(100);
        metrics.record_received(20);
        metrics.record_sent(7);

        assert_eq!(metrics.datagrams_received.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.bytes_received.load(Ordering::Relaxed), 120);
        assert_eq!(metrics.bytes_sent.load(Ordering::Relaxed), 7);
    }

    #[test]
    fn test_session_gauge_saturates() {
        let metrics = Metrics::new();
        metrics.session_started();
        metrics.session_ended();
        metrics.session_ended();
        assert_eq!(metrics.sessions_active.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.connections_admitted.store(5, Ordering::Relaxed);
        metrics.bind_failures.store(2, Ordering::Relaxed);

        let output = metrics.to_prometheus();

        assert!(output.contains("kaillera_connections_admitted_total 5"));
        assert!(output.contains("kaillera_bind_failures_total 2"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }
}
