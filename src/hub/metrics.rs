use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

/// Point-in-time copy of the hub counters.
///
/// Built by the control loop on request; nothing in it is shared with the loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub current_connections: u64,
    pub total_connections: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub message_type_counts: HashMap<String, u64>,
    pub last_message_time: Option<DateTime<Utc>>,
    pub start_time: DateTime<Utc>,
    #[serde(serialize_with = "as_secs")]
    pub uptime: Duration,
}

fn as_secs<S: Serializer>(uptime: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(uptime.as_secs_f64())
}

impl MetricsSnapshot {
    /// Messages sent and received per second of uptime; zero when no time has elapsed.
    pub fn message_rate(&self) -> (f64, f64) {
        let secs = self.uptime.as_secs_f64();
        if secs <= 0.0 {
            return (0.0, 0.0);
        }
        (
            self.messages_sent as f64 / secs,
            self.messages_received as f64 / secs,
        )
    }
}

/// Counters owned and mutated exclusively by the control loop.
#[derive(Debug)]
pub(crate) struct HubMetrics {
    current_connections: u64,
    total_connections: u64,
    messages_sent: u64,
    messages_received: u64,
    message_type_counts: HashMap<String, u64>,
    last_message_time: Option<DateTime<Utc>>,
    start_time: DateTime<Utc>,
    started: Instant,
}

impl HubMetrics {
    pub(crate) fn new() -> Self {
        Self {
            current_connections: 0,
            total_connections: 0,
            messages_sent: 0,
            messages_received: 0,
            message_type_counts: HashMap::new(),
            last_message_time: None,
            start_time: Utc::now(),
            started: Instant::now(),
        }
    }

    pub(crate) fn connection_opened(&mut self, live: usize) {
        self.total_connections += 1;
        self.current_connections = live as u64;
    }

    pub(crate) fn set_current_connections(&mut self, live: usize) {
        self.current_connections = live as u64;
    }

    pub(crate) fn message_received(&mut self, kind: &str) {
        self.messages_received += 1;
        *self.message_type_counts.entry(kind.to_string()).or_insert(0) += 1;
        self.last_message_time = Some(Utc::now());
    }

    pub(crate) fn message_sent(&mut self) {
        self.messages_sent += 1;
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            current_connections: self.current_connections,
            total_connections: self.total_connections,
            messages_sent: self.messages_sent,
            messages_received: self.messages_received,
            message_type_counts: self.message_type_counts.clone(),
            last_message_time: self.last_message_time,
            start_time: self.start_time,
            uptime: self.started.elapsed(),
        }
    }
}
