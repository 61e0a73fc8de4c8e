//! Per-connection metrics
//!
//! Counters plus a bounded window of send latencies. Shared between the
//! writer, receive loop and heartbeat tasks of a link; reset at the start of
//! every connection attempt.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug)]
pub struct ConnectionMetrics {
    pub chunks_sent: u64,
    pub bytes_sent: u64,
    pub frames_received: u64,
    pub send_errors: u64,
    pub ping_failures: u64,
    pub decode_errors: u64,
    latencies: VecDeque<Duration>,
    window: usize,
    last_activity: Instant,
    last_received: Instant,
}

impl ConnectionMetrics {
    pub fn new(window: usize) -> Self {
        Self {
            chunks_sent: 0,
            bytes_sent: 0,
            frames_received: 0,
            send_errors: 0,
            ping_failures: 0,
            decode_errors: 0,
            latencies: VecDeque::with_capacity(window),
            window: window.max(1),
            last_activity: Instant::now(),
            last_received: Instant::now(),
        }
    }

    pub fn record_latency(&mut self, latency: Duration) {
        if self.latencies.len() == self.window {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }

    pub fn average_latency(&self) -> Option<Duration> {
        if self.latencies.is_empty() {
            return None;
        }
        let total: Duration = self.latencies.iter().sum();
        Some(total / self.latencies.len() as u32)
    }

    pub fn latency_samples(&self) -> usize {
        self.latencies.len()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            chunks_sent: self.chunks_sent,
            bytes_sent: self.bytes_sent,
            frames_received: self.frames_received,
            send_errors: self.send_errors,
            ping_failures: self.ping_failures,
            decode_errors: self.decode_errors,
            average_latency_ms: self
                .average_latency()
                .map(|d| d.as_micros() as f64 / 1_000.0),
            latency_samples: self.latencies.len(),
        }
    }
}

/// Point-in-time copy of the metrics, emitted on disconnect.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub chunks_sent: u64,
    pub bytes_sent: u64,
    pub frames_received: u64,
    pub send_errors: u64,
    pub ping_failures: u64,
    pub decode_errors: u64,
    pub average_latency_ms: Option<f64>,
    pub latency_samples: usize,
}

/// Shared handle used by the link tasks.
#[derive(Debug, Clone)]
pub struct MetricsHandle {
    inner: Arc<Mutex<ConnectionMetrics>>,
}

impl MetricsHandle {
    pub fn new(window: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ConnectionMetrics::new(window))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionMetrics> {
        // a panicked holder cannot leave the counters inconsistent
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply an update under the lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut ConnectionMetrics) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn record_send(&self, bytes: usize, is_audio: bool, latency: Duration) {
        let mut m = self.lock();
        if is_audio {
            m.chunks_sent += 1;
        }
        m.bytes_sent += bytes as u64;
        m.record_latency(latency);
        m.last_activity = Instant::now();
    }

    pub fn record_received(&self) {
        let mut m = self.lock();
        m.frames_received += 1;
        m.last_activity = Instant::now();
        m.last_received = m.last_activity;
    }

    /// Time since anything was sent or received.
    pub fn idle_for(&self) -> Duration {
        self.lock().last_activity.elapsed()
    }

    /// Time since the peer last sent anything.
    pub fn silent_for(&self) -> Duration {
        self.lock().last_received.elapsed()
    }

    pub fn reset(&self) {
        let mut m = self.lock();
        let window = m.window;
        *m = ConnectionMetrics::new(window);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.lock().snapshot()
    }
}
