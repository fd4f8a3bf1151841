//! Broker metrics sink.
//!
//! Atomic counters, gauges and one fixed-bucket histogram, updated from the
//! event loop on the hot path and read by the metrics endpoint thread.

use std::sync::atomic::{AtomicU64, Ordering};

/// Histogram bucket upper bounds for message sizes, in bytes.
pub const MESSAGE_SIZE_BUCKETS: [u64; 8] = [10, 50, 100, 500, 1000, 5000, 10000, 50000];

/// Fixed-bucket histogram. Buckets store per-interval counts; the exposition
/// layer accumulates them into cumulative `le` series.
pub struct Histogram {
    buckets: [AtomicU64; 8],
    count: AtomicU64,
    sum: AtomicU64,
}

impl Histogram {
    pub const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            buckets: [ZERO; 8],
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn observe(&self, value: u64) {
        if let Some(i) = MESSAGE_SIZE_BUCKETS.iter().position(|&bound| value <= bound) {
            self.buckets[i].fetch_add(1, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
    }

    /// Cumulative count at and below each bucket bound.
    pub fn cumulative_buckets(&self) -> [u64; 8] {
        let mut out = [0u64; 8];
        let mut acc = 0u64;
        for (i, bucket) in self.buckets.iter().enumerate() {
            acc += bucket.load(Ordering::Relaxed);
            out[i] = acc;
        }
        out
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Global broker metrics using atomic counters.
pub struct BrokerMetrics {
    // Gauges
    pub active_connections: AtomicU64,
    pub active_subscriptions: AtomicU64,

    // Counters
    pub total_connections: AtomicU64,
    pub messages_published: AtomicU64,
    pub messages_received: AtomicU64,
    pub connection_errors: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,

    // Histograms
    pub message_size: Histogram,
}

impl BrokerMetrics {
    pub const fn new() -> Self {
        Self {
            active_connections: AtomicU64::new(0),
            active_subscriptions: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            message_size: Histogram::new(),
        }
    }

    #[inline]
    pub fn set_active_connections(&self, n: u64) {
        self.active_connections.store(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_active_subscriptions(&self, n: u64) {
        self.active_subscriptions.store(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_total_connections(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_messages_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_messages_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_connection_errors(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_bytes_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn observe_message_size(&self, n: u64) {
        self.message_size.observe(n);
    }
}

impl Default for BrokerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
