//! `TrafficMonitor`: periodic accounting loop (spec.md §4.5).
//!
//! The source samples host-wide NIC counters, a deliberate approximation
//! documented in spec.md §4.5/§9. This implementation takes the
//! alternative the design notes explicitly permit: per-flow atomic counters
//! aggregated across `Relay`s (`TrafficCounters`), sampled once a second by
//! `TrafficMonitor` to produce the rate/total triple the UI reads. The
//! public contract — instantaneous rates plus a cumulative total, observed
//! as one coherent sample — is the same either way.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};

/// Cumulative byte counters shared by every `Relay` belonging to a tunnel.
/// Cheap to clone — internally an `Arc`.
#[derive(Clone, Default)]
pub struct TrafficCounters {
    tx_total: Arc<AtomicU64>,
    rx_total: Arc<AtomicU64>,
}

impl TrafficCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tx(&self, bytes: u64) {
        self.tx_total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_rx(&self, bytes: u64) {
        self.rx_total.fetch_add(bytes, Ordering::Relaxed);
    }

    /// `(tx_total, rx_total, tx_total + rx_total)`.
    pub fn totals(&self) -> (u64, u64, u64) {
        let tx = self.tx_total.load(Ordering::Relaxed);
        let rx = self.rx_total.load(Ordering::Relaxed);
        (tx, rx, tx + rx)
    }
}

/// One coherent sample: readers never see a torn mix of these three fields
/// (spec.md §3), since the monitor replaces the whole struct atomically
/// under a single lock on every tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSample {
    pub rx_rate_bps: u64,
    pub tx_rate_bps: u64,
    pub total_bytes: u64,
}

impl TrafficSample {
    /// Format a byte count as `B / KB / MB / GB / TB`, base 1024, one
    /// fractional digit — the dashboard's human-readable view (spec.md §4.5).
    pub fn format_human(bytes: u64) -> String {
        const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
        let mut value = bytes as f64;
        let mut unit = UNITS[0];

        for candidate in &UNITS[1..] {
            if value < 1024.0 {
                break;
            }
            value /= 1024.0;
            unit = candidate;
        }

        format!("{:.1} {}", value, unit)
    }
}

const SAMPLE_PERIOD: Duration = Duration::from_secs(1);

/// One background sampler per active tunnel.
pub struct TrafficMonitor {
    sample: Arc<RwLock<TrafficSample>>,
    task: Option<JoinHandle<()>>,
}

impl TrafficMonitor {
    /// Start sampling `counters` every second. The delta over each tick is
    /// the instantaneous rate; `total_bytes` accumulates the sum of those
    /// deltas (equal to the counters' running total, since nothing else
    /// resets them).
    pub fn start(counters: TrafficCounters) -> Self {
        let sample = Arc::new(RwLock::new(TrafficSample::default()));
        let sample_writer = sample.clone();

        let task = tokio::spawn(async move {
            let mut ticker = interval(SAMPLE_PERIOD);
            let (mut last_tx, mut last_rx, _) = counters.totals();

            loop {
                ticker.tick().await;

                let (tx, rx, total) = counters.totals();
                let tx_rate = tx.saturating_sub(last_tx);
                let rx_rate = rx.saturating_sub(last_rx);
                last_tx = tx;
                last_rx = rx;

                let mut guard = sample_writer.write().await;
                *guard = TrafficSample {
                    rx_rate_bps: rx_rate,
                    tx_rate_bps: tx_rate,
                    total_bytes: total,
                };
            }
        });

        Self {
            sample,
            task: Some(task),
        }
    }

    pub async fn sample(&self) -> TrafficSample {
        *self.sample.read().await
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for TrafficMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
