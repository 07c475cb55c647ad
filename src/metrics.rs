//! Flush counters and the periodic summary log.
//!
//! Counters are plain atomics so recording never blocks a flush.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::flush::FlushMode;

// ---

#[derive(Debug, Default)]
struct Counters {
    live: AtomicU64,
    past: AtomicU64,
    failed_batches: AtomicU64,
    dead_lettered: AtomicU64,
    rejected_samples: AtomicU64,
    dropped_samples: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub live: u64,
    pub past: u64,
    pub failed_batches: u64,
    pub dead_lettered: u64,
    pub rejected_samples: u64,
    pub dropped_samples: u64,
}

/// Shared handle to the process-wide flush counters.
///
/// Keeps a period view (reset by each summary) and a lifetime view
/// (reported once at shutdown).
#[derive(Debug, Clone, Default)]
pub struct FlushMetrics {
    period: Arc<Counters>,
    total: Arc<Counters>,
}

impl FlushMetrics {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self, pick: impl Fn(&Counters) -> &AtomicU64, n: u64) {
        pick(&self.period).fetch_add(n, Ordering::Relaxed);
        pick(&self.total).fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_flush(&self, records: usize, mode: FlushMode) {
        // ---
        let n = records as u64;
        match mode {
            FlushMode::Live => self.bump(|c| &c.live, n),
            FlushMode::Past => self.bump(|c| &c.past, n),
        }
    }

    pub fn record_failed_batch(&self) {
        self.bump(|c| &c.failed_batches, 1);
    }

    pub fn record_dead_lettered(&self, buckets: usize) {
        self.bump(|c| &c.dead_lettered, buckets as u64);
    }

    pub fn record_rejected_sample(&self) {
        self.bump(|c| &c.rejected_samples, 1);
    }

    pub fn record_dropped_sample(&self) {
        self.bump(|c| &c.dropped_samples, 1);
    }

    /// Read and reset the period counters.
    pub fn take_period(&self) -> FlushSummary {
        // ---
        let c = &self.period;
        FlushSummary {
            live: c.live.swap(0, Ordering::Relaxed),
            past: c.past.swap(0, Ordering::Relaxed),
            failed_batches: c.failed_batches.swap(0, Ordering::Relaxed),
            dead_lettered: c.dead_lettered.swap(0, Ordering::Relaxed),
            rejected_samples: c.rejected_samples.swap(0, Ordering::Relaxed),
            dropped_samples: c.dropped_samples.swap(0, Ordering::Relaxed),
        }
    }

    pub fn totals(&self) -> FlushSummary {
        // ---
        let c = &self.total;
        FlushSummary {
            live: c.live.load(Ordering::Relaxed),
            past: c.past.load(Ordering::Relaxed),
            failed_batches: c.failed_batches.load(Ordering::Relaxed),
            dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
            rejected_samples: c.rejected_samples.load(Ordering::Relaxed),
            dropped_samples: c.dropped_samples.load(Ordering::Relaxed),
        }
    }

    pub fn log_period(&self) {
        // ---
        let s = self.take_period();
        tracing::info!(
            past = s.past,
            live = s.live,
            failed_batches = s.failed_batches,
            dead_lettered = s.dead_lettered,
            rejected_samples = s.rejected_samples,
            dropped_samples = s.dropped_samples,
            "Flushed summary in last period"
        );
    }

    pub fn log_final(&self) {
        // ---
        let s = self.totals();
        tracing::info!(
            past = s.past,
            live = s.live,
            failed_batches = s.failed_batches,
            dead_lettered = s.dead_lettered,
            rejected_samples = s.rejected_samples,
            dropped_samples = s.dropped_samples,
            "Final flushed totals"
        );
    }

    /// Spawn the summary reporter. Abort the handle to stop it.
    pub fn spawn_reporter(&self, period: Duration) -> JoinHandle<()> {
        // ---
        let metrics = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                tracing::debug!("Service heartbeat - running normally");
                metrics.log_period();
            }
        })
    }
}
