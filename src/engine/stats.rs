// Live statistics aggregation — task outcomes, cache hit rates, streamed bytes, worker counts.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

struct StatsSample {
    at: Instant,
    streamed_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub cancelled: u64,
    pub queued: usize,
    pub active_workers: u32,
    pub stream_bps: u64,
    pub cache_hit_rate: f64,
}

pub struct StatsCollector {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    cancelled: AtomicU64,
    active_workers: AtomicU32,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    streamed_bytes_total: AtomicU64,
    last_sample: Mutex<StatsSample>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            active_workers: AtomicU32::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            streamed_bytes_total: AtomicU64::new(0),
            last_sample: Mutex::new(StatsSample {
                at: Instant::now(),
                streamed_bytes: 0,
            }),
        }
    }

    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Bytes handed to a stream consumer, from the network or from cache.
    pub fn record_streamed(&self, bytes: u64) {
        self.streamed_bytes_total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn increment_workers(&self) {
        self.active_workers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_workers(&self) {
        self.active_workers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, queued: usize) -> StatsSnapshot {
        let now = Instant::now();
        let current_streamed = self.streamed_bytes_total.load(Ordering::Relaxed);

        let stream_bps = {
            let mut sample = self.last_sample.lock();
            let elapsed = now.duration_since(sample.at).as_secs_f64();
            let bps = if elapsed > 0.1 {
                ((current_streamed - sample.streamed_bytes) as f64 / elapsed) as u64
            } else {
                0
            };

            // Update sample for next call
            sample.at = now;
            sample.streamed_bytes = current_streamed;
            bps
        };

        let hits = self.cache_hits.load(Ordering::Relaxed);
        let lookups = hits + self.cache_misses.load(Ordering::Relaxed);
        let cache_hit_rate = if lookups > 0 {
            hits as f64 / lookups as f64
        } else {
            0.0
        };

        StatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            queued,
            active_workers: self.active_workers.load(Ordering::Relaxed),
            stream_bps,
            cache_hit_rate,
        }
    }

    pub fn total_streamed(&self) -> u64 {
        self.streamed_bytes_total.load(Ordering::Relaxed)
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_basic() {
        let stats = StatsCollector::new();
        stats.record_streamed(1000);
        stats.record_streamed(500);
        assert_eq!(stats.total_streamed(), 1500);

        stats.record_submitted();
        stats.record_submitted();
        stats.record_completed();
        stats.record_cancelled();

        stats.record_cache_hit();
        stats.record_cache_miss();
        stats.record_cache_miss();
        stats.record_cache_miss();

        stats.increment_workers();
        stats.increment_workers();
        stats.decrement_workers();

        let snap = stats.snapshot(3);
        assert_eq!(snap.submitted, 2);
        assert_eq!(snap.completed, 1);
        assert_eq!(snap.cancelled, 1);
        assert_eq!(snap.queued, 3);
        assert_eq!(snap.active_workers, 1);
        assert!((snap.cache_hit_rate - 0.25).abs() < f64::EPSILON);
    }
}
