use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Optional scheduler counters, enabled with the `metrics` feature.
#[derive(Debug)]
pub struct Metrics {
    /// Jobs accepted by `kick` / `kick_io`.
    pub jobs_kicked: AtomicU64,
    /// Jobs rejected because their queue was full.
    pub jobs_rejected: AtomicU64,
    /// Jobs whose entry point returned (or panicked).
    pub jobs_completed: AtomicU64,
    /// Times a fiber parked on a counter.
    pub fibers_parked: AtomicU64,
    /// Times a parked fiber was resumed.
    pub fibers_resumed: AtomicU64,
    /// Jobs set aside because their fiber pool was empty.
    pub pool_stalls: AtomicU64,
    /// Time when metrics collection started.
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            jobs_kicked: AtomicU64::new(0),
            jobs_rejected: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            fibers_parked: AtomicU64::new(0),
            fibers_resumed: AtomicU64::new(0),
            pool_stalls: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Returns a snapshot of current metrics values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_kicked: self.jobs_kicked.load(Ordering::Relaxed),
            jobs_rejected: self.jobs_rejected.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            fibers_parked: self.fibers_parked.load(Ordering::Relaxed),
            fibers_resumed: self.fibers_resumed.load(Ordering::Relaxed),
            pool_stalls: self.pool_stalls.load(Ordering::Relaxed),
            elapsed_seconds: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub jobs_kicked: u64,
    pub jobs_rejected: u64,
    pub jobs_completed: u64,
    pub fibers_parked: u64,
    pub fibers_resumed: u64,
    pub pool_stalls: u64,
    pub elapsed_seconds: f64,
}

impl MetricsSnapshot {
    /// Calculates jobs per second throughput.
    pub fn jobs_per_second(&self) -> f64 {
        if self.elapsed_seconds > 0.0 {
            self.jobs_completed as f64 / self.elapsed_seconds
        } else {
            0.0
        }
    }

    /// Jobs accepted but not yet completed.
    pub fn jobs_outstanding(&self) -> u64 {
        self.jobs_kicked.saturating_sub(self.jobs_completed)
    }

    /// Parks not yet matched by a resume.
    pub fn fibers_waiting(&self) -> u64 {
        self.fibers_parked.saturating_sub(self.fibers_resumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.jobs_kicked, 0);
        assert_eq!(snapshot.jobs_completed, 0);
        assert_eq!(snapshot.fibers_parked, 0);
        assert_eq!(snapshot.pool_stalls, 0);
        assert!(snapshot.elapsed_seconds >= 0.0);
    }

    #[test]
    fn test_metrics_updates() {
        let metrics = Metrics::new();

        metrics.jobs_kicked.fetch_add(10, Ordering::Relaxed);
        metrics.jobs_completed.fetch_add(8, Ordering::Relaxed);
        metrics.fibers_parked.fetch_add(3, Ordering::Relaxed);
        metrics.fibers_resumed.fetch_add(1, Ordering::Relaxed);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.jobs_outstanding(), 2);
        assert_eq!(snapshot.fibers_waiting(), 2);
    }

    #[test]
    fn test_throughput_calculation() {
        let metrics = Metrics::new();
        metrics.jobs_completed.fetch_add(100, Ordering::Relaxed);

        thread::sleep(Duration::from_millis(10));
        let snapshot = metrics.snapshot();

        assert!(snapshot.jobs_per_second() > 0.0);
    }
}
