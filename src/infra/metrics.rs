//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics so the alert worker and the control loop can record without
//! locking. Reporting swaps the periodic counters to get a snapshot.
//!
//! NOTE: All atomics use Relaxed ordering intentionally—these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Exponential bucket boundaries for tick processing time (microseconds)
/// Buckets: ≤50, ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, >6400
const BUCKET_BOUNDS: [u64; 8] = [50, 100, 200, 400, 800, 1600, 3200, 6400];
pub const METRICS_NUM_BUCKETS: usize = 9;

/// Upper bounds used when reporting percentiles (last bucket uses 2x)
const BUCKET_UPPER_BOUNDS: [u64; METRICS_NUM_BUCKETS] =
    [50, 100, 200, 400, 800, 1600, 3200, 6400, 12800];

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; METRICS_NUM_BUCKETS]) -> [u64; METRICS_NUM_BUCKETS] {
    let mut result = [0u64; METRICS_NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; METRICS_NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[METRICS_NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Control loop ticks since last report (reset on report)
    ticks_since_report: AtomicU64,
    /// Sum of tick processing time (reset on report)
    tick_sum_us: AtomicU64,
    /// Max tick processing time (reset on report)
    tick_max_us: AtomicU64,
    /// Tick processing histogram (reset on report)
    tick_buckets: [AtomicU64; METRICS_NUM_BUCKETS],
    /// Detection cycles started (monotonic)
    cycles_total: AtomicU64,
    /// Verdicts that opened the gate (monotonic)
    grants_total: AtomicU64,
    /// Denied verdicts (monotonic)
    denials_total: AtomicU64,
    /// Inconclusive recognition verdicts (monotonic)
    recognition_errors_total: AtomicU64,
    /// Cycles ending in ERROR (monotonic)
    cycle_errors_total: AtomicU64,
    /// Verdicts resolved from the local plate list (monotonic)
    local_fallbacks_total: AtomicU64,
    /// Serial frame retransmissions (monotonic)
    link_retries_total: AtomicU64,
    /// Corrupt frames received (monotonic)
    link_corrupt_total: AtomicU64,
    /// Arrivals flagged while a cycle or open window was active (monotonic)
    tailgates_total: AtomicU64,
    /// Alerts delivered by the SMS gateway (monotonic)
    alerts_sent_total: AtomicU64,
    /// Alerts that exhausted their attempts (monotonic)
    alerts_failed_total: AtomicU64,
    /// Alerts dropped because the queue was full (monotonic)
    alerts_dropped_total: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            ticks_since_report: AtomicU64::new(0),
            tick_sum_us: AtomicU64::new(0),
            tick_max_us: AtomicU64::new(0),
            tick_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            cycles_total: AtomicU64::new(0),
            grants_total: AtomicU64::new(0),
            denials_total: AtomicU64::new(0),
            recognition_errors_total: AtomicU64::new(0),
            cycle_errors_total: AtomicU64::new(0),
            local_fallbacks_total: AtomicU64::new(0),
            link_retries_total: AtomicU64::new(0),
            link_corrupt_total: AtomicU64::new(0),
            tailgates_total: AtomicU64::new(0),
            alerts_sent_total: AtomicU64::new(0),
            alerts_failed_total: AtomicU64::new(0),
            alerts_dropped_total: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record one control loop tick and how long it took
    #[inline]
    pub fn record_tick(&self, latency_us: u64) {
        self.ticks_since_report.fetch_add(1, Ordering::Relaxed);
        self.tick_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.tick_buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.tick_max_us, latency_us);
    }

    #[inline]
    pub fn record_cycle_started(&self) {
        self.cycles_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_grant(&self) {
        self.grants_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_denial(&self) {
        self.denials_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_recognition_error(&self) {
        self.recognition_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cycle_error(&self) {
        self.cycle_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_local_fallback(&self) {
        self.local_fallbacks_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_link_retry(&self) {
        self.link_retries_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_link_corrupt(&self) {
        self.link_corrupt_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_tailgate(&self) {
        self.tailgates_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_alert_sent(&self) {
        self.alerts_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_alert_failed(&self) {
        self.alerts_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_alert_dropped(&self) {
        self.alerts_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cycles_total(&self) -> u64 {
        self.cycles_total.load(Ordering::Relaxed)
    }

    pub fn grants_total(&self) -> u64 {
        self.grants_total.load(Ordering::Relaxed)
    }

    pub fn denials_total(&self) -> u64 {
        self.denials_total.load(Ordering::Relaxed)
    }

    pub fn local_fallbacks_total(&self) -> u64 {
        self.local_fallbacks_total.load(Ordering::Relaxed)
    }

    pub fn tailgates_total(&self) -> u64 {
        self.tailgates_total.load(Ordering::Relaxed)
    }

    pub fn alerts_sent_total(&self) -> u64 {
        self.alerts_sent_total.load(Ordering::Relaxed)
    }

    pub fn alerts_failed_total(&self) -> u64 {
        self.alerts_failed_total.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    pub fn report(&self) -> MetricsSummary {
        let ticks = self.ticks_since_report.swap(0, Ordering::Relaxed);
        let tick_sum = self.tick_sum_us.swap(0, Ordering::Relaxed);
        let tick_max = self.tick_max_us.swap(0, Ordering::Relaxed);
        let tick_buckets = swap_buckets(&self.tick_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let ticks_per_sec = if elapsed.as_secs_f64() > 0.0 {
            ticks as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        MetricsSummary {
            ticks_per_sec,
            tick_avg_us: if ticks > 0 { tick_sum / ticks } else { 0 },
            tick_max_us: tick_max,
            tick_p99_us: percentile_from_buckets(&tick_buckets, 0.99),
            tick_buckets,
            cycles_total: self.cycles_total.load(Ordering::Relaxed),
            grants_total: self.grants_total.load(Ordering::Relaxed),
            denials_total: self.denials_total.load(Ordering::Relaxed),
            recognition_errors_total: self.recognition_errors_total.load(Ordering::Relaxed),
            cycle_errors_total: self.cycle_errors_total.load(Ordering::Relaxed),
            local_fallbacks_total: self.local_fallbacks_total.load(Ordering::Relaxed),
            link_retries_total: self.link_retries_total.load(Ordering::Relaxed),
            link_corrupt_total: self.link_corrupt_total.load(Ordering::Relaxed),
            tailgates_total: self.tailgates_total.load(Ordering::Relaxed),
            alerts_sent_total: self.alerts_sent_total.load(Ordering::Relaxed),
            alerts_failed_total: self.alerts_failed_total.load(Ordering::Relaxed),
            alerts_dropped_total: self.alerts_dropped_total.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct MetricsSummary {
    pub ticks_per_sec: f64,
    pub tick_avg_us: u64,
    pub tick_max_us: u64,
    pub tick_p99_us: u64,
    /// Bounds: ≤50, ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, >6400 µs
    pub tick_buckets: [u64; METRICS_NUM_BUCKETS],
    pub cycles_total: u64,
    pub grants_total: u64,
    pub denials_total: u64,
    pub recognition_errors_total: u64,
    pub cycle_errors_total: u64,
    pub local_fallbacks_total: u64,
    pub link_retries_total: u64,
    pub link_corrupt_total: u64,
    pub tailgates_total: u64,
    pub alerts_sent_total: u64,
    pub alerts_failed_total: u64,
    pub alerts_dropped_total: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            ticks_per_sec = format!("{:.1}", self.ticks_per_sec),
            tick_avg_us = %self.tick_avg_us,
            tick_max_us = %self.tick_max_us,
            tick_p99_us = %self.tick_p99_us,
            cycles = %self.cycles_total,
            grants = %self.grants_total,
            denials = %self.denials_total,
            recognition_errors = %self.recognition_errors_total,
            cycle_errors = %self.cycle_errors_total,
            local_fallbacks = %self.local_fallbacks_total,
            link_retries = %self.link_retries_total,
            link_corrupt = %self.link_corrupt_total,
            tailgates = %self.tailgates_total,
            alerts_sent = %self.alerts_sent_total,
            alerts_failed = %self.alerts_failed_total,
            alerts_dropped = %self.alerts_dropped_total,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.cycles_total(), 0);
        assert_eq!(metrics.grants_total(), 0);
    }

    #[test]
    fn test_report_resets_tick_counters() {
        let metrics = Metrics::new();

        metrics.record_tick(40);
        metrics.record_tick(90);
        metrics.record_tick(170);
        metrics.record_cycle_started();
        metrics.record_grant();

        let summary = metrics.report();

        assert_eq!(summary.tick_avg_us, 100);
        assert_eq!(summary.tick_max_us, 170);
        assert_eq!(summary.cycles_total, 1);
        assert_eq!(summary.grants_total, 1);

        assert_eq!(metrics.ticks_since_report.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.tick_sum_us.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.tick_max_us.load(Ordering::Relaxed), 0);

        // Monotonic counters survive the report
        assert_eq!(metrics.cycles_total(), 1);
    }

    #[test]
    fn test_report_empty() {
        let metrics = Metrics::new();
        let summary = metrics.report();

        assert_eq!(summary.tick_avg_us, 0);
        assert_eq!(summary.tick_max_us, 0);
        assert_eq!(summary.tick_p99_us, 0);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(50), 0);
        assert_eq!(bucket_index(51), 1);
        assert_eq!(bucket_index(6400), 7);
        assert_eq!(bucket_index(6401), 8);
    }

    #[test]
    fn test_percentile_computation() {
        let metrics = Metrics::new();
        for _ in 0..100 {
            metrics.record_tick(150);
        }

        let summary = metrics.report();
        assert_eq!(summary.tick_p99_us, 200);
        assert_eq!(summary.tick_buckets[2], 100);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let metrics = Arc::new(Metrics::new());
        let mut handles = vec![];

        for _ in 0..8 {
            let m = metrics.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..500 {
                    m.record_alert_sent();
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.alerts_sent_total(), 4000);
    }
}
