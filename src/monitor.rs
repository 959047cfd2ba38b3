//! Rolling throughput tracking
//!
//! A [`PerformanceMonitor`] turns a cumulative attempt counter into speed
//! samples, keeps the most recent ones in a ring buffer and derives a batch
//! size from them. Workers run one each; the pool manager runs one over the
//! pool-wide total.

use crate::types::Metrics;
use chrono::Utc;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::trace;

/// Updates closer together than this are ignored
pub const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Sizing and batching parameters for a monitor
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// Ring buffer capacity
    pub capacity: usize,
    /// How many of the newest samples the rolling average covers
    pub rolling_window: usize,
    pub min_interval: Duration,
    /// Accepted updates between full resets
    pub reset_every: u64,
    /// Scheduling window the batch hint is sized for
    pub window: Duration,
    pub cpu_fraction: f64,
    pub min_batch: u64,
    pub max_batch: u64,
}

impl MonitorConfig {
    /// Settings for a single worker's monitor
    pub fn worker_scope(window: Duration, cpu_fraction: f64, min_batch: u64, max_batch: u64) -> Self {
        Self {
            capacity: 5,
            rolling_window: 3,
            min_interval: MIN_SAMPLE_INTERVAL,
            reset_every: 500,
            window,
            cpu_fraction,
            min_batch,
            max_batch: max_batch.max(min_batch),
        }
    }

    /// Settings for the pool-wide monitor
    pub fn pool_scope() -> Self {
        Self {
            capacity: 10,
            rolling_window: 10,
            min_interval: MIN_SAMPLE_INTERVAL,
            reset_every: 500,
            window: Duration::from_millis(50),
            cpu_fraction: 1.0,
            min_batch: 1,
            max_batch: u64::MAX,
        }
    }
}

/// Rolling-window throughput tracker and batch-size advisor
#[derive(Debug, Clone)]
pub struct PerformanceMonitor {
    config: MonitorConfig,
    samples: VecDeque<f64>,
    last_attempts: u64,
    last_update: Instant,
    updates: u64,
}

impl PerformanceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self::starting_at(config, Instant::now())
    }

    /// Create a monitor whose first interval starts at `now`
    pub fn starting_at(config: MonitorConfig, now: Instant) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            config: MonitorConfig { capacity, ..config },
            samples: VecDeque::with_capacity(capacity),
            last_attempts: 0,
            last_update: now,
            updates: 0,
        }
    }

    /// Record the cumulative attempt count. Returns a sample, or `None` when
    /// called again too soon.
    pub fn update_metrics(&mut self, total_attempts: u64) -> Option<Metrics> {
        self.update_metrics_at(total_attempts, Instant::now())
    }

    pub fn update_metrics_at(&mut self, total_attempts: u64, now: Instant) -> Option<Metrics> {
        let elapsed = now.saturating_duration_since(self.last_update);
        if elapsed < self.config.min_interval || elapsed.is_zero() {
            return None;
        }

        let delta = total_attempts.saturating_sub(self.last_attempts);
        let instant_speed = delta as f64 / elapsed.as_secs_f64();

        if self.samples.len() == self.config.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(instant_speed);

        self.last_attempts = total_attempts;
        self.last_update = now;
        self.updates += 1;

        let rolling_average_speed = self.rolling_average();
        let metrics = Metrics {
            attempts: total_attempts,
            instant_speed,
            rolling_average_speed,
            batch_size_hint: self.hint_for(rolling_average_speed),
            timestamp: Utc::now(),
        };

        if self.updates >= self.config.reset_every {
            self.reset();
        }

        Some(metrics)
    }

    /// Mean of the newest `rolling_window` samples, zero when empty
    pub fn rolling_average(&self) -> f64 {
        let take = self.config.rolling_window.min(self.samples.len());
        if take == 0 {
            return 0.0;
        }
        self.samples.iter().rev().take(take).sum::<f64>() / take as f64
    }

    /// Attempts that fit the work part of one window at the current speed
    pub fn batch_size_hint(&self) -> u64 {
        self.hint_for(self.rolling_average())
    }

    fn hint_for(&self, speed: f64) -> u64 {
        let raw = speed * self.config.window.as_secs_f64() * self.config.cpu_fraction;
        if !raw.is_finite() || raw <= 0.0 {
            return self.config.min_batch;
        }
        (raw as u64).clamp(self.config.min_batch, self.config.max_batch)
    }

    /// Drop samples and counters. The last reference point survives so the
    /// next delta is still measured from it.
    pub fn reset(&mut self) {
        trace!(updates = self.updates, "resetting performance monitor");
        self.samples.clear();
        self.updates = 0;
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn update_count(&self) -> u64 {
        self.updates
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn worker_monitor(start: Instant) -> PerformanceMonitor {
        PerformanceMonitor::starting_at(
            MonitorConfig::worker_scope(Duration::from_millis(50), 0.5, 16, 4096),
            start,
        )
    }

    #[test]
    fn test_updates_too_soon_are_ignored() {
        let start = Instant::now();
        let mut monitor = worker_monitor(start);

        assert!(monitor
            .update_metrics_at(100, start + Duration::from_millis(499))
            .is_none());
        assert_eq!(monitor.sample_count(), 0);

        let metrics = monitor
            .update_metrics_at(100, start + Duration::from_millis(500))
            .unwrap();
        assert_eq!(metrics.instant_speed, 200.0);
        assert_eq!(metrics.attempts, 100);
    }

    #[test]
    fn test_rolling_average_covers_newest_three() {
        let start = Instant::now();
        let mut monitor = worker_monitor(start);
        let second = Duration::from_secs(1);

        // speeds: 100, 200, 300, 400
        let mut total = 0;
        for (i, speed) in [100u64, 200, 300, 400].iter().enumerate() {
            total += speed;
            monitor.update_metrics_at(total, start + second * (i as u32 + 1));
        }

        assert_eq!(monitor.sample_count(), 4);
        assert_eq!(monitor.rolling_average(), 300.0);
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let start = Instant::now();
        let mut monitor = worker_monitor(start);

        for i in 1..=8u32 {
            monitor.update_metrics_at(u64::from(i) * 10, start + Duration::from_secs(u64::from(i)));
        }
        assert_eq!(monitor.sample_count(), 5);
    }

    #[test]
    fn test_batch_size_hint_is_clamped() {
        let start = Instant::now();
        let mut monitor = worker_monitor(start);
        assert_eq!(monitor.batch_size_hint(), 16);

        // 10_000/s * 0.05s * 0.5 = 250
        let metrics = monitor
            .update_metrics_at(10_000, start + Duration::from_secs(1))
            .unwrap();
        assert_eq!(metrics.batch_size_hint, 250);

        // enormous speed hits the ceiling
        monitor.update_metrics_at(10_000_000_000, start + Duration::from_secs(2));
        assert_eq!(monitor.batch_size_hint(), 4096);
    }

    #[test]
    fn test_reset_keeps_reference_point() {
        let start = Instant::now();
        let mut config = MonitorConfig::worker_scope(Duration::from_millis(50), 1.0, 1, 100);
        config.reset_every = 2;
        let mut monitor = PerformanceMonitor::starting_at(config, start);

        monitor.update_metrics_at(100, start + Duration::from_secs(1));
        monitor.update_metrics_at(200, start + Duration::from_secs(2));
        assert_eq!(monitor.sample_count(), 0);
        assert_eq!(monitor.update_count(), 0);

        let metrics = monitor
            .update_metrics_at(250, start + Duration::from_secs(3))
            .unwrap();
        assert_eq!(metrics.instant_speed, 50.0);
    }

    #[test]
    fn test_counter_going_backwards_reads_as_zero() {
        let start = Instant::now();
        let mut monitor = PerformanceMonitor::starting_at(MonitorConfig::pool_scope(), start);

        monitor.update_metrics_at(1_000, start + Duration::from_secs(1));
        let metrics = monitor
            .update_metrics_at(10, start + Duration::from_secs(2))
            .unwrap();
        assert_eq!(metrics.instant_speed, 0.0);
    }

    proptest! {
        #[test]
        fn prop_ring_never_exceeds_capacity(steps in proptest::collection::vec(0u64..1_000_000, 1..60)) {
            let start = Instant::now();
            let mut monitor = worker_monitor(start);
            let mut total = 0u64;
            for (i, step) in steps.iter().enumerate() {
                total += step;
                monitor.update_metrics_at(total, start + Duration::from_millis(600 * (i as u64 + 1)));
                prop_assert!(monitor.sample_count() <= 5);
                let hint = monitor.batch_size_hint();
                prop_assert!((16..=4096).contains(&hint));
            }
        }
    }
}
