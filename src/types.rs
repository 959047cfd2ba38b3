//! Core types shared by the workers, the pool manager and its consumers

use crate::crypto::SecretBuffer;
use crate::matcher::PatternType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Lowest accepted CPU usage, in percent
pub const MIN_CPU_USAGE_PERCENT: u8 = 10;

/// Highest accepted CPU usage, in percent
pub const MAX_CPU_USAGE_PERCENT: u8 = 100;

/// Everything one worker instance needs to search. Immutable for the lifetime
/// of an instance; a restart reuses it verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Canonicalized pattern
    pub pattern: String,
    pub pattern_type: PatternType,
    /// Share of each scheduling window spent searching, in `[0.1, 1.0]`
    pub cpu_usage_fraction: f64,
    pub worker_id: usize,
}

impl WorkerConfig {
    pub fn new(pattern: String, pattern_type: PatternType, cpu_usage_percent: u8) -> Self {
        Self {
            pattern,
            pattern_type,
            cpu_usage_fraction: cpu_fraction(cpu_usage_percent),
            worker_id: 0,
        }
    }

    /// Copy of this config bound to `worker_id`
    pub fn for_worker(&self, worker_id: usize) -> Self {
        Self {
            worker_id,
            ..self.clone()
        }
    }

    pub fn cpu_usage_percent(&self) -> u8 {
        (self.cpu_usage_fraction * 100.0).round() as u8
    }
}

/// Convert a CPU percentage to a window fraction, clamped to `[0.1, 1.0]`
pub fn cpu_fraction(cpu_usage_percent: u8) -> f64 {
    f64::from(cpu_usage_percent.clamp(MIN_CPU_USAGE_PERCENT, MAX_CPU_USAGE_PERCENT)) / 100.0
}

/// Lifecycle status of a supervised worker slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Running,
    Paused,
    /// Waiting for a restart, or given up on after a restart storm
    Error,
    Terminated,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerStatus::Running => "running",
            WorkerStatus::Paused => "paused",
            WorkerStatus::Error => "error",
            WorkerStatus::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// One throughput sample from a [`PerformanceMonitor`](crate::monitor::PerformanceMonitor)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Cumulative attempts of the sampled instance
    pub attempts: u64,
    /// Attempts per second since the previous sample
    pub instant_speed: f64,
    /// Mean of the most recent samples
    pub rolling_average_speed: f64,
    /// Suggested number of attempts per batch
    pub batch_size_hint: u64,
    pub timestamp: DateTime<Utc>,
}

/// Manager-side record of a worker slot
#[derive(Debug, Clone)]
pub struct WorkerState {
    pub id: usize,
    pub status: WorkerStatus,
    pub last_heartbeat: Instant,
    /// `Error` reports since the last counted restart, across instances
    pub consecutive_errors: u32,
    pub metrics: Option<Metrics>,
    /// When `metrics` was received, for staleness checks
    pub metrics_received_at: Option<Instant>,
    /// Epoch of the thread currently serving this slot
    pub instance: u64,
    pub restarts: u32,
}

impl WorkerState {
    pub fn new(id: usize, instance: u64) -> Self {
        Self {
            id,
            status: WorkerStatus::Running,
            last_heartbeat: Instant::now(),
            consecutive_errors: 0,
            metrics: None,
            metrics_received_at: None,
            instance,
            restarts: 0,
        }
    }

    /// Metrics if they were received within `staleness` of `now`
    pub fn fresh_metrics(&self, now: Instant, staleness: std::time::Duration) -> Option<&Metrics> {
        match (self.metrics.as_ref(), self.metrics_received_at) {
            (Some(metrics), Some(at)) if now.saturating_duration_since(at) <= staleness => {
                Some(metrics)
            }
            _ => None,
        }
    }
}

/// Read-only copy of a [`WorkerState`] handed to callers
pub type WorkerSnapshot = WorkerState;

/// A matching keypair. Dropping it wipes the private key.
#[derive(Debug)]
pub struct GenerationResult {
    pub public_id: String,
    pub private_key: SecretBuffer,
    /// Attempts made by the winning instance
    pub attempts: u64,
    pub worker_id: usize,
}

/// Pool-wide throughput summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolMetrics {
    /// Attempts of the run so far, including replaced instances
    pub total_attempts: u64,
    /// Sum of fresh per-worker instant speeds
    pub average_speed: f64,
    /// Rolling mean of pool-wide speed samples
    pub rolling_speed: f64,
    pub active_workers: usize,
    pub total_workers: usize,
    pub timestamp: DateTime<Utc>,
}
