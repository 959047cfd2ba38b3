//! Pool sizing and supervision settings

use crate::worker::WorkerSettings;
use std::time::Duration;

/// How many workers a run gets
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerCountPolicy {
    pub max_parallelism: usize,
    /// Share of `max_parallelism` to use, in `(0, 1]`
    pub worker_fraction: f64,
}

impl WorkerCountPolicy {
    pub fn new(max_parallelism: usize, worker_fraction: f64) -> Self {
        Self {
            max_parallelism: max_parallelism.max(1),
            worker_fraction,
        }
    }

    /// Size the pool from the host's logical CPU count
    pub fn from_host(worker_fraction: f64) -> Self {
        Self::new(num_cpus::get(), worker_fraction)
    }

    /// `clamp(floor(max_parallelism * worker_fraction), 1, max_parallelism)`
    pub fn worker_count(&self) -> usize {
        let max = self.max_parallelism.max(1);
        let scaled = (max as f64 * self.worker_fraction).floor();
        if !scaled.is_finite() || scaled < 1.0 {
            return 1;
        }
        (scaled as usize).clamp(1, max)
    }
}

impl Default for WorkerCountPolicy {
    fn default() -> Self {
        Self::from_host(0.8)
    }
}

/// Everything the pool manager needs besides the key generator
#[derive(Debug, Clone, PartialEq)]
pub struct PoolSettings {
    pub worker_policy: WorkerCountPolicy,
    pub worker: WorkerSettings,
    /// A running worker silent for longer than this is restarted
    pub heartbeat_timeout: Duration,
    pub health_check_interval: Duration,
    pub metrics_interval: Duration,
    /// Worker metrics older than this are left out of pool metrics
    pub metrics_staleness: Duration,
    /// Delay between stopping a failed instance and spawning its replacement
    pub restart_backoff: Duration,
    /// `Error` messages from one instance that trigger a restart
    pub error_restart_threshold: u32,
    /// Restarts allowed per slot within `restart_window`
    pub max_restarts: u32,
    pub restart_window: Duration,
    /// Upper bound on joining worker threads at shutdown
    pub shutdown_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            worker_policy: WorkerCountPolicy::default(),
            worker: WorkerSettings::default(),
            heartbeat_timeout: Duration::from_secs(35),
            health_check_interval: Duration::from_secs(5),
            metrics_interval: Duration::from_secs(1),
            metrics_staleness: Duration::from_secs(2),
            restart_backoff: Duration::from_millis(250),
            error_restart_threshold: 3,
            max_restarts: 5,
            restart_window: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}
