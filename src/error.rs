//! Error handling for the vanity worker pool
//!
//! One error type covers configuration, pool lifecycle, worker supervision and
//! key material handling. Worker-local variants never escape the pool: they are
//! logged and healed by a restart.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for vanity pool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the vanity pool
#[derive(Error, Debug)]
pub enum Error {
    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors (including failure to spawn a worker thread)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Invalid start parameters, rejected before any worker is spawned
    #[error("Pool startup rejected: {message}")]
    PoolStartup { message: String },

    /// Pattern validation errors
    #[error("Invalid pattern: {message}")]
    InvalidPattern { message: String },

    /// A single generation attempt failed
    #[error("Transient generation failure: {message}")]
    TransientGeneration { message: String },

    /// A worker gave up after too many consecutive failures
    #[error("Worker {worker_id} failed: {message}")]
    WorkerFatal { worker_id: usize, message: String },

    /// A worker stopped sending messages
    #[error("Worker {worker_id} silent for {}", format_silence(.silent_for))]
    HeartbeatTimeout { worker_id: usize, silent_for: Duration },

    /// A worker kept dying faster than the restart budget allows
    #[error("Worker {worker_id} exceeded the restart budget ({restarts} restarts)")]
    RestartStorm { worker_id: usize, restarts: u32 },

    /// Key material errors
    #[error("Cryptographic error: {message}")]
    Crypto { message: String },

    /// A peer hung up on a channel
    #[error("Channel closed: {channel}")]
    ChannelClosed { channel: String },
}

fn format_silence(silent_for: &Duration) -> humantime::FormattedDuration {
    humantime::format_duration(*silent_for)
}

impl Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a pool startup error
    pub fn pool_startup(message: impl Into<String>) -> Self {
        Self::PoolStartup {
            message: message.into(),
        }
    }

    /// Create an invalid pattern error
    pub fn invalid_pattern(message: impl Into<String>) -> Self {
        Self::InvalidPattern {
            message: message.into(),
        }
    }

    /// Create a transient generation error
    pub fn transient_generation(message: impl Into<String>) -> Self {
        Self::TransientGeneration {
            message: message.into(),
        }
    }

    /// Create a worker fatal error
    pub fn worker_fatal(worker_id: usize, message: impl Into<String>) -> Self {
        Self::WorkerFatal {
            worker_id,
            message: message.into(),
        }
    }

    /// Create a heartbeat timeout error
    pub fn heartbeat_timeout(worker_id: usize, silent_for: Duration) -> Self {
        Self::HeartbeatTimeout {
            worker_id,
            silent_for,
        }
    }

    /// Create a restart storm error
    pub fn restart_storm(worker_id: usize, restarts: u32) -> Self {
        Self::RestartStorm {
            worker_id,
            restarts,
        }
    }

    /// Create a crypto error
    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto {
            message: message.into(),
        }
    }

    /// Create a channel closed error
    pub fn channel_closed(channel: impl Into<String>) -> Self {
        Self::ChannelClosed {
            channel: channel.into(),
        }
    }

    /// Reclassify any failure raised while deriving a keypair as transient.
    pub fn into_transient(self) -> Self {
        match self {
            Error::TransientGeneration { .. } => self,
            other => Error::transient_generation(other.to_string()),
        }
    }

    /// Check if the pool heals this error on its own
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TransientGeneration { .. }
                | Error::WorkerFatal { .. }
                | Error::HeartbeatTimeout { .. }
        )
    }

    /// Get error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::Io(_) => "io",
            Error::Config { .. } => "config",
            Error::PoolStartup { .. } => "pool_startup",
            Error::InvalidPattern { .. } => "invalid_pattern",
            Error::TransientGeneration { .. } => "transient_generation",
            Error::WorkerFatal { .. } => "worker_fatal",
            Error::HeartbeatTimeout { .. } => "heartbeat_timeout",
            Error::RestartStorm { .. } => "restart_storm",
            Error::Crypto { .. } => "crypto",
            Error::ChannelClosed { .. } => "channel_closed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::pool_startup("pattern must not be empty");
        assert_eq!(
            err.to_string(),
            "Pool startup rejected: pattern must not be empty"
        );

        let err = Error::heartbeat_timeout(3, Duration::from_secs(36));
        assert_eq!(err.to_string(), "Worker 3 silent for 36s");
    }

    #[test]
    fn test_into_transient() {
        let err = Error::crypto("bad seed").into_transient();
        assert!(matches!(err, Error::TransientGeneration { .. }));
        assert!(err.to_string().contains("bad seed"));

        let err = Error::transient_generation("once").into_transient();
        assert_eq!(err.to_string(), "Transient generation failure: once");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::transient_generation("x").is_retryable());
        assert!(Error::worker_fatal(1, "x").is_retryable());
        assert!(!Error::pool_startup("x").is_retryable());
        assert!(!Error::restart_storm(1, 5).is_retryable());
    }

    #[test]
    fn test_category() {
        assert_eq!(Error::pool_startup("x").category(), "pool_startup");
        assert_eq!(Error::restart_storm(0, 1).category(), "restart_storm");
        let io_err: Error = std::io::Error::other("boom").into();
        assert_eq!(io_err.category(), "io");
    }
}
