//! Messages exchanged between the pool manager and worker threads

use crate::crypto::SecretBuffer;
use crate::matcher::PatternType;
use chrono::{DateTime, Utc};

/// Manager to worker
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerCommand {
    /// Begin searching. Sent exactly once, right after spawn.
    Start {
        pattern: String,
        pattern_type: PatternType,
        worker_id: usize,
        cpu_usage_percent: u8,
    },
    /// Stop at the next window boundary
    Stop,
}

/// Worker to manager
#[derive(Debug)]
pub enum WorkerMessage {
    Heartbeat {
        timestamp: DateTime<Utc>,
    },
    Progress {
        attempts: u64,
        speed: f64,
        average_speed: f64,
        batch_size: u64,
        timestamp: DateTime<Utc>,
    },
    /// The private key travels by move; whoever drops it wipes it
    Success {
        public_id: String,
        private_key: SecretBuffer,
        attempts: u64,
    },
    Warning {
        reason: String,
    },
    Error {
        message: String,
    },
    /// Last message of every instance
    Terminating {
        timestamp: DateTime<Utc>,
    },
}

impl WorkerMessage {
    pub fn heartbeat() -> Self {
        WorkerMessage::Heartbeat {
            timestamp: Utc::now(),
        }
    }

    pub fn terminating() -> Self {
        WorkerMessage::Terminating {
            timestamp: Utc::now(),
        }
    }

    /// Message name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerMessage::Heartbeat { .. } => "heartbeat",
            WorkerMessage::Progress { .. } => "progress",
            WorkerMessage::Success { .. } => "success",
            WorkerMessage::Warning { .. } => "warning",
            WorkerMessage::Error { .. } => "error",
            WorkerMessage::Terminating { .. } => "terminating",
        }
    }
}

/// A [`WorkerMessage`] tagged with the slot and instance that sent it
#[derive(Debug)]
pub struct WorkerEnvelope {
    pub worker_id: usize,
    pub instance: u64,
    pub message: WorkerMessage,
}
