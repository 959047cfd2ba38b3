//! Worker pool
//!
//! [`WorkerPool`] is a cheap, cloneable handle. Every call is turned into a
//! command for the manager task, which owns the workers and answers over a
//! oneshot channel. Results and metrics come back on the event receiver
//! returned by [`WorkerPool::new`].

mod manager;
pub mod settings;

pub use settings::{PoolSettings, WorkerCountPolicy};

use crate::crypto::KeyGenerator;
use crate::matcher::{PatternMatcher, PatternType};
use crate::types::{
    GenerationResult, PoolMetrics, WorkerConfig, WorkerSnapshot, MAX_CPU_USAGE_PERCENT,
    MIN_CPU_USAGE_PERCENT,
};
use crate::{Error, Result};
use manager::PoolManager;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::Instrument;

/// Manager to consumer
#[derive(Debug)]
pub enum PoolEvent {
    Metrics(PoolMetrics),
    /// At most one per run
    Success(GenerationResult),
    /// A worker slot exhausted its restart budget and was abandoned
    WorkerFailed { worker_id: usize, reason: String },
}

#[derive(Debug)]
pub(crate) enum PoolCommand {
    Start {
        template: WorkerConfig,
        reply: oneshot::Sender<Result<usize>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Pause {
        reply: oneshot::Sender<()>,
    },
    Resume {
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<WorkerSnapshot>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Check start parameters and build the per-run worker config template
pub fn validate_start(
    pattern: &str,
    pattern_type: PatternType,
    cpu_usage_percent: u8,
) -> Result<WorkerConfig> {
    if !(MIN_CPU_USAGE_PERCENT..=MAX_CPU_USAGE_PERCENT).contains(&cpu_usage_percent) {
        return Err(Error::pool_startup(format!(
            "cpu usage must be between {}% and {}%, got {}%",
            MIN_CPU_USAGE_PERCENT, MAX_CPU_USAGE_PERCENT, cpu_usage_percent
        )));
    }

    let matcher =
        PatternMatcher::new(pattern, pattern_type).map_err(|e| Error::pool_startup(e.to_string()))?;

    Ok(WorkerConfig::new(
        matcher.pattern().to_string(),
        pattern_type,
        cpu_usage_percent,
    ))
}

/// Handle to a running pool manager
#[derive(Debug, Clone)]
pub struct WorkerPool {
    commands: mpsc::UnboundedSender<PoolCommand>,
}

impl WorkerPool {
    /// Spawn the manager task. Must be called from within a tokio runtime.
    pub fn new(
        settings: PoolSettings,
        generator: Arc<dyn KeyGenerator>,
    ) -> (Self, mpsc::UnboundedReceiver<PoolEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let manager = PoolManager::new(settings, generator, command_rx, event_tx);
        tokio::spawn(manager.run().instrument(tracing::info_span!("pool_manager")));

        (
            Self {
                commands: command_tx,
            },
            event_rx,
        )
    }

    /// Validate the parameters, replace any current run and spawn the
    /// workers. Returns the number of workers spawned.
    pub async fn start(
        &self,
        pattern: &str,
        pattern_type: PatternType,
        cpu_usage_percent: u8,
    ) -> Result<usize> {
        let template = validate_start(pattern, pattern_type, cpu_usage_percent)?;
        self.request(|reply| PoolCommand::Start { template, reply })
            .await?
    }

    /// Stop every worker. A no-op on an idle or stopped pool.
    pub async fn stop(&self) -> Result<()> {
        self.request(|reply| PoolCommand::Stop { reply }).await
    }

    /// Stop the workers of the current run but keep their configs
    pub async fn pause(&self) -> Result<()> {
        self.request(|reply| PoolCommand::Pause { reply }).await
    }

    /// Respawn the workers of a paused run
    pub async fn resume(&self) -> Result<()> {
        self.request(|reply| PoolCommand::Resume { reply }).await
    }

    /// Snapshot of every worker slot of the current or last run
    pub async fn worker_states(&self) -> Result<Vec<WorkerSnapshot>> {
        self.request(|reply| PoolCommand::Snapshot { reply }).await
    }

    /// Stop the pool, join worker threads (bounded) and end the manager task.
    /// Calling it again afterwards is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        match self.request(|reply| PoolCommand::Shutdown { reply }).await {
            Ok(()) | Err(Error::ChannelClosed { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> PoolCommand,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| Error::channel_closed("pool manager"))?;
        response
            .await
            .map_err(|_| Error::channel_closed("pool manager"))
    }
}
