//! The pool manager task
//!
//! A single tokio task owns every [`WorkerState`]. It reacts to client
//! commands, worker messages, scheduled respawns and two timers (health and
//! metrics). Worker threads never touch manager state; they only send
//! [`WorkerEnvelope`]s tagged with their instance number, and anything from an
//! instance that is no longer current is dropped.

use super::settings::PoolSettings;
use super::{PoolCommand, PoolEvent};
use crate::crypto::KeyGenerator;
use crate::monitor::{MonitorConfig, PerformanceMonitor};
use crate::types::{
    GenerationResult, Metrics, PoolMetrics, WorkerConfig, WorkerSnapshot, WorkerState,
    WorkerStatus,
};
use crate::worker::{spawn_worker, WorkerEnvelope, WorkerHandle, WorkerMessage, WorkerSettings};
use crate::{Error, Result};
use chrono::Utc;
use std::collections::{BTreeMap, VecDeque};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn, Span};
use uuid::Uuid;

/// Ask the manager to bring a failed slot back after its backoff
#[derive(Debug, Clone, Copy)]
struct Respawn {
    run_id: Uuid,
    worker_id: usize,
    /// Instance that failed; the respawn is void if the slot moved on
    instance: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunPhase {
    Running,
    Paused,
    /// Stopped or matched. Kept so callers can still inspect the slots.
    Finished,
}

#[derive(Debug)]
struct WorkerSlot {
    config: WorkerConfig,
    state: WorkerState,
    handle: Option<WorkerHandle>,
    restart_times: VecDeque<Instant>,
    /// Set after a restart storm; the slot is never respawned again
    given_up: bool,
    /// The current instance has reported an `Error`
    errored: bool,
    /// Attempts made by instances this slot has already replaced
    retired_attempts: u64,
}

impl WorkerSlot {
    fn new(config: WorkerConfig) -> Self {
        let state = WorkerState::new(config.worker_id, 0);
        Self {
            config,
            state,
            handle: None,
            restart_times: VecDeque::new(),
            given_up: false,
            errored: false,
            retired_attempts: 0,
        }
    }

    fn release(&mut self, draining: &mut Vec<WorkerHandle>) {
        if let Some(handle) = self.handle.take() {
            handle.stop();
            draining.push(handle);
        }
    }
}

#[derive(Debug)]
struct PoolRun {
    run_id: Uuid,
    phase: RunPhase,
    slots: BTreeMap<usize, WorkerSlot>,
    span: Span,
}

/// Spawns worker instances with pool-unique, increasing instance numbers
struct Spawner {
    settings: WorkerSettings,
    generator: Arc<dyn KeyGenerator>,
    events: mpsc::UnboundedSender<WorkerEnvelope>,
    next_instance: u64,
}

impl Spawner {
    fn spawn(&mut self, slot: &mut WorkerSlot) -> Result<()> {
        self.next_instance += 1;
        let instance = self.next_instance;
        let handle = spawn_worker(
            &slot.config,
            instance,
            self.settings.clone(),
            Arc::clone(&self.generator),
            self.events.clone(),
        )?;

        slot.handle = Some(handle);
        slot.errored = false;
        if let Some(metrics) = slot.state.metrics.take() {
            slot.retired_attempts += metrics.attempts;
        }
        slot.state.instance = instance;
        slot.state.status = WorkerStatus::Running;
        slot.state.last_heartbeat = Instant::now();
        slot.state.metrics_received_at = None;
        Ok(())
    }
}

/// What to do once the borrow of a slot has ended
enum FollowUp {
    /// Counted restart, subject to the restart budget
    Restart(String),
    /// Replace an instance that died below the error threshold
    Respawn,
    Complete(GenerationResult),
}

pub(crate) struct PoolManager {
    settings: PoolSettings,
    spawner: Spawner,
    commands: mpsc::UnboundedReceiver<PoolCommand>,
    worker_events: mpsc::UnboundedReceiver<WorkerEnvelope>,
    respawn_tx: mpsc::UnboundedSender<Respawn>,
    respawns: mpsc::UnboundedReceiver<Respawn>,
    events: mpsc::UnboundedSender<PoolEvent>,
    run: Option<PoolRun>,
    /// Stopped instances whose threads may still be winding down
    draining: Vec<WorkerHandle>,
    pool_monitor: PerformanceMonitor,
}

impl PoolManager {
    pub(crate) fn new(
        settings: PoolSettings,
        generator: Arc<dyn KeyGenerator>,
        commands: mpsc::UnboundedReceiver<PoolCommand>,
        events: mpsc::UnboundedSender<PoolEvent>,
    ) -> Self {
        let (worker_tx, worker_events) = mpsc::unbounded_channel();
        let (respawn_tx, respawns) = mpsc::unbounded_channel();
        let spawner = Spawner {
            settings: settings.worker.clone(),
            generator,
            events: worker_tx,
            next_instance: 0,
        };

        Self {
            settings,
            spawner,
            commands,
            worker_events,
            respawn_tx,
            respawns,
            events,
            run: None,
            draining: Vec::new(),
            pool_monitor: PerformanceMonitor::new(MonitorConfig::pool_scope()),
        }
    }

    pub(crate) async fn run(mut self) {
        let mut health = time::interval(self.settings.health_check_interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut metrics = time::interval(self.settings.metrics_interval);
        metrics.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        debug!("all pool handles dropped");
                        self.shutdown().await;
                        break;
                    };
                    if self.handle_command(command).await.is_break() {
                        break;
                    }
                }
                Some(envelope) = self.worker_events.recv() => self.handle_worker_message(envelope),
                Some(respawn) = self.respawns.recv() => self.handle_respawn(respawn),
                _ = health.tick() => self.check_health(),
                _ = metrics.tick() => self.publish_metrics(),
            }
        }

        debug!("pool manager exited");
    }

    async fn handle_command(&mut self, command: PoolCommand) -> ControlFlow<()> {
        match command {
            PoolCommand::Start { template, reply } => {
                let _ = reply.send(self.start_run(template));
            }
            PoolCommand::Stop { reply } => {
                self.stop_run("stop requested");
                let _ = reply.send(());
            }
            PoolCommand::Pause { reply } => {
                self.pause();
                let _ = reply.send(());
            }
            PoolCommand::Resume { reply } => {
                self.resume();
                let _ = reply.send(());
            }
            PoolCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            PoolCommand::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn start_run(&mut self, template: WorkerConfig) -> Result<usize> {
        self.stop_run("replaced by a new run");

        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("pool_run", run_id = %run_id);
        let _entered = span.enter();

        let worker_count = self.settings.worker_policy.worker_count();
        let mut slots = BTreeMap::new();
        for worker_id in 0..worker_count {
            let mut slot = WorkerSlot::new(template.for_worker(worker_id));
            if let Err(e) = self.spawner.spawn(&mut slot) {
                error!(worker_id, error = %e, "failed to spawn worker");
                for mut spawned in slots.into_values() {
                    WorkerSlot::release(&mut spawned, &mut self.draining);
                }
                return Err(Error::pool_startup(format!(
                    "failed to spawn worker {}: {}",
                    worker_id, e
                )));
            }
            slots.insert(worker_id, slot);
        }

        info!(
            workers = worker_count,
            pattern = %template.pattern,
            pattern_type = %template.pattern_type,
            cpu_usage = template.cpu_usage_percent(),
            "pool started"
        );

        self.pool_monitor = PerformanceMonitor::new(MonitorConfig::pool_scope());
        self.run = Some(PoolRun {
            run_id,
            phase: RunPhase::Running,
            slots,
            span: span.clone(),
        });
        Ok(worker_count)
    }

    fn stop_run(&mut self, reason: &str) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        if run.phase == RunPhase::Finished {
            return;
        }

        let _entered = run.span.enter();
        for slot in run.slots.values_mut() {
            slot.release(&mut self.draining);
            slot.state.status = WorkerStatus::Terminated;
        }
        run.phase = RunPhase::Finished;
        info!(reason, "pool stopped");
    }

    fn pause(&mut self) {
        let Some(run) = self.run.as_mut() else {
            debug!("pause ignored, no run");
            return;
        };
        if run.phase != RunPhase::Running {
            debug!(phase = ?run.phase, "pause ignored");
            return;
        }

        let _entered = run.span.enter();
        for slot in run.slots.values_mut().filter(|s| !s.given_up) {
            slot.release(&mut self.draining);
            slot.state.status = WorkerStatus::Paused;
        }
        run.phase = RunPhase::Paused;
        info!("pool paused");
    }

    fn resume(&mut self) {
        let Some(run) = self.run.as_mut() else {
            debug!("resume ignored, no run");
            return;
        };
        if run.phase != RunPhase::Paused {
            debug!(phase = ?run.phase, "resume ignored");
            return;
        }

        let span = run.span.clone();
        let _entered = span.enter();
        run.phase = RunPhase::Running;

        let mut failed = Vec::new();
        for slot in run
            .slots
            .values_mut()
            .filter(|s| s.state.status == WorkerStatus::Paused)
        {
            if let Err(e) = self.spawner.spawn(slot) {
                warn!(worker_id = slot.state.id, error = %e, "failed to respawn worker");
                slot.state.status = WorkerStatus::Error;
                failed.push((slot.state.id, e.to_string()));
            }
        }
        info!("pool resumed");

        for (worker_id, reason) in failed {
            self.restart_worker(worker_id, &reason);
        }
    }

    fn snapshot(&self) -> Vec<WorkerSnapshot> {
        self.run
            .as_ref()
            .map(|run| run.slots.values().map(|s| s.state.clone()).collect())
            .unwrap_or_default()
    }

    fn handle_worker_message(&mut self, envelope: WorkerEnvelope) {
        let WorkerEnvelope {
            worker_id,
            instance,
            message,
        } = envelope;
        let now = Instant::now();

        let Some(run) = self.run.as_mut() else {
            discard(worker_id, instance, message, "no run");
            return;
        };
        let Some(slot) = run.slots.get_mut(&worker_id) else {
            discard(worker_id, instance, message, "unknown worker id");
            return;
        };
        if slot.state.instance != instance {
            discard(worker_id, instance, message, "stale instance");
            return;
        }

        let span = run.span.clone();
        let _entered = span.enter();
        let running = slot.state.status == WorkerStatus::Running;

        let follow_up = match message {
            WorkerMessage::Heartbeat { .. } => {
                slot.state.last_heartbeat = now;
                None
            }
            WorkerMessage::Progress {
                attempts,
                speed,
                average_speed,
                batch_size,
                timestamp,
            } => {
                slot.state.last_heartbeat = now;
                slot.state.metrics = Some(Metrics {
                    attempts,
                    instant_speed: speed,
                    rolling_average_speed: average_speed,
                    batch_size_hint: batch_size,
                    timestamp,
                });
                slot.state.metrics_received_at = Some(now);
                None
            }
            WorkerMessage::Warning { reason } => {
                slot.state.last_heartbeat = now;
                debug!(worker_id, %reason, "worker warning");
                None
            }
            WorkerMessage::Error { message } if running => {
                slot.errored = true;
                slot.state.consecutive_errors += 1;
                warn!(
                    worker_id,
                    consecutive_errors = slot.state.consecutive_errors,
                    %message,
                    "worker error"
                );
                (slot.state.consecutive_errors >= self.settings.error_restart_threshold)
                    .then(|| FollowUp::Restart(message))
            }
            WorkerMessage::Error { message } => {
                debug!(worker_id, %message, status = %slot.state.status, "error from inactive worker");
                None
            }
            WorkerMessage::Terminating { .. } if running => {
                if slot.errored {
                    Some(FollowUp::Respawn)
                } else {
                    Some(FollowUp::Restart("worker exited unexpectedly".to_string()))
                }
            }
            WorkerMessage::Terminating { .. } => {
                trace!(worker_id, instance, "worker terminated");
                None
            }
            WorkerMessage::Success {
                public_id,
                private_key,
                attempts,
            } => {
                if running && run.phase == RunPhase::Running {
                    Some(FollowUp::Complete(GenerationResult {
                        public_id,
                        private_key,
                        attempts,
                        worker_id,
                    }))
                } else {
                    debug!(worker_id, "discarding success from inactive worker");
                    None
                }
            }
        };

        match follow_up {
            Some(FollowUp::Restart(reason)) => self.restart_worker(worker_id, &reason),
            Some(FollowUp::Respawn) => self.respawn_worker(worker_id),
            Some(FollowUp::Complete(result)) => self.complete_run(result),
            None => {}
        }
    }

    fn complete_run(&mut self, result: GenerationResult) {
        info!(
            worker_id = result.worker_id,
            public_id = %result.public_id,
            attempts = result.attempts,
            "match found"
        );
        self.stop_run("match found");
        if self.events.send(PoolEvent::Success(result)).is_err() {
            warn!("no consumer for pool events, result dropped");
        }
    }

    /// Stop the current instance of `worker_id` and schedule a replacement,
    /// unless the slot has used up its restart budget.
    fn restart_worker(&mut self, worker_id: usize, reason: &str) {
        let now = Instant::now();
        let Some(run) = self.run.as_mut() else {
            return;
        };
        if run.phase != RunPhase::Running {
            return;
        }
        let run_id = run.run_id;
        let Some(slot) = run.slots.get_mut(&worker_id) else {
            return;
        };

        slot.release(&mut self.draining);
        slot.state.status = WorkerStatus::Error;
        slot.state.consecutive_errors = 0;

        let window = self.settings.restart_window;
        while slot
            .restart_times
            .front()
            .is_some_and(|at| now.duration_since(*at) > window)
        {
            slot.restart_times.pop_front();
        }

        if slot.restart_times.len() >= self.settings.max_restarts as usize {
            slot.given_up = true;
            let err = Error::restart_storm(worker_id, slot.state.restarts);
            error!(error = %err, %reason, "giving up on worker");
            let _ = self.events.send(PoolEvent::WorkerFailed {
                worker_id,
                reason: err.to_string(),
            });
            return;
        }

        slot.restart_times.push_back(now);
        slot.state.restarts += 1;
        warn!(
            worker_id,
            restarts = slot.state.restarts,
            %reason,
            backoff = %humantime::format_duration(self.settings.restart_backoff),
            "restarting worker"
        );

        let respawn = Respawn {
            run_id,
            worker_id,
            instance: slot.state.instance,
        };
        self.schedule_respawn(respawn);
    }

    /// Replace an instance that stopped itself after reporting an error,
    /// without spending the restart budget. Its errors stay on the slot's
    /// count so the threshold still applies across instances.
    fn respawn_worker(&mut self, worker_id: usize) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        if run.phase != RunPhase::Running {
            return;
        }
        let run_id = run.run_id;
        let Some(slot) = run.slots.get_mut(&worker_id) else {
            return;
        };

        slot.release(&mut self.draining);
        slot.state.status = WorkerStatus::Error;
        warn!(
            worker_id,
            consecutive_errors = slot.state.consecutive_errors,
            threshold = self.settings.error_restart_threshold,
            "worker exited after an error, respawning"
        );

        let respawn = Respawn {
            run_id,
            worker_id,
            instance: slot.state.instance,
        };
        self.schedule_respawn(respawn);
    }

    fn schedule_respawn(&self, respawn: Respawn) {
        let respawn_tx = self.respawn_tx.clone();
        let delay = self.settings.restart_backoff;
        tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = respawn_tx.send(respawn);
        });
    }

    fn handle_respawn(&mut self, respawn: Respawn) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        if run.run_id != respawn.run_id || run.phase != RunPhase::Running {
            trace!(worker_id = respawn.worker_id, "respawn for inactive run ignored");
            return;
        }
        let Some(slot) = run.slots.get_mut(&respawn.worker_id) else {
            return;
        };
        if slot.given_up
            || slot.state.status != WorkerStatus::Error
            || slot.state.instance != respawn.instance
        {
            return;
        }

        let span = run.span.clone();
        let _entered = span.enter();
        match self.spawner.spawn(slot) {
            Ok(()) => info!(
                worker_id = respawn.worker_id,
                instance = slot.state.instance,
                "worker restarted"
            ),
            Err(e) => {
                error!(worker_id = respawn.worker_id, error = %e, "failed to respawn worker");
                self.restart_worker(respawn.worker_id, &e.to_string());
            }
        }
    }

    fn check_health(&mut self) {
        self.draining.retain(|handle| !handle.is_finished());

        let Some(run) = self.run.as_ref() else {
            return;
        };
        if run.phase != RunPhase::Running {
            return;
        }

        let now = Instant::now();
        let timeout = self.settings.heartbeat_timeout;
        let silent: Vec<(usize, Duration)> = run
            .slots
            .values()
            .filter(|s| s.state.status == WorkerStatus::Running)
            .filter_map(|s| {
                let silent_for = now.saturating_duration_since(s.state.last_heartbeat);
                (silent_for > timeout).then_some((s.state.id, silent_for))
            })
            .collect();

        let span = run.span.clone();
        let _entered = span.enter();
        for (worker_id, silent_for) in silent {
            let err = Error::heartbeat_timeout(worker_id, silent_for);
            warn!(error = %err, "worker unresponsive");
            self.restart_worker(worker_id, &err.to_string());
        }
    }

    fn publish_metrics(&mut self) {
        let Some(run) = self.run.as_ref() else {
            return;
        };
        if run.phase == RunPhase::Finished {
            return;
        }

        let now = Instant::now();
        let mut total_attempts = 0u64;
        let mut average_speed = 0.0;
        let mut active_workers = 0;
        for slot in run.slots.values() {
            let current = slot.state.metrics.as_ref().map_or(0, |m| m.attempts);
            total_attempts += slot.retired_attempts + current;

            if slot.state.status != WorkerStatus::Running {
                continue;
            }
            if let Some(metrics) = slot.state.fresh_metrics(now, self.settings.metrics_staleness) {
                average_speed += metrics.instant_speed;
                active_workers += 1;
            }
        }

        let rolling_speed = match self.pool_monitor.update_metrics(total_attempts) {
            Some(sample) => sample.rolling_average_speed,
            None => self.pool_monitor.rolling_average(),
        };

        let metrics = PoolMetrics {
            total_attempts,
            average_speed,
            rolling_speed,
            active_workers,
            total_workers: run.slots.len(),
            timestamp: Utc::now(),
        };
        debug!(
            total_attempts,
            average_speed,
            active_workers,
            total_workers = metrics.total_workers,
            "pool metrics"
        );
        let _ = self.events.send(PoolEvent::Metrics(metrics));
    }

    /// Stop everything and wait, bounded, for worker threads to exit so their
    /// buffers are wiped before the process goes away.
    async fn shutdown(&mut self) {
        self.stop_run("shutdown");

        let handles = std::mem::take(&mut self.draining);
        if handles.is_empty() {
            return;
        }

        let count = handles.len();
        let joins = handles
            .into_iter()
            .map(|handle| tokio::task::spawn_blocking(move || handle.join()));

        match time::timeout(
            self.settings.shutdown_timeout,
            futures::future::join_all(joins),
        )
        .await
        {
            Ok(results) => {
                let clean = results.iter().filter(|r| matches!(r, Ok(Some(_)))).count();
                debug!(clean, count, "worker threads joined");
            }
            Err(_) => warn!(
                count,
                timeout = %humantime::format_duration(self.settings.shutdown_timeout),
                "timed out waiting for worker threads"
            ),
        }
    }
}

/// Drop a message that no longer belongs to the current run. Any key material
/// it carries is wiped as it goes out of scope.
fn discard(worker_id: usize, instance: u64, message: WorkerMessage, why: &str) {
    match &message {
        WorkerMessage::Success { .. } => {
            debug!(worker_id, instance, why, "discarding success, key wiped")
        }
        other => trace!(worker_id, instance, why, kind = other.kind(), "discarding message"),
    }
}
