//! Generation workers
//!
//! Each worker instance owns one OS thread. It waits for a `Start` command,
//! then repeats generate, derive, match, erase inside throttled windows until
//! it is stopped, finds a match, or gives up after repeated failures.

pub mod protocol;
pub mod throttle;

pub use protocol::{WorkerCommand, WorkerEnvelope, WorkerMessage};
pub use throttle::{Slice, Throttle};

use crate::crypto::{fill_seed, DerivedKeypair, KeyGenerator, SecretBuffer, SEED_LENGTH};
use crate::matcher::PatternMatcher;
use crate::monitor::{MonitorConfig, PerformanceMonitor};
use crate::types::{cpu_fraction, WorkerConfig};
use crate::utils::ExponentialBackoff;
use crate::{Error, Result};
use rand::Rng;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, error, info, trace, warn, Span};

/// Tunables shared by every worker of a pool
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    /// Scheduling window length
    pub window: Duration,
    pub heartbeat_interval: Duration,
    /// Consecutive failed attempts before the worker stops itself
    pub max_consecutive_failures: u32,
    pub min_batch: u64,
    pub max_batch: u64,
    pub failure_backoff_initial: Duration,
    pub failure_backoff_max: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(50),
            heartbeat_interval: Duration::from_secs(5),
            max_consecutive_failures: 5,
            min_batch: 16,
            max_batch: 4096,
            failure_backoff_initial: Duration::from_millis(10),
            failure_backoff_max: Duration::from_millis(500),
        }
    }
}

/// Why a worker instance ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Told to stop, or stopped before it was started
    Stopped,
    Matched,
    /// Gave up after repeated failures or a bad config
    Fatal,
    /// The manager dropped its end of the command channel
    Disconnected,
}

/// What a worker thread returns when joined
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerExit {
    pub worker_id: usize,
    pub instance: u64,
    pub reason: ExitReason,
    pub attempts: u64,
    /// Measured share of wall time spent searching
    pub duty_cycle: f64,
}

/// Thread name for worker `worker_id`
pub fn worker_thread_name(worker_id: usize) -> String {
    format!("vanity-worker-{}", worker_id)
}

/// Create a tracing span for one worker instance
pub fn worker_span(worker_id: usize, instance: u64) -> Span {
    tracing::info_span!("worker", worker_id = worker_id, instance = instance)
}

/// Reused per-attempt buffers, wiped after every attempt and on drop
#[derive(Debug)]
struct AttemptScratch {
    seed: SecretBuffer,
    key: SecretBuffer,
}

impl AttemptScratch {
    fn new() -> Self {
        Self {
            seed: SecretBuffer::zeroed(SEED_LENGTH),
            key: SecretBuffer::default(),
        }
    }

    fn wipe(&mut self) {
        self.seed.wipe();
        self.key.wipe();
    }

    fn is_clear(&self) -> bool {
        self.seed.is_zeroed() && self.key.is_zeroed()
    }
}

impl Drop for AttemptScratch {
    fn drop(&mut self) {
        self.wipe();
    }
}

enum WindowOutcome {
    Continue,
    /// A failed attempt ended the window early
    Backoff(Duration),
    Exit(ExitReason),
}

/// Search loop state for one worker instance
pub struct GenerationWorker {
    worker_id: usize,
    instance: u64,
    settings: WorkerSettings,
    generator: Arc<dyn KeyGenerator>,
    commands: mpsc::UnboundedReceiver<WorkerCommand>,
    events: mpsc::UnboundedSender<WorkerEnvelope>,
    scratch: AttemptScratch,
    attempts: u64,
    consecutive_failures: u32,
    duty_cycle: f64,
}

impl GenerationWorker {
    pub fn new(
        worker_id: usize,
        instance: u64,
        settings: WorkerSettings,
        generator: Arc<dyn KeyGenerator>,
        commands: mpsc::UnboundedReceiver<WorkerCommand>,
        events: mpsc::UnboundedSender<WorkerEnvelope>,
    ) -> Self {
        Self {
            worker_id,
            instance,
            settings,
            generator,
            commands,
            events,
            scratch: AttemptScratch::new(),
            attempts: 0,
            consecutive_failures: 0,
            duty_cycle: 0.0,
        }
    }

    /// Run to completion on the current thread
    pub fn run(mut self) -> WorkerExit {
        let span = worker_span(self.worker_id, self.instance);
        let _entered = span.enter();

        let reason = match self.wait_for_start() {
            Some(config) => self.search(&config),
            None => ExitReason::Stopped,
        };
        self.finish(reason)
    }

    fn wait_for_start(&mut self) -> Option<WorkerConfig> {
        match self.commands.blocking_recv()? {
            WorkerCommand::Start {
                pattern,
                pattern_type,
                worker_id,
                cpu_usage_percent,
            } => {
                if worker_id != self.worker_id {
                    warn!(
                        expected = self.worker_id,
                        received = worker_id,
                        "start command addressed to another worker id"
                    );
                }
                Some(WorkerConfig {
                    pattern,
                    pattern_type,
                    cpu_usage_fraction: cpu_fraction(cpu_usage_percent),
                    worker_id: self.worker_id,
                })
            }
            WorkerCommand::Stop => None,
        }
    }

    fn search(&mut self, config: &WorkerConfig) -> ExitReason {
        let matcher = match PatternMatcher::new(&config.pattern, config.pattern_type) {
            Ok(matcher) => matcher,
            Err(e) => {
                let err = Error::worker_fatal(self.worker_id, e.to_string());
                error!(error = %err, "cannot search");
                self.emit(WorkerMessage::Error {
                    message: err.to_string(),
                });
                return ExitReason::Fatal;
            }
        };

        info!(
            pattern = %matcher,
            cpu_usage = config.cpu_usage_percent(),
            generator = self.generator.name(),
            "worker started"
        );

        let mut throttle = Throttle::new(self.settings.window, config.cpu_usage_fraction);
        let mut monitor = PerformanceMonitor::new(MonitorConfig::worker_scope(
            self.settings.window,
            throttle.fraction(),
            self.settings.min_batch,
            self.settings.max_batch,
        ));
        let mut backoff = ExponentialBackoff::new(
            self.settings.failure_backoff_initial.as_millis() as u64,
            self.settings.failure_backoff_max.as_millis() as u64,
            2.0,
        );
        let mut rng = rand::rng();
        let mut batch_cap = monitor.batch_size_hint();
        let mut last_heartbeat = Instant::now();
        self.emit(WorkerMessage::heartbeat());

        let reason = loop {
            if let Some(reason) = self.poll_commands() {
                break reason;
            }

            let now = Instant::now();
            if now.duration_since(last_heartbeat) >= self.settings.heartbeat_interval {
                self.emit(WorkerMessage::heartbeat());
                last_heartbeat = now;
            }

            let slice = throttle.begin(now);
            let outcome = self.run_window(&slice, batch_cap, &matcher, &mut rng, &mut backoff);
            let rest = throttle.finish(&slice, Instant::now());

            let pause = match outcome {
                WindowOutcome::Exit(reason) => break reason,
                WindowOutcome::Backoff(delay) => rest.max(delay),
                WindowOutcome::Continue => rest,
            };

            if let Some(metrics) = monitor.update_metrics(self.attempts) {
                batch_cap = metrics.batch_size_hint;
                debug!(
                    attempts = metrics.attempts,
                    speed = metrics.instant_speed,
                    batch_size = batch_cap,
                    "progress"
                );
                self.emit(WorkerMessage::Progress {
                    attempts: metrics.attempts,
                    speed: metrics.instant_speed,
                    average_speed: metrics.rolling_average_speed,
                    batch_size: metrics.batch_size_hint,
                    timestamp: metrics.timestamp,
                });
            }

            if pause.is_zero() {
                thread::yield_now();
            } else if let Some(reason) = self.sleep_watching_commands(pause) {
                break reason;
            }
        };

        self.duty_cycle = throttle.duty_cycle();
        reason
    }

    /// Search in batches of at most `batch_cap` attempts until the work deadline
    fn run_window<R: Rng + ?Sized>(
        &mut self,
        slice: &Slice,
        batch_cap: u64,
        matcher: &PatternMatcher,
        rng: &mut R,
        backoff: &mut ExponentialBackoff,
    ) -> WindowOutcome {
        while Instant::now() < slice.deadline {
            let mut in_batch = 0u64;
            while in_batch < batch_cap && Instant::now() < slice.deadline {
                in_batch += 1;
                self.attempts += 1;

                match self.attempt(matcher, rng) {
                    Ok(None) => {
                        if self.consecutive_failures > 0 {
                            self.consecutive_failures = 0;
                            backoff.reset();
                        }
                    }
                    Ok(Some(public_id)) => {
                        return WindowOutcome::Exit(self.report_success(public_id));
                    }
                    Err(err) => {
                        self.consecutive_failures += 1;
                        warn!(
                            error = %err,
                            failures = self.consecutive_failures,
                            "generation attempt failed"
                        );
                        self.emit(WorkerMessage::Warning {
                            reason: err.to_string(),
                        });

                        if self.consecutive_failures >= self.settings.max_consecutive_failures {
                            let fatal = Error::worker_fatal(
                                self.worker_id,
                                format!(
                                    "{} consecutive generation failures, last: {}",
                                    self.consecutive_failures, err
                                ),
                            );
                            error!(error = %fatal, "giving up");
                            self.emit(WorkerMessage::Error {
                                message: fatal.to_string(),
                            });
                            return WindowOutcome::Exit(ExitReason::Fatal);
                        }
                        return WindowOutcome::Backoff(backoff.next_delay());
                    }
                }
            }
            thread::yield_now();
        }
        WindowOutcome::Continue
    }

    /// One generate/derive/match cycle. Returns the public id on a match, in
    /// which case the private key is left in the scratch buffer.
    fn attempt<R: Rng + ?Sized>(
        &mut self,
        matcher: &PatternMatcher,
        rng: &mut R,
    ) -> Result<Option<String>> {
        fill_seed(rng, &mut self.scratch.seed);

        let generator = &self.generator;
        let seed = &self.scratch.seed;
        let derived = panic::catch_unwind(AssertUnwindSafe(|| generator.derive(seed)));
        self.scratch.seed.wipe();

        let DerivedKeypair {
            public_id,
            private_key,
        } = match derived {
            Ok(result) => result.map_err(Error::into_transient)?,
            Err(_) => return Err(Error::transient_generation("key generator panicked")),
        };
        self.scratch.key = private_key;

        if matcher.matches(&public_id) {
            return Ok(Some(public_id));
        }

        self.scratch.key.wipe();
        Ok(None)
    }

    fn report_success(&mut self, public_id: String) -> ExitReason {
        let private_key = self.scratch.key.take();
        info!(public_id = %public_id, attempts = self.attempts, "match found");
        self.emit(WorkerMessage::Success {
            public_id,
            private_key,
            attempts: self.attempts,
        });
        ExitReason::Matched
    }

    /// Sleep for `pause` in steps of at most one window, checking for
    /// commands after each step
    fn sleep_watching_commands(&mut self, pause: Duration) -> Option<ExitReason> {
        let deadline = Instant::now() + pause;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            thread::sleep((deadline - now).min(self.settings.window));
            if let Some(reason) = self.poll_commands() {
                return Some(reason);
            }
        }
    }

    fn poll_commands(&mut self) -> Option<ExitReason> {
        loop {
            match self.commands.try_recv() {
                Ok(WorkerCommand::Stop) => return Some(ExitReason::Stopped),
                Ok(WorkerCommand::Start { .. }) => {
                    debug!("ignoring start command while running");
                }
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => return Some(ExitReason::Disconnected),
            }
        }
    }

    fn emit(&self, message: WorkerMessage) {
        let envelope = WorkerEnvelope {
            worker_id: self.worker_id,
            instance: self.instance,
            message,
        };
        if self.events.send(envelope).is_err() {
            trace!("event channel closed, message dropped");
        }
    }

    fn finish(mut self, reason: ExitReason) -> WorkerExit {
        self.scratch.wipe();
        self.emit(WorkerMessage::terminating());

        match reason {
            ExitReason::Stopped | ExitReason::Matched => {
                info!(?reason, attempts = self.attempts, "worker terminating")
            }
            ExitReason::Fatal | ExitReason::Disconnected => {
                warn!(?reason, attempts = self.attempts, "worker terminating")
            }
        }

        WorkerExit {
            worker_id: self.worker_id,
            instance: self.instance,
            reason,
            attempts: self.attempts,
            duty_cycle: self.duty_cycle,
        }
    }
}

/// Manager-side handle to a running worker thread
#[derive(Debug)]
pub struct WorkerHandle {
    commands: mpsc::UnboundedSender<WorkerCommand>,
    thread: thread::JoinHandle<WorkerExit>,
}

impl WorkerHandle {
    /// Ask the worker to stop at its next window boundary. Returns false if
    /// it has already exited.
    pub fn stop(&self) -> bool {
        self.commands.send(WorkerCommand::Stop).is_ok()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Block until the thread exits. `None` if it panicked.
    pub fn join(self) -> Option<WorkerExit> {
        self.thread.join().ok()
    }
}

/// Spawn a worker thread for `config` and send it its `Start` command
pub fn spawn_worker(
    config: &WorkerConfig,
    instance: u64,
    settings: WorkerSettings,
    generator: Arc<dyn KeyGenerator>,
    events: mpsc::UnboundedSender<WorkerEnvelope>,
) -> Result<WorkerHandle> {
    let (commands, inbox) = mpsc::unbounded_channel();
    commands
        .send(WorkerCommand::Start {
            pattern: config.pattern.clone(),
            pattern_type: config.pattern_type,
            worker_id: config.worker_id,
            cpu_usage_percent: config.cpu_usage_percent(),
        })
        .map_err(|_| Error::channel_closed("worker commands"))?;

    let worker = GenerationWorker::new(
        config.worker_id,
        instance,
        settings,
        generator,
        inbox,
        events,
    );
    let thread = thread::Builder::new()
        .name(worker_thread_name(config.worker_id))
        .spawn(move || worker.run())?;

    Ok(WorkerHandle {
        commands,
        thread,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::PatternType;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct NeverMatch;

    impl KeyGenerator for NeverMatch {
        fn derive(&self, _seed: &SecretBuffer) -> Result<DerivedKeypair> {
            Ok(DerivedKeypair {
                public_id: "ZZZZZZZZ".to_string(),
                private_key: SecretBuffer::from_bytes(b"0123456789abcdef".to_vec()),
            })
        }

        fn name(&self) -> &'static str {
            "never-match"
        }
    }

    struct AlwaysMatch;

    impl KeyGenerator for AlwaysMatch {
        fn derive(&self, _seed: &SecretBuffer) -> Result<DerivedKeypair> {
            Ok(DerivedKeypair {
                public_id: "ABCDEFGH".to_string(),
                private_key: SecretBuffer::from_bytes(b"feedface".to_vec()),
            })
        }

        fn name(&self) -> &'static str {
            "always-match"
        }
    }

    struct AlwaysFail(AtomicU64);

    impl KeyGenerator for AlwaysFail {
        fn derive(&self, _seed: &SecretBuffer) -> Result<DerivedKeypair> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Err(Error::crypto("derivation refused"))
        }

        fn name(&self) -> &'static str {
            "always-fail"
        }
    }

    struct Panics;

    impl KeyGenerator for Panics {
        fn derive(&self, _seed: &SecretBuffer) -> Result<DerivedKeypair> {
            panic!("generator blew up");
        }

        fn name(&self) -> &'static str {
            "panics"
        }
    }

    /// Burns a fixed amount of CPU per derivation
    struct Spin(Duration);

    impl KeyGenerator for Spin {
        fn derive(&self, seed: &SecretBuffer) -> Result<DerivedKeypair> {
            let start = Instant::now();
            while start.elapsed() < self.0 {
                std::hint::spin_loop();
            }
            NeverMatch.derive(seed)
        }

        fn name(&self) -> &'static str {
            "spin"
        }
    }

    fn test_settings() -> WorkerSettings {
        WorkerSettings {
            window: Duration::from_millis(20),
            heartbeat_interval: Duration::from_millis(50),
            max_consecutive_failures: 3,
            ..WorkerSettings::default()
        }
    }

    fn local_worker(
        generator: Arc<dyn KeyGenerator>,
    ) -> (
        GenerationWorker,
        mpsc::UnboundedSender<WorkerCommand>,
        mpsc::UnboundedReceiver<WorkerEnvelope>,
    ) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let worker = GenerationWorker::new(0, 1, test_settings(), generator, command_rx, event_tx);
        (worker, command_tx, event_rx)
    }

    fn prefix(pattern: &str) -> PatternMatcher {
        PatternMatcher::new(pattern, PatternType::Prefix).unwrap()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<WorkerEnvelope>) -> Vec<WorkerEnvelope> {
        let mut out = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            out.push(envelope);
        }
        out
    }

    #[test]
    fn test_scratch_is_wiped_after_miss() {
        let (mut worker, _commands, _events) = local_worker(Arc::new(NeverMatch));
        let mut rng = rand::rng();

        let outcome = worker.attempt(&prefix("AB"), &mut rng).unwrap();

        assert!(outcome.is_none());
        assert_eq!(worker.scratch.seed.len(), SEED_LENGTH);
        assert_eq!(worker.scratch.key.len(), 16);
        assert!(worker.scratch.is_clear());
    }

    #[test]
    fn test_scratch_is_wiped_after_failure() {
        let (mut worker, _commands, _events) =
            local_worker(Arc::new(AlwaysFail(AtomicU64::new(0))));
        let mut rng = rand::rng();

        let err = worker.attempt(&prefix("AB"), &mut rng).unwrap_err();

        assert!(matches!(err, Error::TransientGeneration { .. }));
        assert!(worker.scratch.is_clear());
    }

    #[test]
    fn test_match_moves_key_out_of_scratch() {
        let (mut worker, _commands, mut events) = local_worker(Arc::new(AlwaysMatch));
        let mut rng = rand::rng();

        let public_id = worker.attempt(&prefix("AB"), &mut rng).unwrap().unwrap();
        assert_eq!(public_id, "ABCDEFGH");

        worker.report_success(public_id);
        assert!(worker.scratch.key.is_empty());
        assert!(worker.scratch.is_clear());

        let envelope = events.try_recv().unwrap();
        match envelope.message {
            WorkerMessage::Success { private_key, .. } => {
                assert_eq!(private_key.as_bytes(), b"feedface");
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_panicking_generator_is_transient() {
        let (mut worker, _commands, _events) = local_worker(Arc::new(Panics));
        let mut rng = rand::rng();

        let err = worker.attempt(&prefix("AB"), &mut rng).unwrap_err();
        assert!(matches!(err, Error::TransientGeneration { .. }));
        assert!(worker.scratch.is_clear());
    }

    #[test]
    fn test_stop_before_start() {
        let (worker, commands, mut events) = local_worker(Arc::new(NeverMatch));
        commands.send(WorkerCommand::Stop).unwrap();

        let exit = worker.run();
        assert_eq!(exit.reason, ExitReason::Stopped);
        assert_eq!(exit.attempts, 0);

        let messages = drain(&mut events);
        assert_eq!(messages.len(), 1);
        assert!(matches!(messages[0].message, WorkerMessage::Terminating { .. }));
    }

    #[test]
    fn test_worker_stops_on_command() {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let config = WorkerConfig::new("AB".to_string(), PatternType::Prefix, 50).for_worker(2);
        let handle =
            spawn_worker(&config, 7, test_settings(), Arc::new(NeverMatch), events_tx).unwrap();

        thread::sleep(Duration::from_millis(200));
        assert!(handle.stop());
        let exit = handle.join().unwrap();

        assert_eq!(exit.reason, ExitReason::Stopped);
        assert_eq!(exit.worker_id, 2);
        assert!(exit.attempts > 0);

        let messages = drain(&mut events);
        assert!(messages.iter().all(|m| m.worker_id == 2 && m.instance == 7));
        assert!(matches!(messages[0].message, WorkerMessage::Heartbeat { .. }));
        assert!(matches!(
            messages.last().unwrap().message,
            WorkerMessage::Terminating { .. }
        ));
    }

    #[test]
    fn test_worker_reports_success_and_exits() {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let config = WorkerConfig::new("AB".to_string(), PatternType::Prefix, 100);
        let handle =
            spawn_worker(&config, 1, test_settings(), Arc::new(AlwaysMatch), events_tx).unwrap();

        let exit = handle.join().unwrap();
        assert_eq!(exit.reason, ExitReason::Matched);
        assert_eq!(exit.attempts, 1);

        let kinds: Vec<_> = drain(&mut events)
            .iter()
            .map(|m| m.message.kind())
            .collect();
        assert_eq!(kinds, vec!["heartbeat", "success", "terminating"]);
    }

    #[test]
    fn test_worker_gives_up_after_consecutive_failures() {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let config = WorkerConfig::new("AB".to_string(), PatternType::Prefix, 100);
        let generator = Arc::new(AlwaysFail(AtomicU64::new(0)));
        let settings = WorkerSettings {
            heartbeat_interval: Duration::from_secs(10),
            ..test_settings()
        };
        let handle = spawn_worker(&config, 1, settings, generator.clone(), events_tx).unwrap();

        let exit = handle.join().unwrap();
        assert_eq!(exit.reason, ExitReason::Fatal);
        assert_eq!(generator.0.load(Ordering::Relaxed), 3);

        let kinds: Vec<_> = drain(&mut events)
            .iter()
            .map(|m| m.message.kind())
            .collect();
        assert_eq!(
            kinds,
            vec!["heartbeat", "warning", "warning", "warning", "error", "terminating"]
        );
    }

    #[test]
    fn test_stop_is_seen_during_failure_backoff() {
        let (events_tx, _events) = mpsc::unbounded_channel();
        let config = WorkerConfig::new("AB".to_string(), PatternType::Prefix, 100);
        let settings = WorkerSettings {
            window: Duration::from_millis(20),
            max_consecutive_failures: 100,
            failure_backoff_initial: Duration::from_millis(800),
            failure_backoff_max: Duration::from_millis(800),
            ..test_settings()
        };
        let handle = spawn_worker(
            &config,
            1,
            settings,
            Arc::new(AlwaysFail(AtomicU64::new(0))),
            events_tx,
        )
        .unwrap();

        // First attempt fails at once, so the worker is now in an 800ms backoff
        thread::sleep(Duration::from_millis(150));
        let stopped_at = Instant::now();
        assert!(handle.stop());
        let exit = handle.join().unwrap();
        let latency = stopped_at.elapsed();

        assert_eq!(exit.reason, ExitReason::Stopped);
        assert!(
            latency < Duration::from_millis(300),
            "stop took {:?}",
            latency
        );
    }

    #[test]
    fn test_throttled_worker_duty_cycle() {
        let (events_tx, _events) = mpsc::unbounded_channel();
        let config = WorkerConfig::new("AB".to_string(), PatternType::Prefix, 30);
        let handle = spawn_worker(
            &config,
            1,
            test_settings(),
            Arc::new(Spin(Duration::from_micros(200))),
            events_tx,
        )
        .unwrap();

        thread::sleep(Duration::from_millis(1500));
        handle.stop();
        let exit = handle.join().unwrap();

        assert!(
            (0.15..=0.45).contains(&exit.duty_cycle),
            "duty cycle was {}",
            exit.duty_cycle
        );
    }
}
