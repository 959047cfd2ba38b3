//! Vanity Pool - Main Application
//!
//! Runs a worker pool until a matching identifier is found, the user
//! interrupts, or every worker slot has given up.

use anyhow::{anyhow, Context};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vanity_pool::{
    config::Config,
    logging::init_logging,
    utils::{estimate_time_to_match, format_count, format_speed},
    Ed25519KeyGenerator, GenerationResult, KeyGenerator, PatternMatcher, PatternType, PoolEvent,
    PoolMetrics, WorkerPool, APP_NAME, APP_VERSION,
};

/// How a run ended
enum Outcome {
    Found(GenerationResult),
    Interrupted,
    Exhausted,
    Closed,
}

/// Borrowed view of a result for `--json` output
#[derive(Serialize)]
struct FoundReport<'a> {
    public_id: &'a str,
    private_key: &'a str,
    pattern: &'a str,
    pattern_type: PatternType,
    attempts: u64,
    worker_id: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().await.context("Failed to load configuration")?;

    if config.print_config {
        print_configuration(&config)?;
        return Ok(());
    }

    let _log_guard = init_logging(&config.logging_settings())?;

    let pattern = config
        .pattern
        .clone()
        .ok_or_else(|| anyhow!("A pattern is required (--pattern)"))?;
    let generator: Arc<dyn KeyGenerator> = Arc::new(Ed25519KeyGenerator::new());
    let matcher = PatternMatcher::new(&pattern, config.pattern_type)?;
    let expected_attempts = matcher.estimated_attempts(generator.alphabet_size());

    info!("Starting {} v{}", APP_NAME, APP_VERSION);
    info!(
        "Searching for {} (expected attempts: {}, difficulty: {}, generator: {})",
        matcher,
        format_count(expected_attempts.min(u64::MAX as f64) as u64),
        matcher.difficulty_description(generator.alphabet_size()),
        generator.name()
    );

    let (pool, mut events) = WorkerPool::new(config.pool_settings(), Arc::clone(&generator));
    let workers = pool
        .start(&pattern, config.pattern_type, config.cpu_usage)
        .await
        .context("Failed to start worker pool")?;
    info!(
        "Started {} workers at {}% CPU each",
        workers, config.cpu_usage
    );

    let (metrics_tx, metrics_rx) = watch::channel(None::<PoolMetrics>);
    let cancel = CancellationToken::new();
    let reporter = tokio::spawn(report_progress(
        metrics_rx,
        cancel.clone(),
        config.report_interval_duration(),
        expected_attempts,
    ));

    let mut failed_slots = HashSet::new();
    let outcome = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(PoolEvent::Metrics(metrics)) => {
                    metrics_tx.send_replace(Some(metrics));
                }
                Some(PoolEvent::Success(result)) => break Outcome::Found(result),
                Some(PoolEvent::WorkerFailed { worker_id, reason }) => {
                    warn!("Worker {} abandoned: {}", worker_id, reason);
                    failed_slots.insert(worker_id);
                    if failed_slots.len() >= workers {
                        break Outcome::Exhausted;
                    }
                }
                None => break Outcome::Closed,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping workers");
                break Outcome::Interrupted;
            }
        }
    };

    cancel.cancel();
    if let Err(e) = reporter.await {
        warn!("Progress reporter failed: {}", e);
    }

    let total_attempts = metrics_tx
        .borrow()
        .as_ref()
        .map(|m| m.total_attempts)
        .unwrap_or_default();

    if let Err(e) = pool.shutdown().await {
        error!("Pool shutdown failed: {}", e);
    }

    match outcome {
        Outcome::Found(result) => {
            print_result(&result, &matcher, config.json)?;
            Ok(())
        }
        Outcome::Interrupted => {
            info!(
                "Stopped after roughly {} attempts without a match",
                format_count(total_attempts)
            );
            Ok(())
        }
        Outcome::Exhausted => Err(anyhow!(
            "Every worker gave up after repeated failures; see the log for details"
        )),
        Outcome::Closed => Err(anyhow!("Worker pool stopped unexpectedly")),
    }
}

/// Log a progress line every `every` until cancelled
async fn report_progress(
    mut metrics: watch::Receiver<Option<PoolMetrics>>,
    cancel: CancellationToken,
    every: Duration,
    expected_attempts: f64,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(snapshot) = metrics.borrow_and_update().clone() else {
                    continue;
                };
                let eta = estimate_time_to_match(expected_attempts, snapshot.rolling_speed)
                    .map(|d| humantime::format_duration(d).to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                info!(
                    "{} attempts, {} ({} of {} workers active), expected time to match: {}",
                    format_count(snapshot.total_attempts),
                    format_speed(snapshot.rolling_speed),
                    snapshot.active_workers,
                    snapshot.total_workers,
                    eta
                );
            }
        }
    }
}

/// Print the matching keypair
fn print_result(
    result: &GenerationResult,
    matcher: &PatternMatcher,
    json: bool,
) -> anyhow::Result<()> {
    let private_key = result.private_key.expose_str()?;

    if json {
        let report = FoundReport {
            public_id: &result.public_id,
            private_key,
            pattern: matcher.pattern(),
            pattern_type: matcher.pattern_type(),
            attempts: result.attempts,
            worker_id: result.worker_id,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "Found a match for {} after {} attempts (worker {})",
            matcher,
            format_count(result.attempts),
            result.worker_id
        );
        println!("public:  {}", result.public_id);
        println!("private: {}", private_key);
        println!();
        println!("IMPORTANT: Keep your private key secure!");
    }

    Ok(())
}

/// Print current configuration
fn print_configuration(config: &Config) -> anyhow::Result<()> {
    let config_yaml = serde_yaml::to_string(config)?;
    println!("{}", config_yaml);
    Ok(())
}
