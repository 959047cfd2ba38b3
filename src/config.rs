//! Configuration management for the vanity pool
//!
//! Supports configuration via command line arguments, environment variables,
//! and configuration files (YAML/JSON) with validation and defaults.

use crate::logging::{LogFormat, LoggingSettings};
use crate::matcher::PatternType;
use crate::pool::{PoolSettings, WorkerCountPolicy};
use crate::types::{MAX_CPU_USAGE_PERCENT, MIN_CPU_USAGE_PERCENT};
use crate::worker::WorkerSettings;
use crate::{Error, Result, APP_NAME};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };
        f.write_str(s)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[command(
    name = APP_NAME,
    version = env!("CARGO_PKG_VERSION"),
    about = "Vanity identifier generator",
    long_about = "Searches for a keypair whose public identifier starts or ends with a chosen pattern, using a throttled, self-healing pool of worker threads"
)]
pub struct Config {
    /// Print the parsed configuration and exit
    #[arg(long)]
    #[serde(skip)]
    pub print_config: bool,

    /// Configuration file path (YAML or JSON)
    #[arg(long, value_name = "FILE")]
    #[serde(skip)]
    pub config_file: Option<PathBuf>,

    /// Pattern to search for (ASCII letters and digits)
    #[arg(short = 'p', long, env = "VANITY_PATTERN")]
    #[serde(default)]
    pub pattern: Option<String>,

    /// Where the pattern must appear
    #[arg(short = 't', long, value_enum, default_value = "prefix")]
    #[serde(default)]
    pub pattern_type: PatternType,

    /// CPU usage per worker in percent (10-100, steps of 10 recommended)
    #[arg(short = 'u', long, default_value = "100")]
    #[serde(default = "default_cpu_usage")]
    pub cpu_usage: u8,

    /// Share of the available parallelism to use for workers
    #[arg(long, default_value = "0.8")]
    #[serde(default = "default_worker_fraction")]
    pub worker_fraction: f64,

    /// Override the detected number of logical CPUs
    #[arg(long)]
    #[serde(default)]
    pub max_parallelism: Option<usize>,

    /// Throttling window in milliseconds
    #[arg(long, default_value = "50")]
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Worker heartbeat interval in milliseconds
    #[arg(long, default_value = "5000")]
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Restart a worker silent for longer than this many seconds
    #[arg(long, default_value = "35")]
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,

    /// Seconds between worker health checks
    #[arg(long, default_value = "5")]
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,

    /// Milliseconds between pool metrics
    #[arg(long, default_value = "1000")]
    #[serde(default = "default_metrics_interval_ms")]
    pub metrics_interval_ms: u64,

    /// Ignore worker metrics older than this many milliseconds
    #[arg(long, default_value = "2000")]
    #[serde(default = "default_metrics_staleness_ms")]
    pub metrics_staleness_ms: u64,

    /// Delay before a failed worker is respawned, in milliseconds
    #[arg(long, default_value = "250")]
    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: u64,

    /// Worker error reports that trigger a restart
    #[arg(long, default_value = "3")]
    #[serde(default = "default_error_restart_threshold")]
    pub error_restart_threshold: u32,

    /// Consecutive failed attempts before a worker stops itself
    #[arg(long, default_value = "5")]
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Restarts allowed per worker within the restart window
    #[arg(long, default_value = "5")]
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Restart window in seconds
    #[arg(long, default_value = "60")]
    #[serde(default = "default_restart_window_secs")]
    pub restart_window_secs: u64,

    /// Upper bound on waiting for worker threads at shutdown, in seconds
    #[arg(long, default_value = "5")]
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Seconds between progress lines
    #[arg(long, default_value = "5")]
    #[serde(default = "default_report_interval_secs")]
    pub report_interval_secs: u64,

    /// Log level, used when RUST_LOG is not set
    #[arg(short = 'l', long, value_enum, default_value = "info", env = "VANITY_LOG_LEVEL")]
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    /// Log output format
    #[arg(long, value_enum, default_value = "plain")]
    #[serde(default)]
    pub log_format: LogFormat,

    /// Write logs to this file instead of stderr
    #[arg(long, value_name = "FILE")]
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Print the result as JSON
    #[arg(long)]
    #[serde(default)]
    pub json: bool,
}

/// Replace fields of `$target` still at their default with the value from `$file`
macro_rules! fill_defaults {
    ($target:ident, $file:ident, $defaults:ident; $($field:ident),+ $(,)?) => {
        $(
            if $target.$field == $defaults.$field {
                $target.$field = $file.$field;
            }
        )+
    };
}

impl Config {
    /// Parse the command line, merge the config file if given, and validate
    pub async fn load() -> Result<Self> {
        let mut config = Self::parse();

        if let Some(config_file) = config.config_file.clone() {
            let file_config = Self::load_from_file(&config_file).await?;
            config = config.merge_with_file(file_config)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;

        if path.extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::from_str(&content).map_err(Error::from)
        } else {
            // Default to YAML
            serde_yaml::from_str(&content).map_err(Error::from)
        }
    }

    /// Configuration with every option at its default
    pub fn defaults() -> Result<Self> {
        Self::try_parse_from([APP_NAME])
            .map_err(|e| Error::config(format!("Failed to build default configuration: {}", e)))
    }

    /// Merge CLI config with file config. Values given on the command line
    /// win; the file fills in whatever is still at its default.
    pub fn merge_with_file(self, file_config: Self) -> Result<Self> {
        let defaults = Self::defaults()?;
        let mut merged = self;

        fill_defaults!(merged, file_config, defaults;
            pattern,
            pattern_type,
            cpu_usage,
            worker_fraction,
            max_parallelism,
            window_ms,
            heartbeat_interval_ms,
            heartbeat_timeout_secs,
            health_check_interval_secs,
            metrics_interval_ms,
            metrics_staleness_ms,
            restart_backoff_ms,
            error_restart_threshold,
            max_consecutive_failures,
            max_restarts,
            restart_window_secs,
            shutdown_timeout_secs,
            report_interval_secs,
            log_level,
            log_format,
            log_file,
            json,
        );

        Ok(merged)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !self.print_config {
            let pattern = self
                .pattern
                .as_deref()
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .ok_or_else(|| Error::config("A pattern is required (--pattern)"))?;
            if !pattern.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(Error::config(format!(
                    "Pattern must contain ASCII letters and digits only: {:?}",
                    pattern
                )));
            }
        }

        if !(MIN_CPU_USAGE_PERCENT..=MAX_CPU_USAGE_PERCENT).contains(&self.cpu_usage) {
            return Err(Error::config(format!(
                "CPU usage must be between {} and {} percent",
                MIN_CPU_USAGE_PERCENT, MAX_CPU_USAGE_PERCENT
            )));
        }

        if !(self.worker_fraction > 0.0 && self.worker_fraction <= 1.0) {
            return Err(Error::config("Worker fraction must be in (0, 1]"));
        }

        if self.max_parallelism == Some(0) {
            return Err(Error::config("Max parallelism must be greater than 0"));
        }

        for (name, value) in [
            ("window-ms", self.window_ms),
            ("heartbeat-interval-ms", self.heartbeat_interval_ms),
            ("health-check-interval-secs", self.health_check_interval_secs),
            ("metrics-interval-ms", self.metrics_interval_ms),
            ("restart-window-secs", self.restart_window_secs),
            ("report-interval-secs", self.report_interval_secs),
        ] {
            if value == 0 {
                return Err(Error::config(format!("{} must be greater than 0", name)));
            }
        }

        if self.heartbeat_timeout_duration() <= self.heartbeat_interval_duration() {
            return Err(Error::config(
                "Heartbeat timeout must be longer than the heartbeat interval",
            ));
        }

        if self.error_restart_threshold == 0 || self.max_consecutive_failures == 0 {
            return Err(Error::config(
                "Error restart threshold and max consecutive failures must be greater than 0",
            ));
        }

        Ok(())
    }

    /// Settings consumed by [`WorkerPool`](crate::pool::WorkerPool)
    pub fn pool_settings(&self) -> PoolSettings {
        let worker_policy = match self.max_parallelism {
            Some(max) => WorkerCountPolicy::new(max, self.worker_fraction),
            None => WorkerCountPolicy::from_host(self.worker_fraction),
        };

        PoolSettings {
            worker_policy,
            worker: WorkerSettings {
                window: self.window_duration(),
                heartbeat_interval: self.heartbeat_interval_duration(),
                max_consecutive_failures: self.max_consecutive_failures,
                ..WorkerSettings::default()
            },
            heartbeat_timeout: self.heartbeat_timeout_duration(),
            health_check_interval: Duration::from_secs(self.health_check_interval_secs),
            metrics_interval: Duration::from_millis(self.metrics_interval_ms),
            metrics_staleness: Duration::from_millis(self.metrics_staleness_ms),
            restart_backoff: Duration::from_millis(self.restart_backoff_ms),
            error_restart_threshold: self.error_restart_threshold,
            max_restarts: self.max_restarts,
            restart_window: Duration::from_secs(self.restart_window_secs),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
        }
    }

    pub fn logging_settings(&self) -> LoggingSettings {
        LoggingSettings {
            level: self.log_level.to_string(),
            format: self.log_format,
            file: self.log_file.clone(),
        }
    }

    /// Get throttling window
    pub fn window_duration(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Get heartbeat interval
    pub fn heartbeat_interval_duration(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Get heartbeat timeout
    pub fn heartbeat_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// Get progress report interval
    pub fn report_interval_duration(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }
}

// Default value functions
fn default_cpu_usage() -> u8 { 100 }
fn default_worker_fraction() -> f64 { 0.8 }
fn default_window_ms() -> u64 { 50 }
fn default_heartbeat_interval_ms() -> u64 { 5000 }
fn default_heartbeat_timeout_secs() -> u64 { 35 }
fn default_health_check_interval_secs() -> u64 { 5 }
fn default_metrics_interval_ms() -> u64 { 1000 }
fn default_metrics_staleness_ms() -> u64 { 2000 }
fn default_restart_backoff_ms() -> u64 { 250 }
fn default_error_restart_threshold() -> u32 { 3 }
fn default_max_consecutive_failures() -> u32 { 5 }
fn default_max_restarts() -> u32 { 5 }
fn default_restart_window_secs() -> u64 { 60 }
fn default_shutdown_timeout_secs() -> u64 { 5 }
fn default_report_interval_secs() -> u64 { 5 }
fn default_log_level() -> LogLevel { LogLevel::Info }

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_defaults() {
        let config = Config::try_parse_from(vec![APP_NAME, "--pattern", "abc"]).unwrap();

        assert_eq!(config.pattern.as_deref(), Some("abc"));
        assert_eq!(config.pattern_type, PatternType::Prefix);
        assert_eq!(config.cpu_usage, 100);
        assert_eq!(config.worker_fraction, 0.8);
        assert_eq!(config.window_ms, 50);
        assert_eq!(config.heartbeat_timeout_secs, 35);
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.log_format, LogFormat::Plain);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_config_from_yaml() {
        let yaml_content = r#"
pattern: "cafe"
pattern_type: suffix
cpu_usage: 40
window_ms: 80
max_parallelism: 3
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let config = Config::load_from_file(temp_file.path()).await.unwrap();

        assert_eq!(config.pattern.as_deref(), Some("cafe"));
        assert_eq!(config.pattern_type, PatternType::Suffix);
        assert_eq!(config.cpu_usage, 40);
        assert_eq!(config.window_ms, 80);
        assert_eq!(config.max_parallelism, Some(3));
        // Missing fields fall back to defaults
        assert_eq!(config.heartbeat_interval_ms, 5000);
        assert_eq!(config.log_level, LogLevel::Info);
    }

    #[tokio::test]
    async fn test_config_from_json() {
        let mut temp_file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(temp_file, r#"{{"pattern": "dog", "log_format": "json"}}"#).unwrap();

        let config = Config::load_from_file(temp_file.path()).await.unwrap();
        assert_eq!(config.pattern.as_deref(), Some("dog"));
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[tokio::test]
    async fn test_cli_takes_precedence_over_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "pattern: file\ncpu_usage: 30\nwindow_ms: 80\n").unwrap();
        let file_config = Config::load_from_file(temp_file.path()).await.unwrap();

        let cli = Config::try_parse_from(vec![APP_NAME, "--pattern", "cli", "--cpu-usage", "70"])
            .unwrap();
        let merged = cli.merge_with_file(file_config).unwrap();

        assert_eq!(merged.pattern.as_deref(), Some("cli"));
        assert_eq!(merged.cpu_usage, 70);
        assert_eq!(merged.window_ms, 80);
    }

    #[test]
    fn test_validation_failures() {
        let parse = |args: &[&str]| {
            let mut full = vec![APP_NAME];
            full.extend_from_slice(args);
            Config::try_parse_from(full).unwrap()
        };

        assert!(parse(&[]).validate().is_err());
        assert!(parse(&["--pattern", "  "]).validate().is_err());
        assert!(parse(&["--pattern", "ab_1"]).validate().is_err());
        assert!(parse(&["--pattern", "ab2"]).validate().is_ok());
        assert!(parse(&["--pattern", "ab", "--cpu-usage", "5"]).validate().is_err());
        assert!(parse(&["--pattern", "ab", "--worker-fraction", "0"]).validate().is_err());
        assert!(parse(&["--pattern", "ab", "--max-parallelism", "0"]).validate().is_err());
        assert!(parse(&["--pattern", "ab", "--window-ms", "0"]).validate().is_err());
        assert!(parse(&["--pattern", "ab", "--heartbeat-timeout-secs", "5"])
            .validate()
            .is_err());

        // --print-config does not need a pattern
        assert!(parse(&["--print-config"]).validate().is_ok());
    }

    #[test]
    fn test_pool_settings_mapping() {
        let config = Config::try_parse_from(vec![
            APP_NAME,
            "--pattern",
            "ab",
            "--max-parallelism",
            "10",
            "--worker-fraction",
            "0.5",
            "--window-ms",
            "20",
            "--restart-backoff-ms",
            "100",
        ])
        .unwrap();

        let settings = config.pool_settings();
        assert_eq!(settings.worker_policy.worker_count(), 5);
        assert_eq!(settings.worker.window, Duration::from_millis(20));
        assert_eq!(settings.worker.max_batch, 4096);
        assert_eq!(settings.restart_backoff, Duration::from_millis(100));
        assert_eq!(settings.heartbeat_timeout, Duration::from_secs(35));
    }

    #[test]
    fn test_config_yaml_roundtrip_skips_cli_only_fields() {
        let config =
            Config::try_parse_from(vec![APP_NAME, "--pattern", "ab", "--print-config"]).unwrap();
        let yaml = serde_yaml::to_string(&config).unwrap();

        assert!(!yaml.contains("print_config"));
        assert!(yaml.contains("pattern: ab"));
    }
}
