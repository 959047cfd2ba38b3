//! Vanity Pool
//!
//! Brute-force search for a keypair whose public identifier carries a chosen
//! prefix or suffix:
//! - Case-insensitive prefix/suffix pattern matching
//! - Ed25519 key derivation from random seeds, with secret buffers wiped after use
//! - Duty-cycle throttled workers on dedicated threads
//! - A supervising pool with heartbeat checks, bounded restarts and aggregate metrics

pub mod config;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod matcher;
pub mod monitor;
pub mod pool;
pub mod types;
pub mod utils;
pub mod worker;

pub use config::Config;
pub use crypto::{DerivedKeypair, Ed25519KeyGenerator, KeyGenerator, SecretBuffer};
pub use error::{Error, Result};
pub use matcher::{PatternMatcher, PatternType};
pub use monitor::{MonitorConfig, PerformanceMonitor};
pub use pool::{PoolEvent, PoolSettings, WorkerCountPolicy, WorkerPool};
pub use types::*;

/// Application information
pub const APP_NAME: &str = "vanity-pool";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const APP_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
