//! Load test configuration.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The file path
//! defaults to `rpulse-load.yaml` but can be given via the `-f` flag or the `RPULSE_LOAD_CONFIG`
//! environment variable. A missing file is not an error; every field has a default.
//!
//! ## Loading Priority
//!
//! 1. **YAML config file** - Base configuration
//! 2. **Environment variables** - Variables prefixed with `RPULSE_LOAD_` override YAML values
//! 3. **WEBHOOK_SECRET** - Special case: the variable the rpulse receiver reads, overrides
//!    `webhook_secret` so both sides can share one environment
//!
//! For nested values, use double underscores: `RPULSE_LOAD_PAUSES__AFTER_QUEUED__MIN=0s`.
//!
//! ## Example
//!
//! ```yaml
//! webhook_url: http://localhost:8080/webhook
//! webhook_secret: your_secret_here
//! stages:
//!   - { duration: 30s, target: 15 }
//!   - { duration: 200s, target: 15 }
//!   - { duration: 20s, target: 0 }
//! thresholds:
//!   http_req_duration_p99: 300ms
//! ```

use clap::{Parser, Subcommand};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};
use url::Url;

use crate::errors::Error;
use crate::stages::Stage;

/// Default address for the stub receiver
pub const DEFAULT_RECEIVER_BIND: &str = "127.0.0.1:8080";

/// Environment variables holding the webhook secret, lowest priority first
const SECRET_VARS: [&str; 2] = ["RPULSE_LOAD_WEBHOOK_SECRET", "WEBHOOK_SECRET"];

/// CLI arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "RPULSE_LOAD_CONFIG", default_value = "rpulse-load.yaml")]
    pub config: String,

    /// Validate configuration and exit without generating load.
    #[arg(long)]
    pub validate: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the load test against the configured webhook URL (default)
    Run,
    /// Serve a stub webhook receiver that verifies signatures and answers `{"status":"success"}`
    Receive {
        /// Address to listen on
        #[arg(long, default_value = DEFAULT_RECEIVER_BIND)]
        bind: String,
    },
}

/// Main load test configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Endpoint every lifecycle event is posted to
    pub webhook_url: Url,
    /// Shared HMAC secret used for `X-Hub-Signature-256`
    #[serde(skip_serializing)]
    pub webhook_secret: String,
    /// Per-request timeout; unset means the HTTP client's default
    #[serde(with = "humantime_serde")]
    pub request_timeout: Option<Duration>,
    /// Ramp profile for the number of concurrent virtual users
    pub stages: Vec<Stage>,
    /// How often the driver re-evaluates the virtual user target
    #[serde(with = "humantime_serde")]
    pub ramp_interval: Duration,
    /// How long stopping virtual users may take to finish their current iteration
    #[serde(with = "humantime_serde")]
    pub graceful_stop: Duration,
    /// Think time between lifecycle transitions
    pub pauses: PauseConfig,
    /// Probability that a single event carries the `self-hosted` label
    pub self_hosted_probability: f64,
    /// Seed for reproducible label and pause draws; random when unset
    pub seed: Option<u64>,
    /// Pass/fail criteria evaluated on the final report
    pub thresholds: ThresholdConfig,
    /// Write the final report as JSON to this path
    pub summary_export: Option<PathBuf>,
    /// Capacity of the channel between virtual users and the metrics collector
    pub metrics_channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            webhook_url: Url::parse("http://localhost:8080/webhook").expect("default webhook URL is valid"),
            webhook_secret: String::new(),
            request_timeout: None,
            stages: vec![
                Stage::new(Duration::from_secs(30), 15),
                Stage::new(Duration::from_secs(200), 15),
                Stage::new(Duration::from_secs(20), 0),
            ],
            ramp_interval: Duration::from_millis(100),
            graceful_stop: Duration::from_secs(30),
            pauses: PauseConfig::default(),
            self_hosted_probability: 0.5,
            seed: None,
            thresholds: ThresholdConfig::default(),
            summary_export: None,
            metrics_channel_capacity: 1024,
        }
    }
}

/// A uniformly drawn pause in `[min, max)`. Equal bounds pause exactly `min`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PauseRange {
    #[serde(with = "humantime_serde")]
    pub min: Duration,
    #[serde(with = "humantime_serde")]
    pub max: Duration,
}

impl PauseRange {
    pub const fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub const fn zero() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PauseConfig {
    /// Between `queued` and `in_progress` (default 1s..3s)
    pub after_queued: PauseRange,
    /// Between `in_progress` and `completed` (default 2s..5s)
    pub after_in_progress: PauseRange,
    /// After `completed`, before the next iteration (default 0s..2s)
    pub between_iterations: PauseRange,
}

impl Default for PauseConfig {
    fn default() -> Self {
        Self {
            after_queued: PauseRange::new(Duration::from_secs(1), Duration::from_secs(3)),
            after_in_progress: PauseRange::new(Duration::from_secs(2), Duration::from_secs(5)),
            between_iterations: PauseRange::new(Duration::ZERO, Duration::from_secs(2)),
        }
    }
}

impl PauseConfig {
    /// No think time at all; used by tests and dry runs.
    pub fn none() -> Self {
        Self {
            after_queued: PauseRange::zero(),
            after_in_progress: PauseRange::zero(),
            between_iterations: PauseRange::zero(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThresholdConfig {
    /// 99th percentile request duration must stay strictly below this
    #[serde(with = "humantime_serde")]
    pub http_req_duration_p99: Duration,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            http_req_duration_p99: Duration::from_millis(300),
        }
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        let mut figment = Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("RPULSE_LOAD_").ignore(&["CONFIG", "WEBHOOK_SECRET"]).split("__"));

        // Secrets are taken verbatim; figment's env parsing would turn `007` into a number
        for var in SECRET_VARS {
            if let Ok(secret) = std::env::var(var) {
                figment = figment.merge(Serialized::default("webhook_secret", secret));
            }
        }

        figment
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.webhook_secret.is_empty() {
            return Err(Error::InvalidConfig {
                message: "webhook_secret is not configured. Set WEBHOOK_SECRET or RPULSE_LOAD_WEBHOOK_SECRET, \
                          or add webhook_secret to the config file."
                    .to_string(),
            });
        }

        if self.stages.is_empty() {
            return Err(Error::InvalidConfig {
                message: "at least one stage is required".to_string(),
            });
        }

        if self.stages.iter().all(|stage| stage.duration.is_zero()) {
            return Err(Error::InvalidConfig {
                message: "stages must add up to a non-zero duration".to_string(),
            });
        }

        if self.ramp_interval.is_zero() {
            return Err(Error::InvalidConfig {
                message: "ramp_interval must be greater than zero".to_string(),
            });
        }

        for (name, range) in [
            ("after_queued", self.pauses.after_queued),
            ("after_in_progress", self.pauses.after_in_progress),
            ("between_iterations", self.pauses.between_iterations),
        ] {
            if range.min > range.max {
                return Err(Error::InvalidConfig {
                    message: format!(
                        "pauses.{name}: min ({}) cannot be greater than max ({})",
                        humantime::format_duration(range.min),
                        humantime::format_duration(range.max)
                    ),
                });
            }
        }

        if !(0.0..=1.0).contains(&self.self_hosted_probability) {
            return Err(Error::InvalidConfig {
                message: format!(
                    "self_hosted_probability must be between 0 and 1, got {}",
                    self.self_hosted_probability
                ),
            });
        }

        if self.metrics_channel_capacity == 0 {
            return Err(Error::InvalidConfig {
                message: "metrics_channel_capacity must be greater than zero".to_string(),
            });
        }

        Ok(())
    }
}
