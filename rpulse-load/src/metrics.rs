//! Request metrics: collection and the end-of-run report.
//!
//! ```text
//! virtual user ──Recorder::record()──► mpsc ──► Collector::run()
//!                                                 ├─ latency histogram (µs)
//!                                                 ├─ per-check passes / fails
//!                                                 └─ iteration / job counters
//!                                                        │
//!                                    Summary::report() ◄─┘  (after every Recorder is dropped)
//! ```

use anyhow::Context;
use hdrhistogram::Histogram;
use serde::Serialize;
use std::{collections::BTreeMap, fmt, path::Path, time::Duration};
use tokio::sync::mpsc;

use crate::checks::{CHECK_NAMES, Check};
use crate::config::ThresholdConfig;
use crate::errors::{Error, Result};
use crate::events::JobAction;

/// One observation pushed by a virtual user.
#[derive(Debug)]
pub enum Sample {
    Request {
        action: JobAction,
        duration: Duration,
        checks: [Check; 2],
    },
    JobCompleted,
    JobAborted,
    Iteration,
}

/// Sending half handed to every virtual user.
#[derive(Debug, Clone)]
pub struct Recorder {
    tx: mpsc::Sender<Sample>,
}

impl Recorder {
    pub async fn record(&self, sample: Sample) {
        if self.tx.send(sample).await.is_err() {
            tracing::warn!("Metrics collector has shut down, dropping sample");
        }
    }
}

/// Receiving half; folds samples into a [`Summary`] until every [`Recorder`] is gone.
pub struct Collector {
    rx: mpsc::Receiver<Sample>,
    summary: Summary,
}

pub fn channel(capacity: usize) -> Result<(Recorder, Collector)> {
    let (tx, rx) = mpsc::channel(capacity);
    let summary = Summary::new()?;
    Ok((Recorder { tx }, Collector { rx, summary }))
}

impl Collector {
    pub async fn run(mut self) -> Summary {
        while let Some(sample) = self.rx.recv().await {
            self.summary.record(sample);
        }
        tracing::debug!(requests = self.summary.total_requests(), "Metrics collector drained");
        self.summary
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CheckTally {
    pub passes: u64,
    pub fails: u64,
}

#[derive(Debug)]
pub struct Summary {
    requests: BTreeMap<JobAction, u64>,
    checks: BTreeMap<&'static str, CheckTally>,
    latencies: Histogram<u64>,
    iterations: u64,
    jobs_completed: u64,
    jobs_aborted: u64,
}

impl Summary {
    pub fn new() -> Result<Self> {
        let latencies = Histogram::<u64>::new(3).map_err(|e| Error::Internal {
            operation: format!("create latency histogram: {e}"),
        })?;

        Ok(Self {
            requests: BTreeMap::new(),
            checks: CHECK_NAMES.iter().map(|name| (*name, CheckTally::default())).collect(),
            latencies,
            iterations: 0,
            jobs_completed: 0,
            jobs_aborted: 0,
        })
    }

    pub fn record(&mut self, sample: Sample) {
        match sample {
            Sample::Request { action, duration, checks } => {
                *self.requests.entry(action).or_default() += 1;
                let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
                if let Err(e) = self.latencies.record(micros) {
                    tracing::warn!(micros, error = %e, "Failed to record request latency");
                }
                for check in checks {
                    let tally = self.checks.entry(check.name).or_default();
                    if check.passed {
                        tally.passes += 1;
                    } else {
                        tally.fails += 1;
                    }
                }
            }
            Sample::JobCompleted => self.jobs_completed += 1,
            Sample::JobAborted => self.jobs_aborted += 1,
            Sample::Iteration => self.iterations += 1,
        }
    }

    pub fn total_requests(&self) -> u64 {
        self.requests.values().sum()
    }

    pub fn requests(&self, action: JobAction) -> u64 {
        self.requests.get(&action).copied().unwrap_or(0)
    }

    pub fn check(&self, name: &str) -> CheckTally {
        self.checks.get(name).copied().unwrap_or_default()
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn jobs_completed(&self) -> u64 {
        self.jobs_completed
    }

    pub fn jobs_aborted(&self) -> u64 {
        self.jobs_aborted
    }

    pub fn report(&self, elapsed: Duration, thresholds: &ThresholdConfig) -> Report {
        let total_requests = self.total_requests();
        let seconds = elapsed.as_secs_f64();
        let latency = LatencyReport::from_histogram(&self.latencies);

        let limit_ms = duration_ms(thresholds.http_req_duration_p99);
        let p99 = ThresholdOutcome {
            name: format!(
                "http_req_duration p(99) < {}",
                humantime::format_duration(thresholds.http_req_duration_p99)
            ),
            observed_ms: latency.p99_ms,
            limit_ms,
            passed: latency.p99_ms < limit_ms,
        };

        Report {
            total_time_seconds: seconds,
            requests_per_second: if seconds > 0.0 { total_requests as f64 / seconds } else { 0.0 },
            total_requests,
            requests_by_action: self.requests.clone(),
            iterations: self.iterations,
            jobs_completed: self.jobs_completed,
            jobs_aborted: self.jobs_aborted,
            checks: self
                .checks
                .iter()
                .map(|(name, tally)| CheckReport {
                    name: name.to_string(),
                    passes: tally.passes,
                    fails: tally.fails,
                })
                .collect(),
            latency,
            thresholds: vec![p99],
        }
    }
}

fn duration_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyReport {
    pub min_ms: f64,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

impl LatencyReport {
    fn from_histogram(latencies: &Histogram<u64>) -> Self {
        if latencies.is_empty() {
            return Self::default();
        }

        let ms = |micros: u64| micros as f64 / 1000.0;
        Self {
            min_ms: ms(latencies.min()),
            avg_ms: latencies.mean() / 1000.0,
            p50_ms: ms(latencies.value_at_percentile(50.0)),
            p90_ms: ms(latencies.value_at_percentile(90.0)),
            p95_ms: ms(latencies.value_at_percentile(95.0)),
            p99_ms: ms(latencies.value_at_percentile(99.0)),
            max_ms: ms(latencies.max()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckReport {
    pub name: String,
    pub passes: u64,
    pub fails: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdOutcome {
    pub name: String,
    pub observed_ms: f64,
    pub limit_ms: f64,
    pub passed: bool,
}

/// End-of-run results, printed as text and optionally exported as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub total_time_seconds: f64,
    pub requests_per_second: f64,
    pub total_requests: u64,
    pub requests_by_action: BTreeMap<JobAction, u64>,
    pub iterations: u64,
    pub jobs_completed: u64,
    pub jobs_aborted: u64,
    pub checks: Vec<CheckReport>,
    pub latency: LatencyReport,
    pub thresholds: Vec<ThresholdOutcome>,
}

impl Report {
    pub fn thresholds_passed(&self) -> bool {
        self.thresholds.iter().all(|threshold| threshold.passed)
    }

    pub fn failed_checks(&self) -> u64 {
        self.checks.iter().map(|check| check.fails).sum()
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("write summary to {}", path.display()))?;
        Ok(())
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = |passed: bool| if passed { '✓' } else { '✗' };

        writeln!(f, "rpulse-load summary")?;
        writeln!(f, "  duration .......... {:.1}s", self.total_time_seconds)?;
        writeln!(f, "  iterations ........ {}", self.iterations)?;
        writeln!(
            f,
            "  jobs .............. {} completed, {} aborted",
            self.jobs_completed, self.jobs_aborted
        )?;
        write!(
            f,
            "  http_reqs ......... {} ({:.2}/s)",
            self.total_requests, self.requests_per_second
        )?;
        for (action, count) in &self.requests_by_action {
            write!(f, " {action}={count}")?;
        }
        writeln!(f)?;
        let l = &self.latency;
        writeln!(
            f,
            "  http_req_duration . min={:.2}ms avg={:.2}ms p(50)={:.2}ms p(90)={:.2}ms p(95)={:.2}ms p(99)={:.2}ms max={:.2}ms",
            l.min_ms, l.avg_ms, l.p50_ms, l.p90_ms, l.p95_ms, l.p99_ms, l.max_ms
        )?;
        writeln!(f, "  checks")?;
        for check in &self.checks {
            writeln!(
                f,
                "    {} {}: {} passed, {} failed",
                mark(check.fails == 0),
                check.name,
                check.passes,
                check.fails
            )?;
        }
        writeln!(f, "  thresholds")?;
        for threshold in &self.thresholds {
            writeln!(
                f,
                "    {} {} (observed {:.2}ms)",
                mark(threshold.passed),
                threshold.name,
                threshold.observed_ms
            )?;
        }
        Ok(())
    }
}
