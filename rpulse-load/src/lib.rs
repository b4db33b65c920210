//! # rpulse-load: webhook load generator for rpulse
//!
//! `rpulse-load` exercises a webhook receiver that tracks CI job lifecycles. Each virtual user
//! drives synthetic jobs through `queued` → `in_progress` → `completed`, posting one signed
//! delivery per transition, while the number of virtual users follows a ramping stage profile.
//!
//! ## Wire format
//!
//! Every delivery is a form-encoded POST:
//!
//! ```text
//! POST /webhook
//! Content-Type: application/x-www-form-urlencoded
//! X-Hub-Signature-256: sha256=<hex hmac-sha256 of the body>
//!
//! payload=%7B%22action%22%3A%22queued%22%2C%22workflow_job%22%3A%7B...%7D%7D
//! ```
//!
//! The signature covers the exact encoded bytes that are sent. `created_at` stays the same for all
//! three events of a job, and the `completed` event repeats the `started_at` recorded at the
//! `in_progress` transition.
//!
//! ## Results
//!
//! Two checks run on every response (`status was 200` and `response has success status`). Request
//! durations go into a latency histogram, and the run passes when the 99th percentile stays below
//! the configured threshold (300ms by default). Failed checks never stop a job. The only
//! hard failure is a `completed` event for a job whose start was never recorded.
//!
//! ## Modules
//!
//! - [`config`]: YAML + environment configuration and CLI arguments
//! - [`stages`]: the ramping virtual user profile
//! - [`events`], [`tracker`], [`signing`]: payloads, per-user job state, HMAC signatures
//! - [`emitter`]: the per-user job lifecycle and HTTP delivery
//! - [`runner`]: virtual user scheduling
//! - [`checks`], [`metrics`]: response checks, latency histogram and the final report
//! - [`receiver`]: a stub receiver that verifies and counts deliveries

pub mod checks;
pub mod config;
pub mod emitter;
pub mod errors;
pub mod events;
pub mod metrics;
pub mod receiver;
pub mod runner;
pub mod signing;
pub mod stages;
pub mod telemetry;
pub mod tracker;

#[cfg(test)]
mod test;

pub use config::Config;
pub use errors::{Error, Result};
pub use runner::LoadTest;
