//! Job lifecycle emitter.
//!
//! ```text
//! run_iteration(vu, iter)
//!   ├─ derive_job_id()                    // vu * 10000 + iter
//!   ├─ emit(queued)       ─┐
//!   ├─ pause [1s, 3s)      │  emit():
//!   ├─ emit(in_progress)  ─┤    ├─ build_payload()   // reads JobTracker for `completed`
//!   ├─ pause [2s, 5s)      │    ├─ sign()            // HMAC over the exact form body
//!   ├─ emit(completed)    ─┘    ├─ POST + checks     // failures are metrics, not errors
//!   └─ pause [0s, 2s)           └─ update JobTracker
//! ```
//!
//! One emitter belongs to one virtual user. It owns that user's job tracker and random source,
//! so nothing here is shared across tasks except the HTTP client and the metrics recorder.

use chrono::{DateTime, Utc};
use rand::prelude::RngExt;
use rand::rngs::StdRng;
use reqwest::header::CONTENT_TYPE;
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

use crate::checks::{self, Check};
use crate::config::{Config, PauseConfig, PauseRange};
use crate::errors::Result;
use crate::events::{self, JobAction, SELF_HOSTED_LABEL, WebhookEvent};
use crate::metrics::{Recorder, Sample};
use crate::signing::{self, SIGNATURE_HEADER};
use crate::tracker::JobTracker;

/// Multiplier separating the job id ranges of virtual users.
///
/// Ids stay unique only while a virtual user runs fewer than this many iterations.
pub const JOB_ID_STRIDE: i64 = 10_000;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Job id for a virtual user's iteration: `virtual_user * 10000 + iteration`.
pub fn derive_job_id(virtual_user: u32, iteration: u64) -> i64 {
    i64::from(virtual_user) * JOB_ID_STRIDE + iteration as i64
}

/// A form body together with its `X-Hub-Signature-256` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedBody {
    pub body: String,
    pub signature: String,
}

/// Outcome of one webhook POST.
#[derive(Debug, Clone, Copy)]
pub struct Delivery {
    /// `None` when no response arrived at all
    pub status: Option<u16>,
    pub duration: Duration,
    pub checks: [Check; 2],
}

impl Delivery {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|check| check.passed)
    }
}

/// Signs and posts webhook events to one endpoint.
#[derive(Clone)]
pub struct WebhookClient {
    http: reqwest::Client,
    url: Url,
    secret: String,
}

impl WebhookClient {
    pub fn new(url: Url, secret: impl Into<String>, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            http: builder.build()?,
            url,
            secret: secret.into(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.webhook_url.clone(), config.webhook_secret.clone(), config.request_timeout)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Form-encode an event and sign the resulting bytes.
    pub fn sign(&self, event: &WebhookEvent) -> Result<SignedBody> {
        let body = event.to_form_body()?;
        let signature = signing::sign(body.as_bytes(), &self.secret);

        Ok(SignedBody { body, signature })
    }

    /// POST an event and evaluate the response checks.
    ///
    /// The recorded duration runs from handing the request to the client until the response body
    /// has been read, so it includes any DNS lookup and connection setup the pooled client needs.
    /// Transport errors are not returned: they show up as failed checks with no status.
    pub async fn send(&self, event: &WebhookEvent) -> Result<Delivery> {
        let SignedBody { body, signature } = self.sign(event)?;

        let start = Instant::now();
        let response = self
            .http
            .post(self.url.as_str())
            .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
            .header(SIGNATURE_HEADER, signature)
            .body(body)
            .send()
            .await;

        let (status, body) = match response {
            Ok(response) => {
                let status = response.status().as_u16();
                match response.bytes().await {
                    Ok(bytes) => (Some(status), Some(bytes)),
                    Err(e) => {
                        tracing::warn!(job_id = event.job_id(), status, error = %e, "Failed to read webhook response body");
                        (Some(status), None)
                    }
                }
            }
            Err(e) => {
                tracing::warn!(
                    job_id = event.job_id(),
                    action = %event.action,
                    url = %self.url,
                    error = %e,
                    "Webhook request failed"
                );
                (None, None)
            }
        };
        let duration = start.elapsed();

        Ok(Delivery {
            status,
            duration,
            checks: checks::evaluate(status, body.as_deref()),
        })
    }
}

/// Drives synthetic jobs through `queued` → `in_progress` → `completed` for one virtual user.
pub struct JobLifecycleEmitter {
    client: Arc<WebhookClient>,
    recorder: Recorder,
    tracker: JobTracker,
    rng: StdRng,
    pauses: PauseConfig,
    self_hosted_probability: f64,
}

impl JobLifecycleEmitter {
    pub fn new(
        client: Arc<WebhookClient>,
        recorder: Recorder,
        rng: StdRng,
        pauses: PauseConfig,
        self_hosted_probability: f64,
    ) -> Self {
        Self {
            client,
            recorder,
            tracker: JobTracker::default(),
            rng,
            pauses,
            self_hosted_probability,
        }
    }

    pub fn from_config(client: Arc<WebhookClient>, recorder: Recorder, config: &Config, rng: StdRng) -> Self {
        Self::new(
            client,
            recorder,
            rng,
            config.pauses,
            config.self_hosted_probability,
        )
    }

    pub fn tracker(&self) -> &JobTracker {
        &self.tracker
    }

    /// Labels are drawn per event, not per job.
    fn draw_labels(&mut self) -> Vec<String> {
        if self.rng.random_bool(self.self_hosted_probability) {
            vec![SELF_HOSTED_LABEL.to_string()]
        } else {
            Vec::new()
        }
    }

    pub fn build_payload(
        &mut self,
        job_id: i64,
        action: JobAction,
        created_at: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<WebhookEvent> {
        let labels = self.draw_labels();
        WebhookEvent::build(job_id, action, created_at, at, labels, &self.tracker)
    }

    /// Build, sign and post one transition, then record it in the job tracker.
    ///
    /// Only a sequencing error (`completed` before `in_progress`) fails; it is detected before
    /// anything is sent.
    pub async fn emit(
        &mut self,
        job_id: i64,
        action: JobAction,
        created_at: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<Delivery> {
        let event = self.build_payload(job_id, action, created_at, at)?;
        let delivery = self.client.send(&event).await?;

        self.recorder
            .record(Sample::Request {
                action,
                duration: delivery.duration,
                checks: delivery.checks,
            })
            .await;

        if !delivery.passed() {
            tracing::debug!(job_id, %action, status = ?delivery.status, "Webhook checks failed");
        }

        match action {
            JobAction::Queued => self.tracker.queue(job_id, created_at),
            JobAction::InProgress => self.tracker.start(job_id, created_at, at),
            JobAction::Completed => {
                self.tracker.remove(job_id);
            }
        }

        Ok(delivery)
    }

    /// Run one full iteration and return the job id it used.
    ///
    /// A sequencing failure aborts the job with an error log; the iteration still finishes so
    /// the virtual user can carry on.
    pub async fn run_iteration(&mut self, virtual_user: u32, iteration: u64) -> i64 {
        let job_id = derive_job_id(virtual_user, iteration);

        match self.run_job(job_id).await {
            Ok(()) => self.recorder.record(Sample::JobCompleted).await,
            Err(e) => {
                tracing::error!(job_id, virtual_user, iteration, error = %e, "Aborting job lifecycle");
                self.tracker.remove(job_id);
                self.recorder.record(Sample::JobAborted).await;
            }
        }

        self.pause(self.pauses.between_iterations).await;
        self.recorder.record(Sample::Iteration).await;
        job_id
    }

    async fn run_job(&mut self, job_id: i64) -> Result<()> {
        let created_at = events::now();
        self.emit(job_id, JobAction::Queued, created_at, created_at).await?;
        self.pause(self.pauses.after_queued).await;

        let started_at = events::now();
        self.emit(job_id, JobAction::InProgress, created_at, started_at).await?;
        self.pause(self.pauses.after_in_progress).await;

        self.emit(job_id, JobAction::Completed, created_at, events::now()).await?;
        Ok(())
    }

    async fn pause(&mut self, range: PauseRange) {
        let duration = draw_pause(&mut self.rng, range);
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

fn draw_pause(rng: &mut StdRng, range: PauseRange) -> Duration {
    if range.max <= range.min {
        return range.min;
    }
    Duration::from_secs_f64(rng.random_range(range.min.as_secs_f64()..range.max.as_secs_f64()))
}
