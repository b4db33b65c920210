//! Stub webhook receiver.
//!
//! Accepts the same deliveries as the rpulse webhook endpoint: the `X-Hub-Signature-256` header is
//! checked against the raw body, the body is decoded from `payload=<json>` and the event is
//! counted. Handy as a local target for the load generator and for checking its wire format.
//!
//! - `POST /webhook` answers `{"status":"success"}`, or `{"error": "..."}` with 400/401
//! - `GET /stats` returns the counts so far

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::HeaderMap,
    routing::{get, post},
};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::errors::{Error, Result};
use crate::events::{JobAction, RunnerType, WebhookEvent};
use crate::signing::{self, SIGNATURE_HEADER};

/// Events received so far, by action and by runner type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReceiverCounts {
    pub queued: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub self_hosted: u64,
    pub github_hosted: u64,
}

impl ReceiverCounts {
    fn record(&mut self, event: &WebhookEvent) {
        match event.action {
            JobAction::Queued => self.queued += 1,
            JobAction::InProgress => self.in_progress += 1,
            JobAction::Completed => self.completed += 1,
        }
        match event.runner_type() {
            RunnerType::SelfHosted => self.self_hosted += 1,
            RunnerType::GithubHosted => self.github_hosted += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.queued + self.in_progress + self.completed
    }
}

#[derive(Clone)]
pub struct ReceiverState {
    secret: Arc<str>,
    counts: Arc<RwLock<ReceiverCounts>>,
}

impl ReceiverState {
    /// An empty secret disables signature validation.
    pub fn new(secret: &str) -> Self {
        if secret.is_empty() {
            warn!("Webhook secret not set, signature validation disabled");
        }
        Self {
            secret: Arc::from(secret),
            counts: Arc::new(RwLock::new(ReceiverCounts::default())),
        }
    }

    pub async fn counts(&self) -> ReceiverCounts {
        *self.counts.read().await
    }
}

pub fn router(state: ReceiverState) -> Router {
    Router::new()
        .route("/webhook", post(handle_webhook))
        .route("/stats", get(stats))
        .with_state(state)
}

/// Serve the receiver until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: ReceiverState, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    info!("Webhook receiver listening on http://{}/webhook", listener.local_addr()?);

    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

fn authenticate(headers: &HeaderMap, body: &[u8], secret: &str) -> Result<()> {
    if secret.is_empty() {
        return Ok(());
    }

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| Error::Unauthenticated {
            message: "Missing signature header".to_string(),
        })?;

    signing::verify_signature(body, signature, secret).map_err(|e| Error::Unauthenticated { message: e.to_string() })
}

async fn handle_webhook(State(state): State<ReceiverState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    authenticate(&headers, &body, &state.secret)?;

    let event = WebhookEvent::from_form_body(&body)?;
    let job = &event.workflow_job;

    if let (JobAction::InProgress, Some(started_at)) = (event.action, job.started_at) {
        let queue_time = started_at - job.created_at;
        debug!(job_id = job.id, queue_time_ms = queue_time.num_milliseconds(), "Job started");
    }
    debug!(job_id = job.id, action = %event.action, runner_type = ?event.runner_type(), "Webhook received");

    state.counts.write().await.record(&event);

    Ok(Json(json!({ "status": "success" })))
}

async fn stats(State(state): State<ReceiverState>) -> Json<ReceiverCounts> {
    Json(state.counts().await)
}
