//! End-to-end tests: the load generator against the stub receiver over real sockets.

use std::sync::Arc;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::checks::{RESPONSE_HAS_SUCCESS_STATUS, STATUS_WAS_200};
use crate::config::{Config, PauseConfig, PauseRange};
use crate::emitter::{JobLifecycleEmitter, WebhookClient};
use crate::metrics::{self, CheckTally};
use crate::receiver::{self, ReceiverState};
use crate::stages::Stage;
use crate::LoadTest;

const SECRET: &str = "your_secret_here";

/// Start a receiver on an ephemeral port. Returns its webhook URL and state.
async fn start_receiver(secret: &str) -> (String, ReceiverState, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = ReceiverState::new(secret);
    let shutdown = CancellationToken::new();

    let stop = shutdown.clone();
    tokio::spawn(receiver::serve(listener, state.clone(), async move { stop.cancelled().await }));

    (format!("http://{addr}/webhook"), state, shutdown)
}

fn config(url: &str, secret: &str) -> Config {
    Config {
        webhook_url: url.parse().unwrap(),
        webhook_secret: secret.to_string(),
        pauses: PauseConfig::none(),
        ramp_interval: Duration::from_millis(10),
        graceful_stop: Duration::from_secs(5),
        seed: Some(42),
        ..Default::default()
    }
}

#[test_log::test(tokio::test)]
async fn test_single_lifecycle_is_accepted_by_receiver() {
    let (url, state, shutdown) = start_receiver(SECRET).await;
    let config = config(&url, SECRET);

    let client = Arc::new(WebhookClient::from_config(&config).unwrap());
    let (recorder, collector) = metrics::channel(16).unwrap();
    let mut emitter = JobLifecycleEmitter::from_config(client, recorder, &config, StdRng::seed_from_u64(1));

    let job_id = emitter.run_iteration(2, 5).await;
    assert_eq!(job_id, 20005);
    drop(emitter);

    let summary = collector.run().await;
    assert_eq!(summary.total_requests(), 3);
    assert_eq!(summary.check(STATUS_WAS_200), CheckTally { passes: 3, fails: 0 });
    assert_eq!(summary.check(RESPONSE_HAS_SUCCESS_STATUS), CheckTally { passes: 3, fails: 0 });
    assert_eq!(summary.jobs_completed(), 1);

    let counts = state.counts().await;
    assert_eq!((counts.queued, counts.in_progress, counts.completed), (1, 1, 1));
    assert_eq!(counts.self_hosted + counts.github_hosted, 3);

    shutdown.cancel();
}

#[tokio::test]
async fn test_wrong_secret_fails_checks_but_jobs_complete() {
    let (url, state, shutdown) = start_receiver(SECRET).await;
    let config = config(&url, "some-other-secret");

    let client = Arc::new(WebhookClient::from_config(&config).unwrap());
    let (recorder, collector) = metrics::channel(16).unwrap();
    let mut emitter = JobLifecycleEmitter::from_config(client, recorder, &config, StdRng::seed_from_u64(1));

    emitter.run_iteration(1, 0).await;
    drop(emitter);

    let summary = collector.run().await;
    assert_eq!(summary.check(STATUS_WAS_200), CheckTally { passes: 0, fails: 3 });
    assert_eq!(summary.check(RESPONSE_HAS_SUCCESS_STATUS), CheckTally { passes: 0, fails: 3 });
    assert_eq!(summary.jobs_completed(), 1);
    assert_eq!(summary.jobs_aborted(), 0);

    // rejected before counting
    assert_eq!(state.counts().await.total(), 0);

    shutdown.cancel();
}

#[test_log::test(tokio::test)]
async fn test_short_ramp_against_receiver() {
    let (url, state, shutdown) = start_receiver(SECRET).await;
    let mut config = config(&url, SECRET);
    config.stages = vec![
        Stage::new(Duration::from_millis(100), 2),
        Stage::new(Duration::from_millis(200), 2),
        Stage::new(Duration::from_millis(100), 0),
    ];
    config.pauses.between_iterations = PauseRange::new(Duration::from_millis(1), Duration::from_millis(5));

    let report = LoadTest::new(config).unwrap().run(CancellationToken::new()).await.unwrap();

    assert!(report.jobs_completed > 0);
    assert_eq!(report.total_requests, report.jobs_completed * 3);
    assert_eq!(report.failed_checks(), 0);
    assert_eq!(report.jobs_aborted, 0);
    assert_eq!(report.iterations, report.jobs_completed);

    // every delivery the generator counted reached the receiver
    let counts = state.counts().await;
    assert_eq!(counts.total(), report.total_requests);
    assert_eq!(counts.queued, report.jobs_completed);
    assert_eq!(counts.completed, report.jobs_completed);
    assert_eq!(counts.self_hosted + counts.github_hosted, counts.total());

    shutdown.cancel();
}
