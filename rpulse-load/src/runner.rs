//! Load driver: ramps virtual users along the stage profile and collects the report.
//!
//! Every `ramp_interval` the driver reads the profile's current target and adjusts the number of
//! running virtual users. New users reuse the lowest idle slot, so a user index always refers to
//! the same job id range. Stopping is cooperative: a stopped user finishes its current iteration.
//! When the schedule ends (or shutdown is requested) all users get `graceful_stop` to finish
//! before they are aborted.

use futures::future::join_all;
use rand::SeedableRng;
use rand::prelude::RngExt;
use rand::rngs::StdRng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::emitter::{JOB_ID_STRIDE, JobLifecycleEmitter, WebhookClient};
use crate::errors::{Error, Result};
use crate::metrics::{self, Recorder, Report};
use crate::stages::LoadProfile;

/// A configured load test, ready to run.
pub struct LoadTest {
    config: Config,
    client: Arc<WebhookClient>,
    profile: LoadProfile,
    seed: u64,
}

impl LoadTest {
    pub fn new(config: Config) -> Result<Self> {
        let client = Arc::new(WebhookClient::from_config(&config)?);
        let profile = LoadProfile::new(config.stages.clone());
        let seed = config.seed.unwrap_or_else(|| rand::rng().random());

        Ok(Self {
            config,
            client,
            profile,
            seed,
        })
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn profile(&self) -> &LoadProfile {
        &self.profile
    }

    /// Run the whole schedule, or until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<Report> {
        info!(
            url = %self.client.url(),
            stages = self.profile.stages().len(),
            duration = %humantime::format_duration(self.profile.total_duration()),
            max_vus = self.profile.max_target(),
            seed = self.seed,
            "Starting load test"
        );

        let (recorder, collector) = metrics::channel(self.config.metrics_channel_capacity)?;
        let collector = tokio::spawn(collector.run());

        let mut users = VirtualUsers::new(self.client.clone(), recorder, &self.config, self.seed);
        let start = Instant::now();

        let mut ticker = tokio::time::interval(self.config.ramp_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_target = None;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping virtual users");
                    break;
                }
                _ = ticker.tick() => {
                    let Some(target) = self.profile.target_at(start.elapsed()) else {
                        info!("All stages finished");
                        break;
                    };

                    users.reap().await;
                    users.scale_to(target);

                    if last_target != Some(target) {
                        debug!(target, running = users.running(), "Virtual user target changed");
                        last_target = Some(target);
                    }
                }
            }
        }

        users.stop_all(self.config.graceful_stop).await;
        drop(users);

        let summary = collector.await.map_err(|e| Error::Internal {
            operation: format!("join metrics collector: {e}"),
        })?;
        let report = summary.report(start.elapsed(), &self.config.thresholds);

        info!(
            requests = report.total_requests,
            iterations = report.iterations,
            failed_checks = report.failed_checks(),
            thresholds_passed = report.thresholds_passed(),
            "Load test finished"
        );
        Ok(report)
    }
}

struct Worker {
    stop: CancellationToken,
    handle: JoinHandle<u64>,
}

/// One virtual user index and its progress across restarts.
struct Slot {
    index: u32,
    /// Next iteration this index will run
    iterations: u64,
    worker: Option<Worker>,
    /// Set when a worker panicked; the index is never reused
    retired: bool,
}

impl Slot {
    fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|worker| !worker.stop.is_cancelled())
    }
}

struct VirtualUsers {
    client: Arc<WebhookClient>,
    recorder: Recorder,
    config: Config,
    seed: u64,
    slots: Vec<Slot>,
}

impl VirtualUsers {
    fn new(client: Arc<WebhookClient>, recorder: Recorder, config: &Config, seed: u64) -> Self {
        Self {
            client,
            recorder,
            config: config.clone(),
            seed,
            slots: Vec::new(),
        }
    }

    fn running(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_running()).count()
    }

    /// Collect workers that have exited and remember how far they got.
    async fn reap(&mut self) {
        for slot in &mut self.slots {
            let finished = slot.worker.as_ref().is_some_and(|worker| worker.handle.is_finished());
            if !finished {
                continue;
            }
            let Some(worker) = slot.worker.take() else { continue };

            match worker.handle.await {
                Ok(iterations) => slot.iterations = iterations,
                Err(e) => {
                    error!(virtual_user = slot.index, error = %e, "Virtual user crashed, retiring its index");
                    slot.retired = true;
                }
            }
        }
    }

    fn scale_to(&mut self, target: u32) {
        let target = target as usize;
        let running = self.running();

        if running < target {
            for _ in running..target {
                self.start_one();
            }
        } else if running > target {
            let mut excess = running - target;
            for slot in self.slots.iter().rev() {
                if excess == 0 {
                    break;
                }
                if !slot.is_running() {
                    continue;
                }
                if let Some(worker) = &slot.worker {
                    debug!(virtual_user = slot.index, "Stopping virtual user");
                    worker.stop.cancel();
                    excess -= 1;
                }
            }
        }
    }

    fn start_one(&mut self) {
        let position = match self.slots.iter().position(|slot| slot.worker.is_none() && !slot.retired) {
            Some(position) => position,
            None => {
                let index = self.slots.len() as u32 + 1;
                self.slots.push(Slot {
                    index,
                    iterations: 0,
                    worker: None,
                    retired: false,
                });
                self.slots.len() - 1
            }
        };

        let slot = &mut self.slots[position];
        let rng = user_rng(self.seed, slot.index, slot.iterations);
        let emitter = JobLifecycleEmitter::from_config(self.client.clone(), self.recorder.clone(), &self.config, rng);

        let stop = CancellationToken::new();
        let handle = tokio::spawn(run_virtual_user(emitter, slot.index, slot.iterations, stop.clone()));
        slot.worker = Some(Worker { stop, handle });

        debug!(virtual_user = slot.index, iteration = slot.iterations, "Started virtual user");
    }

    /// Stop every worker, waiting up to `graceful_stop` before aborting the rest.
    async fn stop_all(&mut self, graceful_stop: Duration) {
        let workers: Vec<(u32, Worker)> = self
            .slots
            .iter_mut()
            .filter_map(|slot| slot.worker.take().map(|worker| (slot.index, worker)))
            .collect();

        if workers.is_empty() {
            return;
        }

        for (_, worker) in &workers {
            worker.stop.cancel();
        }

        let abort_handles: Vec<_> = workers.iter().map(|(_, worker)| worker.handle.abort_handle()).collect();
        let count = workers.len();
        let joins = join_all(workers.into_iter().map(|(index, worker)| async move { (index, worker.handle.await) }));

        match tokio::time::timeout(graceful_stop, joins).await {
            Ok(results) => {
                for (index, result) in results {
                    if let Err(e) = result {
                        error!(virtual_user = index, error = %e, "Virtual user crashed during shutdown");
                    }
                }
                debug!(count, "All virtual users stopped");
            }
            Err(_) => {
                warn!(
                    count,
                    graceful_stop = %humantime::format_duration(graceful_stop),
                    "Virtual users did not finish in time, aborting in-flight iterations"
                );
                for handle in abort_handles {
                    handle.abort();
                }
            }
        }
    }
}

/// Loop iterations for one virtual user until told to stop. Returns the next iteration number.
async fn run_virtual_user(
    mut emitter: JobLifecycleEmitter,
    virtual_user: u32,
    mut iteration: u64,
    stop: CancellationToken,
) -> u64 {
    while !stop.is_cancelled() {
        if iteration == JOB_ID_STRIDE as u64 {
            warn!(
                virtual_user,
                iteration, "Virtual user reached the job id stride, ids now overlap the next user's range"
            );
        }

        emitter.run_iteration(virtual_user, iteration).await;
        iteration += 1;
    }

    debug!(virtual_user, iteration, "Virtual user stopped");
    iteration
}

/// Seeded random source for one virtual user.
pub fn user_rng(seed: u64, virtual_user: u32, iteration: u64) -> StdRng {
    StdRng::seed_from_u64(seed ^ (u64::from(virtual_user) << 32) ^ iteration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PauseConfig;
    use crate::stages::Stage;
    use serde_json::json;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn receiver() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "success"})))
            .mount(&server)
            .await;
        server
    }

    fn config_for(server: &MockServer) -> Config {
        Config {
            webhook_url: format!("{}/webhook", server.uri()).parse().unwrap(),
            webhook_secret: "secret".to_string(),
            pauses: PauseConfig::none(),
            ramp_interval: Duration::from_millis(10),
            graceful_stop: Duration::from_secs(5),
            seed: Some(1),
            ..Default::default()
        }
    }

    fn users_for(config: &Config) -> (VirtualUsers, metrics::Collector) {
        let client = Arc::new(WebhookClient::from_config(config).unwrap());
        let (recorder, collector) = metrics::channel(1024).unwrap();
        (VirtualUsers::new(client, recorder, config, 1), collector)
    }

    async fn wait_until_reaped(users: &mut VirtualUsers, indexes: &[u32]) {
        for _ in 0..500 {
            users.reap().await;
            let reaped = users
                .slots
                .iter()
                .filter(|slot| indexes.contains(&slot.index))
                .all(|slot| slot.worker.is_none());
            if reaped {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("virtual users {indexes:?} never stopped");
    }

    #[test_log::test(tokio::test)]
    async fn test_scale_down_stops_highest_and_scale_up_reuses_lowest() {
        let server = receiver().await;
        let config = config_for(&server);
        let (mut users, collector) = users_for(&config);
        let collector = tokio::spawn(collector.run());

        users.scale_to(3);
        assert_eq!(users.running(), 3);
        let indexes: Vec<u32> = users.slots.iter().map(|slot| slot.index).collect();
        assert_eq!(indexes, [1, 2, 3]);

        tokio::time::sleep(Duration::from_millis(100)).await;

        users.scale_to(1);
        assert_eq!(users.running(), 1);
        assert!(users.slots[0].is_running());
        assert!(!users.slots[1].is_running());
        assert!(!users.slots[2].is_running());

        wait_until_reaped(&mut users, &[2, 3]).await;
        let resumed_at = users.slots[1].iterations;
        assert!(resumed_at > 0, "slot 2 never ran an iteration");

        // reuses index 2 rather than allocating index 4
        users.scale_to(2);
        assert_eq!(users.running(), 2);
        assert_eq!(users.slots.len(), 3);
        assert!(users.slots[1].is_running());
        assert!(users.slots[2].worker.is_none());

        users.stop_all(Duration::from_secs(5)).await;
        assert_eq!(users.running(), 0);
        drop(users);

        let summary = collector.await.unwrap();
        assert!(summary.total_requests() > 0);
        assert_eq!(summary.total_requests(), summary.jobs_completed() * 3);
        assert_eq!(summary.jobs_aborted(), 0);
    }

    #[tokio::test]
    async fn test_stop_all_aborts_after_graceful_stop() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "success"})))
            .mount(&server)
            .await;

        let mut config = config_for(&server);
        // users park in the first pause, well past the graceful stop window
        config.pauses.after_queued = crate::config::PauseRange::new(Duration::from_secs(60), Duration::from_secs(60));
        let (mut users, collector) = users_for(&config);
        let collector = tokio::spawn(collector.run());

        users.scale_to(2);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        users.stop_all(Duration::from_millis(100)).await;
        assert!(started.elapsed() < Duration::from_secs(10));
        drop(users);

        // aborted tasks release their recorders, so the collector still completes
        let summary = tokio::time::timeout(Duration::from_secs(10), collector).await.unwrap().unwrap();
        assert_eq!(summary.jobs_completed(), 0);
        assert_eq!(summary.requests(crate::events::JobAction::Completed), 0);
    }

    #[tokio::test]
    async fn test_run_follows_schedule_and_reports() {
        let server = receiver().await;
        let mut config = config_for(&server);
        config.stages = vec![
            Stage::new(Duration::from_millis(100), 2),
            Stage::new(Duration::from_millis(200), 2),
            Stage::new(Duration::from_millis(100), 0),
        ];

        let test = LoadTest::new(config).unwrap();
        assert_eq!(test.seed(), 1);
        let report = test.run(CancellationToken::new()).await.unwrap();

        assert!(report.total_requests > 0);
        assert_eq!(report.total_requests, report.jobs_completed * 3);
        assert_eq!(report.failed_checks(), 0);
        assert_eq!(report.jobs_aborted, 0);
        assert!(report.total_time_seconds >= 0.4);
    }

    #[tokio::test]
    async fn test_shutdown_cuts_the_schedule_short() {
        let server = receiver().await;
        let mut config = config_for(&server);
        config.stages = vec![Stage::new(Duration::from_secs(600), 2)];

        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let report = LoadTest::new(config).unwrap().run(shutdown).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(30));
        assert!(report.total_time_seconds < 30.0);
    }

    #[test]
    fn test_user_rng_is_deterministic_per_user() {
        let draw = |rng: &mut StdRng| (0..8).map(|_| rng.random::<u32>()).collect::<Vec<_>>();

        assert_eq!(draw(&mut user_rng(7, 1, 0)), draw(&mut user_rng(7, 1, 0)));
        assert_ne!(draw(&mut user_rng(7, 1, 0)), draw(&mut user_rng(7, 2, 0)));
        assert_ne!(draw(&mut user_rng(7, 1, 0)), draw(&mut user_rng(7, 1, 5)));
    }
}
