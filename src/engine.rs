use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::client::PresenceClient;
use crate::config::{BackoffConfig, PollerConfig};
use crate::models::{FetchError, PollResult, PollerState, PresenceSnapshot, PresenceStatus};

/// Drives the fetch-update-log cycle on a fixed cadence and owns the cache.
/// Everything else only ever sees copy-out reads of `state`.
pub struct Poller {
    pub config: PollerConfig,
    client: Arc<PresenceClient>,
    pub state: Arc<RwLock<PollerState>>,
    running: Mutex<Option<PollTask>>,
}

struct PollTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Poller {
    pub fn new(config: PollerConfig, client: PresenceClient) -> Self {
        Self {
            config,
            client: Arc::new(client),
            state: Arc::new(RwLock::new(PollerState::new())),
            running: Mutex::new(None),
        }
    }

    /// Spawns the polling loop. Calling this while the loop is already
    /// running is a no-op.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return;
        }
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(poll_loop(
            self.config.clone(),
            Arc::clone(&self.client),
            Arc::clone(&self.state),
            shutdown_rx,
        ));
        *running = Some(PollTask { shutdown, handle });
        info!("Presence poller started (interval {}s)", self.config.poll_interval_secs);
    }

    /// Halts the loop after the in-flight cycle completes and waits for the
    /// task to finish, so no timer outlives this call.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        if let Some(task) = running.take() {
            let _ = task.shutdown.send(true);
            let _ = task.handle.await;
            info!("Presence poller stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Copy-out read for the web layer; never touches the network. `None`
    /// until the first successful cycle covers the subject.
    pub async fn current_snapshot(&self, subject_id: &str) -> Option<PresenceSnapshot> {
        self.state.read().await.snapshots.get(subject_id).cloned()
    }
}

async fn poll_loop(
    config: PollerConfig,
    client: Arc<PresenceClient>,
    state: Arc<RwLock<PollerState>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let base = Duration::from_secs(config.poll_interval_secs);
    loop {
        let cycle = state.read().await.cycle + 1;
        let result = client.fetch(cycle).await;
        let consecutive_failures = apply_result(&state, cycle, result).await;
        let delay = next_interval(base, &config.backoff, consecutive_failures);

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Applies one cycle's outcome to the cache as a single atomic batch and
/// logs it. Returns the consecutive-failure count for backoff.
async fn apply_result(state: &RwLock<PollerState>, cycle: u64, result: PollResult) -> u32 {
    match result {
        Ok(batch) => {
            let total = batch.snapshots.len();
            let present = batch
                .snapshots
                .iter()
                .filter(|s| s.status == PresenceStatus::Present)
                .count();

            let mut transitions = Vec::new();
            {
                let mut state = state.write().await;
                state.cycle = cycle;
                state.consecutive_failures = 0;
                state.last_success = Some(Utc::now());
                state.last_error = None;
                for snapshot in batch.snapshots {
                    let prior = state.snapshots.get(&snapshot.subject_id).map(|s| s.status);
                    if let Some(old) = prior {
                        if old != snapshot.status {
                            transitions.push((snapshot.subject_id.clone(), old, snapshot.status));
                        }
                    }
                    state.snapshots.insert(snapshot.subject_id.clone(), snapshot);
                }
            }

            info!(
                target: "poller",
                cycle,
                http_status = batch.http_status,
                subjects = total,
                present,
                "Polled OK"
            );
            for (subject, old, new) in transitions {
                info!(target: "poller", %subject, "Presence changed {:?} -> {:?}", old, new);
            }
            for (subject, err) in &batch.partial_failures {
                warn!(target: "poller", %subject, kind = err.kind(), "Subject fetch failed: {err}");
            }
            0
        }
        Err(err) => {
            let consecutive_failures = {
                let mut state = state.write().await;
                state.cycle = cycle;
                state.consecutive_failures += 1;
                state.last_error = Some(err.to_string());
                state.consecutive_failures
            };

            match &err {
                FetchError::AuthRejected(_) => warn!(
                    target: "poller",
                    cycle,
                    kind = err.kind(),
                    http_status = ?err.http_status(),
                    consecutive_failures,
                    "Poll rejected, credential rotation needed: {err}"
                ),
                _ => warn!(
                    target: "poller",
                    cycle,
                    kind = err.kind(),
                    http_status = ?err.http_status(),
                    consecutive_failures,
                    "Poll failed, serving last known data: {err}"
                ),
            }
            consecutive_failures
        }
    }
}

/// Base interval until the failure streak reaches the threshold, then
/// exponential growth capped at `max_multiplier` times the base.
fn next_interval(base: Duration, backoff: &BackoffConfig, consecutive_failures: u32) -> Duration {
    if consecutive_failures < backoff.failure_threshold {
        return base;
    }
    let exponent = consecutive_failures - backoff.failure_threshold + 1;
    let cap = backoff.max_multiplier.max(1.0);
    let multiplier = backoff.factor.powi(exponent.min(16) as i32).clamp(1.0, cap);
    base.mul_f64(multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FetchBatch;
    use serde_json::json;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn snapshot(subject_id: &str, status: PresenceStatus, cycle: u64) -> PresenceSnapshot {
        PresenceSnapshot {
            subject_id: subject_id.into(),
            status,
            last_updated_at: Utc::now(),
            source_cycle: cycle,
        }
    }

    fn success(snapshots: Vec<PresenceSnapshot>) -> PollResult {
        Ok(FetchBatch {
            snapshots,
            http_status: 200,
            partial_failures: Vec::new(),
        })
    }

    #[test]
    fn interval_stays_at_base_below_threshold() {
        let backoff = BackoffConfig::default();
        let base = Duration::from_secs(10);
        assert_eq!(next_interval(base, &backoff, 0), base);
        assert_eq!(next_interval(base, &backoff, 2), base);
    }

    #[test]
    fn interval_grows_monotonically_and_caps() {
        let backoff = BackoffConfig::default();
        let base = Duration::from_secs(10);
        let mut previous = base;
        for failures in 3..12 {
            let next = next_interval(base, &backoff, failures);
            assert!(next >= previous, "interval shrank at {failures} failures");
            assert!(next <= base.mul_f64(backoff.max_multiplier));
            previous = next;
        }
        assert_eq!(next_interval(base, &backoff, 20), Duration::from_secs(80));
    }

    #[test]
    fn four_times_factor_scales_fourth_interval_to_forty_seconds() {
        let backoff = BackoffConfig {
            failure_threshold: 3,
            factor: 4.0,
            max_multiplier: 4.0,
        };
        let base = Duration::from_secs(10);
        assert_eq!(next_interval(base, &backoff, 2), Duration::from_secs(10));
        assert_eq!(next_interval(base, &backoff, 3), Duration::from_secs(40));
        // First success resets the count, which puts the interval back at base.
        assert_eq!(next_interval(base, &backoff, 0), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn failure_keeps_cached_snapshots_and_counts_up() {
        let state = RwLock::new(PollerState::new());

        apply_result(&state, 1, success(vec![snapshot("alice", PresenceStatus::Present, 1)]))
            .await;
        let cached = state.read().await.snapshots["alice"].clone();

        let failures = apply_result(&state, 2, Err(FetchError::Network("refused".into()))).await;
        assert_eq!(failures, 1);
        let failures = apply_result(&state, 3, Err(FetchError::Timeout)).await;
        assert_eq!(failures, 2);

        let current = state.read().await;
        let after = &current.snapshots["alice"];
        assert_eq!(after.status, cached.status);
        assert_eq!(after.last_updated_at, cached.last_updated_at);
        assert_eq!(after.source_cycle, 1);
        assert_eq!(current.consecutive_failures, 2);
        assert_eq!(current.cycle, 3);
    }

    #[tokio::test]
    async fn success_resets_failure_streak_and_advances_timestamps() {
        let state = RwLock::new(PollerState::new());

        for cycle in 1..=5 {
            apply_result(&state, cycle, Err(FetchError::Timeout)).await;
        }
        assert_eq!(state.read().await.consecutive_failures, 5);

        apply_result(&state, 6, success(vec![snapshot("alice", PresenceStatus::Absent, 6)]))
            .await;
        let first_update = {
            let current = state.read().await;
            assert_eq!(current.consecutive_failures, 0);
            assert!(current.last_success.is_some());
            current.snapshots["alice"].last_updated_at
        };

        apply_result(&state, 7, success(vec![snapshot("alice", PresenceStatus::Absent, 7)]))
            .await;
        let second_update = state.read().await.snapshots["alice"].last_updated_at;
        assert!(second_update > first_update);
    }

    #[tokio::test]
    async fn auth_rejection_is_not_fatal_and_leaves_cache_alone() {
        let state = RwLock::new(PollerState::new());
        apply_result(&state, 1, success(vec![snapshot("alice", PresenceStatus::Present, 1)]))
            .await;

        apply_result(&state, 2, Err(FetchError::AuthRejected(403))).await;

        let current = state.read().await;
        assert_eq!(current.snapshots["alice"].status, PresenceStatus::Present);
        assert_eq!(current.consecutive_failures, 1);
        assert!(current.last_error.as_deref().unwrap().contains("authentication rejected"));
    }

    async fn poller_against(server: &MockServer, interval_secs: u64) -> Poller {
        let config: PollerConfig = serde_json::from_value(json!({
            "base_url": server.uri(),
            "poll_interval_secs": interval_secs,
        }))
        .unwrap();
        let client = PresenceClient::new(&config, "test-key".into()).unwrap();
        Poller::new(config, client)
    }

    #[tokio::test]
    async fn empty_cache_reports_not_found_until_first_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let poller = poller_against(&server, 60).await;
        poller.start().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(poller.current_snapshot("alice").await.is_none());
        assert!(poller.is_running().await);
        poller.stop().await;
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_halts_cycles() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "id": "alice", "onsite_status": "onsite" }
            ])))
            .mount(&server)
            .await;

        let poller = poller_against(&server, 1).await;
        poller.start().await;
        poller.start().await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        // One running loop, one immediate fetch; a second start spawned nothing.
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
        let cached = poller.current_snapshot("alice").await.unwrap();
        assert_eq!(cached.status, PresenceStatus::Present);

        poller.stop().await;
        assert!(!poller.is_running().await);
        let after_stop = server.received_requests().await.unwrap().len();

        // Wait past the poll interval; a dangling loop would fetch again.
        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert_eq!(server.received_requests().await.unwrap().len(), after_stop);
    }
}
