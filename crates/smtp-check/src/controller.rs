//! Outcome interpretation, retry/backoff policy and session scheduling.
//!
//! A [`CheckSession`] walks its host roster one probe per tick:
//! - success on a host advances to the next host almost immediately
//! - failure retries the same host after the backoff delay until the retry
//!   budget is spent, then marks the backend DOWN and restarts the roster
//!   after the steady-state interval
//! - running past the last host marks the backend UP and waits for the
//!   steady-state interval before the next pass

use crate::checker::Prober;
use crate::error::{FailureKind, ProbeError, ProbeFailure};
use crate::roster::HostRoster;
use crate::types::{CheckDefinition, CheckId, HealthState, Target};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Delay before probing the next host after a success
pub const NEXT_HOST_DELAY: Duration = Duration::from_millis(1);

/// Owner of the backend up/down flag and of the load-balancer data path.
#[cfg_attr(test, mockall::automock)]
pub trait HealthRegistry: Send + Sync {
    /// Aggregate liveness of a backend across all of its checks
    fn is_alive(&self, backend: SocketAddr) -> bool;

    /// Record this check's verdict for the backend
    fn update(&self, check: CheckId, backend: SocketAddr, state: HealthState);

    /// Observe a finished probe attempt. `failure` is `None` on success.
    fn record_attempt(
        &self,
        _check: CheckId,
        _target: Target,
        _failure: Option<FailureKind>,
        _elapsed: Duration,
    ) {
    }
}

/// Alert category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCategory {
    BackendStateChange,
}

/// State-change alert handed to the notification sender
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub category: AlertCategory,
    pub check: CheckId,
    pub backend: SocketAddr,
    pub host: Option<Target>,
    pub state: HealthState,
    pub message: String,
}

/// Fire-and-forget alert sender
#[cfg_attr(test, mockall::automock)]
pub trait Alerter: Send + Sync {
    fn send(&self, alert: Alert);
}

/// Global alerting policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertPolicy {
    /// Only alert when the backend's aggregate liveness actually changed
    pub suppress_unchanged: bool,
}

/// Why the session chose its next delay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescheduleReason {
    /// Check administratively disabled, no socket work done
    Disabled,
    /// Local socket setup failed, retry counter untouched
    LocalError,
    /// Host succeeded, move on to the next one
    NextHost,
    /// Host failed with retries left
    Retry,
    /// Every host succeeded
    PassComplete,
    /// Host failed with no retries left
    RetriesExhausted,
}

/// Delay until the next tick and the decision that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reschedule {
    pub delay: Duration,
    pub reason: RescheduleReason,
}

/// Long-lived probe state for one check of one backend.
///
/// Only the session's own task mutates it, one tick at a time, so the
/// roster position and retry counter need no synchronization.
pub struct CheckSession {
    definition: Arc<CheckDefinition>,
    roster: HostRoster,
    retry_count: u32,
    checker_up: bool,
    has_run: bool,
    enabled: Arc<AtomicBool>,
    prober: Arc<dyn Prober>,
    registry: Arc<dyn HealthRegistry>,
    alerter: Arc<dyn Alerter>,
    policy: AlertPolicy,
}

impl CheckSession {
    pub fn new(
        definition: Arc<CheckDefinition>,
        prober: Arc<dyn Prober>,
        registry: Arc<dyn HealthRegistry>,
        alerter: Arc<dyn Alerter>,
        policy: AlertPolicy,
    ) -> Self {
        let mut roster = definition.roster.clone();
        roster.reset();

        Self {
            enabled: Arc::new(AtomicBool::new(definition.settings.enabled)),
            definition,
            roster,
            retry_count: 0,
            checker_up: true,
            has_run: false,
            prober,
            registry,
            alerter,
            policy,
        }
    }

    pub fn id(&self) -> CheckId {
        self.definition.id
    }

    pub fn definition(&self) -> &Arc<CheckDefinition> {
        &self.definition
    }

    /// This check's last verdict (UP until the first failure is confirmed)
    pub fn is_up(&self) -> bool {
        self.checker_up
    }

    pub fn has_run(&self) -> bool {
        self.has_run
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn roster(&self) -> &HostRoster {
        &self.roster
    }

    /// Shared administrative enable flag
    pub fn enabled_flag(&self) -> Arc<AtomicBool> {
        self.enabled.clone()
    }

    /// Run one scheduling step and return when the next one is due.
    pub async fn tick(&mut self) -> Reschedule {
        let settings = &self.definition.settings;

        if !self.enabled.load(Ordering::Relaxed) {
            return Reschedule {
                delay: settings.interval,
                reason: RescheduleReason::Disabled,
            };
        }

        let Some(host) = self.roster.current().cloned() else {
            return self.complete_pass();
        };

        let started = Instant::now();
        let result = self.prober.probe(&host, &self.definition.helo_name).await;
        let elapsed = started.elapsed();

        match result {
            Ok(()) => {
                self.registry
                    .record_attempt(self.id(), host.target(), None, elapsed);
                self.on_success()
            }
            Err(ProbeError::Setup(e)) => {
                warn!(
                    check = self.id(),
                    target = %host.target(),
                    error = %e,
                    "SMTP check failed to create socket, rescheduling"
                );
                Reschedule {
                    delay: self.definition.settings.interval,
                    reason: RescheduleReason::LocalError,
                }
            }
            Err(ProbeError::Failed(failure)) => {
                self.registry
                    .record_attempt(self.id(), host.target(), Some(failure.kind()), elapsed);
                self.on_failure(failure)
            }
        }
    }

    fn on_success(&mut self) -> Reschedule {
        self.retry_count = 0;
        self.roster.advance();

        Reschedule {
            delay: NEXT_HOST_DELAY,
            reason: RescheduleReason::NextHost,
        }
    }

    fn on_failure(&mut self, failure: ProbeFailure) -> Reschedule {
        let settings = &self.definition.settings;

        if self.checker_up {
            warn!(
                check = self.id(),
                backend = %Target(self.definition.backend),
                kind = failure.kind().as_str(),
                attempt = self.retry_count + 1,
                "SMTP_CHECK {}",
                failure
            );
        }

        if self.retry_count < settings.retry {
            self.retry_count += 1;
            return Reschedule {
                delay: settings.delay_before_retry,
                reason: RescheduleReason::Retry,
            };
        }

        if self.checker_up || !self.has_run {
            let message = format!("=> CHECK failed on service : {} <=", failure);
            self.change_state(HealthState::Down, Some(failure.target()), message);
        }

        self.retry_count = 0;
        self.roster.reset();

        Reschedule {
            delay: self.definition.settings.interval,
            reason: RescheduleReason::RetriesExhausted,
        }
    }

    fn complete_pass(&mut self) -> Reschedule {
        if !self.checker_up || !self.has_run {
            info!(
                check = self.id(),
                backend = %Target(self.definition.backend),
                "Remote SMTP server succeed on service"
            );
            self.change_state(
                HealthState::Up,
                None,
                "=> CHECK succeed on service <=".to_string(),
            );
        }

        self.retry_count = 0;
        self.roster.reset();

        Reschedule {
            delay: self.definition.settings.interval,
            reason: RescheduleReason::PassComplete,
        }
    }

    fn change_state(&mut self, state: HealthState, host: Option<Target>, message: String) {
        let backend = self.definition.backend;
        let checker_was_up = self.checker_up;
        let backend_was_alive = self.registry.is_alive(backend);

        self.registry.update(self.id(), backend, state);
        self.checker_up = state == HealthState::Up;
        self.has_run = true;

        if !self.definition.settings.alert || checker_was_up == self.checker_up {
            return;
        }

        let backend_changed = backend_was_alive != self.registry.is_alive(backend);
        if backend_changed || !self.policy.suppress_unchanged {
            self.alerter.send(Alert {
                category: AlertCategory::BackendStateChange,
                check: self.id(),
                backend,
                host,
                state,
                message,
            });
        }
    }

    /// Tick forever, sleeping between ticks, until `stop` is notified.
    pub async fn run(mut self, stop: Arc<Notify>) {
        info!(
            check = self.id(),
            backend = %Target(self.definition.backend),
            hosts = self.roster.len(),
            "SMTP check session started"
        );

        loop {
            let next = self.tick().await;
            debug!(
                check = self.id(),
                delay_ms = next.delay.as_millis() as u64,
                reason = ?next.reason,
                "Next SMTP check tick scheduled"
            );

            tokio::select! {
                _ = sleep(next.delay) => {}
                _ = stop.notified() => {
                    info!(check = self.id(), "SMTP check session stopping");
                    break;
                }
            }
        }
    }
}

/// Handle to a spawned [`CheckSession`]
pub struct SessionHandle {
    id: CheckId,
    definition: Arc<CheckDefinition>,
    enabled: Arc<AtomicBool>,
    stop: Arc<Notify>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Spawn the session's tick loop on the current runtime
    pub fn spawn(session: CheckSession) -> Self {
        let stop = Arc::new(Notify::new());
        let id = session.id();
        let definition = session.definition().clone();
        let enabled = session.enabled_flag();

        let task = tokio::spawn(session.run(stop.clone()));

        Self {
            id,
            definition,
            enabled,
            stop,
            task,
        }
    }

    pub fn id(&self) -> CheckId {
        self.id
    }

    pub fn definition(&self) -> &Arc<CheckDefinition> {
        &self.definition
    }

    /// Administratively enable or disable the check. Takes effect on the
    /// next tick; a probe in flight finishes normally.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Signal the session to stop once its current tick completes
    pub fn stop(&self) {
        self.stop.notify_one();
    }

    /// Stop the session and wait for its task to finish
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.task.await {
            warn!(check = self.id, error = %e, "SMTP check session task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roster::HostRoster;
    use crate::types::{CheckSettings, ConnectOptions, HostConfig};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Prober that replays scripted results and records the hosts it saw
    #[derive(Default)]
    struct ScriptedProber {
        results: Mutex<VecDeque<Result<(), ProbeError>>>,
        probed: Mutex<Vec<SocketAddr>>,
    }

    impl ScriptedProber {
        fn push(&self, result: Result<(), ProbeError>) {
            self.results.lock().unwrap().push_back(result);
        }

        fn probed(&self) -> Vec<SocketAddr> {
            self.probed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, host: &HostConfig, _helo_name: &str) -> Result<(), ProbeError> {
            self.probed.lock().unwrap().push(host.destination);
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .expect("no scripted result left")
        }
    }

    /// Single-check registry: the backend is alive iff the last update was UP
    struct RecordingRegistry {
        alive: Mutex<bool>,
        updates: Mutex<Vec<HealthState>>,
    }

    impl RecordingRegistry {
        fn new() -> Self {
            Self {
                alive: Mutex::new(true),
                updates: Mutex::new(Vec::new()),
            }
        }

        fn updates(&self) -> Vec<HealthState> {
            self.updates.lock().unwrap().clone()
        }
    }

    impl HealthRegistry for RecordingRegistry {
        fn is_alive(&self, _backend: SocketAddr) -> bool {
            *self.alive.lock().unwrap()
        }

        fn update(&self, _check: CheckId, _backend: SocketAddr, state: HealthState) {
            *self.alive.lock().unwrap() = state == HealthState::Up;
            self.updates.lock().unwrap().push(state);
        }
    }

    #[derive(Default)]
    struct RecordingAlerter {
        alerts: Mutex<Vec<Alert>>,
    }

    impl RecordingAlerter {
        fn alerts(&self) -> Vec<Alert> {
            self.alerts.lock().unwrap().clone()
        }
    }

    impl Alerter for RecordingAlerter {
        fn send(&self, alert: Alert) {
            self.alerts.lock().unwrap().push(alert);
        }
    }

    fn definition(hosts: &[&str], retry: u32) -> Arc<CheckDefinition> {
        let hosts: Vec<ConnectOptions> = hosts
            .iter()
            .map(|addr| {
                let addr: SocketAddr = addr.parse().unwrap();
                ConnectOptions {
                    connect_ip: Some(addr.ip()),
                    connect_port: Some(addr.port()),
                    ..Default::default()
                }
            })
            .collect();
        let backend: SocketAddr = "10.0.0.5:25".parse().unwrap();

        Arc::new(CheckDefinition {
            id: 1,
            backend,
            roster: HostRoster::resolve(backend, &ConnectOptions::default(), &hosts).unwrap(),
            helo_name: "lb.example.com".to_string(),
            settings: CheckSettings {
                interval: Duration::from_secs(60),
                retry,
                delay_before_retry: Duration::from_secs(1),
                alert: true,
                enabled: true,
            },
        })
    }

    fn timeout_failure(addr: &str) -> Result<(), ProbeError> {
        Err(ProbeFailure::ConnectTimeout {
            target: Target(addr.parse().unwrap()),
        }
        .into())
    }

    struct Fixture {
        session: CheckSession,
        prober: Arc<ScriptedProber>,
        registry: Arc<RecordingRegistry>,
        alerter: Arc<RecordingAlerter>,
    }

    fn fixture(definition: Arc<CheckDefinition>, policy: AlertPolicy) -> Fixture {
        let prober = Arc::new(ScriptedProber::default());
        let registry = Arc::new(RecordingRegistry::new());
        let alerter = Arc::new(RecordingAlerter::default());
        let session = CheckSession::new(
            definition,
            prober.clone(),
            registry.clone(),
            alerter.clone(),
            policy,
        );
        Fixture {
            session,
            prober,
            registry,
            alerter,
        }
    }

    #[tokio::test]
    async fn test_retry_budget_gives_r_plus_one_attempts() {
        for retry in 0..4 {
            let mut f = fixture(definition(&["10.0.0.5:25"], retry), AlertPolicy::default());
            for _ in 0..=retry {
                f.prober.push(timeout_failure("10.0.0.5:25"));
            }

            for _ in 0..retry {
                let next = f.session.tick().await;
                assert_eq!(next.reason, RescheduleReason::Retry);
                assert_eq!(next.delay, Duration::from_secs(1));
                assert!(f.registry.updates().is_empty());
            }

            let next = f.session.tick().await;
            assert_eq!(next.reason, RescheduleReason::RetriesExhausted);
            assert_eq!(next.delay, Duration::from_secs(60));
            assert_eq!(f.prober.probed().len(), retry as usize + 1);
            assert_eq!(f.registry.updates(), vec![HealthState::Down]);
            assert_eq!(f.session.retry_count(), 0);
            assert_eq!(f.session.roster().position(), 0);
        }
    }

    #[tokio::test]
    async fn test_success_advances_and_pass_completion_marks_up() {
        let mut f = fixture(
            definition(&["10.0.0.6:25", "10.0.0.7:25"], 1),
            AlertPolicy::default(),
        );
        f.prober.push(Ok(()));
        f.prober.push(Ok(()));

        let next = f.session.tick().await;
        assert_eq!(next.reason, RescheduleReason::NextHost);
        assert_eq!(next.delay, NEXT_HOST_DELAY);
        assert_eq!(f.session.roster().position(), 1);

        f.session.tick().await;
        assert!(f.session.roster().is_exhausted());

        let next = f.session.tick().await;
        assert_eq!(next.reason, RescheduleReason::PassComplete);
        assert_eq!(next.delay, Duration::from_secs(60));
        assert_eq!(f.session.roster().position(), 0);
        assert_eq!(f.registry.updates(), vec![HealthState::Up]);
        // Checker started UP, so no edge and no alert
        assert!(f.alerter.alerts().is_empty());

        assert_eq!(
            f.prober.probed(),
            vec![
                "10.0.0.6:25".parse::<SocketAddr>().unwrap(),
                "10.0.0.7:25".parse().unwrap()
            ]
        );
    }

    #[tokio::test]
    async fn test_second_pass_does_not_update_again() {
        let mut f = fixture(definition(&["10.0.0.6:25"], 0), AlertPolicy::default());
        f.prober.push(Ok(()));
        f.prober.push(Ok(()));

        f.session.tick().await;
        f.session.tick().await;
        f.session.tick().await;
        f.session.tick().await;

        assert_eq!(f.registry.updates(), vec![HealthState::Up]);
    }

    #[tokio::test]
    async fn test_failure_after_success_restarts_from_first_host() {
        let mut f = fixture(
            definition(&["10.0.0.6:25", "10.0.0.7:25"], 0),
            AlertPolicy::default(),
        );
        f.prober.push(Ok(()));
        f.prober.push(timeout_failure("10.0.0.7:25"));
        f.prober.push(Ok(()));

        f.session.tick().await;
        let next = f.session.tick().await;
        assert_eq!(next.reason, RescheduleReason::RetriesExhausted);
        assert_eq!(f.session.roster().position(), 0);

        f.session.tick().await;
        assert_eq!(
            f.prober.probed().last().copied(),
            Some("10.0.0.6:25".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn test_down_then_up_alerts_on_each_edge() {
        let mut f = fixture(definition(&["10.0.0.5:25"], 0), AlertPolicy::default());
        f.prober.push(timeout_failure("10.0.0.5:25"));
        f.prober.push(Ok(()));

        f.session.tick().await;
        assert!(!f.session.is_up());
        f.session.tick().await;
        f.session.tick().await;
        assert!(f.session.is_up());

        let alerts = f.alerter.alerts();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].state, HealthState::Down);
        assert_eq!(
            alerts[0].message,
            "=> CHECK failed on service : Connection timeout to server [10.0.0.5]:25 <="
        );
        assert_eq!(alerts[0].host, Some(Target("10.0.0.5:25".parse().unwrap())));
        assert_eq!(alerts[1].state, HealthState::Up);
        assert_eq!(alerts[1].message, "=> CHECK succeed on service <=");
    }

    #[tokio::test]
    async fn test_staying_down_never_realerts() {
        let mut f = fixture(
            definition(&["10.0.0.5:25"], 0),
            AlertPolicy {
                suppress_unchanged: true,
            },
        );
        for _ in 0..3 {
            f.prober.push(timeout_failure("10.0.0.5:25"));
        }

        for _ in 0..3 {
            let next = f.session.tick().await;
            assert_eq!(next.reason, RescheduleReason::RetriesExhausted);
        }

        assert_eq!(f.alerter.alerts().len(), 1);
        assert_eq!(f.registry.updates(), vec![HealthState::Down]);
    }

    #[tokio::test]
    async fn test_alerts_disabled_for_backend() {
        let mut definition = (*definition(&["10.0.0.5:25"], 0)).clone();
        definition.settings.alert = false;
        let mut f = fixture(Arc::new(definition), AlertPolicy::default());
        f.prober.push(timeout_failure("10.0.0.5:25"));

        f.session.tick().await;
        assert_eq!(f.registry.updates(), vec![HealthState::Down]);
        assert!(f.alerter.alerts().is_empty());
    }

    #[tokio::test]
    async fn test_local_error_keeps_retry_budget() {
        let mut f = fixture(definition(&["10.0.0.5:25"], 1), AlertPolicy::default());
        f.prober.push(Err(crate::error::SocketSetupError::Create(
            std::io::Error::from_raw_os_error(libc::EMFILE),
        )
        .into()));

        let next = f.session.tick().await;
        assert_eq!(next.reason, RescheduleReason::LocalError);
        assert_eq!(next.delay, Duration::from_secs(60));
        assert_eq!(f.session.retry_count(), 0);
        assert!(f.registry.updates().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_check_skips_socket_work() {
        let f = fixture(definition(&["10.0.0.5:25"], 1), AlertPolicy::default());
        let mut session = f.session;
        session.enabled_flag().store(false, Ordering::Relaxed);

        let next = session.tick().await;
        assert_eq!(next.reason, RescheduleReason::Disabled);
        assert_eq!(next.delay, Duration::from_secs(60));
        assert!(f.prober.probed().is_empty());
    }

    #[tokio::test]
    async fn test_suppressed_alert_when_backend_liveness_unchanged() {
        // Another check keeps the backend down, so this checker's recovery
        // does not change the backend's aggregate state.
        let mut registry = MockHealthRegistry::new();
        registry.expect_is_alive().return_const(false);
        registry
            .expect_update()
            .withf(|check, _, state| *check == 1 && *state == HealthState::Down)
            .times(1)
            .return_const(());
        registry
            .expect_update()
            .withf(|_, _, state| *state == HealthState::Up)
            .times(1)
            .return_const(());
        registry.expect_record_attempt().return_const(());

        let mut alerter = MockAlerter::new();
        alerter.expect_send().never();

        let prober = Arc::new(ScriptedProber::default());
        prober.push(timeout_failure("10.0.0.5:25"));
        prober.push(Ok(()));

        let mut session = CheckSession::new(
            definition(&["10.0.0.5:25"], 0),
            prober,
            Arc::new(registry),
            Arc::new(alerter),
            AlertPolicy {
                suppress_unchanged: true,
            },
        );

        session.tick().await;
        session.tick().await;
        session.tick().await;
        assert!(session.is_up());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_handle_stops() {
        let f = fixture(definition(&["10.0.0.5:25"], 0), AlertPolicy::default());
        for _ in 0..8 {
            f.prober.push(Ok(()));
        }

        let handle = SessionHandle::spawn(f.session);
        assert_eq!(handle.id(), 1);
        assert!(handle.is_enabled());

        tokio::time::sleep(Duration::from_secs(90)).await;
        handle.shutdown().await;

        // One pass (probe, completion) then a second probe after the interval
        assert_eq!(f.prober.probed().len(), 2);
        assert_eq!(f.registry.updates(), vec![HealthState::Up]);
    }
}
