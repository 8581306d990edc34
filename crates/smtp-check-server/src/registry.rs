//! Backend health registry shared by every check session.

use crate::metrics::MetricsRegistry;
use crate::types::Notification;
use dashmap::DashMap;
use smtp_check::{CheckId, FailureKind, HealthRegistry, HealthState, Target};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Last verdict of one check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckRecord {
    pub backend: SocketAddr,
    pub state: HealthState,
    pub changed_at: SystemTime,
}

/// A backend is alive while none of its checks reports it down.
///
/// Every state change is forwarded to the notifier so the peer agent can
/// apply it to the load-balancer data path. The health channel is unbounded:
/// a change is reported exactly once, so it must never be dropped while the
/// peer is away.
pub struct BackendRegistry {
    /// Checks currently reporting each backend down
    failed: DashMap<SocketAddr, HashSet<CheckId>>,

    checks: DashMap<CheckId, CheckRecord>,

    health_tx: mpsc::UnboundedSender<Notification>,

    metrics: Option<Arc<MetricsRegistry>>,
}

impl BackendRegistry {
    pub fn new(
        health_tx: mpsc::UnboundedSender<Notification>,
        metrics: Option<Arc<MetricsRegistry>>,
    ) -> Self {
        Self {
            failed: DashMap::new(),
            checks: DashMap::new(),
            health_tx,
            metrics,
        }
    }

    /// Last verdict of a check, if it has reported one
    pub fn record(&self, check: CheckId) -> Option<CheckRecord> {
        self.checks.get(&check).map(|entry| *entry)
    }

    pub fn state(&self, check: CheckId) -> Option<HealthState> {
        self.record(check).map(|record| record.state)
    }

    /// Drop everything known about a check. Its DOWN vote, if any, no longer
    /// counts against the backend.
    pub fn forget(&self, check: CheckId) {
        let Some((_, record)) = self.checks.remove(&check) else {
            return;
        };

        let was_alive = self.is_alive(record.backend);
        self.clear_failure(record.backend, check);

        if let Some(ref m) = self.metrics {
            m.remove_check(check);
        }

        if !was_alive && self.is_alive(record.backend) {
            info!(
                check,
                backend = %Target(record.backend),
                "Removed check was the last failing check, backend alive again"
            );
            self.notify(Notification::Health {
                check,
                backend: record.backend,
                state: HealthState::Up,
                backend_alive: true,
            });
        }
    }

    fn clear_failure(&self, backend: SocketAddr, check: CheckId) {
        self.failed.remove_if_mut(&backend, |_, checks| {
            checks.remove(&check);
            checks.is_empty()
        });
    }

    fn notify(&self, notification: Notification) {
        if let Err(e) = self.health_tx.send(notification) {
            debug!(check = e.0.check(), "Health channel closed");
        }
    }
}

impl HealthRegistry for BackendRegistry {
    fn is_alive(&self, backend: SocketAddr) -> bool {
        self.failed
            .get(&backend)
            .is_none_or(|checks| checks.is_empty())
    }

    fn update(&self, check: CheckId, backend: SocketAddr, state: HealthState) {
        let previous = self.checks.insert(
            check,
            CheckRecord {
                backend,
                state,
                changed_at: SystemTime::now(),
            },
        );

        match state {
            HealthState::Down => {
                self.failed.entry(backend).or_default().insert(check);
            }
            HealthState::Up => self.clear_failure(backend, check),
        }

        let backend_alive = self.is_alive(backend);

        if let Some(ref m) = self.metrics {
            m.set_check_state(check, state);
        }

        if previous.map(|r| r.state) == Some(state) {
            return;
        }

        info!(
            check,
            backend = %Target(backend),
            state = %state,
            backend_alive,
            "Checker state changed"
        );

        if let Some(ref m) = self.metrics {
            m.record_state_transition(check, state);
        }

        self.notify(Notification::Health {
            check,
            backend,
            state,
            backend_alive,
        });
    }

    fn record_attempt(
        &self,
        check: CheckId,
        target: Target,
        failure: Option<FailureKind>,
        elapsed: Duration,
    ) {
        let result = failure.map_or("success", |kind| kind.as_str());
        debug!(check, target = %target, result, elapsed_ms = elapsed.as_millis() as u64, "SMTP probe finished");

        if let Some(ref m) = self.metrics {
            m.record_probe(check, result, elapsed);
        }
    }
}
