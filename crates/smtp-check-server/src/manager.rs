//! Manager for check session lifecycle.

use crate::metrics::MetricsRegistry;
use crate::registry::BackendRegistry;
use crate::types::CheckStatus;
use dashmap::DashMap;
use futures::future::join_all;
use smtp_check::{
    AlertPolicy, Alerter, CheckDefinition, CheckId, CheckSession, HealthRegistry, Prober,
    SessionHandle,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// What a configuration apply changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub added: Vec<CheckId>,
    pub updated: Vec<CheckId>,
    pub removed: Vec<CheckId>,
    pub unchanged: usize,
}

/// Owns one running session per configured check
pub struct Manager {
    sessions: DashMap<CheckId, SessionHandle>,
    prober: Arc<dyn Prober>,
    registry: Arc<BackendRegistry>,
    alerter: Arc<dyn Alerter>,
    policy: AlertPolicy,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl Manager {
    pub fn new(
        prober: Arc<dyn Prober>,
        registry: Arc<BackendRegistry>,
        alerter: Arc<dyn Alerter>,
        policy: AlertPolicy,
        metrics: Option<Arc<MetricsRegistry>>,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            prober,
            registry,
            alerter,
            policy,
            metrics,
        }
    }

    /// Bring the running sessions in line with `definitions`.
    ///
    /// Sessions whose definition compares equal keep running with their
    /// roster position, retry counter and verdict intact. Changed
    /// definitions restart from scratch; removed ones are stopped and their
    /// verdict withdrawn from the registry.
    pub async fn apply(&self, definitions: Vec<CheckDefinition>) -> ApplySummary {
        debug!("Applying {} SMTP check definitions", definitions.len());

        let mut summary = ApplySummary::default();
        let new_ids: HashSet<_> = definitions.iter().map(|d| d.id).collect();

        let removed: Vec<CheckId> = self
            .sessions
            .iter()
            .map(|entry| *entry.key())
            .filter(|id| !new_ids.contains(id))
            .collect();

        for id in removed {
            if let Some((_, handle)) = self.sessions.remove(&id) {
                info!(check = id, "Removing SMTP check");
                handle.shutdown().await;
                self.registry.forget(id);
                summary.removed.push(id);
            }
        }

        for definition in definitions {
            let id = definition.id;

            let unchanged = self
                .sessions
                .get(&id)
                .is_some_and(|handle| **handle.definition() == definition);
            if unchanged {
                summary.unchanged += 1;
                continue;
            }

            if let Some((_, handle)) = self.sessions.remove(&id) {
                info!(check = id, "Updating SMTP check config");
                handle.shutdown().await;
                self.registry.forget(id);
                summary.updated.push(id);
            } else {
                info!(check = id, backend = %smtp_check::Target(definition.backend), "Adding SMTP check");
                summary.added.push(id);
            }

            debug!("{}", definition);
            let session = CheckSession::new(
                Arc::new(definition),
                self.prober.clone(),
                self.registry.clone(),
                self.alerter.clone(),
                self.policy,
            );
            self.sessions.insert(id, SessionHandle::spawn(session));
        }

        if let Some(ref m) = self.metrics {
            m.update_session_count(self.sessions.len());
        }

        summary
    }

    /// Administratively enable or disable a check. Returns false if no such
    /// check is running.
    pub fn set_enabled(&self, id: CheckId, enabled: bool) -> bool {
        match self.sessions.get(&id) {
            Some(handle) => {
                info!(check = id, enabled, "Setting SMTP check enabled state");
                handle.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    /// Status of every running check, ordered by id
    pub fn statuses(&self) -> Vec<CheckStatus> {
        let mut statuses: Vec<CheckStatus> = self
            .sessions
            .iter()
            .map(|entry| {
                let handle = entry.value();
                let backend = handle.definition().backend;
                let record = self.registry.record(handle.id());

                CheckStatus {
                    id: handle.id(),
                    backend,
                    state: record.map(|r| r.state),
                    enabled: handle.is_enabled(),
                    backend_alive: self.registry.is_alive(backend),
                    last_change: record.map(|r| r.changed_at),
                }
            })
            .collect();

        statuses.sort_by_key(|s| s.id);
        statuses
    }

    pub fn contains(&self, id: CheckId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Stop every session and wait for them to finish
    pub async fn stop_all(&self) {
        let ids: Vec<CheckId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        let handles: Vec<SessionHandle> = ids
            .into_iter()
            .filter_map(|id| self.sessions.remove(&id).map(|(_, handle)| handle))
            .collect();

        info!("Stopping {} SMTP check sessions", handles.len());
        join_all(handles.into_iter().map(SessionHandle::shutdown)).await;

        if let Some(ref m) = self.metrics {
            m.update_session_count(0);
        }
    }
}
