//! Prometheus metrics for the SMTP check server.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use smtp_check::{CheckId, HealthState};
use std::time::Duration;

/// Labels for per-check metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CheckLabels {
    /// Check ID
    pub check: String,
}

/// Labels for probe result metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProbeLabels {
    /// Check ID
    pub check: String,
    /// `success` or a failure kind (connect_timeout, bad_greeting, ...)
    pub result: String,
}

/// Labels for state transition metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TransitionLabels {
    /// Check ID
    pub check: String,
    /// New state
    pub to: String,
}

/// Labels for alert metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StateLabels {
    /// State (up, down)
    pub state: String,
}

/// Labels for batch trigger metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BatchTriggerLabels {
    /// Trigger reason (size_limit, time_delay, shutdown)
    pub trigger: String,
}

/// Labels for outcome metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    /// success or failure
    pub result: String,
}

/// Labels for error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// Error type (peer_parse, peer_io, alert_dropped, ...)
    pub error_type: String,
}

/// Metrics registry with all SMTP check server metrics
pub struct MetricsRegistry {
    /// Prometheus registry
    pub registry: Registry,

    // Per-check metrics
    probes_total: Family<ProbeLabels, Counter>,
    probe_duration_seconds: Family<CheckLabels, Histogram>,
    /// Current checker state (1=up, 0=down)
    state: Family<CheckLabels, Gauge>,
    state_transitions_total: Family<TransitionLabels, Counter>,

    // System-wide metrics
    alerts_total: Family<StateLabels, Counter>,
    sessions_active: Gauge,
    config_reloads_total: Family<OutcomeLabels, Counter>,
    notifications_sent_total: Family<BatchTriggerLabels, Counter>,
    batch_size: Histogram,
    peer_connected: Gauge,
    errors_total: Family<ErrorLabels, Counter>,
}

impl MetricsRegistry {
    /// Counters are registered without their `_total` suffix; the text
    /// encoder appends it.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let probes_total = Family::<ProbeLabels, Counter>::default();
        registry.register(
            "smtp_check_probes",
            "Total SMTP probes performed by result",
            probes_total.clone(),
        );

        let probe_duration_seconds =
            Family::<CheckLabels, Histogram>::new_with_constructor(|| {
                // 1ms to ~16s
                Histogram::new(exponential_buckets(0.001, 2.0, 15))
            });
        registry.register(
            "smtp_check_probe_duration_seconds",
            "SMTP probe duration in seconds",
            probe_duration_seconds.clone(),
        );

        let state = Family::<CheckLabels, Gauge>::default();
        registry.register(
            "smtp_check_state",
            "Current checker state (1=up, 0=down)",
            state.clone(),
        );

        let state_transitions_total = Family::<TransitionLabels, Counter>::default();
        registry.register(
            "smtp_check_state_transitions",
            "Total checker state transitions",
            state_transitions_total.clone(),
        );

        let alerts_total = Family::<StateLabels, Counter>::default();
        registry.register(
            "smtp_check_alerts",
            "Total state-change alerts queued",
            alerts_total.clone(),
        );

        let sessions_active = Gauge::default();
        registry.register(
            "smtp_check_sessions_active",
            "Number of running check sessions",
            sessions_active.clone(),
        );

        let config_reloads_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "smtp_check_config_reloads",
            "Total configuration reloads by outcome",
            config_reloads_total.clone(),
        );

        let notifications_sent_total = Family::<BatchTriggerLabels, Counter>::default();
        registry.register(
            "smtp_check_notification_batches",
            "Total notification batches sent to the peer",
            notifications_sent_total.clone(),
        );

        let batch_size = Histogram::new([1.0, 5.0, 10.0, 50.0, 100.0, 500.0].into_iter());
        registry.register(
            "smtp_check_batch_size",
            "Notification batch size",
            batch_size.clone(),
        );

        let peer_connected = Gauge::default();
        registry.register(
            "smtp_check_peer_connected",
            "Peer connection state (1=connected, 0=disconnected)",
            peer_connected.clone(),
        );

        let errors_total = Family::<ErrorLabels, Counter>::default();
        registry.register(
            "smtp_check_errors",
            "Total errors by type",
            errors_total.clone(),
        );

        Self {
            registry,
            probes_total,
            probe_duration_seconds,
            state,
            state_transitions_total,
            alerts_total,
            sessions_active,
            config_reloads_total,
            notifications_sent_total,
            batch_size,
            peer_connected,
            errors_total,
        }
    }

    /// Record a finished probe attempt
    pub fn record_probe(&self, check: CheckId, result: &str, duration: Duration) {
        let check = check.to_string();

        self.probes_total
            .get_or_create(&ProbeLabels {
                check: check.clone(),
                result: result.to_string(),
            })
            .inc();

        self.probe_duration_seconds
            .get_or_create(&CheckLabels { check })
            .observe(duration.as_secs_f64());
    }

    /// Update checker state gauge
    pub fn set_check_state(&self, check: CheckId, state: HealthState) {
        self.state
            .get_or_create(&CheckLabels {
                check: check.to_string(),
            })
            .set(if state == HealthState::Up { 1 } else { 0 });
    }

    /// Drop the per-check state gauge of a removed check
    pub fn remove_check(&self, check: CheckId) {
        self.state.remove(&CheckLabels {
            check: check.to_string(),
        });
    }

    pub fn record_state_transition(&self, check: CheckId, to: HealthState) {
        self.state_transitions_total
            .get_or_create(&TransitionLabels {
                check: check.to_string(),
                to: state_label(to).to_string(),
            })
            .inc();
    }

    pub fn record_alert(&self, state: HealthState) {
        self.alerts_total
            .get_or_create(&StateLabels {
                state: state_label(state).to_string(),
            })
            .inc();
    }

    pub fn update_session_count(&self, count: usize) {
        self.sessions_active.set(count as i64);
    }

    pub fn record_config_reload(&self, success: bool) {
        self.config_reloads_total
            .get_or_create(&OutcomeLabels {
                result: if success { "success" } else { "failure" }.to_string(),
            })
            .inc();
    }

    /// Record batch sent
    pub fn record_batch_sent(&self, size: usize, trigger: &str) {
        self.notifications_sent_total
            .get_or_create(&BatchTriggerLabels {
                trigger: trigger.to_string(),
            })
            .inc();

        self.batch_size.observe(size as f64);
    }

    pub fn set_peer_connected(&self, connected: bool) {
        self.peer_connected.set(if connected { 1 } else { 0 });
    }

    /// Record error by type
    pub fn record_error(&self, error_type: &str) {
        self.errors_total
            .get_or_create(&ErrorLabels {
                error_type: error_type.to_string(),
            })
            .inc();
    }

    /// Encode all metrics in the Prometheus text format
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn state_label(state: HealthState) -> &'static str {
    match state {
        HealthState::Up => "up",
        HealthState::Down => "down",
    }
}
