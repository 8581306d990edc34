//! Integration tests for Manager component

use async_trait::async_trait;
use smtp_check::{
    AlertPolicy, CheckDefinition, HealthState, HostConfig, ProbeError, ProbeFailure, Prober,
    SmtpCheckConfig, Target,
};
use smtp_check_server::manager::Manager;
use smtp_check_server::notifier::ChannelAlerter;
use smtp_check_server::registry::BackendRegistry;
use smtp_check_server::types::Notification;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Prober that fails hosts listed as down and counts every probe
#[derive(Default)]
struct FakeProber {
    down: Mutex<HashSet<SocketAddr>>,
    probes: AtomicUsize,
}

#[async_trait]
impl Prober for FakeProber {
    async fn probe(&self, host: &HostConfig, _helo_name: &str) -> Result<(), ProbeError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.down.lock().unwrap().contains(&host.destination) {
            return Err(ProbeFailure::ConnectTimeout {
                target: Target(host.destination),
            }
            .into());
        }
        Ok(())
    }
}

/// Helper to build a resolved check definition
fn definition(id: u64, backend: &str, retry: u32) -> CheckDefinition {
    let yaml = format!(
        "id: {}\nbackend: {}\nretry: {}\ninterval: 1s\ndelay_before_retry: 10ms\n",
        id, backend, retry
    );
    let config: SmtpCheckConfig = serde_yaml::from_str(&yaml).unwrap();
    CheckDefinition::resolve(&config).unwrap()
}

struct Fixture {
    manager: Manager,
    prober: Arc<FakeProber>,
    _health_rx: mpsc::UnboundedReceiver<Notification>,
    _alert_rx: mpsc::Receiver<Notification>,
}

fn fixture() -> Fixture {
    let (health_tx, health_rx) = mpsc::unbounded_channel::<Notification>();
    let (alert_tx, alert_rx) = mpsc::channel::<Notification>(100);
    let prober = Arc::new(FakeProber::default());
    let registry = Arc::new(BackendRegistry::new(health_tx, None));
    let alerter = Arc::new(ChannelAlerter::new(alert_tx, None));

    let manager = Manager::new(
        prober.clone(),
        registry,
        alerter,
        AlertPolicy::default(),
        None,
    );

    Fixture {
        manager,
        prober,
        _health_rx: health_rx,
        _alert_rx: alert_rx,
    }
}

#[tokio::test]
async fn test_manager_adds_new_checks() {
    let f = fixture();

    let summary = f
        .manager
        .apply(vec![
            definition(1, "10.0.0.5:25", 0),
            definition(2, "10.0.0.6:25", 0),
        ])
        .await;

    assert_eq!(summary.added, vec![1, 2]);
    assert_eq!(f.manager.len(), 2);

    tokio::time::sleep(Duration::from_millis(100)).await;

    let statuses = f.manager.statuses();
    assert_eq!(statuses.len(), 2);
    assert!(statuses.iter().all(|s| s.state == Some(HealthState::Up)));
    assert!(statuses.iter().all(|s| s.enabled && s.backend_alive));

    f.manager.stop_all().await;
    assert!(f.manager.is_empty());
}

#[tokio::test]
async fn test_manager_reports_down_backend() {
    let f = fixture();
    f.prober
        .down
        .lock()
        .unwrap()
        .insert("10.0.0.7:25".parse().unwrap());

    f.manager.apply(vec![definition(3, "10.0.0.7:25", 1)]).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let status = &f.manager.statuses()[0];
    assert_eq!(status.state, Some(HealthState::Down));
    assert!(!status.backend_alive);
    // One attempt plus one retry
    assert_eq!(f.prober.probes.load(Ordering::SeqCst), 2);

    f.manager.stop_all().await;
}

#[tokio::test]
async fn test_manager_keeps_unchanged_and_restarts_changed() {
    let f = fixture();

    f.manager
        .apply(vec![
            definition(1, "10.0.0.5:25", 0),
            definition(2, "10.0.0.6:25", 0),
            definition(3, "10.0.0.7:25", 0),
        ])
        .await;

    let summary = f
        .manager
        .apply(vec![
            definition(1, "10.0.0.5:25", 0),
            definition(2, "10.0.0.6:25", 3),
        ])
        .await;

    assert_eq!(summary.unchanged, 1);
    assert_eq!(summary.updated, vec![2]);
    assert_eq!(summary.removed, vec![3]);
    assert!(summary.added.is_empty());
    assert!(f.manager.contains(1));
    assert!(!f.manager.contains(3));

    f.manager.stop_all().await;
}

#[tokio::test]
async fn test_manager_removal_releases_backend() {
    let f = fixture();
    f.prober
        .down
        .lock()
        .unwrap()
        .insert("10.0.0.8:25".parse().unwrap());

    f.manager
        .apply(vec![
            definition(1, "10.0.0.8:25", 0),
            definition(2, "10.0.0.9:25", 0),
        ])
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(f.manager.statuses()[0].state, Some(HealthState::Down));

    f.manager.apply(vec![definition(2, "10.0.0.9:25", 0)]).await;

    let statuses = f.manager.statuses();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].id, 2);

    f.manager.stop_all().await;
}

#[tokio::test]
async fn test_manager_set_enabled() {
    let f = fixture();
    f.manager.apply(vec![definition(5, "10.0.0.5:25", 0)]).await;

    assert!(f.manager.set_enabled(5, false));
    assert!(!f.manager.statuses()[0].enabled);
    assert!(!f.manager.set_enabled(42, false));

    f.manager.stop_all().await;
}
