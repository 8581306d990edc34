//! Notifier for batching health changes and alerts for the peer agent.

use crate::metrics::MetricsRegistry;
use crate::types::{Notification, NotificationBatch, ServerToPeerMsg};
use smtp_check::{Alert, Alerter, Target};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, interval};
use tracing::{debug, info, warn};

/// Notifier batches notifications and sends them to the peer link.
///
/// Health changes arrive on an unbounded channel and are never dropped;
/// alerts arrive on a bounded one.
pub struct Notifier {
    health_rx: mpsc::UnboundedReceiver<Notification>,
    alert_rx: mpsc::Receiver<Notification>,
    peer_tx: mpsc::Sender<ServerToPeerMsg>,
    batch_delay: Duration,
    batch_size: usize,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl Notifier {
    pub fn new(
        health_rx: mpsc::UnboundedReceiver<Notification>,
        alert_rx: mpsc::Receiver<Notification>,
        peer_tx: mpsc::Sender<ServerToPeerMsg>,
        batch_delay: Duration,
        batch_size: usize,
        metrics: Option<Arc<MetricsRegistry>>,
    ) -> Self {
        Self {
            health_rx,
            alert_rx,
            peer_tx,
            batch_delay,
            batch_size,
            metrics,
        }
    }

    /// Run until every health and alert sender is gone, then flush what is left
    pub async fn run(mut self) {
        info!("Notifier task started");

        let mut batch = Vec::new();
        let mut batch_timer = interval(self.batch_delay);
        batch_timer.tick().await; // Skip first immediate tick

        let mut last_batch_time = Instant::now();
        let mut health_open = true;
        let mut alerts_open = true;

        while health_open || alerts_open {
            let received = tokio::select! {
                received = self.health_rx.recv(), if health_open => {
                    health_open = received.is_some();
                    received
                }
                received = self.alert_rx.recv(), if alerts_open => {
                    alerts_open = received.is_some();
                    received
                }
                _ = batch_timer.tick() => {
                    if !batch.is_empty() && last_batch_time.elapsed() >= self.batch_delay {
                        self.send_batch(&mut batch, "time_delay").await;
                        last_batch_time = Instant::now();
                    }
                    None
                }
            };

            let Some(notification) = received else {
                continue;
            };
            debug!(check = notification.check(), "Received notification");
            batch.push(notification);

            if batch.len() >= self.batch_size {
                self.send_batch(&mut batch, "size_limit").await;
                last_batch_time = Instant::now();
                batch_timer.reset();
            }
        }

        self.send_batch(&mut batch, "shutdown").await;
        info!("Notifier task stopped");
    }

    async fn send_batch(&self, batch: &mut Vec<Notification>, trigger: &str) {
        if batch.is_empty() {
            return;
        }

        debug!(size = batch.len(), trigger, "Sending notification batch");

        if let Some(ref m) = self.metrics {
            m.record_batch_sent(batch.len(), trigger);
        }

        let msg = ServerToPeerMsg::NotificationBatch {
            batch: NotificationBatch {
                notifications: std::mem::take(batch),
            },
        };

        if let Err(e) = self.peer_tx.send(msg).await {
            warn!(error = %e, "Failed to send batch to peer");
        }
    }
}

/// [`Alerter`] that queues alerts for the notifier without blocking the
/// session that raised them. Alerts are dropped with a warning when the
/// queue is full.
#[derive(Clone)]
pub struct ChannelAlerter {
    alert_tx: mpsc::Sender<Notification>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl ChannelAlerter {
    pub fn new(alert_tx: mpsc::Sender<Notification>, metrics: Option<Arc<MetricsRegistry>>) -> Self {
        Self { alert_tx, metrics }
    }
}

impl Alerter for ChannelAlerter {
    fn send(&self, alert: Alert) {
        info!(
            check = alert.check,
            backend = %Target(alert.backend),
            state = %alert.state,
            "{}",
            alert.message
        );

        if let Some(ref m) = self.metrics {
            m.record_alert(alert.state);
        }

        match self.alert_tx.try_send(Notification::Alert(alert)) {
            Ok(()) => {}
            Err(TrySendError::Full(n)) => {
                warn!(check = n.check(), "Alert channel full, dropping alert");
                if let Some(ref m) = self.metrics {
                    m.record_error("alert_dropped");
                }
            }
            Err(TrySendError::Closed(n)) => {
                warn!(check = n.check(), "Alert channel closed, dropping alert");
            }
        }
    }
}
