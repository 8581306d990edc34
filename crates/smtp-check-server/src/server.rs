//! Main SMTP check server implementation.

use crate::config::Config;
use crate::http_server::MetricsServer;
use crate::manager::Manager;
use crate::metrics::MetricsRegistry;
use crate::notifier::{ChannelAlerter, Notifier};
use crate::peer::PeerLink;
use crate::registry::BackendRegistry;
use crate::types::{Notification, PeerToServerMsg, ServerToPeerMsg};
use common::{Error, Result};
use smtp_check::{AlertPolicy, SmtpProber};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// SMTP check server
pub struct SmtpCheckServer {
    config: Config,

    /// File to re-read on reload; `None` searches the default locations
    config_path: Option<PathBuf>,
}

impl SmtpCheckServer {
    pub fn new(config: Config, config_path: Option<PathBuf>) -> Self {
        Self {
            config,
            config_path,
        }
    }

    /// Run the server until SIGTERM, ctrl-c or a peer `Shutdown`
    pub async fn run(self) -> Result<()> {
        info!("Starting SMTP check server");
        let server_config = self.config.to_server_config();

        // Resolve before spawning anything so a bad file fails startup
        let definitions = self
            .config
            .check_definitions()
            .map_err(Error::config)?;

        let (health_tx, health_rx) = mpsc::unbounded_channel::<Notification>();
        let (alert_tx, alert_rx) = mpsc::channel::<Notification>(server_config.channel_size);
        let (to_peer_tx, to_peer_rx) =
            mpsc::channel::<ServerToPeerMsg>(server_config.channel_size);
        let (from_peer_tx, mut from_peer_rx) =
            mpsc::channel::<PeerToServerMsg>(server_config.peer_channel_size);

        let metrics = if server_config.metrics_enabled {
            info!("Metrics enabled on {}", server_config.metrics_listen_addr);
            Some(Arc::new(MetricsRegistry::new()))
        } else {
            info!("Metrics disabled");
            None
        };

        let registry = Arc::new(BackendRegistry::new(health_tx, metrics.clone()));
        let alerter = Arc::new(ChannelAlerter::new(alert_tx, metrics.clone()));
        let manager = Manager::new(
            Arc::new(SmtpProber::new()),
            registry,
            alerter,
            AlertPolicy {
                suppress_unchanged: server_config.suppress_unchanged,
            },
            metrics.clone(),
        );
        let notifier = Notifier::new(
            health_rx,
            alert_rx,
            to_peer_tx.clone(),
            server_config.batch_delay,
            server_config.batch_size,
            metrics.clone(),
        );
        let peer = PeerLink::new(
            server_config.peer_socket.clone(),
            to_peer_rx,
            from_peer_tx,
            metrics.clone(),
        );

        let metrics_handle = metrics.as_ref().map(|registry| {
            let server =
                MetricsServer::new(registry.clone(), server_config.metrics_listen_addr.clone());
            tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    warn!(error = %e, "Metrics server error");
                }
            })
        });

        let peer_handle = tokio::spawn(async move {
            if let Err(e) = peer.run().await {
                warn!(error = %e, "Peer link error");
            }
        });

        let notifier_handle = tokio::spawn(notifier.run());

        let summary = manager.apply(definitions).await;
        info!(checks = summary.added.len(), "SMTP check sessions started");

        let mut hangup = signal(SignalKind::hangup())?;
        let mut terminate = signal(SignalKind::terminate())?;

        loop {
            tokio::select! {
                _ = hangup.recv() => {
                    info!("Received SIGHUP, reloading configuration");
                    self.reload(&manager, metrics.as_deref()).await;
                }
                _ = terminate.recv() => {
                    info!("Received SIGTERM");
                    break;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received interrupt");
                    break;
                }
                Some(msg) = from_peer_rx.recv() => {
                    match msg {
                        PeerToServerMsg::Reload => {
                            info!("Received reload request from peer");
                            self.reload(&manager, metrics.as_deref()).await;
                        }
                        PeerToServerMsg::RequestStatus => {
                            let statuses = manager.statuses();
                            if let Err(e) = to_peer_tx.send(ServerToPeerMsg::StatusResponse { statuses }).await {
                                warn!(error = %e, "Failed to send status response");
                            }
                        }
                        PeerToServerMsg::SetEnabled { id, enabled } => {
                            if !manager.set_enabled(id, enabled) {
                                let message = format!("unknown check id {}", id);
                                warn!(check = id, "{}", message);
                                if let Err(e) = to_peer_tx.send(ServerToPeerMsg::Error { message }).await {
                                    warn!(error = %e, "Failed to send error reply");
                                }
                            }
                        }
                        PeerToServerMsg::Shutdown => {
                            info!("Received shutdown request from peer");
                            break;
                        }
                    }
                }
            }
        }

        manager.stop_all().await;

        // Sessions hold the last notification senders; once they are gone
        // the notifier flushes its final batch and exits.
        drop(manager);
        if let Err(e) = notifier_handle.await {
            warn!(error = %e, "Notifier task failed");
        }

        peer_handle.abort();
        if let Some(handle) = metrics_handle {
            handle.abort();
        }

        info!("SMTP check server stopped");
        Ok(())
    }

    async fn reload(&self, manager: &Manager, metrics: Option<&MetricsRegistry>) {
        let result = Config::load_from(self.config_path.as_deref())
            .and_then(|config| config.check_definitions());

        match result {
            Ok(definitions) => {
                let summary = manager.apply(definitions).await;
                info!(
                    added = summary.added.len(),
                    updated = summary.updated.len(),
                    removed = summary.removed.len(),
                    unchanged = summary.unchanged,
                    "Configuration reloaded"
                );
                if let Some(m) = metrics {
                    m.record_config_reload(true);
                }
            }
            Err(e) => {
                error!(error = %e, "Configuration reload failed, keeping current checks");
                if let Some(m) = metrics {
                    m.record_config_reload(false);
                }
            }
        }
    }
}
