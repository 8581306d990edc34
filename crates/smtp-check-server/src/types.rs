//! Types for the SMTP check server and its peer link.

use serde::{Deserialize, Serialize};
use smtp_check::{Alert, CheckId, HealthState};
use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket path for the peer agent link
    pub peer_socket: String,

    /// Batch delay for notifications
    pub batch_delay: Duration,

    /// Maximum batch size
    pub batch_size: usize,

    /// Notification channel buffer size
    pub channel_size: usize,

    /// Peer message channel buffer size
    pub peer_channel_size: usize,

    /// Only alert when a backend's aggregate liveness changes
    pub suppress_unchanged: bool,

    /// Serve Prometheus metrics
    pub metrics_enabled: bool,

    /// Listen address of the metrics endpoint
    pub metrics_listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            peer_socket: "/var/run/smtp-check/peer.sock".to_string(),
            batch_delay: Duration::from_millis(100),
            batch_size: 100,
            channel_size: 1000,
            peer_channel_size: 10,
            suppress_unchanged: false,
            metrics_enabled: true,
            metrics_listen_addr: "127.0.0.1:9125".to_string(),
        }
    }
}

/// Event forwarded to the peer agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    /// A check changed its verdict for a backend. The agent applies
    /// `backend_alive` to the load-balancer data path.
    Health {
        check: CheckId,
        backend: SocketAddr,
        state: HealthState,
        backend_alive: bool,
    },

    /// State-change alert for the agent's mailer
    Alert(Alert),
}

impl Notification {
    pub fn check(&self) -> CheckId {
        match self {
            Notification::Health { check, .. } => *check,
            Notification::Alert(alert) => alert.check,
        }
    }
}

/// Batch of notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationBatch {
    pub notifications: Vec<Notification>,
}

/// Snapshot of one running check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckStatus {
    pub id: CheckId,
    pub backend: SocketAddr,

    /// Last verdict, `None` until the first pass or failure completes
    pub state: Option<HealthState>,

    pub enabled: bool,
    pub backend_alive: bool,
    pub last_change: Option<SystemTime>,
}

/// Message from the peer agent to the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerToServerMsg {
    /// Re-read the configuration file
    Reload,

    /// Request status for all checks
    RequestStatus,

    /// Administratively enable or disable one check
    SetEnabled { id: CheckId, enabled: bool },

    /// Shutdown server
    Shutdown,
}

/// Message from the server to the peer agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerToPeerMsg {
    /// Server ready
    Ready,

    /// Batched health changes and alerts
    NotificationBatch { batch: NotificationBatch },

    /// Response to status request
    StatusResponse { statuses: Vec<CheckStatus> },

    /// Error occurred
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use smtp_check::{AlertCategory, Target};

    #[test]
    fn test_peer_message_wire_format() {
        let msg: PeerToServerMsg =
            serde_json::from_str(r#"{"type":"set_enabled","id":4,"enabled":false}"#).unwrap();
        assert_eq!(
            msg,
            PeerToServerMsg::SetEnabled {
                id: 4,
                enabled: false
            }
        );

        let msg: PeerToServerMsg = serde_json::from_str(r#"{"type":"reload"}"#).unwrap();
        assert_eq!(msg, PeerToServerMsg::Reload);

        assert_eq!(
            serde_json::to_string(&ServerToPeerMsg::Ready).unwrap(),
            r#"{"type":"ready"}"#
        );
    }

    #[test]
    fn test_notification_wire_format() {
        let health = Notification::Health {
            check: 1,
            backend: "10.0.0.5:25".parse().unwrap(),
            state: HealthState::Down,
            backend_alive: false,
        };
        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["kind"], "health");
        assert_eq!(json["state"], "down");
        assert_eq!(json["backend"], "10.0.0.5:25");

        let alert = Notification::Alert(Alert {
            category: AlertCategory::BackendStateChange,
            check: 2,
            backend: "10.0.0.5:25".parse().unwrap(),
            host: Some(Target("10.0.0.6:25".parse().unwrap())),
            state: HealthState::Down,
            message: "=> CHECK failed on service : Read timeout from server [10.0.0.6]:25 <="
                .to_string(),
        });
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["kind"], "alert");
        assert_eq!(json["category"], "backend_state_change");
        assert_eq!(alert.check(), 2);

        let back: Notification = serde_json::from_value(json).unwrap();
        assert_eq!(back, alert);
    }
}
