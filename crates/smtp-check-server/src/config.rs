//! Configuration loading and validation for the SMTP check server

use crate::types::ServerConfig;
use serde::{Deserialize, Serialize};
use smtp_check::{CheckDefinition, CheckId, RosterError, SmtpCheckConfig};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(#[from] ValidationErrors),

    #[error("Invalid SMTP check {id}: {source}")]
    Check {
        id: CheckId,
        #[source]
        source: RosterError,
    },
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub alerts: AlertSettings,

    #[serde(default)]
    pub channels: ChannelSettings,

    #[serde(default)]
    pub metrics: MetricsSettings,

    #[serde(default)]
    pub logging: LoggingSettings,

    #[serde(default)]
    pub telemetry: TelemetrySettings,

    #[serde(default)]
    pub checks: Vec<SmtpCheckConfig>,
}

impl Validate for Config {
    fn validate(&self) -> Result<(), ValidationErrors> {
        self.server.validate()?;
        self.alerts.validate()?;
        self.channels.validate()?;
        self.metrics.validate()?;
        self.logging.validate()?;

        if let Err(e) = validate_checks(&self.checks) {
            let mut errors = ValidationErrors::new();
            errors.add("checks", e);
            return Err(errors);
        }
        Ok(())
    }
}

/// Server-level settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ServerSettings {
    #[validate(length(min = 1), custom = "validate_socket_path")]
    pub peer_socket: String,
}

/// Alert delivery and notification batching
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AlertSettings {
    /// Skip alerts when the backend's aggregate state did not change
    pub suppress_unchanged: bool,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_batch_delay")]
    pub batch_delay: Duration,

    #[validate(range(min = 1, max = 10000))]
    pub batch_size: usize,
}

/// Channel buffer size settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ChannelSettings {
    #[validate(range(min = 10, max = 100000))]
    pub notification: usize,

    #[validate(range(min = 1, max = 1000))]
    pub peer_message: usize,
}

/// Prometheus endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,

    #[validate(custom = "validate_listen_addr")]
    pub listen_addr: String,
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct LoggingSettings {
    pub level: Option<String>,

    /// `text` (default) or `json`
    #[validate(custom = "validate_log_format")]
    pub format: Option<String>,
}

impl LoggingSettings {
    pub fn is_json(&self) -> bool {
        self.format.as_deref() == Some("json")
    }
}

/// OTLP exporter transport
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OtlpProtocol {
    #[default]
    Grpc,
    Http,
}

/// OpenTelemetry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub enabled: bool,
    pub service_name: String,
    pub otlp_endpoint: String,
    pub protocol: OtlpProtocol,
}

// Default implementations

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            peer_socket: "/var/run/smtp-check/peer.sock".to_string(),
        }
    }
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            suppress_unchanged: false,
            batch_delay: Duration::from_millis(100),
            batch_size: 100,
        }
    }
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            notification: 1000,
            peer_message: 10,
        }
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "127.0.0.1:9125".to_string(),
        }
    }
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            service_name: "smtp-check-server".to_string(),
            otlp_endpoint: "http://localhost:4317".to_string(),
            protocol: OtlpProtocol::Grpc,
        }
    }
}

// Custom validators

fn validate_socket_path(path: &str) -> Result<(), ValidationError> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::new("socket_path_empty"));
    }

    // Must be absolute path or relative (starting with ./)
    if !trimmed.starts_with('/') && !trimmed.starts_with("./") {
        return Err(ValidationError::new("socket_path_invalid_format"));
    }

    Ok(())
}

fn validate_batch_delay(delay: &Duration) -> Result<(), ValidationError> {
    let millis = delay.as_millis();
    if !(1..=10_000).contains(&millis) {
        return Err(ValidationError::new("batch_delay_out_of_range"));
    }
    Ok(())
}

fn validate_listen_addr(addr: &str) -> Result<(), ValidationError> {
    addr.parse::<SocketAddr>()
        .map(|_| ())
        .map_err(|_| ValidationError::new("listen_addr_invalid"))
}

fn validate_log_format(format: &str) -> Result<(), ValidationError> {
    match format {
        "text" | "json" => Ok(()),
        _ => Err(ValidationError::new("log_format_unknown")),
    }
}

fn validate_checks(checks: &[SmtpCheckConfig]) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();

    for check in checks {
        if !seen.insert(check.id) {
            return Err(ValidationError::new("duplicate_check_id"));
        }

        // The name goes on the wire verbatim
        if let Some(helo) = &check.helo_name {
            if helo.is_empty() || helo.chars().any(|c| c.is_whitespace() || c.is_control()) {
                return Err(ValidationError::new("helo_name_invalid"));
            }
        }

        if check.settings.interval.is_zero() {
            return Err(ValidationError::new("interval_zero"));
        }

        let timeouts = std::iter::once(&check.connection)
            .chain(&check.hosts)
            .filter_map(|h| h.connect_timeout);
        for timeout in timeouts {
            if timeout.is_zero() {
                return Err(ValidationError::new("connect_timeout_zero"));
            }
        }
    }

    Ok(())
}

// Configuration loading implementation

impl Config {
    /// Load configuration from default search paths
    pub fn load() -> Result<Self, ConfigError> {
        match Self::find_config_file() {
            Some(path) => {
                tracing::info!("Loading configuration from: {}", path.display());
                Self::load_from_file(&path)
            }
            None => {
                tracing::info!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load from `path` if given, otherwise from the search paths
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&contents)
    }

    /// Parse and validate a YAML document
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/smtp-check/smtp-check.yaml")];

        if let Some(home_path) = Self::home_config_path() {
            paths.push(home_path);
        }

        paths.push(PathBuf::from("./smtp-check.yaml"));

        paths.into_iter().find(|p: &PathBuf| p.exists() && p.is_file())
    }

    /// Get home directory config path
    fn home_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config/smtp-check/smtp-check.yaml"))
    }

    /// Resolve every configured check into its frozen runtime form
    pub fn check_definitions(&self) -> Result<Vec<CheckDefinition>, ConfigError> {
        self.checks
            .iter()
            .map(|check| {
                CheckDefinition::resolve(check).map_err(|source| ConfigError::Check {
                    id: check.id,
                    source,
                })
            })
            .collect()
    }

    /// Convert to ServerConfig
    pub fn to_server_config(&self) -> ServerConfig {
        ServerConfig {
            peer_socket: self.server.peer_socket.clone(),
            batch_delay: self.alerts.batch_delay,
            batch_size: self.alerts.batch_size,
            channel_size: self.channels.notification,
            peer_channel_size: self.channels.peer_message,
            suppress_unchanged: self.alerts.suppress_unchanged,
            metrics_enabled: self.metrics.enabled,
            metrics_listen_addr: self.metrics.listen_addr.clone(),
        }
    }
}
