//! SMTP health check types and structures.

use crate::roster::HostRoster;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Health check ID
pub type CheckId = u64;

/// HELO name presented when a check does not configure one.
pub const DEFAULT_HELO_NAME: &str = "smtpchecker.localdomain";

/// Per-I/O timeout applied when neither the host nor the check sets one.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Checker verdict pushed to the health registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Up,
    Down,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Up => write!(f, "UP"),
            HealthState::Down => write!(f, "DOWN"),
        }
    }
}

/// Identity of a probed host, rendered as `[ip]:port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target(pub SocketAddr);

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]:{}", self.0.ip(), self.0.port())
    }
}

/// One resolved probe target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// Address the SMTP dialogue is held with
    pub destination: SocketAddr,

    /// Local address to bind before connecting
    pub bind_address: Option<SocketAddr>,

    /// Interface to bind the socket to (SO_BINDTODEVICE)
    pub bind_interface: Option<String>,

    /// Firewall mark applied to the socket (SO_MARK)
    pub fwmark: Option<u32>,

    /// Timeout for connect and for every read or write
    pub connect_timeout: Duration,
}

impl HostConfig {
    /// Host identity used in logs and failure contexts
    pub fn target(&self) -> Target {
        Target(self.destination)
    }
}

impl fmt::Display for HostConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.target())?;
        if let Some(bind) = self.bind_address {
            write!(f, " bind {}", Target(bind))?;
        }
        if let Some(interface) = &self.bind_interface {
            write!(f, " dev {}", interface)?;
        }
        if let Some(mark) = self.fwmark {
            write!(f, " fwmark {}", mark)?;
        }
        write!(f, " timeout {:?}", self.connect_timeout)
    }
}

/// Per-host connection options as written in configuration. Every field is
/// optional; unset fields are filled in by [`HostRoster::resolve`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOptions {
    #[serde(default)]
    pub connect_ip: Option<IpAddr>,

    #[serde(default)]
    pub connect_port: Option<u16>,

    #[serde(default)]
    pub bind_to: Option<IpAddr>,

    #[serde(default)]
    pub bind_port: Option<u16>,

    #[serde(default)]
    pub bind_if: Option<String>,

    #[serde(default)]
    pub fwmark: Option<u32>,

    #[serde(default, with = "humantime_serde")]
    pub connect_timeout: Option<Duration>,
}

/// Timing and policy knobs shared by every host of one check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckSettings {
    /// Steady-state delay between full passes
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Retries allowed on a host before the backend is marked down
    pub retry: u32,

    /// Backoff between retries of the same host
    #[serde(with = "humantime_serde")]
    pub delay_before_retry: Duration,

    /// Send alerts for state changes of this backend
    pub alert: bool,

    /// Administratively enabled at startup
    pub enabled: bool,
}

impl Default for CheckSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            retry: 1,
            delay_before_retry: Duration::from_secs(1),
            alert: false,
            enabled: true,
        }
    }
}

/// SMTP check definition as written in configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpCheckConfig {
    pub id: CheckId,

    /// The real server whose health this check decides
    pub backend: SocketAddr,

    #[serde(default)]
    pub helo_name: Option<String>,

    /// Check-level connection options, the default for every host
    #[serde(default)]
    pub connection: ConnectOptions,

    /// Extra hosts to probe (deprecated, prefer one check per host)
    #[serde(default)]
    pub hosts: Vec<ConnectOptions>,

    #[serde(flatten)]
    pub settings: CheckSettings,
}

/// Frozen, fully resolved check. Built once per configuration load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckDefinition {
    pub id: CheckId,
    pub backend: SocketAddr,
    pub roster: HostRoster,
    pub helo_name: String,
    pub settings: CheckSettings,
}

impl CheckDefinition {
    /// Resolve a configured check into its immutable runtime form
    pub fn resolve(config: &SmtpCheckConfig) -> Result<Self, crate::error::RosterError> {
        let roster = HostRoster::resolve(config.backend, &config.connection, &config.hosts)?;
        if !config.hosts.is_empty() {
            tracing::info!(
                check = config.id,
                "The SMTP check host block is deprecated. Please define additional checks."
            );
        }

        Ok(Self {
            id: config.id,
            backend: config.backend,
            roster,
            helo_name: config
                .helo_name
                .clone()
                .unwrap_or_else(|| DEFAULT_HELO_NAME.to_string()),
            settings: config.settings.clone(),
        })
    }
}

impl fmt::Display for CheckDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "SMTP check {} for backend {}", self.id, Target(self.backend))?;
        writeln!(f, "  helo = {}", self.helo_name)?;
        writeln!(
            f,
            "  interval = {:?}, retry = {}, delay_before_retry = {:?}, alert = {}",
            self.settings.interval,
            self.settings.retry,
            self.settings.delay_before_retry,
            self.settings.alert
        )?;
        for host in self.roster.iter() {
            writeln!(f, "  host {}", host)?;
        }
        Ok(())
    }
}
