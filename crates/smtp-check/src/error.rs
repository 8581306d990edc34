//! Failure taxonomy for SMTP probes.

use crate::protocol::ProtocolState;
use crate::types::Target;
use std::io;
use std::net::SocketAddr;

/// Terminal failure of one probe attempt. Every variant consumes the
/// host's retry budget.
#[derive(Debug, thiserror::Error)]
pub enum ProbeFailure {
    #[error("Error connecting to server {target}")]
    Connect {
        target: Target,
        #[source]
        source: io::Error,
    },

    #[error("Connection timeout to server {target}")]
    ConnectTimeout { target: Target },

    #[error("Read timeout from server {target}")]
    ReadTimeout { target: Target },

    #[error("Read failure from server {target}")]
    ReadFailure {
        target: Target,
        #[source]
        source: Option<io::Error>,
    },

    #[error("Write timeout to server {target}")]
    WriteTimeout { target: Target },

    #[error("Write failure to server {target}")]
    WriteFailure {
        target: Target,
        #[source]
        source: Option<io::Error>,
    },

    #[error("Bad greeting banner from server {target}")]
    BadGreeting { target: Target, status: Option<u16> },

    #[error("Bad HELO response from server {target}")]
    BadHeloResponse { target: Target, status: Option<u16> },

    #[error("Unknown smtp engine state encountered")]
    UnknownState { target: Target, state: ProtocolState },
}

/// Coarse classification of a [`ProbeFailure`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Connect,
    ConnectTimeout,
    ReadTimeout,
    ReadFailure,
    WriteTimeout,
    WriteFailure,
    BadGreeting,
    BadHeloResponse,
    UnknownState,
}

impl FailureKind {
    /// Stable label for metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Connect => "connect_error",
            FailureKind::ConnectTimeout => "connect_timeout",
            FailureKind::ReadTimeout => "read_timeout",
            FailureKind::ReadFailure => "read_failure",
            FailureKind::WriteTimeout => "write_timeout",
            FailureKind::WriteFailure => "write_failure",
            FailureKind::BadGreeting => "bad_greeting",
            FailureKind::BadHeloResponse => "bad_helo_response",
            FailureKind::UnknownState => "unknown_state",
        }
    }
}

impl ProbeFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            ProbeFailure::Connect { .. } => FailureKind::Connect,
            ProbeFailure::ConnectTimeout { .. } => FailureKind::ConnectTimeout,
            ProbeFailure::ReadTimeout { .. } => FailureKind::ReadTimeout,
            ProbeFailure::ReadFailure { .. } => FailureKind::ReadFailure,
            ProbeFailure::WriteTimeout { .. } => FailureKind::WriteTimeout,
            ProbeFailure::WriteFailure { .. } => FailureKind::WriteFailure,
            ProbeFailure::BadGreeting { .. } => FailureKind::BadGreeting,
            ProbeFailure::BadHeloResponse { .. } => FailureKind::BadHeloResponse,
            ProbeFailure::UnknownState { .. } => FailureKind::UnknownState,
        }
    }

    pub fn target(&self) -> Target {
        match self {
            ProbeFailure::Connect { target, .. }
            | ProbeFailure::ConnectTimeout { target }
            | ProbeFailure::ReadTimeout { target }
            | ProbeFailure::ReadFailure { target, .. }
            | ProbeFailure::WriteTimeout { target }
            | ProbeFailure::WriteFailure { target, .. }
            | ProbeFailure::BadGreeting { target, .. }
            | ProbeFailure::BadHeloResponse { target, .. }
            | ProbeFailure::UnknownState { target, .. } => *target,
        }
    }
}

/// Local failure while preparing the probe socket. Never charged to the
/// host's retry budget.
#[derive(Debug, thiserror::Error)]
pub enum SocketSetupError {
    #[error("failed to create socket: {0}")]
    Create(#[source] io::Error),

    #[error("failed to set fwmark {mark}: {source}")]
    Mark {
        mark: u32,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind to interface {interface}: {source}")]
    BindDevice {
        interface: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to register socket with the runtime: {0}")]
    Register(#[source] io::Error),
}

/// Anything that can end a probe other than success
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error(transparent)]
    Setup(#[from] SocketSetupError),

    #[error(transparent)]
    Failed(#[from] ProbeFailure),
}

/// Invalid connection options found while resolving a host roster
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RosterError {
    #[error("bind address {bind} does not match the address family of {destination}")]
    FamilyMismatch {
        destination: SocketAddr,
        bind: SocketAddr,
    },

    #[error("destination {0} has port 0")]
    ZeroPort(SocketAddr),
}
