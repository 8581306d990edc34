//! SMTP health checking for load-balanced mail backends.
//!
//! Each configured check owns a roster of hosts. A session walks the roster
//! one probe at a time, holding a short SMTP dialogue with every host:
//! - wait for a `220` greeting
//! - send `HELO <name>` and expect `250`
//! - send `QUIT` and read one reply line
//!
//! Failures are retried per host with a backoff delay. When the retry budget
//! of a host is spent the backend is reported DOWN; a full pass over every
//! host reports it UP again. Verdicts go to a [`HealthRegistry`] and state
//! changes to an [`Alerter`].
//!
//! # Example
//!
//! ```no_run
//! use smtp_check::{AlertPolicy, CheckDefinition, CheckSession, SessionHandle, SmtpCheckConfig, SmtpProber};
//! # use smtp_check::{Alert, Alerter, HealthRegistry, HealthState, CheckId};
//! # use std::net::SocketAddr;
//! use std::sync::Arc;
//!
//! # struct Registry;
//! # impl HealthRegistry for Registry {
//! #     fn is_alive(&self, _: SocketAddr) -> bool { true }
//! #     fn update(&self, _: CheckId, _: SocketAddr, _: HealthState) {}
//! # }
//! # struct Log;
//! # impl Alerter for Log { fn send(&self, alert: Alert) { println!("{}", alert.message) } }
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config: SmtpCheckConfig = serde_yaml::from_str(
//!     "id: 1\nbackend: 192.168.1.25:25\nhelo_name: lb.example.com\nretry: 2\n",
//! )?;
//! let definition = Arc::new(CheckDefinition::resolve(&config)?);
//!
//! let session = CheckSession::new(
//!     definition,
//!     Arc::new(SmtpProber::new()),
//!     Arc::new(Registry),
//!     Arc::new(Log),
//!     AlertPolicy::default(),
//! );
//! let handle = SessionHandle::spawn(session);
//!
//! // Later
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod checker;
pub mod connector;
pub mod controller;
pub mod error;
pub mod protocol;
pub mod roster;
pub mod transport;
pub mod types;

pub use checker::{Prober, SmtpProber};
pub use controller::{
    Alert, AlertCategory, AlertPolicy, Alerter, CheckSession, HealthRegistry, Reschedule,
    RescheduleReason, SessionHandle,
};
pub use error::{FailureKind, ProbeError, ProbeFailure, RosterError, SocketSetupError};
pub use protocol::{ProtocolState, parse_status};
pub use roster::HostRoster;
pub use types::{
    CheckDefinition, CheckId, CheckSettings, ConnectOptions, HealthState, HostConfig,
    SmtpCheckConfig, Target,
};
