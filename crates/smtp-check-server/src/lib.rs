//! SMTP check server
//!
//! Daemon that runs SMTP health checks against mail backends and reports
//! their state to a peer agent.
//!
//! # Architecture
//!
//! - The `smtp-check` crate runs one session per configured check
//! - This crate owns the shared state and process-level concerns
//! - JSON lines over a Unix socket carry health changes and alerts to the
//!   peer agent, which owns the load-balancer data path and the mailer
//!
//! # Components
//!
//! - **Manager**: Starts, restarts and stops check sessions on reload
//! - **Registry**: Aggregates per-check verdicts into backend liveness
//! - **Notifier**: Batches health changes and alerts for the peer
//! - **Peer**: Communicates with the peer agent via Unix socket

pub mod config;
pub mod http_server;
pub mod manager;
pub mod metrics;
pub mod notifier;
pub mod peer;
pub mod registry;
pub mod server;
pub mod telemetry;
pub mod types;

pub use config::{Config, ConfigError};
pub use http_server::MetricsServer;
pub use manager::{ApplySummary, Manager};
pub use metrics::MetricsRegistry;
pub use notifier::{ChannelAlerter, Notifier};
pub use registry::BackendRegistry;
pub use server::SmtpCheckServer;
pub use telemetry::{TelemetryGuard, setup_tracing_with_otel};
pub use types::ServerConfig;
