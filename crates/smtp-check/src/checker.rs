//! Probe implementations.

use crate::connector::{self, ConnectOutcome};
use crate::error::{ProbeError, ProbeFailure};
use crate::protocol::run_dialogue;
use crate::transport::LineTransport;
use crate::types::HostConfig;
use async_trait::async_trait;

/// One probe attempt against one host
#[async_trait]
pub trait Prober: Send + Sync {
    /// Probe `host`, presenting `helo_name`. Any socket opened by the
    /// attempt is closed before this returns.
    async fn probe(&self, host: &HostConfig, helo_name: &str) -> Result<(), ProbeError>;
}

/// Speaks the start of an SMTP dialogue: greeting, HELO, QUIT.
#[derive(Debug, Default, Clone, Copy)]
pub struct SmtpProber;

impl SmtpProber {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Prober for SmtpProber {
    async fn probe(&self, host: &HostConfig, helo_name: &str) -> Result<(), ProbeError> {
        let target = host.target();

        let stream = match connector::connect(host).await? {
            ConnectOutcome::Connected(stream) => stream,
            ConnectOutcome::Error(source) => {
                return Err(ProbeFailure::Connect { target, source }.into());
            }
            ConnectOutcome::Timeout => {
                return Err(ProbeFailure::ConnectTimeout { target }.into());
            }
        };

        let mut transport = LineTransport::new(stream, target, host.connect_timeout);
        run_dialogue(&mut transport, helo_name).await?;
        Ok(())
    }
}
