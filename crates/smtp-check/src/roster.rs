//! Ordered list of hosts probed for one backend.

use crate::error::RosterError;
use crate::types::{ConnectOptions, DEFAULT_CONNECT_TIMEOUT, HostConfig};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Hosts probed in insertion order on every pass, plus the position of the
/// host currently being probed.
#[derive(Debug, Clone, Eq)]
pub struct HostRoster {
    hosts: Vec<HostConfig>,
    position: usize,
}

// Two rosters are the same configuration regardless of where a pass is.
impl PartialEq for HostRoster {
    fn eq(&self, other: &Self) -> bool {
        self.hosts == other.hosts
    }
}

impl HostRoster {
    /// Build a roster from already resolved hosts.
    ///
    /// # Panics
    ///
    /// Panics if `hosts` is empty; a resolved check always has at least its
    /// default host.
    pub fn new(hosts: Vec<HostConfig>) -> Self {
        assert!(!hosts.is_empty(), "a host roster needs at least one host");
        Self { hosts, position: 0 }
    }

    /// Resolve configured connection options into a frozen roster.
    ///
    /// The check-level `default` options fall back to the backend address and
    /// the default timeout. Each explicit host inherits every option it leaves
    /// unset from that resolved default. Without explicit hosts the default
    /// entry is the only one.
    pub fn resolve(
        backend: SocketAddr,
        default: &ConnectOptions,
        hosts: &[ConnectOptions],
    ) -> Result<Self, RosterError> {
        let base = HostConfig {
            destination: backend,
            bind_address: None,
            bind_interface: None,
            fwmark: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        };
        let default_host = apply_options(&base, default)?;

        if hosts.is_empty() {
            return Ok(Self::new(vec![default_host]));
        }

        let resolved = hosts
            .iter()
            .map(|options| apply_options(&default_host, options))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::new(resolved))
    }

    /// Host at the current position, or `None` once the pass is exhausted
    pub fn current(&self) -> Option<&HostConfig> {
        self.hosts.get(self.position)
    }

    /// Move to the next host
    pub fn advance(&mut self) {
        self.position += 1;
    }

    /// Restart from the first host
    pub fn reset(&mut self) {
        self.position = 0;
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn is_exhausted(&self) -> bool {
        self.position >= self.hosts.len()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostConfig> {
        self.hosts.iter()
    }
}

fn apply_options(base: &HostConfig, options: &ConnectOptions) -> Result<HostConfig, RosterError> {
    let destination = SocketAddr::new(
        options.connect_ip.unwrap_or(base.destination.ip()),
        options.connect_port.unwrap_or(base.destination.port()),
    );
    if destination.port() == 0 {
        return Err(RosterError::ZeroPort(destination));
    }

    let bind_address = match (options.bind_to, options.bind_port) {
        (Some(ip), port) => Some(SocketAddr::new(ip, port.unwrap_or(0))),
        (None, Some(port)) => Some(SocketAddr::new(unspecified_like(&destination), port)),
        (None, None) => base.bind_address,
    };

    if let Some(bind) = bind_address {
        if bind.is_ipv4() != destination.is_ipv4() {
            return Err(RosterError::FamilyMismatch { destination, bind });
        }
    }

    Ok(HostConfig {
        destination,
        bind_address,
        bind_interface: options
            .bind_if
            .clone()
            .or_else(|| base.bind_interface.clone()),
        fwmark: options.fwmark.or(base.fwmark),
        connect_timeout: options.connect_timeout.unwrap_or(base.connect_timeout),
    })
}

fn unspecified_like(addr: &SocketAddr) -> IpAddr {
    match addr {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}
