//! Non-blocking TCP connection establishment for probes.

use crate::error::SocketSetupError;
use crate::types::HostConfig;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Result of one connection attempt
#[derive(Debug)]
pub enum ConnectOutcome {
    /// Connection established, ready for the SMTP dialogue
    Connected(TcpStream),
    /// The connection was refused, reset or otherwise failed
    Error(io::Error),
    /// The connection did not complete within the host's timeout
    Timeout,
}

/// Open a non-blocking, close-on-exec socket for `host` and connect it.
///
/// Errors returned here are local (socket creation, mark, device or address
/// binding); remote failures are reported through [`ConnectOutcome`].
pub async fn connect(host: &HostConfig) -> Result<ConnectOutcome, SocketSetupError> {
    let socket = prepare_socket(host)?;

    match socket.connect(&SockAddr::from(host.destination)) {
        Ok(()) => {}
        Err(e) if is_in_progress(&e) => {}
        Err(e) => return Ok(ConnectOutcome::Error(e)),
    }

    let stream: std::net::TcpStream = socket.into();
    let stream = TcpStream::from_std(stream).map_err(SocketSetupError::Register)?;

    match timeout(host.connect_timeout, stream.writable()).await {
        Err(_) => Ok(ConnectOutcome::Timeout),
        Ok(Err(e)) => Ok(ConnectOutcome::Error(e)),
        Ok(Ok(())) => match stream.take_error() {
            Ok(None) => {
                debug!(target = %host.target(), "Remote SMTP server connected");
                Ok(ConnectOutcome::Connected(stream))
            }
            Ok(Some(e)) | Err(e) => Ok(ConnectOutcome::Error(e)),
        },
    }
}

fn prepare_socket(host: &HostConfig) -> Result<Socket, SocketSetupError> {
    let socket = Socket::new(
        Domain::for_address(host.destination),
        Type::STREAM.nonblocking().cloexec(),
        Some(Protocol::TCP),
    )
    .map_err(SocketSetupError::Create)?;

    if let Some(mark) = host.fwmark {
        socket
            .set_mark(mark)
            .map_err(|source| SocketSetupError::Mark { mark, source })?;
    }

    if let Some(interface) = &host.bind_interface {
        socket
            .bind_device(Some(interface.as_bytes()))
            .map_err(|source| SocketSetupError::BindDevice {
                interface: interface.clone(),
                source,
            })?;
    }

    if let Some(address) = host.bind_address {
        socket
            .bind(&SockAddr::from(address))
            .map_err(|source| SocketSetupError::Bind { address, source })?;
    }

    Ok(socket)
}

fn is_in_progress(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EINPROGRESS)
}
