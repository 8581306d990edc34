//! Peer link: JSON lines over a Unix socket to the agent that owns the
//! load-balancer data path and the mailer.

use crate::metrics::MetricsRegistry;
use crate::types::{PeerToServerMsg, ServerToPeerMsg};
use common::{Error, Result};
use futures::{SinkExt, StreamExt};
use std::path::Path;
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};

/// Longest line accepted from the peer
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// How a peer connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkEnd {
    /// The peer went away; wait for the next one
    Disconnected,
    /// The server side is shutting down
    Closed,
}

/// Peer communication handler
pub struct PeerLink {
    socket_path: String,
    outbound_rx: mpsc::Receiver<ServerToPeerMsg>,
    inbound_tx: mpsc::Sender<PeerToServerMsg>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl PeerLink {
    pub fn new(
        socket_path: String,
        outbound_rx: mpsc::Receiver<ServerToPeerMsg>,
        inbound_tx: mpsc::Sender<PeerToServerMsg>,
        metrics: Option<Arc<MetricsRegistry>>,
    ) -> Self {
        Self {
            socket_path,
            outbound_rx,
            inbound_tx,
            metrics,
        }
    }

    /// Serve one peer at a time until the outbound channel closes
    pub async fn run(mut self) -> Result<()> {
        // Remove old socket if it exists
        if Path::new(&self.socket_path).exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        info!(socket = %self.socket_path, "Peer listener started");

        loop {
            let (stream, _) = listener.accept().await?;
            info!("Peer connected");
            self.set_connected(true);

            let end = self.handle_connection(stream).await;
            self.set_connected(false);

            match end {
                Ok(LinkEnd::Disconnected) => info!("Peer disconnected"),
                Ok(LinkEnd::Closed) => break,
                Err(e) => {
                    warn!(error = %e, "Peer connection failed");
                    if let Some(ref m) = self.metrics {
                        m.record_error("peer_io");
                    }
                }
            }
        }

        info!("Peer link stopped");
        Ok(())
    }

    fn set_connected(&self, connected: bool) {
        if let Some(ref m) = self.metrics {
            m.set_peer_connected(connected);
        }
    }

    async fn handle_connection(&mut self, stream: UnixStream) -> Result<LinkEnd> {
        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

        send(&mut framed, &ServerToPeerMsg::Ready).await?;

        loop {
            tokio::select! {
                line = framed.next() => {
                    match line {
                        None => return Ok(LinkEnd::Disconnected),
                        Some(Ok(line)) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            match serde_json::from_str::<PeerToServerMsg>(&line) {
                                Ok(msg) => {
                                    debug!(?msg, "Received message from peer");
                                    if self.inbound_tx.send(msg).await.is_err() {
                                        return Ok(LinkEnd::Closed);
                                    }
                                }
                                Err(e) => {
                                    warn!(error = %e, line = %line.trim(), "Failed to parse peer message");
                                    if let Some(ref m) = self.metrics {
                                        m.record_error("peer_parse");
                                    }
                                    let reply = ServerToPeerMsg::Error {
                                        message: format!("invalid message: {}", e),
                                    };
                                    send(&mut framed, &reply).await?;
                                }
                            }
                        }
                        Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                            warn!(max = MAX_LINE_LENGTH, "Peer message too long, discarded");
                            if let Some(ref m) = self.metrics {
                                m.record_error("peer_parse");
                            }
                        }
                        Some(Err(LinesCodecError::Io(e))) => {
                            error!(error = %e, "Failed to read from peer");
                            return Err(e.into());
                        }
                    }
                }

                msg = self.outbound_rx.recv() => {
                    match msg {
                        Some(msg) => send(&mut framed, &msg).await?,
                        None => return Ok(LinkEnd::Closed),
                    }
                }
            }
        }
    }
}

async fn send(framed: &mut Framed<UnixStream, LinesCodec>, msg: &ServerToPeerMsg) -> Result<()> {
    let json = serde_json::to_string(msg)?;
    debug!("Sending message to peer: {}", json);

    framed.send(json).await.map_err(|e| match e {
        LinesCodecError::Io(e) => Error::Io(e),
        other => Error::peer(other),
    })
}
