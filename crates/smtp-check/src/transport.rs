//! Line-oriented transport over a connected probe socket.

use crate::error::ProbeFailure;
use crate::types::Target;
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Capacity of the per-session line buffer in bytes
pub const LINE_BUFFER_CAPACITY: usize = 512;

/// Capacity-bounded buffer that accumulates bytes until a newline is seen.
///
/// The buffer never grows past its capacity. When a caller finds it full
/// without a newline, the partial line is discarded with [`LineBuffer::clear`]
/// and accumulation starts over.
#[derive(Debug)]
pub struct LineBuffer {
    buf: BytesMut,
    capacity: usize,
}

impl LineBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Append as much of `data` as fits, returning the number of bytes taken
    pub fn append(&mut self, data: &[u8]) -> usize {
        let take = data.len().min(self.remaining());
        self.buf.extend_from_slice(&data[..take]);
        take
    }

    /// The first complete line, including its `\n`. Bytes after it are ignored.
    pub fn line(&self) -> Option<&[u8]> {
        let end = self.buf.iter().position(|&b| b == b'\n')?;
        Some(&self.buf[..=end])
    }

    /// Replace the content with an outgoing command, truncated to capacity
    pub fn load(&mut self, line: &[u8]) {
        self.clear();
        self.append(line);
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.buf.len()
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new(LINE_BUFFER_CAPACITY)
    }
}

/// Reads and writes single CRLF-terminated lines with a per-I/O timeout.
///
/// Failures come back as [`ProbeFailure`] naming the operation and the
/// target; the caller hands them straight to the retry controller.
pub struct LineTransport<S> {
    stream: S,
    buffer: LineBuffer,
    io_timeout: Duration,
    target: Target,
}

impl<S> LineTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, target: Target, io_timeout: Duration) -> Self {
        Self {
            stream,
            buffer: LineBuffer::default(),
            io_timeout,
            target,
        }
    }

    pub fn target(&self) -> Target {
        self.target
    }

    /// Receive one line. Every read is bounded by the I/O timeout. A line
    /// longer than the buffer is dropped through its terminating newline and
    /// accumulation restarts with the next line.
    pub async fn receive_line(&mut self) -> Result<Bytes, ProbeFailure> {
        self.buffer.clear();
        let mut chunk = [0u8; LINE_BUFFER_CAPACITY];
        let mut discarding = false;

        loop {
            if !discarding && self.buffer.is_full() {
                warn!(
                    target = %self.target,
                    capacity = LINE_BUFFER_CAPACITY,
                    "Buffer overflow reading from SMTP server, discarding partial line"
                );
                self.buffer.clear();
                discarding = true;
            }

            let want = if discarding {
                chunk.len()
            } else {
                self.buffer.remaining().min(chunk.len())
            };
            let read = match timeout(self.io_timeout, self.stream.read(&mut chunk[..want])).await {
                Err(_) => return Err(ProbeFailure::ReadTimeout { target: self.target }),
                Ok(Err(e)) => {
                    return Err(ProbeFailure::ReadFailure {
                        target: self.target,
                        source: Some(e),
                    });
                }
                Ok(Ok(0)) => {
                    return Err(ProbeFailure::ReadFailure {
                        target: self.target,
                        source: None,
                    });
                }
                Ok(Ok(n)) => n,
            };
            let data = &chunk[..read];

            if discarding {
                // The overlong line ends at the first newline; keep what follows
                let Some(end) = data.iter().position(|&b| b == b'\n') else {
                    continue;
                };
                discarding = false;
                self.buffer.append(&data[end + 1..]);
            } else {
                self.buffer.append(data);
            }

            if let Some(line) = self.buffer.line() {
                debug!(
                    target = %self.target,
                    line = %String::from_utf8_lossy(line).trim_end(),
                    "SMTP <"
                );
                return Ok(Bytes::copy_from_slice(line));
            }
        }
    }

    /// Send one line with a single write. Any accepted byte count counts as
    /// sent; commands are small enough to go out in one segment.
    pub async fn send_line(&mut self, line: &str) -> Result<(), ProbeFailure> {
        self.buffer.load(line.as_bytes());

        match timeout(self.io_timeout, self.stream.write(self.buffer.as_bytes())).await {
            Err(_) => Err(ProbeFailure::WriteTimeout { target: self.target }),
            Ok(Err(e)) => Err(ProbeFailure::WriteFailure {
                target: self.target,
                source: Some(e),
            }),
            Ok(Ok(0)) => Err(ProbeFailure::WriteFailure {
                target: self.target,
                source: None,
            }),
            Ok(Ok(_)) => {
                debug!(target = %self.target, line = %line.trim_end(), "SMTP >");
                Ok(())
            }
        }
    }

}
