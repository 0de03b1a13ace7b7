//! Per-connection session state.
//!
//! A session is split the same way its socket is:
//! - `LineReader` owns the read half and is only touched by the session's
//!   own worker task.
//! - `Peer` owns the write half behind an async mutex. It is cheap to clone
//!   and is handed to the registry so other workers can broadcast to it.

use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::trace;

/// Initial read buffer size
const BUFFER_SIZE: usize = 4 * 1024;

/// Opaque identifier assigned to each accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new(id: u64) -> Self {
        SessionId(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session-fatal errors
#[derive(Debug)]
pub enum SessionError {
    /// No input within the idle timeout, or a write took too long
    TimedOut,
    /// Transport fault
    Io(std::io::Error),
    /// Peer sent a line longer than the configured limit
    LineTooLong(usize),
    /// Peer was already marked dead by an earlier failed write
    Closed,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::TimedOut => write!(f, "Session timed out"),
            SessionError::Io(e) => write!(f, "I/O error: {}", e),
            SessionError::LineTooLong(limit) => {
                write!(f, "Line exceeds maximum length of {} bytes", limit)
            }
            SessionError::Closed => write!(f, "Session closed"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::Io(e)
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Outbound half of a session.
///
/// Writes from the owning worker and from broadcasting workers are
/// serialized by the inner mutex, so lines never interleave.
#[derive(Clone)]
pub struct Peer {
    id: SessionId,
    writer: Arc<Mutex<BoxedWriter>>,
    closed: Arc<AtomicBool>,
    write_timeout: Duration,
}

impl Peer {
    pub fn new<W>(id: SessionId, writer: W, write_timeout: Duration) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Peer {
            id,
            writer: Arc::new(Mutex::new(Box::new(writer))),
            closed: Arc::new(AtomicBool::new(false)),
            write_timeout,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// True once a write has failed or `close` was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Write `text` followed by a newline.
    ///
    /// Any failure marks the peer dead; later sends fail fast with
    /// `SessionError::Closed`.
    pub async fn send(&self, text: &str) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }

        let mut line = BytesMut::with_capacity(text.len() + 1);
        line.put_slice(text.as_bytes());
        line.put_u8(b'\n');

        let mut writer = self.writer.lock().await;
        let result = tokio::time::timeout(self.write_timeout, async {
            writer.write_all(&line).await?;
            writer.flush().await
        })
        .await;

        match result {
            Ok(Ok(())) => {
                trace!(session = %self.id, line = text, "Sent");
                Ok(())
            }
            Ok(Err(e)) => {
                self.closed.store(true, Ordering::Release);
                Err(SessionError::Io(e))
            }
            Err(_) => {
                self.closed.store(true, Ordering::Release);
                Err(SessionError::TimedOut)
            }
        }
    }

    /// Mark the peer dead and shut down the write half.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut writer = self.writer.lock().await;
        // Best effort: the socket may already be gone.
        let _ = tokio::time::timeout(self.write_timeout, writer.shutdown()).await;
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Buffered newline-delimited reader over the inbound half.
pub struct LineReader<R> {
    reader: R,
    buffer: BytesMut,
    idle_timeout: Option<Duration>,
    max_line_length: usize,
    eof: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    /// `idle_timeout` of `None` waits forever.
    pub fn new(reader: R, idle_timeout: Option<Duration>, max_line_length: usize) -> Self {
        LineReader {
            reader,
            buffer: BytesMut::with_capacity(BUFFER_SIZE.min(max_line_length + 1)),
            idle_timeout,
            max_line_length,
            eof: false,
        }
    }

    /// Read the next line, without its terminator.
    ///
    /// Returns `Ok(None)` once the peer has closed and every buffered line
    /// has been returned. A final unterminated fragment counts as a line.
    pub async fn read_line(&mut self) -> Result<Option<String>, SessionError> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                if pos > self.max_line_length {
                    return Err(SessionError::LineTooLong(self.max_line_length));
                }
                let line = self.buffer.split_to(pos);
                self.buffer.advance(1);
                return Ok(Some(decode_line(&line)));
            }

            if self.buffer.len() > self.max_line_length {
                return Err(SessionError::LineTooLong(self.max_line_length));
            }

            if self.eof {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                let line = self.buffer.split();
                return Ok(Some(decode_line(&line)));
            }

            let n = match self.idle_timeout {
                Some(limit) => tokio::time::timeout(limit, self.reader.read_buf(&mut self.buffer))
                    .await
                    .map_err(|_| SessionError::TimedOut)??,
                None => self.reader.read_buf(&mut self.buffer).await?,
            };

            if n == 0 {
                trace!("Connection closed by client");
                self.eof = true;
            }
        }
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    text.trim_end_matches('\r').to_string()
}
