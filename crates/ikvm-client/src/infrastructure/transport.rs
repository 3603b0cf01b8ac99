//! Non-blocking TCP transport for the iKVM control connection.
//!
//! The socket is split once after connecting.  The read half belongs to the
//! receiver task alone; the write half is shared by every caller and the
//! receiver (keepalive replies) behind an async mutex, so frames are never
//! interleaved.
//!
//! Both halves use `try_read`/`try_write` and classify every outcome:
//!
//! | Outcome                           | Meaning                    |
//! |-----------------------------------|----------------------------|
//! | `Ok(0)` on read                   | peer closed, disconnected  |
//! | `WouldBlock`                      | no progress now, back off  |
//! | reset / aborted / broken pipe     | disconnected               |
//! | any other `io::Error`             | fatal, propagated          |

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time;
use tracing::{debug, trace};

use crate::error::ErrorCategory;

/// Back-off between attempts when the socket reports `WouldBlock`.
pub const TICK: Duration = Duration::from_millis(10);

/// How many [`TICK`]s a frame write may spend making no progress.
pub const SEND_RETRY_TICKS: u32 = 100;

const READ_CHUNK: usize = 4096;

/// Errors raised by the transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer closed, reset or aborted the connection, or it was closed
    /// locally.
    #[error("connection closed")]
    Disconnected,

    /// A frame write made no progress for the whole retry budget.
    #[error("send timed out after {0:?}")]
    SendTimeout(Duration),

    /// Any other socket fault.
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            TransportError::Disconnected | TransportError::Io(_) => ErrorCategory::Transport,
            TransportError::SendTimeout(_) => ErrorCategory::Timing,
        }
    }
}

/// Result of one [`TransportReader::read`] attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// This many bytes were appended to the buffer.
    Data(usize),
    /// Nothing arrived within one [`TICK`].
    NoData,
    /// The peer is gone.
    Disconnected,
}

fn is_disconnect(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

/// Splits a connected stream into its transport halves.
///
/// # Errors
///
/// Fails only if the socket options cannot be applied.
pub fn split(stream: TcpStream) -> Result<(TransportReader, TransportWriter), TransportError> {
    stream.set_nodelay(true)?;
    let peer = stream.peer_addr()?;
    let (read_half, write_half) = stream.into_split();
    Ok((
        TransportReader { half: read_half },
        TransportWriter {
            peer,
            half: Mutex::new(Some(write_half)),
            closed: AtomicBool::new(false),
        },
    ))
}

// ── Read half ─────────────────────────────────────────────────────────────────

/// Exclusive read side of the connection.
pub struct TransportReader {
    half: OwnedReadHalf,
}

impl TransportReader {
    /// Appends whatever bytes are available to `buf`.
    ///
    /// Waits at most one [`TICK`] for the socket to become readable, so a
    /// caller looping on this can check its own stop condition between
    /// calls.
    ///
    /// # Errors
    ///
    /// [`TransportError::Io`] for socket faults that are not disconnects.
    pub async fn read(&mut self, buf: &mut Vec<u8>) -> Result<ReadOutcome, TransportError> {
        let mut chunk = [0u8; READ_CHUNK];
        match self.half.try_read(&mut chunk) {
            Ok(0) => Ok(ReadOutcome::Disconnected),
            Ok(n) => {
                trace!(bytes = n, "received");
                buf.extend_from_slice(&chunk[..n]);
                Ok(ReadOutcome::Data(n))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                // Either readiness or the tick elapsing is fine; the next
                // call retries the read.
                match time::timeout(TICK, self.half.readable()).await {
                    Ok(Err(e)) if is_disconnect(e.kind()) => Ok(ReadOutcome::Disconnected),
                    Ok(Err(e)) => Err(TransportError::Io(e)),
                    _ => Ok(ReadOutcome::NoData),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(ReadOutcome::NoData),
            Err(e) if is_disconnect(e.kind()) => Ok(ReadOutcome::Disconnected),
            Err(e) => Err(TransportError::Io(e)),
        }
    }
}

// ── Write half ────────────────────────────────────────────────────────────────

/// Shared write side of the connection.
pub struct TransportWriter {
    peer: SocketAddr,
    half: Mutex<Option<OwnedWriteHalf>>,
    closed: AtomicBool,
}

impl TransportWriter {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Writes one whole frame.
    ///
    /// Partial writes are continued until every byte is out.  Each
    /// `WouldBlock` costs one [`TICK`]; after [`SEND_RETRY_TICKS`] of them the
    /// send gives up.
    ///
    /// # Errors
    ///
    /// [`TransportError::Disconnected`] when the connection is gone (the
    /// writer is closed as a side effect), [`TransportError::SendTimeout`]
    /// when the budget runs out, [`TransportError::Io`] otherwise.
    pub async fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut guard = self.half.lock().await;
        let Some(half) = guard.as_mut() else {
            return Err(TransportError::Disconnected);
        };

        let result = write_frame(half, bytes).await;
        if let Err(TransportError::Disconnected) = result {
            debug!(peer = %self.peer, "peer went away during write");
            self.closed.store(true, Ordering::Release);
            *guard = None;
        }
        result
    }

    /// Shuts the write side down and releases it.
    ///
    /// Returns `true` only for the call that actually closed the connection;
    /// later calls are no-ops.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        // Dropping the owned write half shuts down the write direction.
        let half = self.half.lock().await.take();
        drop(half);
        debug!(peer = %self.peer, "transport closed");
        true
    }
}

async fn write_frame(half: &mut OwnedWriteHalf, bytes: &[u8]) -> Result<(), TransportError> {
    let mut sent = 0;
    let mut ticks = 0;
    while sent < bytes.len() {
        match half.try_write(&bytes[sent..]) {
            Ok(0) => ticks += 1,
            Ok(n) => sent += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => ticks += 1,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if is_disconnect(e.kind()) => return Err(TransportError::Disconnected),
            Err(e) => return Err(TransportError::Io(e)),
        }
        if sent < bytes.len() {
            if ticks >= SEND_RETRY_TICKS {
                return Err(TransportError::SendTimeout(TICK * SEND_RETRY_TICKS));
            }
            // Readiness errors surface on the next try_write.
            let _ = time::timeout(TICK, half.writable()).await;
        }
    }
    trace!(bytes = bytes.len(), "sent");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
