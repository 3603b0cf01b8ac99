//! The receiver task: pulls bytes off the socket, finds frames, decodes them
//! and routes each reply to its slot.
//!
//! The receive buffer lives here and nowhere else.  A decode error never stops
//! the loop: the error goes into the slot of the reply it belonged to and the
//! loop resynchronises on the next magic marker.  Only a disconnect or a fatal
//! socket error ends it.

use std::sync::Arc;

use ikvm_core::protocol::codec::{decode_reply_payload, encode_request, find_frame, FrameScan, ProtocolError};
use ikvm_core::protocol::messages::{MessageType, Reply, Request, FRAME_HEADER_LEN};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::SessionShared;
use crate::infrastructure::transport::{ReadOutcome, TransportError, TransportReader};

/// One step of frame extraction from the buffer.
#[derive(Debug, PartialEq)]
enum Extracted {
    Reply(Reply),
    Failed(MessageType, ProtocolError),
    Skipped(u8),
    NeedMore,
}

/// Why waiting for the handshake echo stopped.
#[derive(Debug)]
pub(crate) enum HandshakeError {
    Timeout,
    Disconnected,
    Transport(TransportError),
}

pub(crate) struct Receiver {
    reader: TransportReader,
    buf: Vec<u8>,
}

impl Receiver {
    pub(crate) fn new(reader: TransportReader) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(4096),
        }
    }

    /// Pulls one item out of the buffer without touching the socket.
    fn extract(&mut self) -> Extracted {
        match find_frame(&self.buf) {
            FrameScan::NotFound { keep_from } => {
                if keep_from > 0 {
                    debug!(bytes = keep_from, "discarding bytes without a frame marker");
                }
                self.buf.drain(..keep_from);
                Extracted::NeedMore
            }
            FrameScan::Incomplete { start } => {
                self.buf.drain(..start);
                Extracted::NeedMore
            }
            FrameScan::Found { tag, start } => {
                if start > 0 {
                    debug!(bytes = start, "discarding bytes before frame marker");
                    self.buf.drain(..start);
                }
                let kind = match MessageType::try_from(tag) {
                    Ok(kind) if kind.is_server_message() => kind,
                    _ => {
                        self.buf.drain(..FRAME_HEADER_LEN);
                        return Extracted::Skipped(tag);
                    }
                };
                match decode_reply_payload(kind, &self.buf[FRAME_HEADER_LEN..]) {
                    Ok((reply, n)) => {
                        self.buf.drain(..FRAME_HEADER_LEN + n);
                        Extracted::Reply(reply)
                    }
                    Err(e) if e.is_incomplete() => Extracted::NeedMore,
                    Err(e) => {
                        // Drop only the header; the payload bytes are rescanned
                        // for the next marker.
                        self.buf.drain(..FRAME_HEADER_LEN);
                        Extracted::Failed(kind, e)
                    }
                }
            }
        }
    }

    /// Waits for the server to echo the handshake.
    ///
    /// Anything else that arrives first is dropped.  Bytes after the echo stay
    /// buffered for [`Receiver::run`].
    pub(crate) async fn await_handshake(&mut self, deadline: Instant) -> Result<(), HandshakeError> {
        loop {
            match self.extract() {
                Extracted::Reply(Reply::Handshake) => return Ok(()),
                Extracted::Reply(other) => debug!(kind = ?other.message_type(), "ignored before handshake"),
                Extracted::Failed(kind, e) => debug!(?kind, "ignored before handshake: {e}"),
                Extracted::Skipped(tag) => debug!("ignored tag 0x{tag:02X} before handshake"),
                Extracted::NeedMore => {
                    if Instant::now() >= deadline {
                        return Err(HandshakeError::Timeout);
                    }
                    match self.reader.read(&mut self.buf).await {
                        Ok(ReadOutcome::Data(_) | ReadOutcome::NoData) => {}
                        Ok(ReadOutcome::Disconnected) => return Err(HandshakeError::Disconnected),
                        Err(e) => return Err(HandshakeError::Transport(e)),
                    }
                }
            }
        }
    }

    /// Runs until the session stops or the connection drops.
    pub(crate) async fn run(mut self, shared: Arc<SessionShared>) {
        debug!("receiver started");
        while shared.is_running() {
            match self.extract() {
                Extracted::NeedMore => match self.reader.read(&mut self.buf).await {
                    Ok(ReadOutcome::Data(_) | ReadOutcome::NoData) => {}
                    Ok(ReadOutcome::Disconnected) => {
                        warn!("server closed the connection");
                        shared.teardown("server closed the connection").await;
                        break;
                    }
                    Err(e) => {
                        error!("receive failed: {e}");
                        shared.teardown("receive failed").await;
                        break;
                    }
                },
                Extracted::Reply(reply) => {
                    if !self.dispatch(reply, &shared).await {
                        break;
                    }
                }
                Extracted::Failed(kind, e) => {
                    warn!(?kind, "dropping malformed frame: {e}");
                    shared.slots.publish(kind, Err(e));
                }
                Extracted::Skipped(tag) => debug!("skipping frame with tag 0x{tag:02X}"),
            }
        }
        // Waiters must not outlive the loop that would have fed them.
        shared.slots.close();
        debug!("receiver stopped");
    }

    /// Handles one decoded reply.  Returns `false` when the loop must stop.
    async fn dispatch(&mut self, reply: Reply, shared: &SessionShared) -> bool {
        let kind = reply.message_type();
        debug!(?kind, "received");
        match reply {
            Reply::Goodbye => {
                info!("server said goodbye");
                shared.teardown("server said goodbye").await;
                false
            }
            Reply::AskAlive => {
                let frame = match encode_request(&Request::ReplyAlive) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!("cannot encode keepalive reply: {e}");
                        return true;
                    }
                };
                match shared.writer.send(&frame).await {
                    Ok(()) => true,
                    Err(TransportError::Disconnected) => {
                        warn!("connection lost while answering keepalive");
                        shared.teardown("connection lost").await;
                        false
                    }
                    Err(e) => {
                        warn!("keepalive reply failed: {e}");
                        true
                    }
                }
            }
            other => {
                shared.slots.publish(kind, Ok(other));
                true
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
