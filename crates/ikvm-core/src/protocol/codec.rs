//! Binary codec for iKVM protocol frames.
//!
//! Wire format:
//! ```text
//! [magic:3 = FF 31 D5][type:1][payload:N]
//! ```
//! There is no length field.  Each payload is self-describing: strings carry
//! a one-byte length prefix (two bytes for typed text) and lists a one-byte
//! count, so a decoder knows exactly how many bytes it needs.  All
//! multi-byte integers are big-endian.
//!
//! Decoders never block and never panic.  When the slice ends before the
//! payload does they return [`ProtocolError::InsufficientData`]; the caller
//! reads more bytes and tries again from the same start.

use thiserror::Error;
use tracing::trace;

use crate::domain::devices::{CaptureMode, FrameRate, Resolution, SerialDevice, UsbId, VideoCapture};
use crate::protocol::messages::{
    AsciiText, AtxSignal, KeyAction, KeyCommand, MessageType, MouseButton, MouseCommand, Reply,
    Request, RunMjpgRequest, StatusCode, StatusReply, WheelDirection, FRAME_HEADER_LEN, MAGIC,
    MAX_SHORT_STRING, WHEEL_RELEASE_ALL,
};

/// Errors that can occur during frame encoding or decoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The slice ends before the frame does.  Not a fault: read more bytes.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The slice handed to a frame decoder does not start with [`MAGIC`].
    #[error("frame does not start with the magic marker")]
    MissingMagic,

    #[error("unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    /// A known tag arrived in the wrong direction.
    #[error("unexpected message {0:?} in this direction")]
    UnexpectedMessage(MessageType),

    #[error("invalid status code {0:02X}")]
    InvalidStatusCode(u8),

    #[error("{field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },

    #[error("{field} has zero length")]
    EmptyName { field: &'static str },

    #[error("{field} of {len} bytes does not fit its length prefix")]
    StringTooLong { field: &'static str, len: usize },

    #[error("{field} has {count} entries, at most 255 fit the count byte")]
    TooManyEntries { field: &'static str, count: usize },

    #[error("invalid {field}: 0x{value:X}")]
    InvalidValue { field: &'static str, value: u32 },

    #[error("capture {capture:?} reports no resolutions")]
    NoResolutions { capture: String },

    #[error("capture {capture:?} reports no frame rates for {resolution}")]
    NoFrameRates { capture: String, resolution: Resolution },
}

impl ProtocolError {
    /// `true` when the error only means "read more bytes and retry".
    pub fn is_incomplete(&self) -> bool {
        matches!(self, ProtocolError::InsufficientData { .. })
    }
}

// ── Frame scanning ────────────────────────────────────────────────────────────

/// Outcome of [`find_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameScan {
    /// A full header starts at `start`; the payload begins at
    /// `start + FRAME_HEADER_LEN`.  `tag` is the raw type byte.
    Found { tag: u8, start: usize },
    /// The magic starts at `start` but the type byte has not arrived yet.
    /// Bytes before `start` can be dropped.
    Incomplete { start: usize },
    /// No magic in the buffer.  Everything before `keep_from` can be dropped;
    /// the bytes from `keep_from` on are a partial magic that the next read
    /// may complete.
    NotFound { keep_from: usize },
}

/// Scans `buf` for the first frame header.
///
/// # Examples
///
/// ```rust
/// use ikvm_core::protocol::codec::{find_frame, FrameScan};
///
/// let buf = [0x00, 0x42, 0xFF, 0x31, 0xD5, 0xF0];
/// assert_eq!(find_frame(&buf), FrameScan::Found { tag: 0xF0, start: 2 });
///
/// // A marker cut in half by a partial read is kept for the next pass.
/// let buf = [0x00, 0x42, 0xFF, 0x31];
/// assert_eq!(find_frame(&buf), FrameScan::NotFound { keep_from: 2 });
/// ```
pub fn find_frame(buf: &[u8]) -> FrameScan {
    if let Some(start) = buf.windows(MAGIC.len()).position(|w| w == MAGIC) {
        if start > 0 {
            trace!(skipped = start, "discarding bytes before frame magic");
        }
        return match buf.get(start + MAGIC.len()) {
            Some(&tag) => FrameScan::Found { tag, start },
            None => FrameScan::Incomplete { start },
        };
    }

    let keep = (1..MAGIC.len())
        .rev()
        .find(|&k| buf.ends_with(&MAGIC[..k]))
        .unwrap_or(0);
    FrameScan::NotFound {
        keep_from: buf.len() - keep,
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a client-to-server [`Request`] into a complete frame.
///
/// # Errors
///
/// Returns [`ProtocolError`] when a string field is empty or longer than its
/// length prefix allows.
///
/// # Examples
///
/// ```rust
/// use ikvm_core::protocol::codec::encode_request;
/// use ikvm_core::protocol::messages::{AtxSignal, Request};
///
/// let bytes = encode_request(&Request::SendAtx(AtxSignal::Reset)).unwrap();
/// assert_eq!(bytes, vec![0xFF, 0x31, 0xD5, 0x06, 0xFE]);
/// ```
pub fn encode_request(req: &Request) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = frame_header(req.message_type());
    match req {
        Request::Handshake
        | Request::Goodbye
        | Request::ReplyAlive
        | Request::ListUart
        | Request::ListCap => {}
        Request::OpenUart { port } => write_name(&mut buf, port, "serial port name")?,
        Request::RunMjpg(run) => {
            write_name(&mut buf, &run.device, "capture device name")?;
            buf.extend_from_slice(&run.resolution.width().to_be_bytes());
            buf.extend_from_slice(&run.resolution.height().to_be_bytes());
            buf.push(run.fps.get());
            buf.extend_from_slice(&run.port.to_be_bytes());
        }
        Request::SendKey(cmd) => match cmd {
            KeyCommand::Key { action, code } => {
                buf.extend_from_slice(&[KeyCommand::KEY, *action as u8, *code]);
            }
            KeyCommand::Text(text) => {
                buf.push(KeyCommand::TEXT);
                // AsciiText guarantees the length fits.
                buf.extend_from_slice(&(text.len() as u16).to_be_bytes());
                buf.extend_from_slice(text.as_bytes());
            }
            KeyCommand::ReleaseAll => buf.push(KeyCommand::RELEASE_ALL),
        },
        Request::SendMouse(cmd) => match cmd {
            MouseCommand::Button { action, button } => {
                buf.extend_from_slice(&[MouseCommand::BUTTON, *action as u8, *button as u8]);
            }
            MouseCommand::Move { dx, dy } => {
                buf.push(MouseCommand::MOVE);
                buf.extend_from_slice(&dx.to_be_bytes());
                buf.extend_from_slice(&dy.to_be_bytes());
            }
            MouseCommand::Scroll(direction) => {
                buf.extend_from_slice(&[MouseCommand::SCROLL, *direction as u8]);
            }
            MouseCommand::ReleaseAll => {
                buf.extend_from_slice(&[MouseCommand::SCROLL, WHEEL_RELEASE_ALL]);
            }
        },
        Request::SendAtx(signal) => buf.push(*signal as u8),
    }
    Ok(buf)
}

/// Encodes a server-to-client [`Reply`] into a complete frame.  Used by test
/// servers and tooling; the client itself only decodes replies.
///
/// # Errors
///
/// Returns [`ProtocolError`] when a name is empty or too long, or when a list
/// has more than 255 entries.
pub fn encode_reply(reply: &Reply) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = frame_header(reply.message_type());
    match reply {
        Reply::Handshake | Reply::Goodbye | Reply::AskAlive => {}
        Reply::ListUart(devices) => {
            buf.push(count_byte(devices.len(), "serial device list")?);
            for dev in devices {
                write_name(&mut buf, &dev.name, "serial device name")?;
                buf.extend_from_slice(&dev.usb_id.vendor.to_be_bytes());
                buf.extend_from_slice(&dev.usb_id.product.to_be_bytes());
            }
        }
        Reply::ListCap(captures) => {
            buf.push(count_byte(captures.len(), "capture list")?);
            for cap in captures {
                write_name(&mut buf, &cap.name, "capture device name")?;
                buf.push(count_byte(cap.modes.len(), "resolution list")?);
                for mode in &cap.modes {
                    buf.extend_from_slice(&mode.resolution.width().to_be_bytes());
                    buf.extend_from_slice(&mode.resolution.height().to_be_bytes());
                    buf.push(count_byte(mode.frame_rates.len(), "frame rate list")?);
                    buf.extend(mode.frame_rates.iter().map(FrameRate::get));
                }
            }
        }
        Reply::OpenUart(status)
        | Reply::RunMjpg(status)
        | Reply::SendKey(status)
        | Reply::SendMouse(status)
        | Reply::SendAtx(status) => {
            buf.push(status.code() as u8);
            if let Some(detail) = status.detail() {
                write_short_string(&mut buf, detail, "status detail")?;
            }
        }
    }
    Ok(buf)
}

/// Decodes one [`Reply`] from a slice that starts with a frame header.
///
/// Returns the reply and the number of bytes consumed (header included).
///
/// # Errors
///
/// [`ProtocolError::InsufficientData`] when the frame is not complete yet;
/// any other variant when the frame is malformed.
pub fn decode_reply(bytes: &[u8]) -> Result<(Reply, usize), ProtocolError> {
    let kind = decode_header(bytes)?;
    let (reply, n) = decode_reply_payload(kind, &bytes[FRAME_HEADER_LEN..])
        .map_err(|e| shift_needed(e, FRAME_HEADER_LEN))?;
    Ok((reply, FRAME_HEADER_LEN + n))
}

/// Decodes one [`Request`] from a slice that starts with a frame header.
///
/// Returns the request and the number of bytes consumed (header included).
///
/// # Errors
///
/// Same contract as [`decode_reply`].
pub fn decode_request(bytes: &[u8]) -> Result<(Request, usize), ProtocolError> {
    let kind = decode_header(bytes)?;
    let (req, n) = decode_request_payload(kind, &bytes[FRAME_HEADER_LEN..])
        .map_err(|e| shift_needed(e, FRAME_HEADER_LEN))?;
    Ok((req, FRAME_HEADER_LEN + n))
}

/// Decodes the payload of a server-to-client frame whose header has already
/// been consumed.  Returns the reply and the payload bytes consumed.
///
/// # Errors
///
/// [`ProtocolError::UnexpectedMessage`] for client-only tags, otherwise the
/// same contract as [`decode_reply`].
pub fn decode_reply_payload(kind: MessageType, payload: &[u8]) -> Result<(Reply, usize), ProtocolError> {
    let mut r = Reader::new(payload);
    let reply = match kind {
        MessageType::Handshake => Reply::Handshake,
        MessageType::Goodbye => Reply::Goodbye,
        MessageType::AskAlive => Reply::AskAlive,
        MessageType::ListUartRes => Reply::ListUart(read_serial_devices(&mut r)?),
        MessageType::ListCapRes => Reply::ListCap(read_captures(&mut r)?),
        MessageType::OpenUartRes
        | MessageType::RunMjpgRes
        | MessageType::SendKeyRes
        | MessageType::SendMouseRes
        | MessageType::SendAtxRes => {
            let status = read_status(&mut r)?;
            Reply::from_status(kind, status).ok_or(ProtocolError::UnexpectedMessage(kind))?
        }
        other => return Err(ProtocolError::UnexpectedMessage(other)),
    };
    Ok((reply, r.pos))
}

/// Decodes the payload of a client-to-server frame whose header has already
/// been consumed.  Returns the request and the payload bytes consumed.
///
/// # Errors
///
/// [`ProtocolError::UnexpectedMessage`] for server-only tags, otherwise the
/// same contract as [`decode_reply`].
pub fn decode_request_payload(
    kind: MessageType,
    payload: &[u8],
) -> Result<(Request, usize), ProtocolError> {
    let mut r = Reader::new(payload);
    let req = match kind {
        MessageType::Handshake => Request::Handshake,
        MessageType::Goodbye => Request::Goodbye,
        MessageType::ReplyAlive => Request::ReplyAlive,
        MessageType::ListUartReq => Request::ListUart,
        MessageType::ListCapReq => Request::ListCap,
        MessageType::OpenUartReq => Request::OpenUart {
            port: r.name("serial port name")?,
        },
        MessageType::RunMjpgReq => {
            let device = r.name("capture device name")?;
            let resolution = read_resolution(&mut r)?;
            let fps = read_frame_rate(&mut r)?;
            let port = r.u16()?;
            Request::RunMjpg(RunMjpgRequest {
                device,
                resolution,
                fps,
                port,
            })
        }
        MessageType::SendKeyReq => Request::SendKey(read_key_command(&mut r)?),
        MessageType::SendMouseReq => Request::SendMouse(read_mouse_command(&mut r)?),
        MessageType::SendAtxReq => {
            let raw = r.u8()?;
            let signal = AtxSignal::try_from(raw).map_err(|_| ProtocolError::InvalidValue {
                field: "ATX signal",
                value: raw as u32,
            })?;
            Request::SendAtx(signal)
        }
        other => return Err(ProtocolError::UnexpectedMessage(other)),
    };
    Ok((req, r.pos))
}

// ── Private encode helpers ────────────────────────────────────────────────────

fn frame_header(kind: MessageType) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32);
    buf.extend_from_slice(&MAGIC);
    buf.push(kind as u8);
    buf
}

fn count_byte(count: usize, field: &'static str) -> Result<u8, ProtocolError> {
    u8::try_from(count).map_err(|_| ProtocolError::TooManyEntries { field, count })
}

fn write_short_string(buf: &mut Vec<u8>, s: &str, field: &'static str) -> Result<(), ProtocolError> {
    if s.len() > MAX_SHORT_STRING {
        return Err(ProtocolError::StringTooLong { field, len: s.len() });
    }
    buf.push(s.len() as u8);
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn write_name(buf: &mut Vec<u8>, s: &str, field: &'static str) -> Result<(), ProtocolError> {
    if s.is_empty() {
        return Err(ProtocolError::EmptyName { field });
    }
    write_short_string(buf, s, field)
}

// ── Private decode helpers ────────────────────────────────────────────────────

fn decode_header(bytes: &[u8]) -> Result<MessageType, ProtocolError> {
    if bytes.len() < FRAME_HEADER_LEN {
        return Err(ProtocolError::InsufficientData {
            needed: FRAME_HEADER_LEN,
            available: bytes.len(),
        });
    }
    if bytes[..MAGIC.len()] != MAGIC {
        return Err(ProtocolError::MissingMagic);
    }
    let tag = bytes[MAGIC.len()];
    MessageType::try_from(tag).map_err(|_| ProtocolError::UnknownMessageType(tag))
}

/// Rebases an `InsufficientData` count from payload-relative to
/// frame-relative.
fn shift_needed(err: ProtocolError, offset: usize) -> ProtocolError {
    match err {
        ProtocolError::InsufficientData { needed, available } => ProtocolError::InsufficientData {
            needed: needed + offset,
            available: available + offset,
        },
        other => other,
    }
}

/// Forward-only cursor over a payload slice.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self.pos + n;
        if self.buf.len() < end {
            return Err(ProtocolError::InsufficientData {
                needed: end,
                available: self.buf.len(),
            });
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn i16(&mut self) -> Result<i16, ProtocolError> {
        let b = self.take(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    fn short_string(&mut self, field: &'static str) -> Result<String, ProtocolError> {
        let len = self.u8()? as usize;
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|_| ProtocolError::InvalidUtf8 { field })
    }

    fn name(&mut self, field: &'static str) -> Result<String, ProtocolError> {
        let s = self.short_string(field)?;
        if s.is_empty() {
            return Err(ProtocolError::EmptyName { field });
        }
        Ok(s)
    }
}

fn read_status(r: &mut Reader<'_>) -> Result<StatusReply, ProtocolError> {
    let raw = r.u8()?;
    match StatusCode::try_from(raw) {
        Ok(StatusCode::Success) => Ok(StatusReply::Success),
        Ok(StatusCode::Failure) => Ok(StatusReply::Failure(r.short_string("status detail")?)),
        Ok(StatusCode::Error) => Ok(StatusReply::Error(r.short_string("status detail")?)),
        Err(()) => Err(ProtocolError::InvalidStatusCode(raw)),
    }
}

fn read_serial_devices(r: &mut Reader<'_>) -> Result<Vec<SerialDevice>, ProtocolError> {
    let count = r.u8()? as usize;
    let mut devices = Vec::with_capacity(count);
    for _ in 0..count {
        let name = r.name("serial device name")?;
        let vendor = r.u16()?;
        let product = r.u16()?;
        devices.push(SerialDevice {
            name,
            usb_id: UsbId::new(vendor, product),
        });
    }
    Ok(devices)
}

fn read_captures(r: &mut Reader<'_>) -> Result<Vec<VideoCapture>, ProtocolError> {
    let count = r.u8()? as usize;
    let mut captures = Vec::with_capacity(count);
    for _ in 0..count {
        let name = r.name("capture device name")?;
        let mode_count = r.u8()? as usize;
        if mode_count == 0 {
            return Err(ProtocolError::NoResolutions { capture: name });
        }
        let mut modes = Vec::with_capacity(mode_count);
        for _ in 0..mode_count {
            let resolution = read_resolution(r)?;
            let rate_count = r.u8()? as usize;
            if rate_count == 0 {
                return Err(ProtocolError::NoFrameRates {
                    capture: name,
                    resolution,
                });
            }
            let frame_rates = (0..rate_count)
                .map(|_| read_frame_rate(r))
                .collect::<Result<Vec<_>, _>>()?;
            modes.push(CaptureMode {
                resolution,
                frame_rates,
            });
        }
        captures.push(VideoCapture { name, modes });
    }
    Ok(captures)
}

fn read_resolution(r: &mut Reader<'_>) -> Result<Resolution, ProtocolError> {
    let width = r.u16()?;
    let height = r.u16()?;
    Resolution::new(width, height).ok_or(ProtocolError::InvalidValue {
        field: "resolution",
        value: (width as u32) << 16 | height as u32,
    })
}

fn read_frame_rate(r: &mut Reader<'_>) -> Result<FrameRate, ProtocolError> {
    let raw = r.u8()?;
    FrameRate::new(raw).ok_or(ProtocolError::InvalidValue {
        field: "frame rate",
        value: raw as u32,
    })
}

fn read_key_action(r: &mut Reader<'_>) -> Result<KeyAction, ProtocolError> {
    let raw = r.u8()?;
    KeyAction::try_from(raw).map_err(|_| ProtocolError::InvalidValue {
        field: "key action",
        value: raw as u32,
    })
}

fn read_key_command(r: &mut Reader<'_>) -> Result<KeyCommand, ProtocolError> {
    match r.u8()? {
        KeyCommand::KEY => {
            let action = read_key_action(r)?;
            let code = r.u8()?;
            Ok(KeyCommand::Key { action, code })
        }
        KeyCommand::TEXT => {
            let len = r.u16()? as usize;
            let raw = r.take(len)?;
            let text = std::str::from_utf8(raw)
                .map_err(|_| ProtocolError::InvalidUtf8 { field: "key text" })?;
            let text = AsciiText::try_from(text.to_string()).map_err(|_| {
                ProtocolError::InvalidValue {
                    field: "key text length",
                    value: len as u32,
                }
            })?;
            Ok(KeyCommand::Text(text))
        }
        KeyCommand::RELEASE_ALL => Ok(KeyCommand::ReleaseAll),
        other => Err(ProtocolError::InvalidValue {
            field: "key command",
            value: other as u32,
        }),
    }
}

fn read_mouse_command(r: &mut Reader<'_>) -> Result<MouseCommand, ProtocolError> {
    match r.u8()? {
        MouseCommand::BUTTON => {
            let action = read_key_action(r)?;
            let raw = r.u8()?;
            let button = MouseButton::try_from(raw).map_err(|_| ProtocolError::InvalidValue {
                field: "mouse button",
                value: raw as u32,
            })?;
            Ok(MouseCommand::Button { action, button })
        }
        MouseCommand::MOVE => {
            let dx = r.i16()?;
            let dy = r.i16()?;
            Ok(MouseCommand::Move { dx, dy })
        }
        MouseCommand::SCROLL => match r.u8()? {
            WHEEL_RELEASE_ALL => Ok(MouseCommand::ReleaseAll),
            0x01 => Ok(MouseCommand::Scroll(WheelDirection::Up)),
            0xFF => Ok(MouseCommand::Scroll(WheelDirection::Down)),
            other => Err(ProtocolError::InvalidValue {
                field: "wheel direction",
                value: other as u32,
            }),
        },
        other => Err(ProtocolError::InvalidValue {
            field: "mouse command",
            value: other as u32,
        }),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u8, payload: &[u8]) -> Vec<u8> {
        let mut v = MAGIC.to_vec();
        v.push(tag);
        v.extend_from_slice(payload);
        v
    }

    fn fps(values: &[u8]) -> Vec<FrameRate> {
        values.iter().map(|&v| FrameRate::new(v).unwrap()).collect()
    }

    // ── find_frame ───────────────────────────────────────────────────────────

    #[test]
    fn test_find_frame_at_start() {
        let buf = frame(0xF0, &[]);
        assert_eq!(find_frame(&buf), FrameScan::Found { tag: 0xF0, start: 0 });
    }

    #[test]
    fn test_find_frame_skips_garbage_prefix() {
        let mut buf = vec![0x01, 0xFF, 0x31, 0x00, 0xD5];
        buf.extend(frame(0x80, &[0x00]));
        assert_eq!(find_frame(&buf), FrameScan::Found { tag: 0x80, start: 5 });
    }

    #[test]
    fn test_find_frame_magic_without_tag_is_incomplete() {
        let buf = [0x10, 0x20, 0xFF, 0x31, 0xD5];
        assert_eq!(find_frame(&buf), FrameScan::Incomplete { start: 2 });
    }

    #[test]
    fn test_find_frame_no_magic_discards_everything() {
        let buf = [0x10, 0x20, 0x30];
        assert_eq!(find_frame(&buf), FrameScan::NotFound { keep_from: 3 });
        assert_eq!(find_frame(&[]), FrameScan::NotFound { keep_from: 0 });
    }

    #[test]
    fn test_find_frame_keeps_partial_magic_suffix() {
        assert_eq!(find_frame(&[0x10, 0xFF]), FrameScan::NotFound { keep_from: 1 });
        assert_eq!(
            find_frame(&[0x10, 0x20, 0xFF, 0x31]),
            FrameScan::NotFound { keep_from: 2 }
        );
        // 0x31 alone is not a magic prefix.
        assert_eq!(find_frame(&[0x10, 0x31]), FrameScan::NotFound { keep_from: 2 });
    }

    // ── Requests ─────────────────────────────────────────────────────────────

    #[test]
    fn test_encode_control_requests_have_no_payload() {
        assert_eq!(encode_request(&Request::Handshake).unwrap(), frame(0xF0, &[]));
        assert_eq!(encode_request(&Request::Goodbye).unwrap(), frame(0xF1, &[]));
        assert_eq!(encode_request(&Request::ReplyAlive).unwrap(), frame(0xF3, &[]));
        assert_eq!(encode_request(&Request::ListUart).unwrap(), frame(0x00, &[]));
        assert_eq!(encode_request(&Request::ListCap).unwrap(), frame(0x02, &[]));
    }

    #[test]
    fn test_encode_open_uart() {
        let bytes = encode_request(&Request::OpenUart {
            port: "/dev/ttyUSB0".to_string(),
        })
        .unwrap();
        let mut expected = vec![12];
        expected.extend_from_slice(b"/dev/ttyUSB0");
        assert_eq!(bytes, frame(0x01, &expected));
    }

    #[test]
    fn test_encode_open_uart_rejects_empty_port() {
        let err = encode_request(&Request::OpenUart { port: String::new() }).unwrap_err();
        assert_eq!(err, ProtocolError::EmptyName { field: "serial port name" });
    }

    #[test]
    fn test_encode_run_mjpg_layout() {
        let req = Request::RunMjpg(RunMjpgRequest {
            device: "/dev/video0".to_string(),
            resolution: Resolution::new(1920, 1080).unwrap(),
            fps: FrameRate::new(30).unwrap(),
            port: 8080,
        });
        let bytes = encode_request(&req).unwrap();
        let mut expected = vec![11];
        expected.extend_from_slice(b"/dev/video0");
        expected.extend_from_slice(&[0x07, 0x80, 0x04, 0x38, 30, 0x1F, 0x90]);
        assert_eq!(bytes, frame(0x03, &expected));

        let (decoded, n) = decode_request(&bytes).unwrap();
        assert_eq!(decoded, req);
        assert_eq!(n, bytes.len());
    }

    #[test]
    fn test_encode_key_commands() {
        let key = Request::SendKey(KeyCommand::Key {
            action: KeyAction::Press,
            code: 0x04,
        });
        assert_eq!(encode_request(&key).unwrap(), frame(0x04, &[b'K', 0x01, 0x04]));

        let text = Request::SendKey(KeyCommand::Text("hi".parse().unwrap()));
        assert_eq!(encode_request(&text).unwrap(), frame(0x04, &[b'C', 0x00, 0x02, b'h', b'i']));

        let release = Request::SendKey(KeyCommand::ReleaseAll);
        assert_eq!(encode_request(&release).unwrap(), frame(0x04, &[b'R']));
    }

    #[test]
    fn test_encode_mouse_commands() {
        let click = Request::SendMouse(MouseCommand::Button {
            action: KeyAction::Release,
            button: MouseButton::Middle,
        });
        assert_eq!(encode_request(&click).unwrap(), frame(0x05, &[b'K', 0x00, 0x04]));

        let mv = Request::SendMouse(MouseCommand::Move { dx: -2, dy: 300 });
        assert_eq!(
            encode_request(&mv).unwrap(),
            frame(0x05, &[b'M', 0xFF, 0xFE, 0x01, 0x2C])
        );

        let down = Request::SendMouse(MouseCommand::Scroll(WheelDirection::Down));
        assert_eq!(encode_request(&down).unwrap(), frame(0x05, &[b'S', 0xFF]));

        let release = Request::SendMouse(MouseCommand::ReleaseAll);
        assert_eq!(encode_request(&release).unwrap(), frame(0x05, &[b'S', 0x00]));
    }

    #[test]
    fn test_encode_atx_signals() {
        for (signal, byte) in [
            (AtxSignal::ShortPower, 0xFD),
            (AtxSignal::Reset, 0xFE),
            (AtxSignal::LongPower, 0xFF),
        ] {
            assert_eq!(encode_request(&Request::SendAtx(signal)).unwrap(), frame(0x06, &[byte]));
        }
    }

    #[test]
    fn test_decode_request_rejects_server_only_tag() {
        let bytes = frame(0xF2, &[]);
        assert_eq!(
            decode_request(&bytes),
            Err(ProtocolError::UnexpectedMessage(MessageType::AskAlive))
        );
    }

    // ── Status replies ───────────────────────────────────────────────────────

    #[test]
    fn test_status_success_has_no_detail() {
        let bytes = frame(0x84, &[0x00]);
        let (reply, n) = decode_reply(&bytes).unwrap();
        assert_eq!(reply, Reply::SendKey(StatusReply::Success));
        assert_eq!(n, 5);
    }

    #[test]
    fn test_status_failure_carries_detail() {
        let bytes = frame(0x81, &[0x01, 0x04, b'b', b'u', b's', b'y']);
        let (reply, _) = decode_reply(&bytes).unwrap();
        assert_eq!(reply, Reply::OpenUart(StatusReply::Failure("busy".to_string())));
    }

    #[test]
    fn test_status_error_with_empty_detail() {
        let bytes = frame(0x86, &[0x02, 0x00]);
        let (reply, _) = decode_reply(&bytes).unwrap();
        assert_eq!(reply, Reply::SendAtx(StatusReply::Error(String::new())));
    }

    #[test]
    fn test_unknown_status_code_names_raw_byte() {
        let bytes = frame(0x84, &[0xAA]);
        let err = decode_reply(&bytes).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidStatusCode(0xAA));
        assert_eq!(err.to_string(), "invalid status code AA");
    }

    #[test]
    fn test_status_detail_invalid_utf8() {
        let bytes = frame(0x83, &[0x02, 0x02, 0xC3, 0x28]);
        assert_eq!(
            decode_reply(&bytes),
            Err(ProtocolError::InvalidUtf8 { field: "status detail" })
        );
    }

    #[test]
    fn test_status_detail_truncated_is_incomplete() {
        let bytes = frame(0x81, &[0x01, 0x05, b'a', b'b']);
        let err = decode_reply(&bytes).unwrap_err();
        assert!(err.is_incomplete());
        assert_eq!(
            err,
            ProtocolError::InsufficientData {
                needed: 11,
                available: 8
            }
        );
    }

    // ── Device lists ─────────────────────────────────────────────────────────

    #[test]
    fn test_list_uart_decodes_devices() {
        let mut payload = vec![2];
        payload.push(12);
        payload.extend_from_slice(b"/dev/ttyUSB0");
        payload.extend_from_slice(&[0x1A, 0x86, 0x75, 0x23]);
        payload.push(12);
        payload.extend_from_slice(b"/dev/ttyACM0");
        payload.extend_from_slice(&[0x04, 0x83, 0xDF, 0x11]);
        let bytes = frame(0x80, &payload);

        let (reply, n) = decode_reply(&bytes).unwrap();
        assert_eq!(n, bytes.len());
        let Reply::ListUart(devices) = reply else {
            panic!("expected ListUart, got {reply:?}");
        };
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].name, "/dev/ttyUSB0");
        assert_eq!(devices[0].usb_id, UsbId::new(0x1A86, 0x7523));
        assert_eq!(devices[1].usb_id.to_string(), "0483:df11");
    }

    #[test]
    fn test_list_uart_zero_devices() {
        let (reply, n) = decode_reply(&frame(0x80, &[0x00])).unwrap();
        assert_eq!(reply, Reply::ListUart(Vec::new()));
        assert_eq!(n, 5);
        assert_eq!(encode_reply(&reply).unwrap(), frame(0x80, &[0x00]));
    }

    #[test]
    fn test_list_uart_zero_length_name_is_error() {
        let bytes = frame(0x80, &[0x01, 0x00, 0x00, 0x01, 0x00, 0x02]);
        assert_eq!(
            decode_reply(&bytes),
            Err(ProtocolError::EmptyName { field: "serial device name" })
        );
    }

    #[test]
    fn test_list_cap_round_trip() {
        let reply = Reply::ListCap(vec![VideoCapture {
            name: "/dev/video0".to_string(),
            modes: vec![
                CaptureMode {
                    resolution: Resolution::new(1920, 1080).unwrap(),
                    frame_rates: fps(&[30, 60]),
                },
                CaptureMode {
                    resolution: Resolution::new(1280, 720).unwrap(),
                    frame_rates: fps(&[60]),
                },
            ],
        }]);
        let bytes = encode_reply(&reply).unwrap();
        let (decoded, n) = decode_reply(&bytes).unwrap();
        assert_eq!(decoded, reply);
        assert_eq!(n, bytes.len());
    }

    #[test]
    fn test_list_cap_zero_captures() {
        let bytes = frame(0x82, &[0x00]);

        let (reply, n) = decode_reply(&bytes).unwrap();

        assert_eq!(reply, Reply::ListCap(Vec::new()));
        assert_eq!(n, 5);
        assert_eq!(encode_reply(&reply).unwrap(), bytes);
    }

    #[test]
    fn test_list_cap_zero_width_or_rate_is_invalid() {
        let mut zero_width = vec![1, 4];
        zero_width.extend_from_slice(b"cam0");
        zero_width.extend_from_slice(&[1, 0x00, 0x00, 0x02, 0xD0, 1, 30]);
        assert_eq!(
            decode_reply(&frame(0x82, &zero_width)),
            Err(ProtocolError::InvalidValue {
                field: "resolution",
                value: 720
            })
        );

        let mut zero_rate = vec![1, 4];
        zero_rate.extend_from_slice(b"cam0");
        zero_rate.extend_from_slice(&[1, 0x05, 0x00, 0x02, 0xD0, 1, 0]);
        assert_eq!(
            decode_reply(&frame(0x82, &zero_rate)),
            Err(ProtocolError::InvalidValue {
                field: "frame rate",
                value: 0
            })
        );
    }

    #[test]
    fn test_list_cap_capture_without_resolutions_is_error() {
        let mut payload = vec![1, 4];
        payload.extend_from_slice(b"cam0");
        payload.push(0);
        assert_eq!(
            decode_reply(&frame(0x82, &payload)),
            Err(ProtocolError::NoResolutions {
                capture: "cam0".to_string()
            })
        );
    }

    #[test]
    fn test_list_cap_resolution_without_rates_is_error() {
        let mut payload = vec![1, 4];
        payload.extend_from_slice(b"cam0");
        payload.extend_from_slice(&[1, 0x02, 0x80, 0x01, 0xE0, 0]);
        assert_eq!(
            decode_reply(&frame(0x82, &payload)),
            Err(ProtocolError::NoFrameRates {
                capture: "cam0".to_string(),
                resolution: Resolution::new(640, 480).unwrap(),
            })
        );
    }

    #[test]
    fn test_every_prefix_of_a_reply_is_incomplete() {
        let reply = Reply::ListUart(vec![SerialDevice {
            name: "/dev/ttyUSB0".to_string(),
            usb_id: UsbId::new(0x1A86, 0x7523),
        }]);
        let bytes = encode_reply(&reply).unwrap();
        for cut in 0..bytes.len() {
            let err = decode_reply(&bytes[..cut]).unwrap_err();
            assert!(err.is_incomplete(), "prefix of {cut} bytes gave {err:?}");
        }
        assert_eq!(decode_reply(&bytes).unwrap().0, reply);
    }

    #[test]
    fn test_decode_reply_ignores_trailing_bytes() {
        let mut bytes = frame(0xF2, &[]);
        bytes.extend(frame(0xF1, &[]));
        let (reply, n) = decode_reply(&bytes).unwrap();
        assert_eq!(reply, Reply::AskAlive);
        assert_eq!(n, 4);
    }

    #[test]
    fn test_decode_reply_rejects_missing_magic_and_unknown_tag() {
        assert_eq!(decode_reply(&[0x00, 0x31, 0xD5, 0xF0]), Err(ProtocolError::MissingMagic));
        assert_eq!(
            decode_reply(&frame(0x7E, &[])),
            Err(ProtocolError::UnknownMessageType(0x7E))
        );
        assert_eq!(
            decode_reply(&frame(0x00, &[])),
            Err(ProtocolError::UnexpectedMessage(MessageType::ListUartReq))
        );
    }

    #[test]
    fn test_encode_reply_rejects_oversized_lists() {
        let devices = (0..256)
            .map(|i| SerialDevice {
                name: format!("/dev/ttyUSB{i}"),
                usb_id: UsbId::new(1, 1),
            })
            .collect();
        assert_eq!(
            encode_reply(&Reply::ListUart(devices)),
            Err(ProtocolError::TooManyEntries {
                field: "serial device list",
                count: 256
            })
        );
    }
}
