//! All iKVM protocol message types.
//!
//! Every frame on the wire is `MAGIC + TYPE [+ payload]`.  Requests flow from
//! the client to the server and replies flow back; a reply's type tag is the
//! request's tag with the high bit set.  Control frames (handshake, goodbye,
//! keepalive) live in the `0xF0` range and carry no payload.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::devices::{FrameRate, Resolution, SerialDevice, ValueError, VideoCapture};

// ── Protocol constants ────────────────────────────────────────────────────────

/// Three-byte marker that starts every frame.  It is never escaped.
pub const MAGIC: [u8; 3] = [0xFF, 0x31, 0xD5];

/// Magic plus the one-byte type tag.
pub const FRAME_HEADER_LEN: usize = MAGIC.len() + 1;

/// Default TCP port of the iKVM server.
pub const DEFAULT_SERVER_PORT: u16 = 7130;

/// Default HTTP port of mjpg-streamer on the iKVM server.
pub const DEFAULT_MJPG_PORT: u16 = 8080;

/// Longest string a one-byte length prefix can describe.
pub const MAX_SHORT_STRING: usize = u8::MAX as usize;

// ── Message type codes ────────────────────────────────────────────────────────

/// Every type tag the protocol defines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    // Requests (0x00–0x7F)
    ListUartReq = 0x00,
    OpenUartReq = 0x01,
    ListCapReq = 0x02,
    RunMjpgReq = 0x03,
    SendKeyReq = 0x04,
    SendMouseReq = 0x05,
    SendAtxReq = 0x06,
    // Replies (request | 0x80)
    ListUartRes = 0x80,
    OpenUartRes = 0x81,
    ListCapRes = 0x82,
    RunMjpgRes = 0x83,
    SendKeyRes = 0x84,
    SendMouseRes = 0x85,
    SendAtxRes = 0x86,
    // Control (0xF0–0xFF)
    Handshake = 0xF0,
    Goodbye = 0xF1,
    AskAlive = 0xF2,
    ReplyAlive = 0xF3,
}

impl TryFrom<u8> for MessageType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x00 => Ok(MessageType::ListUartReq),
            0x01 => Ok(MessageType::OpenUartReq),
            0x02 => Ok(MessageType::ListCapReq),
            0x03 => Ok(MessageType::RunMjpgReq),
            0x04 => Ok(MessageType::SendKeyReq),
            0x05 => Ok(MessageType::SendMouseReq),
            0x06 => Ok(MessageType::SendAtxReq),
            0x80 => Ok(MessageType::ListUartRes),
            0x81 => Ok(MessageType::OpenUartRes),
            0x82 => Ok(MessageType::ListCapRes),
            0x83 => Ok(MessageType::RunMjpgRes),
            0x84 => Ok(MessageType::SendKeyRes),
            0x85 => Ok(MessageType::SendMouseRes),
            0x86 => Ok(MessageType::SendAtxRes),
            0xF0 => Ok(MessageType::Handshake),
            0xF1 => Ok(MessageType::Goodbye),
            0xF2 => Ok(MessageType::AskAlive),
            0xF3 => Ok(MessageType::ReplyAlive),
            _ => Err(()),
        }
    }
}

impl MessageType {
    /// `true` for tags the server may send to the client.
    pub fn is_server_message(self) -> bool {
        matches!(
            self,
            MessageType::ListUartRes
                | MessageType::OpenUartRes
                | MessageType::ListCapRes
                | MessageType::RunMjpgRes
                | MessageType::SendKeyRes
                | MessageType::SendMouseRes
                | MessageType::SendAtxRes
                | MessageType::Handshake
                | MessageType::Goodbye
                | MessageType::AskAlive
        )
    }

    /// `true` for tags the client may send to the server.
    pub fn is_client_message(self) -> bool {
        matches!(
            self,
            MessageType::ListUartReq
                | MessageType::OpenUartReq
                | MessageType::ListCapReq
                | MessageType::RunMjpgReq
                | MessageType::SendKeyReq
                | MessageType::SendMouseReq
                | MessageType::SendAtxReq
                | MessageType::Handshake
                | MessageType::Goodbye
                | MessageType::ReplyAlive
        )
    }

    /// The reply tag that answers this request tag, if it has one.
    pub fn response(self) -> Option<MessageType> {
        match self {
            MessageType::ListUartReq => Some(MessageType::ListUartRes),
            MessageType::OpenUartReq => Some(MessageType::OpenUartRes),
            MessageType::ListCapReq => Some(MessageType::ListCapRes),
            MessageType::RunMjpgReq => Some(MessageType::RunMjpgRes),
            MessageType::SendKeyReq => Some(MessageType::SendKeyRes),
            MessageType::SendMouseReq => Some(MessageType::SendMouseRes),
            MessageType::SendAtxReq => Some(MessageType::SendAtxRes),
            MessageType::Handshake => Some(MessageType::Handshake),
            _ => None,
        }
    }
}

// ── Status-code replies ───────────────────────────────────────────────────────

/// Status byte of a generic acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum StatusCode {
    Success = 0x00,
    Failure = 0x01,
    Error = 0x02,
}

impl TryFrom<u8> for StatusCode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x00 => Ok(StatusCode::Success),
            0x01 => Ok(StatusCode::Failure),
            0x02 => Ok(StatusCode::Error),
            _ => Err(()),
        }
    }
}

/// Decoded generic acknowledgement.  Only failures and errors carry a detail
/// message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusReply {
    Success,
    Failure(String),
    Error(String),
}

impl StatusReply {
    pub fn code(&self) -> StatusCode {
        match self {
            StatusReply::Success => StatusCode::Success,
            StatusReply::Failure(_) => StatusCode::Failure,
            StatusReply::Error(_) => StatusCode::Error,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StatusReply::Success)
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            StatusReply::Success => None,
            StatusReply::Failure(d) | StatusReply::Error(d) => Some(d),
        }
    }
}

impl fmt::Display for StatusReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusReply::Success => write!(f, "success"),
            StatusReply::Failure(d) => write!(f, "failure: {d}"),
            StatusReply::Error(d) => write!(f, "error: {d}"),
        }
    }
}

// ── Input vocabulary ──────────────────────────────────────────────────────────

/// Press or release, shared by keys and mouse buttons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum KeyAction {
    Release = 0x00,
    Press = 0x01,
}

impl TryFrom<u8> for KeyAction {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x00 => Ok(KeyAction::Release),
            0x01 => Ok(KeyAction::Press),
            _ => Err(()),
        }
    }
}

impl FromStr for KeyAction {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "press" => Ok(KeyAction::Press),
            "release" => Ok(KeyAction::Release),
            _ => Err(ValueError::KeyAction(s.to_string())),
        }
    }
}

/// Mouse button bit as the HID bridge expects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MouseButton {
    Left = 0x01,
    Right = 0x02,
    Middle = 0x04,
}

impl TryFrom<u8> for MouseButton {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(MouseButton::Left),
            0x02 => Ok(MouseButton::Right),
            0x04 => Ok(MouseButton::Middle),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum WheelDirection {
    Up = 0x01,
    Down = 0xFF,
}

/// Wheel byte that releases every mouse button instead of scrolling.
pub const WHEEL_RELEASE_ALL: u8 = 0x00;

/// ATX front-panel signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum AtxSignal {
    ShortPower = 0xFD,
    Reset = 0xFE,
    LongPower = 0xFF,
}

impl TryFrom<u8> for AtxSignal {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0xFD => Ok(AtxSignal::ShortPower),
            0xFE => Ok(AtxSignal::Reset),
            0xFF => Ok(AtxSignal::LongPower),
            _ => Err(()),
        }
    }
}

impl FromStr for AtxSignal {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c == '-' || c == '_' { ' ' } else { c })
            .collect();
        match normalized.as_str() {
            "short power" => Ok(AtxSignal::ShortPower),
            "reset" => Ok(AtxSignal::Reset),
            "long power" => Ok(AtxSignal::LongPower),
            _ => Err(ValueError::AtxSignal(s.to_string())),
        }
    }
}

impl fmt::Display for AtxSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AtxSignal::ShortPower => "short power",
            AtxSignal::Reset => "reset",
            AtxSignal::LongPower => "long power",
        })
    }
}

/// Text typed by the HID bridge.  ASCII only, at most 65535 bytes so the
/// length fits the u16 prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AsciiText(String);

impl AsciiText {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<String> for AsciiText {
    type Error = ValueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if let Some(pos) = value.bytes().position(|b| !b.is_ascii()) {
            return Err(ValueError::NonAscii(pos));
        }
        if value.len() > u16::MAX as usize {
            return Err(ValueError::TextTooLong(value.len()));
        }
        Ok(Self(value))
    }
}

impl FromStr for AsciiText {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_string())
    }
}

impl From<AsciiText> for String {
    fn from(value: AsciiText) -> Self {
        value.0
    }
}

/// Payload of a SEND_KEY request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyCommand {
    /// `'K'` + action + HID key code.
    Key { action: KeyAction, code: u8 },
    /// `'C'` + u16 length + ASCII bytes.
    Text(AsciiText),
    /// `'R'`: release every held key.
    ReleaseAll,
}

impl KeyCommand {
    pub const KEY: u8 = b'K';
    pub const TEXT: u8 = b'C';
    pub const RELEASE_ALL: u8 = b'R';
}

/// Payload of a SEND_MOUSE request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MouseCommand {
    /// `'K'` + action + button.
    Button { action: KeyAction, button: MouseButton },
    /// `'M'` + i16 dx + i16 dy.
    Move { dx: i16, dy: i16 },
    /// `'S'` + wheel byte.
    Scroll(WheelDirection),
    /// `'S'` + `0x00`.
    ReleaseAll,
}

impl MouseCommand {
    pub const BUTTON: u8 = b'K';
    pub const MOVE: u8 = b'M';
    pub const SCROLL: u8 = b'S';
}

/// Payload of a RUN_MJPG request: restart mjpg-streamer on the server with
/// this device and mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMjpgRequest {
    pub device: String,
    pub resolution: Resolution,
    pub fps: FrameRate,
    pub port: u16,
}

// ── Top-level message enums ───────────────────────────────────────────────────

/// A frame sent from the client to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Handshake,
    Goodbye,
    ReplyAlive,
    ListUart,
    OpenUart { port: String },
    ListCap,
    RunMjpg(RunMjpgRequest),
    SendKey(KeyCommand),
    SendMouse(MouseCommand),
    SendAtx(AtxSignal),
}

impl Request {
    pub fn message_type(&self) -> MessageType {
        match self {
            Request::Handshake => MessageType::Handshake,
            Request::Goodbye => MessageType::Goodbye,
            Request::ReplyAlive => MessageType::ReplyAlive,
            Request::ListUart => MessageType::ListUartReq,
            Request::OpenUart { .. } => MessageType::OpenUartReq,
            Request::ListCap => MessageType::ListCapReq,
            Request::RunMjpg(_) => MessageType::RunMjpgReq,
            Request::SendKey(_) => MessageType::SendKeyReq,
            Request::SendMouse(_) => MessageType::SendMouseReq,
            Request::SendAtx(_) => MessageType::SendAtxReq,
        }
    }
}

/// A frame sent from the server to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Handshake,
    Goodbye,
    AskAlive,
    ListUart(Vec<SerialDevice>),
    OpenUart(StatusReply),
    ListCap(Vec<VideoCapture>),
    RunMjpg(StatusReply),
    SendKey(StatusReply),
    SendMouse(StatusReply),
    SendAtx(StatusReply),
}

impl Reply {
    pub fn message_type(&self) -> MessageType {
        match self {
            Reply::Handshake => MessageType::Handshake,
            Reply::Goodbye => MessageType::Goodbye,
            Reply::AskAlive => MessageType::AskAlive,
            Reply::ListUart(_) => MessageType::ListUartRes,
            Reply::OpenUart(_) => MessageType::OpenUartRes,
            Reply::ListCap(_) => MessageType::ListCapRes,
            Reply::RunMjpg(_) => MessageType::RunMjpgRes,
            Reply::SendKey(_) => MessageType::SendKeyRes,
            Reply::SendMouse(_) => MessageType::SendMouseRes,
            Reply::SendAtx(_) => MessageType::SendAtxRes,
        }
    }

    /// The acknowledgement carried by a status-code reply.
    pub fn status(&self) -> Option<&StatusReply> {
        match self {
            Reply::OpenUart(s)
            | Reply::RunMjpg(s)
            | Reply::SendKey(s)
            | Reply::SendMouse(s)
            | Reply::SendAtx(s) => Some(s),
            _ => None,
        }
    }

    /// Builds the status-code reply for `kind`, or `None` when `kind` is not a
    /// status-code reply tag.
    pub fn from_status(kind: MessageType, status: StatusReply) -> Option<Reply> {
        match kind {
            MessageType::OpenUartRes => Some(Reply::OpenUart(status)),
            MessageType::RunMjpgRes => Some(Reply::RunMjpg(status)),
            MessageType::SendKeyRes => Some(Reply::SendKey(status)),
            MessageType::SendMouseRes => Some(Reply::SendMouse(status)),
            MessageType::SendAtxRes => Some(Reply::SendAtx(status)),
            _ => None,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
