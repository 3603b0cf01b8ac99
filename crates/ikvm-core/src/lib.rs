//! # ikvm-core
//!
//! Shared library for the iKVM client containing the wire protocol codec,
//! device descriptors, validated value types and the device selection policy.
//!
//! It has no dependencies on sockets, async runtimes or OS APIs, so every
//! piece can be tested with plain byte slices.
//!
//! # Architecture overview
//!
//! An iKVM server sits next to the machine being controlled.  It exposes a
//! USB HID bridge on a serial port (keyboard, mouse, ATX power header) and a
//! video capture card streamed by mjpg-streamer.  The client talks to it over
//! a small binary TCP protocol and reads the video as MJPEG over HTTP.
//!
//! - **`protocol`** – How bytes travel over the TCP connection.  Every frame
//!   is a three-byte magic marker, a one-byte type tag and a self-describing
//!   payload.  [`protocol::codec::find_frame`] locates frames in a receive
//!   buffer and the `decode_*` functions turn payloads into typed replies.
//!
//! - **`domain`** – The device descriptors the server reports, the value
//!   types users supply (`1920x1080`, `16:9`, `0483:df11`), and the policy
//!   that picks a serial device and a capture mode from them.

pub mod domain;
pub mod protocol;

pub use domain::devices::{
    AspectRatio, CaptureMode, FrameRate, Resolution, SerialDevice, UsbId, ValueError, VideoCapture,
};
pub use domain::selection::{
    select_capture, select_serial, CaptureChoice, CapturePreference, Quality, SelectionError,
};
pub use protocol::codec::{decode_reply, encode_request, find_frame, FrameScan, ProtocolError};
pub use protocol::messages::{
    AsciiText, AtxSignal, KeyAction, KeyCommand, MessageType, MouseButton, MouseCommand, Reply,
    Request, StatusReply, WheelDirection,
};
