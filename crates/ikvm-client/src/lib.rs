//! ikvm-client library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # What does ikvm-client do?
//!
//! An iKVM server sits next to a target machine.  It exposes the target's
//! keyboard and mouse through a USB serial HID adapter, its screen through a
//! video capture device streamed by mjpg-streamer, and its power button
//! through ATX signals.  This crate:
//!
//! 1. Connects to the server over TCP and completes the handshake
//!    (`infrastructure::network::KvmClient`).
//! 2. Opens a serial device and starts mjpg-streamer with a capture mode
//!    picked from what the server reports.
//! 3. Sends keyboard, mouse and ATX commands as fire-and-forget frames whose
//!    acknowledgements can be drained later.
//! 4. Reads JPEG frames from the mjpg-streamer HTTP stream
//!    (`infrastructure::mjpeg::MjpgClient`).

/// Application layer: caller-side session supervision.
pub mod application;

/// Error categories shared by every layer.
pub mod error;

/// Infrastructure layer: TCP, HTTP and configuration storage.
pub mod infrastructure;
