//! Application layer for the iKVM client.
//!
//! - **`session`** – Retry policy and the supervisor that starts a KVM session,
//!   re-opens its serial device or capture, and keeps the video stream
//!   connected.  It talks to the protocol and video clients only through the
//!   `KvmControl` and `FrameSource` traits, which infrastructure implements.

pub mod session;
