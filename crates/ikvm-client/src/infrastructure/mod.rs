//! Infrastructure layer: sockets, HTTP and files.
//!
//! **Dependency rule**: this layer may depend on `application` and `ikvm_core`,
//! but MUST NOT be imported by the `application` layer.
//!
//! # Sub-modules
//!
//! - **`transport`** – Non-blocking TCP halves with the 10 ms back-off and
//!   bounded send retries.
//!
//! - **`network`** – `KvmClient`: connect, handshake, the receiver task,
//!   per-type reply slots, and every request the server understands.
//!
//! - **`mjpeg`** – Multipart MJPEG parser and the HTTP client that feeds it.
//!
//! - **`storage`** – TOML configuration file.

pub mod mjpeg;
pub mod network;
pub mod storage;
pub mod transport;
