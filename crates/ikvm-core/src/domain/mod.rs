//! Domain types for the iKVM client.
//!
//! Pure data and policy with no sockets and no async runtime: the device
//! descriptors the server reports, the validated value types users supply,
//! and the rules that pick a serial device and a capture mode.

pub mod devices;
pub mod selection;
