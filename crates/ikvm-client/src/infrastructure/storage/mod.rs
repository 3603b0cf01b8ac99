//! Storage infrastructure: the client's TOML configuration file.
//!
//! The `config` sub-module reads the file from the platform config directory,
//! fills in defaults for anything missing, and writes it back after a session
//! has picked its devices so the next run starts with the same choice.

pub mod config;
