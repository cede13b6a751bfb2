//! Shared configuration and wire types for shellbridge.
//!
//! Everything here is plain data: the TOML configuration consumed by the
//! daemon, the shell selector handed to the session layer, and the small
//! set of types that cross the HTTP/WebSocket boundary.

pub mod config;
pub mod types;
