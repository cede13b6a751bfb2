//! Logging and request tracing for shellbridge services.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`,
//!   filtered by `RUST_LOG` with a configurable fallback level.
//! - **Tracing**: request-id middleware for the HTTP/WS router and
//!   trace/span id helpers for correlating a terminal connection's logs.

pub mod logging;
pub mod tracing_setup;
