//! HTTP and WebSocket surface for shellbridge.
//!
//! - [`http_api`] -- REST routes for creating, inspecting and closing sessions
//! - [`terminal_ws`] -- the transport bridge between one session and one
//!   WebSocket connection
//! - [`api_error`] -- JSON error responses

pub mod api_error;
pub mod http_api;
pub mod terminal_ws;
