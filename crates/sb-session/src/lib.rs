//! Terminal sessions for shellbridge.
//!
//! A [`session::Session`] owns one pseudo-terminal and the shell process
//! attached to it, runs the read loop that forwards PTY output to an
//! [`sink::OutputSink`], and optionally auto-answers confirmation prompts.
//! The [`manager::SessionManager`] is the registry of live sessions.
//!
//! Key components:
//! - [`pty`] -- the platform PTY capability and its `portable-pty` backend
//! - [`shell`] -- shell selector to executable/argument resolution
//! - [`prompt_watcher`] -- confirmation-prompt detection
//! - [`session`] -- a single PTY + process pairing
//! - [`manager`] -- concurrent session registry

pub mod error;
pub mod manager;
pub mod prompt_watcher;
pub mod pty;
pub mod session;
pub mod shell;
pub mod sink;

pub use error::{Result, SessionError};
pub use manager::SessionManager;
pub use session::{Session, SessionSpec};
pub use sink::{OutputSink, SinkError};
