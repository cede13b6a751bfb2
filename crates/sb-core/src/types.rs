use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Terminal geometry in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TerminalSize {
    pub rows: u16,
    pub cols: u16,
}

impl TerminalSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl std::fmt::Display for TerminalSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Running,
    Closed,
}

/// Point-in-time view of a session, served by the status endpoint and
/// delivered to clients as a polled snapshot while the stream is down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub state: SessionState,
    pub shell: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub rows: u16,
    pub cols: u16,
    pub prompt_watcher: bool,
    pub attached: bool,
    pub bytes_forwarded: u64,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// HTTP request / response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    /// One of `default`, `cmd`, `powershell`, `wsl`. Falls back to the
    /// daemon's configured shell when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell_selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wsl_distro: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_watcher: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub shell: String,
    pub rows: u16,
    pub cols: u16,
}

/// Error payload for a session that could not be spawned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnFailedBody {
    pub kind: String,
    pub detail: String,
}

// ---------------------------------------------------------------------------
// WebSocket control messages
// ---------------------------------------------------------------------------

/// JSON control frames sent from the client over the terminal WebSocket.
/// Text frames that do not parse as one of these are treated as raw input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Raw input data to write to the PTY.
    Input { data: String },
    /// Resize the terminal.
    Resize { rows: u16, cols: u16 },
    /// Toggle auto-answering of confirmation prompts.
    PromptWatcher { enabled: bool },
}
