use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to spawn shell '{shell}': {detail}")]
    SpawnFailed { shell: String, detail: String },

    #[error("pty write failed: {0}")]
    WriteFailed(String),

    #[error("pty resize failed: {0}")]
    ResizeFailed(String),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session already exists: {0}")]
    AlreadyExists(String),

    #[error("session {0} already has an active read loop")]
    ReadLoopActive(String),

    #[error("session manager is at capacity ({max})")]
    AtCapacity { max: usize },

    #[error("session {0} is closed")]
    Closed(String),
}

impl SessionError {
    /// Stable identifier used in API error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::SpawnFailed { .. } => "SpawnFailed",
            SessionError::WriteFailed(_) => "WriteFailed",
            SessionError::ResizeFailed(_) => "ResizeFailed",
            SessionError::NotFound(_) => "NotFound",
            SessionError::AlreadyExists(_) => "AlreadyExists",
            SessionError::ReadLoopActive(_) => "ReadLoopActive",
            SessionError::AtCapacity { .. } => "AtCapacity",
            SessionError::Closed(_) => "Closed",
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
