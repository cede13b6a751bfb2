use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// Automatic reconnection stopped; only an explicit reconnect resumes.
    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("status poll failed: {0}")]
    Poll(String),

    /// The connection driver is no longer running.
    #[error("client connection closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, ClientError>;
