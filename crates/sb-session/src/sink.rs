use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("transport send failed: {0}")]
    TransportSendFailed(String),
}

/// Destination for PTY output. One call per chunk read from the PTY, in
/// read order. An error means the connection is dead; the read loop stops
/// and tears the session down.
#[async_trait]
pub trait OutputSink: Send + Sync + 'static {
    async fn send_output(&self, chunk: Vec<u8>) -> Result<(), SinkError>;
}

#[async_trait]
impl OutputSink for flume::Sender<Vec<u8>> {
    async fn send_output(&self, chunk: Vec<u8>) -> Result<(), SinkError> {
        self.send_async(chunk)
            .await
            .map_err(|e| SinkError::TransportSendFailed(e.to_string()))
    }
}
