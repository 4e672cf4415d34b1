use std::time::Duration;

use thiserror::Error;

/// Failures produced by the loader, the stream consumer, and the HTTP collaborators.
///
/// Errors are `Clone` because they are kept around as observable state
/// (`last_error`, `last_stream_error`) rather than only propagated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected status {status}: {reason}")]
    Protocol { status: u16, reason: String },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("no frame received for {0:?}")]
    Liveness(Duration),
    #[error("stream closed by server")]
    StreamClosed,
    #[error("operation cancelled")]
    Cancelled,
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("{0} not configured")]
    NotConfigured(&'static str),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    /// Client-side rejections (4xx) are not retried; everything else is.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Protocol { status, .. } if (400..500).contains(status))
    }

    pub fn protocol(status: reqwest::StatusCode) -> Self {
        SyncError::Protocol {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("unknown").to_string(),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return SyncError::Decode(err.to_string());
        }
        match err.status() {
            Some(status) => SyncError::protocol(status),
            None => SyncError::Transport(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Decode(err.to_string())
    }
}
