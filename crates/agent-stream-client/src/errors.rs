use agent_stream_core::{CodecError, ReconstructionError};

/// Errors returned by [`StreamClient`](crate::StreamClient).
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Invalid client configuration.
    #[error("config error: {0}")]
    Config(String),
    /// The request could not be sent.
    #[error("http error: {0}")]
    Http(String),
    /// The server answered with a non-success status.
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },
    /// The response body broke off while streaming.
    #[error("transport error: {0}")]
    Transport(String),
    /// A frame could not be decoded or arrived out of order.
    #[error("decode error: {0}")]
    Decode(#[from] CodecError),
    /// The decoded events do not form a valid execution tree.
    #[error("reconstruction error: {0}")]
    Reconstruction(#[from] ReconstructionError),
}

impl ClientError {
    pub(crate) fn http(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }

    /// HTTP status of a [`ClientError::Status`] error.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}
