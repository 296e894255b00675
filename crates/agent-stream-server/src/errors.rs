use std::path::PathBuf;

use agent_stream_core::{ReconstructionError, StreamError};
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::{debug, error};

/// Invalid server configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("cannot read script {path}: {source}")]
    ScriptIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid script {path}: {source}")]
    ScriptFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// A run request was rejected before anything was spawned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunError {
    #[error("validation error: {0}")]
    Validation(String),
}

/// Failure raised by an agent runtime while it executes.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeFailure {
    /// A tool or script step reported an error.
    #[error("{0}")]
    Step(String),
    /// Reporting progress failed.
    #[error(transparent)]
    Stream(#[from] StreamError),
}

impl RuntimeFailure {
    pub fn step(message: impl Into<String>) -> Self {
        Self::Step(message.into())
    }

    /// The consumer went away, so there is nobody left to report the failure to.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Stream(err) if err.is_transport() || matches!(err, StreamError::Closed))
    }
}

/// Error returned by HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    /// The run finished, but not successfully.
    #[error("{0}")]
    RunFailed(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::RunFailed(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::NotFound(_) => "not_found",
            ApiError::RunFailed(_) => "run_failed",
            ApiError::Internal(_) => "internal_error",
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();
        match &self {
            ApiError::Internal(_) | ApiError::RunFailed(_) => {
                error!(error_code = code, message = %message, "API error");
            }
            _ => debug!(error_code = code, message = %message, "client error"),
        }
        (status, Json(ErrorResponse { error: message, code })).into_response()
    }
}

impl From<RunError> for ApiError {
    fn from(err: RunError) -> Self {
        match err {
            RunError::Validation(message) => ApiError::BadRequest(message),
        }
    }
}

impl From<ReconstructionError> for ApiError {
    fn from(err: ReconstructionError) -> Self {
        ApiError::Internal(format!("run produced an invalid stream: {err}"))
    }
}

impl From<agent_stream_core::CodecError> for ApiError {
    fn from(err: agent_stream_core::CodecError) -> Self {
        ApiError::Internal(err.to_string())
    }
}
