//! Error taxonomy shared by every component.
//!
//! Components return `Result<T, BoxError>` uniformly; route handlers
//! translate a `BoxError` into an HTTP response via [`BoxError::status`].
//! Subscriber callbacks never propagate errors to the producer — failures
//! there are caught and logged at the call site instead of surfacing here.

use axum::http::StatusCode;
use serde_json::{json, Value};
use std::fmt;

/// Machine-readable error code identifying a failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    SessionAlreadyExists,
    SessionNotFound,
    CommandExecutionError,
    StreamStartError,
    CommandNotFound,
    ProcessNotFound,
    ProcessError,
    ProcessReadyTimeout,
    ProcessExitedBeforeReady,
    PtyNotFound,
    PtyExclusiveControl,
    PtyError,
    ValidationFailed,
    ParseError,
    InvalidRequest,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionAlreadyExists => "SESSION_ALREADY_EXISTS",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::CommandExecutionError => "COMMAND_EXECUTION_ERROR",
            Self::StreamStartError => "STREAM_START_ERROR",
            Self::CommandNotFound => "COMMAND_NOT_FOUND",
            Self::ProcessNotFound => "PROCESS_NOT_FOUND",
            Self::ProcessError => "PROCESS_ERROR",
            Self::ProcessReadyTimeout => "PROCESS_READY_TIMEOUT",
            Self::ProcessExitedBeforeReady => "PROCESS_EXITED_BEFORE_READY",
            Self::PtyNotFound => "PTY_NOT_FOUND",
            Self::PtyExclusiveControl => "PTY_EXCLUSIVE_CONTROL",
            Self::PtyError => "PTY_ERROR",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::ParseError => "PARSE_ERROR",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// A taxonomy error carrying a code, human message, and optional context.
#[derive(Debug, Clone)]
pub struct BoxError {
    pub code: ErrorCode,
    pub message: String,
    pub context: Value,
}

impl BoxError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: Value::Null,
        }
    }

    #[must_use]
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    /// Fixed code-to-status mapping from the error handling design.
    pub fn status(&self) -> StatusCode {
        match self.code {
            ErrorCode::SessionNotFound
            | ErrorCode::CommandNotFound
            | ErrorCode::ProcessNotFound
            | ErrorCode::PtyNotFound => StatusCode::NOT_FOUND,
            ErrorCode::ValidationFailed
            | ErrorCode::ParseError
            | ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorCode::SessionAlreadyExists | ErrorCode::PtyExclusiveControl => {
                StatusCode::CONFLICT
            }
            ErrorCode::ProcessReadyTimeout => StatusCode::REQUEST_TIMEOUT,
            ErrorCode::StreamStartError => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::CommandExecutionError
            | ErrorCode::ProcessError
            | ErrorCode::ProcessExitedBeforeReady
            | ErrorCode::PtyError
            | ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON body shape used by both the HTTP facade and the WS `error` frame.
    pub fn to_json(&self) -> Value {
        let mut obj = json!({
            "code": self.code.as_str(),
            "message": self.message,
        });
        if !self.context.is_null() {
            obj["context"] = self.context.clone();
        }
        obj
    }
}

impl fmt::Display for BoxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for BoxError {}

impl axum::response::IntoResponse for BoxError {
    fn into_response(self) -> axum::response::Response {
        (self.status(), axum::Json(self.to_json())).into_response()
    }
}
