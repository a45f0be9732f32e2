//! Error types for the reconciliation engine and JSON error responses for the admin API

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// A failed call against the appliance management API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplianceError {
    pub verb: String,
    pub url: String,
    /// HTTP status, absent when the request never got a response
    pub status: Option<u16>,
    pub message: String,
}

impl ApplianceError {
    pub fn new(verb: impl Into<String>, url: impl Into<String>, status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            url: url.into(),
            status,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }

    pub fn is_conflict(&self) -> bool {
        self.status == Some(409)
    }
}

impl fmt::Display for ApplianceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(
                f,
                "Encountered an error on {} request to URL {}: HTTP code: {}; error from appliance: {}",
                self.verb, self.url, status, self.message
            ),
            None => write!(
                f,
                "Encountered an error on {} request to URL {}: {}",
                self.verb, self.url, self.message
            ),
        }
    }
}

impl std::error::Error for ApplianceError {}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    Appliance(#[from] ApplianceError),

    #[error("{kind} {name} already exists on the appliance")]
    NameCollision { kind: &'static str, name: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to render template {name}: {source}")]
    Template {
        name: String,
        #[source]
        source: minijinja::Error,
    },

    #[error("snapshot encoding error: {0}")]
    Snapshot(#[from] serde_json::Error),

    #[error("error reloading router: {status}\n{output}")]
    Reload { status: String, output: String },

    #[error("event dispatcher is not running")]
    DispatcherClosed,
}

impl RouterError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RouterError::Io {
            path: path.into(),
            source,
        }
    }

    /// Admin API error code for this failure
    pub fn error_code(&self) -> ErrorCode {
        match self {
            RouterError::Appliance(_) => ErrorCode::BackendFailure,
            RouterError::NameCollision { .. } => ErrorCode::NameCollision,
            RouterError::Io { .. } | RouterError::Template { .. } | RouterError::Snapshot(_) => {
                ErrorCode::CommitFailed
            }
            RouterError::Reload { .. } => ErrorCode::ReloadFailed,
            RouterError::DispatcherClosed => ErrorCode::Unavailable,
        }
    }
}

pub type Result<T> = std::result::Result<T, RouterError>;

/// Error codes reported by the admin API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Missing or wrong bearer token
    Unauthorized,
    /// Unknown admin path
    NotFound,
    /// Event payload could not be decoded
    InvalidPayload,
    /// Appliance API call failed
    BackendFailure,
    /// Object unexpectedly present on the appliance
    NameCollision,
    /// Writing certificates, snapshot or config failed
    CommitFailed,
    /// Reload command exited unsuccessfully
    ReloadFailed,
    /// Dispatcher stopped
    Unavailable,
}

impl ErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::InvalidPayload => StatusCode::BAD_REQUEST,
            ErrorCode::BackendFailure => StatusCode::BAD_GATEWAY,
            ErrorCode::NameCollision => StatusCode::CONFLICT,
            ErrorCode::CommitFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::ReloadFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Value of the X-Routegate-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InvalidPayload => "INVALID_PAYLOAD",
            ErrorCode::BackendFailure => "BACKEND_FAILURE",
            ErrorCode::NameCollision => "NAME_COLLISION",
            ErrorCode::CommitFailed => "COMMIT_FAILED",
            ErrorCode::ReloadFailed => "RELOAD_FAILED",
            ErrorCode::Unavailable => "UNAVAILABLE",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with an X-Routegate-Error header
pub fn json_error_response(code: ErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let body = ErrorResponse::new(code, message).to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Routegate-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static headers")
}
