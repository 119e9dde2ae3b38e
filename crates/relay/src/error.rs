use std::future::Future;

use axum::{
    http::{header::HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ValidationFailed,
    AuthInvalidToken,
    AuthForbidden,
    NotFound,
    SessionNotJoined,
    InvalidMessage,
    PersistenceFailed,
    InternalError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::AuthInvalidToken => "AUTH_INVALID_TOKEN",
            Self::AuthForbidden => "AUTH_FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::SessionNotJoined => "SYNC_SESSION_NOT_JOINED",
            Self::InvalidMessage => "SYNC_INVALID_MESSAGE",
            Self::PersistenceFailed => "PERSISTENCE_FAILED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::ValidationFailed | Self::InvalidMessage => StatusCode::BAD_REQUEST,
            Self::AuthInvalidToken => StatusCode::UNAUTHORIZED,
            Self::AuthForbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::SessionNotJoined => StatusCode::CONFLICT,
            Self::PersistenceFailed => StatusCode::SERVICE_UNAVAILABLE,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub const fn retryable(self) -> bool {
        matches!(self, Self::PersistenceFailed | Self::InternalError)
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::ValidationFailed => "request validation failed",
            Self::AuthInvalidToken => "invalid authentication token",
            Self::AuthForbidden => "caller lacks required permission",
            Self::NotFound => "requested resource not found",
            Self::SessionNotJoined => "session has not joined a workspace",
            Self::InvalidMessage => "invalid websocket frame payload",
            Self::PersistenceFailed => "durable storage is unavailable",
            Self::InternalError => "internal server error",
        }
    }
}

/// Failures of the document synchronization engine.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("workspace `{workspace_id}` not found")]
    NotFound { workspace_id: String },

    #[error("workspace id must not be empty")]
    InvalidWorkspaceId,
}

impl SyncError {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::InvalidWorkspaceId => ErrorCode::ValidationFailed,
        }
    }
}

/// Failures of the durable storage backend.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("durable store query failed: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("workspace record could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("version {version} does not fit the durable column type")]
    VersionOverflow { version: u64 },

    #[error("durable store unavailable: {0}")]
    Unavailable(String),
}

/// Reasons a connection handshake or bearer token is rejected.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing identity token")]
    MissingToken,

    #[error("missing workspace id")]
    MissingWorkspace,

    #[error("invalid identity token")]
    InvalidToken,

    #[error("token does not grant access to workspace `{workspace_id}`")]
    Forbidden { workspace_id: String },
}

impl AuthError {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Forbidden { .. } => ErrorCode::AuthForbidden,
            _ => ErrorCode::AuthInvalidToken,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayError {
    code: ErrorCode,
    message: String,
    request_id: Option<String>,
}

impl RelayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), request_id: None }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

impl From<SyncError> for RelayError {
    fn from(error: SyncError) -> Self {
        Self::new(error.code(), error.to_string())
    }
}

impl From<AuthError> for RelayError {
    fn from(error: AuthError) -> Self {
        Self::new(error.code(), error.to_string())
    }
}

impl From<PersistenceError> for RelayError {
    fn from(error: PersistenceError) -> Self {
        Self::new(ErrorCode::PersistenceFailed, error.to_string())
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let request_id = self.request_id.or_else(current_request_id);

        let mut response = (
            self.code.status(),
            Json(json!({
                "error": {
                    "code": self.code.as_str(),
                    "message": self.message,
                    "retryable": self.code.retryable(),
                    "request_id": request_id.clone(),
                }
            })),
        )
            .into_response();

        if let Some(request_id) = request_id {
            attach_request_id_header(&mut response, &request_id);
        }

        response
    }
}

pub async fn with_request_id_scope<F>(request_id: String, future: F) -> F::Output
where
    F: Future,
{
    REQUEST_ID.scope(request_id, future).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

pub fn request_id_from_headers_or_generate(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn attach_request_id_header(response: &mut Response, request_id: &str) {
    if let Ok(header) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header);
    }
}
