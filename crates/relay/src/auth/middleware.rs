use crate::{
    auth::{IdentityVerifier, VerifiedIdentity},
    error::{ErrorCode, RelayError},
};
use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

/// Caller identity attached to admin requests by [`require_bearer_auth`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub workspace_id: String,
}

impl AuthenticatedUser {
    /// Fails with `AUTH_FORBIDDEN` unless the token grants `workspace_id`.
    pub fn ensure_workspace(&self, workspace_id: &str) -> Result<(), RelayError> {
        if self.workspace_id == workspace_id {
            return Ok(());
        }
        Err(RelayError::new(
            ErrorCode::AuthForbidden,
            format!("token does not grant access to workspace `{workspace_id}`"),
        ))
    }
}

pub async fn require_bearer_auth(
    State(verifier): State<Arc<dyn IdentityVerifier>>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = match request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
    {
        Some(token) => token,
        None => return unauthorized_response("missing bearer token"),
    };

    let VerifiedIdentity { user_id, workspace_id } = match verifier.decode(token) {
        Ok(identity) => identity,
        Err(_) => return unauthorized_response("invalid bearer token"),
    };

    request.extensions_mut().insert(AuthenticatedUser { user_id, workspace_id });

    next.run(request).await
}

pub(crate) fn extract_bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;

    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    Some(token)
}

fn unauthorized_response(message: &'static str) -> Response {
    RelayError::new(ErrorCode::AuthInvalidToken, message).into_response()
}
