// Identity verification seam for the connection handshake and admin routes.
//
// Workspace membership and roles are decided by an external service; the
// relay only checks that a token names the user and grants the workspace.

pub mod jwt;
pub mod middleware;

use crate::error::AuthError;

pub use jwt::JwtIdentityVerifier;

/// Identity proven by a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub user_id: String,
    pub workspace_id: String,
}

pub trait IdentityVerifier: Send + Sync {
    /// Decodes and validates a token without checking its workspace.
    fn decode(&self, token: &str) -> Result<VerifiedIdentity, AuthError>;

    /// Validates a token and checks that it grants `workspace_id`.
    fn verify(&self, token: &str, workspace_id: &str) -> Result<VerifiedIdentity, AuthError> {
        if token.trim().is_empty() {
            return Err(AuthError::MissingToken);
        }
        if workspace_id.trim().is_empty() {
            return Err(AuthError::MissingWorkspace);
        }

        let identity = self.decode(token)?;
        if identity.workspace_id != workspace_id {
            return Err(AuthError::Forbidden { workspace_id: workspace_id.to_string() });
        }
        Ok(identity)
    }
}
