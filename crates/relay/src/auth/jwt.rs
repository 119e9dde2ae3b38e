use anyhow::{anyhow, bail, Context};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use super::{IdentityVerifier, VerifiedIdentity};
use crate::error::AuthError;

pub const TOKEN_TTL_SECONDS: i64 = 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WorkspaceClaims {
    sub: String,
    workspace_id: String,
    iat: i64,
    exp: i64,
}

/// HS256 tokens whose `sub` is the user id and whose `workspace_id` claim
/// names the single workspace they grant.
#[derive(Clone)]
pub struct JwtIdentityVerifier {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityVerifier {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < 32 {
            bail!("jwt secret must be at least 32 characters long");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    /// Issues a token for local development and tests.
    pub fn issue_workspace_token(&self, user_id: &str, workspace_id: &str) -> anyhow::Result<String> {
        self.issue_workspace_token_at(user_id, workspace_id, current_unix_timestamp()?)
    }

    fn issue_workspace_token_at(
        &self,
        user_id: &str,
        workspace_id: &str,
        issued_at: i64,
    ) -> anyhow::Result<String> {
        let claims = WorkspaceClaims {
            sub: user_id.to_string(),
            workspace_id: workspace_id.to_string(),
            iat: issued_at,
            exp: issued_at + TOKEN_TTL_SECONDS,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to encode workspace token")
    }
}

impl IdentityVerifier for JwtIdentityVerifier {
    fn decode(&self, token: &str) -> Result<VerifiedIdentity, AuthError> {
        let claims = decode::<WorkspaceClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|error| {
                debug!(error = %error, "token rejected");
                AuthError::InvalidToken
            })?
            .claims;

        if claims.sub.trim().is_empty() || claims.workspace_id.trim().is_empty() {
            return Err(AuthError::InvalidToken);
        }

        Ok(VerifiedIdentity { user_id: claims.sub, workspace_id: claims.workspace_id })
    }
}

fn current_unix_timestamp() -> anyhow::Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|error| anyhow!("system clock is before unix epoch: {error}"))?;

    i64::try_from(duration.as_secs()).context("unix timestamp overflow")
}
