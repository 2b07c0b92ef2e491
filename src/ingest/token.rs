use chrono::Utc;
use tracing::{debug, info};

use crate::connectors::TokenEndpoint;
use crate::db::models::{Credential, User};
use crate::db::Database;
use crate::error::IngestError;

/// Returns a bearer credential that is valid right now.
///
/// A stored token whose expiry lies strictly in the future is returned as is.
/// Otherwise the refresh token is exchanged at `endpoint`, the new token and
/// expiry are written to the user row in a single statement, and `user` is
/// updated in place. A failed exchange leaves both the row and `user` untouched.
pub async fn ensure_fresh_credential(
    db: &Database,
    endpoint: &dyn TokenEndpoint,
    user: &mut User,
) -> Result<Credential, IngestError> {
    let now = Utc::now();
    if let Some(credential) = user.credential() {
        if credential.expires_at.is_some_and(|expiry| expiry > now) {
            debug!("access token for user {} still valid", user.id);
            return Ok(credential);
        }
    }

    let refresh_token = user
        .refresh_token
        .as_deref()
        .filter(|token| !token.trim().is_empty())
        .ok_or_else(|| {
            IngestError::AuthExpired(format!("user {} has no refresh token", user.id))
        })?;

    let refreshed = endpoint.refresh(refresh_token).await?;
    db.update_credential(user.id, &refreshed.access_token, refreshed.expires_at)?;
    info!("refreshed access token for user {}", user.id);

    user.access_token = Some(refreshed.access_token.clone());
    user.token_expiry = refreshed.expires_at;

    Ok(Credential {
        access_token: refreshed.access_token,
        expires_at: refreshed.expires_at,
    })
}
