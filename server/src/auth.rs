//! Authentication primitives for `AUTH` messages.
//!
//! DESIGN
//! ======
//! Three credential shapes are accepted: email+password (delegated to the
//! platform login), a refresh token (exchanged for a fresh access token),
//! or a raw access token. Whatever the shape, the resulting token resolves
//! to an [`Accountability`] and an optional expiry instant: the explicit
//! `expires_at` on the message wins, then the platform's login expiry, then
//! the token's own `exp` claim.
//!
//! The `exp` extraction deliberately skips signature verification — the
//! access-control resolver owns trust; this module only needs the timestamp.

use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{DecodingKey, Validation};
use serde::Deserialize;

use crate::errors::GatewayError;
use crate::services::{Accountability, Services};
use messages::AuthRequest;

/// A successfully established auth epoch.
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub accountability: Accountability,
    /// Epoch seconds; `None` means this layer never expires the epoch.
    pub expires_at: Option<i64>,
    /// Present when the login shape was used, so socket-only clients can
    /// re-authenticate later.
    pub refresh_token: Option<String>,
}

/// Run one `AUTH` message through the platform services.
pub async fn authenticate(
    services: &Services,
    request: &AuthRequest,
) -> Result<AuthOutcome, GatewayError> {
    let (token, platform_expiry, refresh_token) = match request {
        AuthRequest { email: Some(email), password: Some(password), .. } => {
            let login = services
                .auth
                .login(email, password)
                .await
                .map_err(|e| GatewayError::AuthenticationFailed(e.to_string()))?;
            (login.access_token, login.expires_at, Some(login.refresh_token))
        }
        AuthRequest { refresh_token: Some(refresh), .. } => {
            let result = services
                .auth
                .refresh(refresh)
                .await
                .map_err(|e| GatewayError::AuthenticationFailed(e.to_string()))?;
            (result.access_token, None, None)
        }
        AuthRequest { access_token: Some(token), .. } => (token.clone(), None, None),
        _ => {
            return Err(GatewayError::InvalidPayload(
                "auth message carries no credentials".into(),
            ));
        }
    };

    let accountability = services
        .access
        .accountability_for_token(&token)
        .await
        .map_err(|e| GatewayError::AuthenticationFailed(e.to_string()))?;

    let expires_at = request
        .expires_at
        .or(platform_expiry)
        .or_else(|| token_expiry(&token));

    Ok(AuthOutcome { accountability, expires_at, refresh_token })
}

#[derive(Deserialize)]
struct ExpiryClaims {
    exp: Option<i64>,
}

/// Extract the `exp` claim from a JWT without verifying its signature.
/// Returns `None` for opaque (non-JWT) tokens.
#[must_use]
pub fn token_expiry(token: &str) -> Option<i64> {
    let header = jsonwebtoken::decode_header(token).ok()?;

    let mut validation = Validation::new(header.alg);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    jsonwebtoken::decode::<ExpiryClaims>(token, &DecodingKey::from_secret(&[]), &validation)
        .ok()
        .and_then(|data| data.claims.exp)
}

/// Current time as epoch seconds.
#[must_use]
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

#[cfg(test)]
#[path = "auth_test.rs"]
mod tests;
