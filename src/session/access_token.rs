//! Access-token signing and verification.
//!
//! Access tokens are EdDSA JWTs signed with the app's current signing key.
//! Verification accepts any still-valid key (matched by `kid` when present),
//! so tokens signed just before a rotation keep verifying. Expiry is checked
//! against the injected clock, not the process wall clock.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::config::CoreConfig;
use crate::signing_keys::SigningKeyManager;
use crate::storage::SigningKeyRecord;

use super::{SessionError, SessionResult, TokenInfo};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    pub session_handle: String,
    pub user_id: String,
    pub user_data: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anti_csrf_token: Option<String>,
    /// Issued-at, seconds since epoch.
    pub iat: u64,
    /// Expiry, seconds since epoch (rounded up from the millisecond expiry).
    pub exp: u64,
}

/// Signs a new access token with `key`.
///
/// # Errors
/// Fails when the signing key material is unusable.
pub fn create_new_access_token(
    key: &SigningKeyRecord,
    config: &CoreConfig,
    now_millis: u64,
    session_handle: &str,
    user_id: &str,
    user_data: &serde_json::Value,
    anti_csrf_token: Option<&str>,
) -> SessionResult<TokenInfo> {
    let expires_at_millis = now_millis + config.access_token_validity_millis();
    let claims = AccessTokenClaims {
        session_handle: session_handle.to_string(),
        user_id: user_id.to_string(),
        user_data: user_data.clone(),
        anti_csrf_token: anti_csrf_token.map(ToString::to_string),
        iat: now_millis / 1_000,
        exp: expires_at_millis.div_ceil(1_000),
    };

    let mut header = Header::new(Algorithm::EdDSA);
    header.kid = Some(key.id.clone());
    let encoding_key = EncodingKey::from_ed_pem(key.private_key.as_bytes())
        .map_err(|err| SessionError::Internal(format!("signing key material: {err}")))?;
    let token = jsonwebtoken::encode(&header, &claims, &encoding_key)
        .map_err(|err| SessionError::Internal(format!("access token signing: {err}")))?;

    Ok(TokenInfo {
        token,
        expires_at_millis,
        created_at_millis: now_millis,
    })
}

/// Verifies an access token against the app's valid signing keys.
///
/// # Errors
/// Fails with a try-refresh condition for bad signatures, unknown key ids,
/// and expired tokens — the client's remedy is the same in every case.
pub async fn get_info_from_access_token(
    keys: &SigningKeyManager,
    token: &str,
    now_millis: u64,
) -> SessionResult<AccessTokenClaims> {
    let header = jsonwebtoken::decode_header(token).map_err(|_| SessionError::TryRefreshToken)?;

    let candidates = match header.kid.as_deref() {
        Some(kid) => match keys.key_by_id(kid).await? {
            Some(key) => vec![key],
            None => return Err(SessionError::TryRefreshToken),
        },
        None => keys.all_valid_keys().await?,
    };

    let claims = candidates
        .iter()
        .find_map(|key| decode_with(key, token))
        .ok_or(SessionError::TryRefreshToken)?;

    // Inclusive boundary: a token expires at its expiry instant, not after.
    if now_millis >= claims.exp * 1_000 {
        return Err(SessionError::TryRefreshToken);
    }

    Ok(claims)
}

fn decode_with(key: &SigningKeyRecord, token: &str) -> Option<AccessTokenClaims> {
    let decoding_key = DecodingKey::from_ed_components(&key.public_key).ok()?;

    let mut validation = Validation::new(Algorithm::EdDSA);
    // Expiry is enforced above against the injected clock.
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims = std::collections::HashSet::new();

    jsonwebtoken::decode::<AccessTokenClaims>(token, &decoding_key, &validation)
        .map(|data| data.claims)
        .ok()
}
