//! Refresh-token creation and parsing.
//!
//! The wire form is the base64 output of [`crate::crypto::encrypt`] over a
//! JSON payload carrying the session handle, the parent token's hash, the
//! license-tier type, and a nonce. Anything that fails to open or parse is
//! unauthorised; callers never learn why.

use serde::{Deserialize, Serialize};

use crate::config::{CoreConfig, LicenseTier};
use crate::crypto;
use secrecy::ExposeSecret;

use super::{SessionError, SessionResult, TokenInfo};

/// Wire type of a refresh token, derived from the license tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenType {
    #[serde(rename = "FREE")]
    Free,
    #[serde(rename = "PAID")]
    Paid,
}

impl From<LicenseTier> for TokenType {
    fn from(tier: LicenseTier) -> Self {
        match tier {
            LicenseTier::Free => Self::Free,
            LicenseTier::Paid => Self::Paid,
        }
    }
}

/// What a refresh token decrypts to.
#[derive(Clone, Debug, PartialEq)]
pub struct RefreshTokenInfo {
    pub session_handle: String,
    /// Filled in by the façade once the session row is loaded.
    pub user_id: Option<String>,
    /// SHA-256 of the previous issued token; `None` for a chain head.
    pub parent_refresh_token_hash2: Option<String>,
    pub token_type: TokenType,
}

#[derive(Serialize, Deserialize)]
struct RefreshTokenPayload {
    session_handle: String,
    parent_refresh_token_hash2: Option<String>,
    token_type: TokenType,
    nonce: String,
}

/// Builds and seals a new refresh token for `session_handle`.
///
/// # Errors
/// Fails when the payload cannot be sealed under the installation secret.
pub fn create_new_refresh_token(
    config: &CoreConfig,
    now_millis: u64,
    session_handle: &str,
    parent_token: Option<&str>,
) -> SessionResult<TokenInfo> {
    let payload = RefreshTokenPayload {
        session_handle: session_handle.to_string(),
        parent_refresh_token_hash2: parent_token.map(crypto::hash_sha256),
        token_type: config.license_tier().into(),
        nonce: crypto::random_token(),
    };
    let json = serde_json::to_string(&payload)
        .map_err(|err| SessionError::Internal(format!("refresh payload encoding: {err}")))?;
    let token = crypto::encrypt(&json, config.installation_secret().expose_secret())
        .map_err(|err| SessionError::Internal(format!("refresh token sealing: {err}")))?;

    Ok(TokenInfo {
        token,
        expires_at_millis: now_millis + config.refresh_token_validity_millis(),
        created_at_millis: now_millis,
    })
}

/// Opens and deserializes a refresh token.
///
/// # Errors
/// Fails with an unauthorised condition for tampered tokens, tokens sealed
/// under a different installation secret, or structurally invalid payloads.
pub fn get_info_from_refresh_token(
    config: &CoreConfig,
    token: &str,
) -> SessionResult<RefreshTokenInfo> {
    let json = crypto::decrypt(token, config.installation_secret().expose_secret())
        .map_err(|_| SessionError::Unauthorised("invalid refresh token".to_string()))?;
    let payload: RefreshTokenPayload = serde_json::from_str(&json)
        .map_err(|_| SessionError::Unauthorised("invalid refresh token".to_string()))?;

    Ok(RefreshTokenInfo {
        session_handle: payload.session_handle,
        user_id: None,
        parent_refresh_token_hash2: payload.parent_refresh_token_hash2,
        token_type: payload.token_type,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn config() -> CoreConfig {
        CoreConfig::new(SecretString::from(crypto::generate_installation_secret()))
            .with_refresh_token_validity_millis(10_000)
    }

    #[test]
    fn create_and_parse_roundtrip() {
        let config = config();
        let token = create_new_refresh_token(&config, 1_000, "session-1", None).unwrap();
        assert_eq!(token.created_at_millis, 1_000);
        assert_eq!(token.expires_at_millis, 11_000);

        let info = get_info_from_refresh_token(&config, &token.token).unwrap();
        assert_eq!(info.session_handle, "session-1");
        assert_eq!(info.parent_refresh_token_hash2, None);
        assert_eq!(info.token_type, TokenType::Free);
    }

    #[test]
    fn parent_hash_links_to_previous_token() {
        let config = config();
        let parent = create_new_refresh_token(&config, 0, "session-1", None).unwrap();
        let child =
            create_new_refresh_token(&config, 0, "session-1", Some(&parent.token)).unwrap();

        let info = get_info_from_refresh_token(&config, &child.token).unwrap();
        assert_eq!(
            info.parent_refresh_token_hash2.as_deref(),
            Some(crypto::hash_sha256(&parent.token).as_str())
        );
    }

    #[test]
    fn token_type_follows_license_tier() {
        let config = config().with_license_tier(crate::config::LicenseTier::Paid);
        let token = create_new_refresh_token(&config, 0, "session-1", None).unwrap();
        let info = get_info_from_refresh_token(&config, &token.token).unwrap();
        assert_eq!(info.token_type, TokenType::Paid);
    }

    #[test]
    fn foreign_secret_tokens_are_unauthorised() {
        let token = create_new_refresh_token(&config(), 0, "session-1", None).unwrap();

        // A different installation cannot open the token.
        let err = get_info_from_refresh_token(&config(), &token.token).unwrap_err();
        assert!(matches!(err, SessionError::Unauthorised(_)));
    }

    #[test]
    fn garbage_tokens_are_unauthorised() {
        let config = config();
        for bad in ["", "zzzz", "not a token at all"] {
            assert!(matches!(
                get_info_from_refresh_token(&config, bad),
                Err(SessionError::Unauthorised(_))
            ));
        }
    }

    #[test]
    fn tokens_are_unique_even_for_same_session() {
        let config = config();
        let a = create_new_refresh_token(&config, 0, "session-1", None).unwrap();
        let b = create_new_refresh_token(&config, 0, "session-1", None).unwrap();
        assert_ne!(a.token, b.token);
    }
}
