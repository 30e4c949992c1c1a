//! Session façade: the single entry point the transport layer talks to.
//!
//! Composes the refresh-token engine, the signing-key manager, and storage to
//! answer create/verify/refresh/revoke plus the sign-up/sign-in recipe
//! operations. Rotation runs inside a serializable storage transaction and
//! resolves to one of three explicit outcomes; "benign retry" is a value,
//! not a caught exception.

pub mod access_token;
pub mod refresh_token;

use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::crypto;
use crate::distributor::DistributorError;
use crate::runtime::RuntimeContext;
use crate::signing_keys::{SigningKeyError, SigningKeyManager};
use crate::storage::{
    run_with_retry, IsolationLevel, SessionRecord, StorageError, SupersededToken, UserRecord,
};
use crate::tenant::TenantScope;

pub use access_token::AccessTokenClaims;
pub use refresh_token::{RefreshTokenInfo, TokenType};

pub type SessionResult<T> = Result<T, SessionError>;

/// Failure taxonomy for session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Bad, expired, or reused token; also any token-decryption failure.
    /// Crypto and parsing internals never travel past this message.
    #[error("unauthorised: {0}")]
    Unauthorised(String),

    /// A rotated-out refresh token was replayed; the session has been
    /// revoked as a defense against replay after theft.
    #[error("token theft detected for session {session_handle}")]
    TokenTheftDetected {
        session_handle: String,
        user_id: String,
    },

    /// The access token cannot be used (expired or unverifiable); the client
    /// should call refresh.
    #[error("access token requires refresh")]
    TryRefreshToken,

    /// Sign-up raced another account with the same email. Surfaced as a
    /// domain conflict, never retried here.
    #[error("email already exists")]
    DuplicateEmail,

    #[error("wrong credentials")]
    WrongCredentials,

    #[error("invalid email")]
    InvalidEmail,

    /// Transient backend failure, retryable by the caller. Bounded retries
    /// have already happened by the time this escapes.
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    SigningKeys(#[from] SigningKeyError),

    #[error(transparent)]
    Distributor(#[from] DistributorError),

    #[error("internal error: {0}")]
    Internal(String),
}

/// An issued token with its lifetime.
#[derive(Clone, Debug, PartialEq)]
pub struct TokenInfo {
    pub token: String,
    pub expires_at_millis: u64,
    pub created_at_millis: u64,
}

/// Everything handed back after a session is created or refreshed.
#[derive(Clone, Debug)]
pub struct SessionInformation {
    pub session_handle: String,
    pub user_id: String,
    pub user_data: Value,
    pub access_token: TokenInfo,
    pub refresh_token: TokenInfo,
    pub anti_csrf_token: Option<String>,
}

/// Result of verifying an access token.
#[derive(Clone, Debug)]
pub struct VerifiedSession {
    pub session_handle: String,
    pub user_id: String,
    pub user_data: Value,
}

/// What the transport layer needs to bootstrap a client.
#[derive(Clone, Debug)]
pub struct HandshakeInfo {
    pub jwt_signing_public_key: String,
    pub jwt_signing_public_key_expiry_time: u64,
    pub cookie_domain: Option<String>,
    pub cookie_secure: bool,
    pub access_token_path: String,
    pub refresh_token_path: String,
    pub enable_anti_csrf: bool,
    pub access_token_blacklisting_enabled: bool,
}

/// The three ways a rotation attempt can resolve.
#[derive(Debug)]
pub enum RotationOutcome {
    /// The incoming token was the chain head; a new head was issued.
    Rotated(Box<SessionInformation>),
    /// The incoming token was superseded inside the grace window; the
    /// already-issued successor is returned again.
    RetrySameResult(Box<SessionInformation>),
    /// No match: reused or stolen token.
    Rejected {
        session_handle: String,
        user_id: String,
    },
}

/// Creates a session: refresh-token chain head, signed access token, and the
/// durable session row.
///
/// # Errors
/// Surfaces storage and signing-key failures; unknown scopes fail with the
/// tenant-or-app-not-found condition.
pub async fn create_new_session(
    ctx: &RuntimeContext,
    scope: &TenantScope,
    user_id: &str,
    user_data: Value,
) -> SessionResult<SessionInformation> {
    let config = ctx.config_for(scope)?;
    let now = ctx.now_millis();

    let session_handle = Uuid::new_v4().to_string();
    let refresh = refresh_token::create_new_refresh_token(&config, now, &session_handle, None)?;
    let anti_csrf_token = config
        .anti_csrf_enabled()
        .then(|| Uuid::new_v4().to_string());

    let keys = SigningKeyManager::instance(ctx, scope)?;
    let signing_key = keys.current_key().await?;
    let access = access_token::create_new_access_token(
        &signing_key,
        &config,
        now,
        &session_handle,
        user_id,
        &user_data,
        anti_csrf_token.as_deref(),
    )?;

    let record = SessionRecord {
        session_handle: session_handle.clone(),
        user_id: user_id.to_string(),
        user_data: user_data.clone(),
        refresh_token_hash2: crypto::hash_sha256(&refresh.token),
        superseded: None,
        created_at_millis: now,
        expires_at_millis: now + config.refresh_token_validity_millis(),
    };
    ctx.storage().create_session(scope, record).await?;

    info!(session_handle = %session_handle, "created session");
    Ok(SessionInformation {
        session_handle,
        user_id: user_id.to_string(),
        user_data,
        access_token: access,
        refresh_token: refresh,
        anti_csrf_token,
    })
}

/// Verifies an access token and returns the session it belongs to.
///
/// # Errors
/// `TryRefreshToken` for unusable access tokens and failed anti-CSRF checks;
/// `Unauthorised` when blacklisting is on and the session is gone.
pub async fn get_session(
    ctx: &RuntimeContext,
    scope: &TenantScope,
    access_token: &str,
    anti_csrf_token: Option<&str>,
    do_anti_csrf_check: bool,
) -> SessionResult<VerifiedSession> {
    let config = ctx.config_for(scope)?;
    let keys = SigningKeyManager::instance(ctx, scope)?;
    let claims =
        access_token::get_info_from_access_token(&keys, access_token, ctx.now_millis()).await?;

    if config.anti_csrf_enabled()
        && do_anti_csrf_check
        && claims.anti_csrf_token.as_deref() != anti_csrf_token
    {
        return Err(SessionError::TryRefreshToken);
    }

    if config.access_token_blacklisting_enabled() {
        let now = ctx.now_millis();
        let alive = ctx
            .storage()
            .get_session(scope, &claims.session_handle)
            .await?
            .is_some_and(|record| now < record.expires_at_millis);
        if !alive {
            return Err(SessionError::Unauthorised(
                "session does not exist".to_string(),
            ));
        }
    }

    Ok(VerifiedSession {
        session_handle: claims.session_handle,
        user_id: claims.user_id,
        user_data: claims.user_data,
    })
}

/// Rotates a refresh token.
///
/// Retries transparently on transient storage conflicts; a rejected token
/// revokes the whole session before the error is returned.
///
/// # Errors
/// `Unauthorised` for unknown/expired sessions and undecryptable tokens,
/// `TokenTheftDetected` for replayed tokens.
pub async fn refresh_session(
    ctx: &RuntimeContext,
    scope: &TenantScope,
    refresh_token: &str,
) -> SessionResult<SessionInformation> {
    let config = ctx.config_for(scope)?;
    let info = refresh_token::get_info_from_refresh_token(&config, refresh_token)?;

    let outcome = run_with_retry(
        || rotate_once(ctx, scope, &config, refresh_token, &info),
        |err| matches!(err, SessionError::Storage(inner) if inner.is_retryable()),
    )
    .await?;

    match outcome {
        RotationOutcome::Rotated(session) | RotationOutcome::RetrySameResult(session) => {
            Ok(*session)
        }
        RotationOutcome::Rejected {
            session_handle,
            user_id,
        } => {
            warn!(session_handle = %session_handle, "refresh token reuse detected, revoking session");
            ctx.storage()
                .delete_sessions(scope, &[session_handle.clone()])
                .await?;
            Err(SessionError::TokenTheftDetected {
                session_handle,
                user_id,
            })
        }
    }
}

/// One transactional rotation attempt; the compare-and-swap on the chain
/// head is guarded by the transaction's isolation.
async fn rotate_once(
    ctx: &RuntimeContext,
    scope: &TenantScope,
    config: &crate::config::CoreConfig,
    refresh_token: &str,
    info: &RefreshTokenInfo,
) -> SessionResult<RotationOutcome> {
    let now = ctx.now_millis();
    let incoming_hash = crypto::hash_sha256(refresh_token);

    let storage = ctx.storage();
    let mut tx = storage.begin(IsolationLevel::Serializable).await?;
    let Some(mut record) = tx.session_for_update(scope, &info.session_handle).await? else {
        return Err(SessionError::Unauthorised(
            "session missing in storage".to_string(),
        ));
    };
    if now >= record.expires_at_millis {
        return Err(SessionError::Unauthorised("session expired".to_string()));
    }

    if record.refresh_token_hash2 == incoming_hash {
        let successor = refresh_token::create_new_refresh_token(
            config,
            now,
            &record.session_handle,
            Some(refresh_token),
        )?;
        record.superseded = Some(SupersededToken {
            hash2: incoming_hash,
            successor_token: successor.token.clone(),
            successor_expires_at_millis: successor.expires_at_millis,
            rotated_at_millis: now,
        });
        record.refresh_token_hash2 = crypto::hash_sha256(&successor.token);
        record.expires_at_millis = now + config.refresh_token_validity_millis();
        tx.update_session(scope, record.clone()).await?;
        // Rotation is complete only once this commit lands; a canceled
        // request before here leaves the old head in place.
        tx.commit().await?;

        let session = build_session_information(ctx, scope, config, &record, successor).await?;
        return Ok(RotationOutcome::Rotated(Box::new(session)));
    }

    if let Some(superseded) = record.superseded.clone() {
        let in_grace = config.rotation_grace_millis() > 0
            && now < superseded.rotated_at_millis + config.rotation_grace_millis();
        if superseded.hash2 == incoming_hash && in_grace {
            tx.commit().await?;
            let successor = TokenInfo {
                token: superseded.successor_token,
                expires_at_millis: superseded.successor_expires_at_millis,
                created_at_millis: superseded.rotated_at_millis,
            };
            let session = build_session_information(ctx, scope, config, &record, successor).await?;
            return Ok(RotationOutcome::RetrySameResult(Box::new(session)));
        }
    }

    tx.commit().await?;
    Ok(RotationOutcome::Rejected {
        session_handle: record.session_handle,
        user_id: record.user_id,
    })
}

/// Mints the access token for a rotation result. Runs after the rotation
/// commit: the signing-key manager opens its own transaction.
async fn build_session_information(
    ctx: &RuntimeContext,
    scope: &TenantScope,
    config: &crate::config::CoreConfig,
    record: &SessionRecord,
    refresh: TokenInfo,
) -> SessionResult<SessionInformation> {
    let anti_csrf_token = config
        .anti_csrf_enabled()
        .then(|| Uuid::new_v4().to_string());

    let keys = SigningKeyManager::instance(ctx, scope)?;
    let signing_key = keys.current_key().await?;
    let access = access_token::create_new_access_token(
        &signing_key,
        config,
        ctx.now_millis(),
        &record.session_handle,
        &record.user_id,
        &record.user_data,
        anti_csrf_token.as_deref(),
    )?;

    Ok(SessionInformation {
        session_handle: record.session_handle.clone(),
        user_id: record.user_id.clone(),
        user_data: record.user_data.clone(),
        access_token: access,
        refresh_token: refresh,
        anti_csrf_token,
    })
}

/// Revokes sessions by handle, returning how many existed.
///
/// # Errors
/// Surfaces storage failures.
pub async fn revoke_sessions(
    ctx: &RuntimeContext,
    scope: &TenantScope,
    session_handles: &[String],
) -> SessionResult<u64> {
    Ok(ctx.storage().delete_sessions(scope, session_handles).await?)
}

/// Revokes every session belonging to `user_id`.
///
/// # Errors
/// Surfaces storage failures.
pub async fn revoke_all_sessions_for_user(
    ctx: &RuntimeContext,
    scope: &TenantScope,
    user_id: &str,
) -> SessionResult<u64> {
    let handles = ctx
        .storage()
        .session_handles_for_user(scope, user_id)
        .await?;
    if handles.is_empty() {
        return Ok(0);
    }
    Ok(ctx.storage().delete_sessions(scope, &handles).await?)
}

/// Handshake payload for SDK bootstrap.
///
/// # Errors
/// Surfaces storage and signing-key failures.
pub async fn handshake_info(
    ctx: &RuntimeContext,
    scope: &TenantScope,
) -> SessionResult<HandshakeInfo> {
    let config = ctx.config_for(scope)?;
    let keys = SigningKeyManager::instance(ctx, scope)?;
    let current = keys.current_key().await?;
    let supersede_time = keys.current_key_supersede_time().await?;

    Ok(HandshakeInfo {
        jwt_signing_public_key: current.public_key,
        jwt_signing_public_key_expiry_time: supersede_time,
        cookie_domain: config.cookie_domain().map(ToString::to_string),
        cookie_secure: config.cookie_secure(),
        access_token_path: config.access_token_path().to_string(),
        refresh_token_path: config.refresh_token_path().to_string(),
        enable_anti_csrf: config.anti_csrf_enabled(),
        access_token_blacklisting_enabled: config.access_token_blacklisting_enabled(),
    })
}

/// Registers a user and opens their first session.
///
/// The credential digest is opaque here; hashing policy lives in the recipe
/// layer.
///
/// # Errors
/// `DuplicateEmail` when the address is taken (including races — the unique
/// constraint decides), `InvalidEmail` for malformed addresses.
pub async fn sign_up(
    ctx: &RuntimeContext,
    scope: &TenantScope,
    email: &str,
    credential_digest: &str,
) -> SessionResult<(UserRecord, SessionInformation)> {
    let email = normalize_email(email);
    if !valid_email(&email) {
        return Err(SessionError::InvalidEmail);
    }

    let user = UserRecord {
        user_id: Uuid::new_v4().to_string(),
        email: email.clone(),
        credential_digest: credential_digest.to_string(),
        created_at_millis: ctx.now_millis(),
    };
    match ctx.storage().create_user(scope, user.clone()).await {
        Ok(()) => {}
        Err(StorageError::AlreadyExists { .. }) => return Err(SessionError::DuplicateEmail),
        Err(err) => return Err(err.into()),
    }

    let session =
        create_new_session(ctx, scope, &user.user_id, serde_json::json!({ "email": email }))
            .await?;
    Ok((user, session))
}

/// Verifies credentials and opens a session.
///
/// # Errors
/// `WrongCredentials` for unknown emails and digest mismatches alike.
pub async fn sign_in(
    ctx: &RuntimeContext,
    scope: &TenantScope,
    email: &str,
    credential_digest: &str,
) -> SessionResult<(UserRecord, SessionInformation)> {
    let email = normalize_email(email);
    let user = ctx
        .storage()
        .get_user_by_email(scope, &email)
        .await?
        .ok_or(SessionError::WrongCredentials)?;
    if user.credential_digest != credential_digest {
        return Err(SessionError::WrongCredentials);
    }

    let session =
        create_new_session(ctx, scope, &user.user_id, serde_json::json!({ "email": email }))
            .await?;
    Ok((user, session))
}

/// Deletes a user and revokes all their sessions.
///
/// # Errors
/// Surfaces storage failures.
pub async fn remove_user(
    ctx: &RuntimeContext,
    scope: &TenantScope,
    user_id: &str,
) -> SessionResult<bool> {
    revoke_all_sessions_for_user(ctx, scope, user_id).await?;
    Ok(ctx.storage().delete_user(scope, user_id).await?)
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn valid_email(email_normalized: &str) -> bool {
    regex::Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$")
        .is_ok_and(|regex| regex.is_match(email_normalized))
}
