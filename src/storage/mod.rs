//! Storage capability contract the core is polymorphic over.
//!
//! Backends supply durable reads/writes plus transactions with
//! serializable-or-better isolation; the refresh-token rotation
//! compare-and-swap depends on that guarantee. A transaction dropped without
//! [`StorageTransaction::commit`] must roll back, on every exit path.
//!
//! Concrete SQL backends live out of tree; [`MemoryStorage`] ships here for
//! embedded use and tests.

mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::tenant::TenantScope;

pub use memory::MemoryStorage;

pub type StorageResult<T> = Result<T, StorageError>;

/// Errors surfaced by storage backends.
///
/// Backends map their internal failures onto these variants; the core never
/// sees driver-specific error types.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// Transaction conflict from concurrent modification. Retryable: the
    /// caller re-runs the whole transaction.
    #[error("transaction conflict")]
    Conflict,

    /// A unique constraint was violated. Not retryable; surfaced to the
    /// caller as a domain conflict.
    #[error("already exists: {key}")]
    AlreadyExists {
        key: String,
    },

    /// Failure to reach the backend. Retryable.
    #[error("connection error: {message}")]
    Connection {
        message: String,
    },

    /// Stored data could not be encoded or decoded.
    #[error("serialization error: {message}")]
    Serialization {
        message: String,
    },

    /// Backend-specific internal error.
    #[error("internal storage error: {message}")]
    Internal {
        message: String,
    },
}

impl StorageError {
    #[must_use]
    pub fn already_exists(key: impl Into<String>) -> Self {
        Self::AlreadyExists { key: key.into() }
    }

    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into() }
    }

    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into() }
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Whether re-running the failed transaction can succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict | Self::Connection { .. })
    }
}

/// Isolation requested at transaction start. Backends may upgrade but never
/// downgrade.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IsolationLevel {
    Serializable,
    RepeatableRead,
}

/// A refresh token superseded by rotation, kept reachable for the configured
/// grace window so a client retrying a lost response gets the same answer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SupersededToken {
    pub hash2: String,
    /// Wire form of the successor refresh token (ciphertext under the
    /// installation secret).
    pub successor_token: String,
    pub successor_expires_at_millis: u64,
    pub rotated_at_millis: u64,
}

/// Durable state for one logical session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_handle: String,
    pub user_id: String,
    pub user_data: serde_json::Value,
    /// Hash of the current refresh-token chain head.
    pub refresh_token_hash2: String,
    pub superseded: Option<SupersededToken>,
    pub created_at_millis: u64,
    pub expires_at_millis: u64,
}

/// One access-token signing key. Append-only: persisted keys are superseded,
/// never mutated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SigningKeyRecord {
    pub id: String,
    pub created_at_millis: u64,
    pub expires_at_millis: u64,
    /// Raw Ed25519 public key, base64url without padding.
    pub public_key: String,
    /// PKCS#8 PEM private key.
    pub private_key: String,
}

/// Account row backing sign-up/sign-in. The credential digest is opaque to
/// the core; hashing policy belongs to the recipe layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: String,
    pub email: String,
    pub credential_digest: String,
    pub created_at_millis: u64,
}

/// Capability set the core consumes. Sessions and users are tenant-scoped;
/// signing keys are app-scoped (backends normalize via
/// [`TenantScope::app_scope`]).
#[async_trait]
pub trait SessionStorage: Send + Sync {
    /// Begins a transaction. The handle rolls back if dropped uncommitted.
    async fn begin(&self, isolation: IsolationLevel) -> StorageResult<Box<dyn StorageTransaction>>;

    async fn get_session(
        &self,
        scope: &TenantScope,
        session_handle: &str,
    ) -> StorageResult<Option<SessionRecord>>;

    async fn create_session(&self, scope: &TenantScope, record: SessionRecord)
        -> StorageResult<()>;

    async fn session_handles_for_user(
        &self,
        scope: &TenantScope,
        user_id: &str,
    ) -> StorageResult<Vec<String>>;

    /// Returns how many sessions were actually removed.
    async fn delete_sessions(
        &self,
        scope: &TenantScope,
        session_handles: &[String],
    ) -> StorageResult<u64>;

    async fn get_signing_keys(&self, scope: &TenantScope) -> StorageResult<Vec<SigningKeyRecord>>;

    /// Fails with [`StorageError::AlreadyExists`] when the email is taken.
    async fn create_user(&self, scope: &TenantScope, user: UserRecord) -> StorageResult<()>;

    async fn get_user_by_email(
        &self,
        scope: &TenantScope,
        email: &str,
    ) -> StorageResult<Option<UserRecord>>;

    async fn delete_user(&self, scope: &TenantScope, user_id: &str) -> StorageResult<bool>;
}

/// Write handle for one transaction. All reads through the handle see the
/// transaction's own writes.
#[async_trait]
pub trait StorageTransaction: Send {
    async fn session_for_update(
        &mut self,
        scope: &TenantScope,
        session_handle: &str,
    ) -> StorageResult<Option<SessionRecord>>;

    async fn update_session(
        &mut self,
        scope: &TenantScope,
        record: SessionRecord,
    ) -> StorageResult<()>;

    async fn delete_sessions(
        &mut self,
        scope: &TenantScope,
        session_handles: &[String],
    ) -> StorageResult<u64>;

    async fn signing_keys_for_update(
        &mut self,
        scope: &TenantScope,
    ) -> StorageResult<Vec<SigningKeyRecord>>;

    /// Fails with [`StorageError::AlreadyExists`] on a duplicate key id, so
    /// concurrent rotation attempts converge on one winner.
    async fn insert_signing_key(
        &mut self,
        scope: &TenantScope,
        key: SigningKeyRecord,
    ) -> StorageResult<()>;

    async fn commit(self: Box<Self>) -> StorageResult<()>;
}

/// How many times callers re-run a transaction that failed with a retryable
/// error before giving up.
pub const TRANSACTION_RETRY_ATTEMPTS: u32 = 5;

/// Backoff before retry attempt `attempt` (1-based). Deterministic so tests
/// stay stable.
#[must_use]
pub fn retry_backoff(attempt: u32) -> std::time::Duration {
    std::time::Duration::from_millis(u64::from(attempt) * 20)
}

/// Re-runs `op` until it succeeds, a non-retryable error surfaces, or the
/// attempt budget is spent. `retryable` inspects the caller's error type,
/// since each layer wraps [`StorageError`] in its own taxonomy.
///
/// # Errors
/// Returns the last error once retries are exhausted or `retryable` says no.
pub async fn run_with_retry<T, E, F, Fut, P>(mut op: F, retryable: P) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if retryable(&err) && attempt < TRANSACTION_RETRY_ATTEMPTS => {
                debug!(attempt, "retrying storage operation");
                tokio::time::sleep(retry_backoff(attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_transient_failures_until_success() {
        let calls = AtomicU32::new(0);
        let result: StorageResult<u32> = run_with_retry(
            || {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(StorageError::Conflict)
                    } else {
                        Ok(7)
                    }
                }
            },
            StorageError::is_retryable,
        )
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_surface_immediately() {
        let calls = AtomicU32::new(0);
        let result: StorageResult<()> = run_with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StorageError::already_exists("k")) }
            },
            StorageError::is_retryable,
        )
        .await;

        assert!(matches!(result, Err(StorageError::AlreadyExists { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempt_budget_is_bounded() {
        let calls = AtomicU32::new(0);
        let result: StorageResult<()> = run_with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StorageError::Conflict) }
            },
            StorageError::is_retryable,
        )
        .await;

        assert!(matches!(result, Err(StorageError::Conflict)));
        assert_eq!(calls.load(Ordering::SeqCst), TRANSACTION_RETRY_ATTEMPTS);
    }
}
