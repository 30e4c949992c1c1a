//! Dynamic access-token signing keys.
//!
//! One manager exists per app, installed through the resource distributor.
//! Keys are Ed25519; a new key is minted transactionally when none exists or
//! the newest key has outlived the configured update interval. Superseded
//! keys keep verifying tokens until their own expiry, so rotation never
//! invalidates in-flight access tokens.

use std::sync::Arc;

use base64ct::{Base64UrlUnpadded, Encoding};
use ed25519_dalek::pkcs8::EncodePrivateKey;
use pkcs8::LineEnding;
use rand::rngs::OsRng;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;
use ulid::Ulid;

use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::distributor::DistributorError;
use crate::runtime::RuntimeContext;
use crate::storage::{
    run_with_retry, IsolationLevel, SessionStorage, SigningKeyRecord, StorageError,
};
use crate::tenant::TenantScope;

/// Distributor key for per-app signing key managers.
pub const SIGNING_KEYS_RESOURCE_KEY: &str = "signing-keys";

pub type SigningKeyResult<T> = Result<T, SigningKeyError>;

#[derive(Debug, Error)]
pub enum SigningKeyError {
    /// Storage failed during read or rotation. Retryable variants were
    /// already retried; whatever arrives here is for the caller to surface.
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("key generation failed: {0}")]
    KeyGeneration(String),
}

/// One JSON Web Key, as published on the JWKS endpoint.
#[derive(Clone, Debug, Serialize, utoipa::ToSchema)]
pub struct Jwk {
    pub kty: String,
    pub crv: String,
    pub alg: String,
    #[serde(rename = "use")]
    pub key_use: String,
    pub kid: String,
    pub x: String,
}

#[derive(Clone, Debug, Serialize, utoipa::ToSchema)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

/// Per-app signing key lifecycle. See the module docs.
pub struct SigningKeyManager {
    app_scope: TenantScope,
    storage: Arc<dyn SessionStorage>,
    clock: Arc<dyn Clock>,
    config: Arc<CoreConfig>,
    /// Known keys, newest first. The lock also single-flights rotation:
    /// concurrent callers needing a new key queue behind one winner.
    cache: Mutex<Vec<SigningKeyRecord>>,
}

impl SigningKeyManager {
    /// Resolves the manager for `scope`'s app, constructing it on first use.
    ///
    /// # Errors
    /// Fails with a tenant-or-app-not-found condition for unknown scopes.
    pub fn instance(
        ctx: &RuntimeContext,
        scope: &TenantScope,
    ) -> Result<Arc<Self>, DistributorError> {
        let config = ctx.config_for(scope)?;
        let app_scope = scope.app_scope();
        let storage = ctx.storage();
        let clock = ctx.clock();
        ctx.distributor().get_or_init_resource(&app_scope, SIGNING_KEYS_RESOURCE_KEY, {
            let app_scope = app_scope.clone();
            move || {
                Arc::new(Self {
                    app_scope,
                    storage,
                    clock,
                    config,
                    cache: Mutex::new(Vec::new()),
                })
            }
        })
    }

    /// The key new access tokens are signed with.
    ///
    /// Creates and persists a key when none exists or the newest one has
    /// outlived the update interval; otherwise returns the existing current
    /// key. Never returns an expired or partially persisted key.
    ///
    /// # Errors
    /// Surfaces storage failures after bounded retry.
    pub async fn current_key(&self) -> SigningKeyResult<SigningKeyRecord> {
        let keys = self.usable_keys().await?;
        keys.into_iter()
            .next()
            .ok_or_else(|| SigningKeyError::KeyGeneration("no signable key after refresh".into()))
    }

    /// Every key still valid for verification, newest first.
    ///
    /// # Errors
    /// Surfaces storage failures after bounded retry.
    pub async fn all_valid_keys(&self) -> SigningKeyResult<Vec<SigningKeyRecord>> {
        self.usable_keys().await
    }

    /// Looks up a verification key by id among the currently valid set.
    ///
    /// # Errors
    /// Surfaces storage failures after bounded retry.
    pub async fn key_by_id(&self, kid: &str) -> SigningKeyResult<Option<SigningKeyRecord>> {
        Ok(self
            .all_valid_keys()
            .await?
            .into_iter()
            .find(|key| key.id == kid))
    }

    /// JWKS document for the currently valid keys.
    ///
    /// # Errors
    /// Surfaces storage failures after bounded retry.
    pub async fn jwks(&self) -> SigningKeyResult<Jwks> {
        let keys = self
            .all_valid_keys()
            .await?
            .into_iter()
            .map(|key| Jwk {
                kty: "OKP".to_string(),
                crv: "Ed25519".to_string(),
                alg: "EdDSA".to_string(),
                key_use: "sig".to_string(),
                kid: key.id,
                x: key.public_key,
            })
            .collect();
        Ok(Jwks { keys })
    }

    /// When the current key stops being used for new signatures.
    ///
    /// # Errors
    /// Surfaces storage failures after bounded retry.
    pub async fn current_key_supersede_time(&self) -> SigningKeyResult<u64> {
        let current = self.current_key().await?;
        Ok(current.created_at_millis + self.config.signing_key_update_interval_millis())
    }

    /// Returns the valid key set, rotating first when required.
    async fn usable_keys(&self) -> SigningKeyResult<Vec<SigningKeyRecord>> {
        let mut cache = self.cache.lock().await;
        let now = self.clock.now_millis();

        if !self.has_signable(&cache, now) {
            *cache = self.refresh_with_retry().await?;
        }

        let now = self.clock.now_millis();
        Ok(cache
            .iter()
            .filter(|key| key.expires_at_millis > now)
            .cloned()
            .collect())
    }

    fn has_signable(&self, keys: &[SigningKeyRecord], now: u64) -> bool {
        // Keys are newest-first; if the newest is past the update interval,
        // every older one is too.
        keys.first().is_some_and(|key| self.is_signable(key, now))
    }

    fn is_signable(&self, key: &SigningKeyRecord, now: u64) -> bool {
        key.expires_at_millis > now
            && now < key.created_at_millis + self.config.signing_key_update_interval_millis()
    }

    async fn refresh_with_retry(&self) -> SigningKeyResult<Vec<SigningKeyRecord>> {
        run_with_retry(
            || self.refresh_once(),
            |err| matches!(err, SigningKeyError::Storage(inner) if inner.is_retryable()),
        )
        .await
    }

    /// One transactional read-check-insert. A concurrent creator that wins
    /// the race turns our insert into a conflict, which the retry loop
    /// resolves by re-reading the winner's key.
    async fn refresh_once(&self) -> SigningKeyResult<Vec<SigningKeyRecord>> {
        let mut tx = self.storage.begin(IsolationLevel::Serializable).await?;
        let mut keys = tx.signing_keys_for_update(&self.app_scope).await?;
        keys.sort_by(|a, b| b.created_at_millis.cmp(&a.created_at_millis));

        let now = self.clock.now_millis();
        if !self.has_signable(&keys, now) {
            let key = self.generate_key(now)?;
            match tx.insert_signing_key(&self.app_scope, key.clone()).await {
                Ok(()) => {
                    info!(kid = %key.id, scope = %self.app_scope, "created signing key");
                    keys.insert(0, key);
                }
                Err(StorageError::AlreadyExists { .. }) => {
                    return Err(SigningKeyError::Storage(StorageError::Conflict));
                }
                Err(err) => return Err(err.into()),
            }
        }

        tx.commit().await?;
        Ok(keys)
    }

    fn generate_key(&self, now: u64) -> SigningKeyResult<SigningKeyRecord> {
        let signing = ed25519_dalek::SigningKey::generate(&mut OsRng);
        let private_key = signing
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|err| SigningKeyError::KeyGeneration(err.to_string()))?
            .to_string();
        let public_key = Base64UrlUnpadded::encode_string(signing.verifying_key().as_bytes());

        Ok(SigningKeyRecord {
            // ULIDs embed the creation timestamp, keeping ids ordered the
            // same way as created_at.
            id: Ulid::from_parts(now, rand::random()).to_string(),
            created_at_millis: now,
            expires_at_millis: now + self.config.signing_key_validity_millis(),
            public_key,
            private_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::crypto;
    use crate::storage::MemoryStorage;
    use futures::future::join_all;
    use secrecy::SecretString;
    use std::collections::HashSet;

    fn config(update_interval_millis: u64, access_validity_millis: u64) -> CoreConfig {
        CoreConfig::new(SecretString::from(crypto::generate_installation_secret()))
            .with_signing_key_update_interval_millis(update_interval_millis)
            .with_access_token_validity_millis(access_validity_millis)
    }

    fn manager(
        storage: &MemoryStorage,
        clock: &TestClock,
        config: CoreConfig,
    ) -> SigningKeyManager {
        SigningKeyManager {
            app_scope: TenantScope::base().app_scope(),
            storage: Arc::new(storage.clone()),
            clock: Arc::new(clock.clone()),
            config: Arc::new(config),
            cache: Mutex::new(Vec::new()),
        }
    }

    #[tokio::test]
    async fn first_access_creates_and_persists_a_key() {
        let storage = MemoryStorage::new();
        let clock = TestClock::new(10_000);
        let manager = manager(&storage, &clock, config(2_000, 1_000));

        let key = manager.current_key().await.unwrap();
        assert_eq!(key.created_at_millis, 10_000);
        assert_eq!(key.expires_at_millis, 10_000 + 2_000 + 2 * 1_000);

        let persisted = storage.get_signing_keys(&TenantScope::base()).await.unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].id, key.id);
    }

    #[tokio::test]
    async fn current_key_is_stable_inside_the_interval() {
        let storage = MemoryStorage::new();
        let clock = TestClock::new(0);
        let manager = manager(&storage, &clock, config(2_000, 1_000));

        let first = manager.current_key().await.unwrap();
        clock.set(1_000);
        let second = manager.current_key().await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn rotation_after_interval_keeps_old_key_valid() {
        let storage = MemoryStorage::new();
        let clock = TestClock::new(0);
        // interval 2s, access validity 1s -> each key verifiable for 4s
        let manager = manager(&storage, &clock, config(2_000, 1_000));

        let k0 = manager.current_key().await.unwrap();

        clock.set(3_000);
        let k1 = manager.current_key().await.unwrap();
        assert_ne!(k0.id, k1.id);

        let valid = manager.all_valid_keys().await.unwrap();
        let ids: Vec<&str> = valid.iter().map(|k| k.id.as_str()).collect();
        assert_eq!(ids, vec![k1.id.as_str(), k0.id.as_str()]);
    }

    #[tokio::test]
    async fn expired_keys_are_never_returned() {
        let storage = MemoryStorage::new();
        let clock = TestClock::new(0);
        let manager = manager(&storage, &clock, config(2_000, 1_000));

        let k0 = manager.current_key().await.unwrap();
        assert_eq!(k0.expires_at_millis, 4_000);

        // Expiry boundary is inclusive: at exactly expires_at the key is out.
        clock.set(4_000);
        let valid = manager.all_valid_keys().await.unwrap();
        assert!(valid.iter().all(|key| key.id != k0.id));
        assert!(valid.iter().all(|key| key.expires_at_millis > 4_000));
    }

    #[tokio::test]
    async fn all_valid_keys_include_latest_current_key() {
        let storage = MemoryStorage::new();
        let clock = TestClock::new(0);
        let manager = manager(&storage, &clock, config(2_000, 1_000));

        for step in 0..4_u64 {
            clock.set(step * 3_000);
            let current = manager.current_key().await.unwrap();
            let valid = manager.all_valid_keys().await.unwrap();
            assert!(valid.iter().any(|key| key.id == current.id));
        }
    }

    #[tokio::test]
    async fn concurrent_first_access_converges_on_one_key() {
        let storage = MemoryStorage::new();
        let clock = TestClock::new(50_000);
        let manager = Arc::new(manager(&storage, &clock, config(60_000, 1_000)));

        let tasks = (0..16).map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.current_key().await.unwrap().id })
        });
        let ids: HashSet<String> = join_all(tasks)
            .await
            .into_iter()
            .map(|result| result.unwrap())
            .collect();

        assert_eq!(ids.len(), 1);
        let persisted = storage.get_signing_keys(&TenantScope::base()).await.unwrap();
        assert_eq!(persisted.len(), 1);
    }

    #[tokio::test]
    async fn independent_managers_converge_through_storage() {
        let storage = MemoryStorage::new();
        let clock = TestClock::new(50_000);
        let a = manager(&storage, &clock, config(60_000, 1_000));
        let b = manager(&storage, &clock, config(60_000, 1_000));

        let (ka, kb) = tokio::join!(a.current_key(), b.current_key());
        assert_eq!(ka.unwrap().id, kb.unwrap().id);
        let persisted = storage.get_signing_keys(&TenantScope::base()).await.unwrap();
        assert_eq!(persisted.len(), 1);
    }

    #[tokio::test]
    async fn jwks_exposes_one_entry_per_valid_key() {
        let storage = MemoryStorage::new();
        let clock = TestClock::new(0);
        let manager = manager(&storage, &clock, config(2_000, 1_000));

        let k0 = manager.current_key().await.unwrap();
        clock.set(3_000);
        let k1 = manager.current_key().await.unwrap();

        let jwks = manager.jwks().await.unwrap();
        assert_eq!(jwks.keys.len(), 2);
        let first = &jwks.keys[0];
        assert_eq!(first.kty, "OKP");
        assert_eq!(first.crv, "Ed25519");
        assert_eq!(first.alg, "EdDSA");
        assert_eq!(first.key_use, "sig");
        assert_eq!(first.kid, k1.id);
        assert_eq!(first.x, k1.public_key);
        assert_eq!(jwks.keys[1].kid, k0.id);
    }

    #[tokio::test]
    async fn key_ids_order_like_creation_times() {
        let storage = MemoryStorage::new();
        let clock = TestClock::new(1_000);
        let manager = manager(&storage, &clock, config(2_000, 1_000));

        let k0 = manager.current_key().await.unwrap();
        clock.set(4_000);
        let k1 = manager.current_key().await.unwrap();
        assert!(k1.id > k0.id);
    }

    #[tokio::test]
    async fn key_by_id_finds_only_valid_keys() {
        let storage = MemoryStorage::new();
        let clock = TestClock::new(0);
        let manager = manager(&storage, &clock, config(2_000, 1_000));

        let k0 = manager.current_key().await.unwrap();
        assert!(manager.key_by_id(&k0.id).await.unwrap().is_some());
        assert!(manager.key_by_id("missing").await.unwrap().is_none());

        // Past its expiry the key disappears from lookup as well.
        clock.set(10_000);
        let _ = manager.current_key().await.unwrap();
        assert!(manager.key_by_id(&k0.id).await.unwrap().is_none());
    }
}
