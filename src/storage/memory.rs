//! Embedded in-memory storage backend.
//!
//! Transactions clone the shared state, mutate the clone, and publish it on
//! commit while still holding the state lock. One transaction runs at a time,
//! which gives serializable isolation for free; dropping the handle without
//! committing discards the clone, which is the rollback.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::tenant::TenantScope;

use super::{
    IsolationLevel, SessionRecord, SessionStorage, SigningKeyRecord, StorageError,
    StorageResult, StorageTransaction, UserRecord,
};

type ScopedKey = (TenantScope, String);

#[derive(Clone, Debug, Default)]
struct MemoryState {
    sessions: HashMap<ScopedKey, SessionRecord>,
    signing_keys: HashMap<TenantScope, Vec<SigningKeyRecord>>,
    users: HashMap<ScopedKey, UserRecord>,
}

impl MemoryState {
    fn delete_sessions(&mut self, scope: &TenantScope, handles: &[String]) -> u64 {
        let mut removed = 0;
        for handle in handles {
            if self
                .sessions
                .remove(&(scope.clone(), handle.clone()))
                .is_some()
            {
                removed += 1;
            }
        }
        removed
    }

    fn signing_keys(&self, scope: &TenantScope) -> Vec<SigningKeyRecord> {
        self.signing_keys
            .get(&scope.app_scope())
            .cloned()
            .unwrap_or_default()
    }
}

/// In-memory [`SessionStorage`] implementation.
///
/// Clones share the same state, so a clone handed to another component
/// observes all writes.
#[derive(Clone, Debug, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStorage for MemoryStorage {
    async fn begin(
        &self,
        _isolation: IsolationLevel,
    ) -> StorageResult<Box<dyn StorageTransaction>> {
        // Holding the guard for the transaction's lifetime serializes all
        // transactions, which satisfies any requested isolation level.
        let guard = Arc::clone(&self.state).lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTransaction { guard, working }))
    }

    async fn get_session(
        &self,
        scope: &TenantScope,
        session_handle: &str,
    ) -> StorageResult<Option<SessionRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .sessions
            .get(&(scope.clone(), session_handle.to_string()))
            .cloned())
    }

    async fn create_session(
        &self,
        scope: &TenantScope,
        record: SessionRecord,
    ) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        let key = (scope.clone(), record.session_handle.clone());
        if state.sessions.contains_key(&key) {
            return Err(StorageError::already_exists(record.session_handle));
        }
        state.sessions.insert(key, record);
        Ok(())
    }

    async fn session_handles_for_user(
        &self,
        scope: &TenantScope,
        user_id: &str,
    ) -> StorageResult<Vec<String>> {
        let state = self.state.lock().await;
        Ok(state
            .sessions
            .iter()
            .filter(|((record_scope, _), record)| {
                record_scope == scope && record.user_id == user_id
            })
            .map(|((_, handle), _)| handle.clone())
            .collect())
    }

    async fn delete_sessions(
        &self,
        scope: &TenantScope,
        session_handles: &[String],
    ) -> StorageResult<u64> {
        let mut state = self.state.lock().await;
        Ok(state.delete_sessions(scope, session_handles))
    }

    async fn get_signing_keys(&self, scope: &TenantScope) -> StorageResult<Vec<SigningKeyRecord>> {
        let state = self.state.lock().await;
        Ok(state.signing_keys(scope))
    }

    async fn create_user(&self, scope: &TenantScope, user: UserRecord) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        let key = (scope.clone(), user.email.clone());
        if state.users.contains_key(&key) {
            return Err(StorageError::already_exists(user.email));
        }
        state.users.insert(key, user);
        Ok(())
    }

    async fn get_user_by_email(
        &self,
        scope: &TenantScope,
        email: &str,
    ) -> StorageResult<Option<UserRecord>> {
        let state = self.state.lock().await;
        Ok(state.users.get(&(scope.clone(), email.to_string())).cloned())
    }

    async fn delete_user(&self, scope: &TenantScope, user_id: &str) -> StorageResult<bool> {
        let mut state = self.state.lock().await;
        let key = state
            .users
            .iter()
            .find(|((record_scope, _), user)| record_scope == scope && user.user_id == user_id)
            .map(|(key, _)| key.clone());
        match key {
            Some(key) => {
                state.users.remove(&key);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

#[async_trait]
impl StorageTransaction for MemoryTransaction {
    async fn session_for_update(
        &mut self,
        scope: &TenantScope,
        session_handle: &str,
    ) -> StorageResult<Option<SessionRecord>> {
        Ok(self
            .working
            .sessions
            .get(&(scope.clone(), session_handle.to_string()))
            .cloned())
    }

    async fn update_session(
        &mut self,
        scope: &TenantScope,
        record: SessionRecord,
    ) -> StorageResult<()> {
        self.working
            .sessions
            .insert((scope.clone(), record.session_handle.clone()), record);
        Ok(())
    }

    async fn delete_sessions(
        &mut self,
        scope: &TenantScope,
        session_handles: &[String],
    ) -> StorageResult<u64> {
        Ok(self.working.delete_sessions(scope, session_handles))
    }

    async fn signing_keys_for_update(
        &mut self,
        scope: &TenantScope,
    ) -> StorageResult<Vec<SigningKeyRecord>> {
        Ok(self.working.signing_keys(scope))
    }

    async fn insert_signing_key(
        &mut self,
        scope: &TenantScope,
        key: SigningKeyRecord,
    ) -> StorageResult<()> {
        let keys = self
            .working
            .signing_keys
            .entry(scope.app_scope())
            .or_default();
        if keys.iter().any(|existing| existing.id == key.id) {
            return Err(StorageError::already_exists(key.id));
        }
        keys.push(key);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        let MemoryTransaction { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }
}
