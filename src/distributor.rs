//! Per-tenant singleton resource registry.
//!
//! Owns the mapping from `(scope, resource key)` to lazily built, type-erased
//! singletons: signing-key managers, per-app config, anything stateful that
//! must exist exactly once per scope. Readers take `Arc` snapshots; a tenant
//! reload swaps a scope's whole resource set in one critical section, so an
//! in-flight request keeps the snapshot it already holds and is never torn.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tracing::debug;

use crate::tenant::TenantScope;

/// Type-erased singleton handle.
pub type ResourceHandle = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Error)]
pub enum DistributorError {
    /// The scope was never provisioned, or holds no resource under the key.
    /// Distinguishable from transient failures: the tenant/app simply does
    /// not exist here.
    #[error("tenant or app not found: {scope}")]
    TenantOrAppNotFound {
        scope: String,
    },

    /// A resource exists under the key but is of a different type. Indicates
    /// two components disagree about a resource key.
    #[error("resource {key} for {scope} has an unexpected type")]
    ResourceTypeMismatch {
        scope: String,
        key: &'static str,
    },
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct ResourceKey {
    scope: TenantScope,
    key: &'static str,
}

#[derive(Default)]
struct Inner {
    scopes: HashSet<TenantScope>,
    resources: HashMap<ResourceKey, ResourceHandle>,
}

/// Registry of per-scope singletons. See the module docs for the contract.
#[derive(Default)]
pub struct ResourceDistributor {
    inner: RwLock<Inner>,
}

impl ResourceDistributor {
    /// Creates a distributor with the base scope already provisioned.
    #[must_use]
    pub fn new() -> Self {
        let distributor = Self::default();
        distributor.provision_scope(TenantScope::base());
        distributor
    }

    pub fn provision_scope(&self, scope: TenantScope) {
        let mut inner = self.write();
        inner.scopes.insert(scope);
    }

    #[must_use]
    pub fn is_provisioned(&self, scope: &TenantScope) -> bool {
        self.read().scopes.contains(scope)
    }

    #[must_use]
    pub fn scopes(&self) -> Vec<TenantScope> {
        self.read().scopes.iter().cloned().collect()
    }

    /// Replaces the provisioned scope set atomically.
    ///
    /// Resources of scopes that survive and are not listed in `changed` are
    /// carried over; everything else is dropped inside the same critical
    /// section, so no reader observes a half-replaced table.
    pub fn refresh_scopes(&self, scopes: Vec<TenantScope>, changed: &[TenantScope]) {
        let mut inner = self.write();
        let next: HashSet<TenantScope> = scopes.into_iter().collect();
        inner.resources.retain(|resource_key, _| {
            next.contains(&resource_key.scope) && !changed.contains(&resource_key.scope)
        });
        inner.scopes = next;
        debug!(scopes = inner.scopes.len(), "refreshed provisioned scopes");
    }

    /// Installs (or replaces) a resource for a provisioned scope.
    ///
    /// # Errors
    /// Fails when the scope is not provisioned.
    pub fn set_resource(
        &self,
        scope: &TenantScope,
        key: &'static str,
        resource: ResourceHandle,
    ) -> Result<(), DistributorError> {
        let mut inner = self.write();
        if !inner.scopes.contains(scope) {
            return Err(DistributorError::TenantOrAppNotFound {
                scope: scope.to_string(),
            });
        }
        inner
            .resources
            .insert(ResourceKey { scope: scope.clone(), key }, resource);
        Ok(())
    }

    /// Fetches the resource installed under `(scope, key)`.
    ///
    /// # Errors
    /// Fails with `TenantOrAppNotFound` when the scope is unknown or holds
    /// nothing under the key, and with `ResourceTypeMismatch` when the stored
    /// resource is not a `T`.
    pub fn get_resource<T: Send + Sync + 'static>(
        &self,
        scope: &TenantScope,
        key: &'static str,
    ) -> Result<Arc<T>, DistributorError> {
        let inner = self.read();
        let handle = inner
            .resources
            .get(&ResourceKey { scope: scope.clone(), key })
            .cloned()
            .ok_or_else(|| DistributorError::TenantOrAppNotFound {
                scope: scope.to_string(),
            })?;
        downcast(scope, key, handle)
    }

    /// Fetches the resource, constructing it with `init` on first access.
    ///
    /// Construction happens under the registry's write lock: concurrent first
    /// callers block until the winner has installed the instance, and then
    /// all observe that same instance.
    ///
    /// # Errors
    /// Fails when the scope is not provisioned or on a type mismatch.
    pub fn get_or_init_resource<T, F>(
        &self,
        scope: &TenantScope,
        key: &'static str,
        init: F,
    ) -> Result<Arc<T>, DistributorError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Arc<T>,
    {
        let mut inner = self.write();
        if !inner.scopes.contains(scope) {
            return Err(DistributorError::TenantOrAppNotFound {
                scope: scope.to_string(),
            });
        }
        let resource_key = ResourceKey { scope: scope.clone(), key };
        if let Some(handle) = inner.resources.get(&resource_key).cloned() {
            return downcast(scope, key, handle);
        }
        let resource = init();
        inner.resources.insert(resource_key, resource.clone());
        Ok(resource)
    }

    /// Removes the entry under `key` from every scope, leaving resources
    /// stored under other keys untouched.
    pub fn clear_all_resources_with_key(&self, key: &'static str) {
        let mut inner = self.write();
        inner.resources.retain(|resource_key, _| resource_key.key != key);
    }

    /// Drops every resource held for `scope`. The scope stays provisioned.
    pub fn clear_scope_resources(&self, scope: &TenantScope) {
        let mut inner = self.write();
        inner.resources.retain(|resource_key, _| &resource_key.scope != scope);
    }

    /// Snapshot of every scope's resource under `key`, for managers that
    /// rebuild their instances on tenant reload.
    #[must_use]
    pub fn resources_with_key(&self, key: &'static str) -> Vec<(TenantScope, ResourceHandle)> {
        self.read()
            .resources
            .iter()
            .filter(|(resource_key, _)| resource_key.key == key)
            .map(|(resource_key, handle)| (resource_key.scope.clone(), handle.clone()))
            .collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn downcast<T: Send + Sync + 'static>(
    scope: &TenantScope,
    key: &'static str,
    handle: ResourceHandle,
) -> Result<Arc<T>, DistributorError> {
    handle
        .downcast::<T>()
        .map_err(|_| DistributorError::ResourceTypeMismatch {
            scope: scope.to_string(),
            key,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const KEY_A: &str = "resource-a";
    const KEY_B: &str = "resource-b";

    fn tenant(id: &str) -> TenantScope {
        TenantScope::new("", "app1", id)
    }

    #[test]
    fn set_and_get_roundtrip() {
        let distributor = ResourceDistributor::new();
        let scope = TenantScope::base();

        distributor
            .set_resource(&scope, KEY_A, Arc::new(42_u32))
            .unwrap();
        let value: Arc<u32> = distributor.get_resource(&scope, KEY_A).unwrap();
        assert_eq!(*value, 42);
    }

    #[test]
    fn unknown_scope_is_distinguishable() {
        let distributor = ResourceDistributor::new();
        let scope = tenant("nope");

        let err = distributor
            .set_resource(&scope, KEY_A, Arc::new(1_u32))
            .unwrap_err();
        assert!(matches!(err, DistributorError::TenantOrAppNotFound { .. }));

        let err = distributor.get_resource::<u32>(&scope, KEY_A).unwrap_err();
        assert!(matches!(err, DistributorError::TenantOrAppNotFound { .. }));
    }

    #[test]
    fn type_mismatch_is_reported() {
        let distributor = ResourceDistributor::new();
        let scope = TenantScope::base();
        distributor
            .set_resource(&scope, KEY_A, Arc::new("text".to_string()))
            .unwrap();

        let err = distributor.get_resource::<u32>(&scope, KEY_A).unwrap_err();
        assert!(matches!(err, DistributorError::ResourceTypeMismatch { .. }));
    }

    #[test]
    fn construct_once_under_concurrent_first_access() {
        let distributor = Arc::new(ResourceDistributor::new());
        let scope = TenantScope::base();
        let constructions = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let distributor = Arc::clone(&distributor);
            let constructions = Arc::clone(&constructions);
            let scope = scope.clone();
            handles.push(std::thread::spawn(move || {
                let value: Arc<u64> = distributor
                    .get_or_init_resource(&scope, KEY_A, || {
                        constructions.fetch_add(1, Ordering::SeqCst);
                        Arc::new(7)
                    })
                    .unwrap();
                *value
            }));
        }

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 7);
        }
        assert_eq!(constructions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clear_by_key_leaves_other_keys_intact() {
        let distributor = ResourceDistributor::new();
        let t1 = tenant("t1");
        let t2 = tenant("t2");
        distributor.provision_scope(t1.clone());
        distributor.provision_scope(t2.clone());
        distributor.set_resource(&t1, KEY_A, Arc::new(1_u32)).unwrap();
        distributor.set_resource(&t2, KEY_A, Arc::new(2_u32)).unwrap();
        distributor.set_resource(&t1, KEY_B, Arc::new(3_u32)).unwrap();

        distributor.clear_all_resources_with_key(KEY_A);

        assert!(distributor.get_resource::<u32>(&t1, KEY_A).is_err());
        assert!(distributor.get_resource::<u32>(&t2, KEY_A).is_err());
        let survivor: Arc<u32> = distributor.get_resource(&t1, KEY_B).unwrap();
        assert_eq!(*survivor, 3);

        // Cleared entries can be re-installed.
        distributor.set_resource(&t1, KEY_A, Arc::new(9_u32)).unwrap();
        let value: Arc<u32> = distributor.get_resource(&t1, KEY_A).unwrap();
        assert_eq!(*value, 9);
    }

    #[test]
    fn clear_scope_drops_only_that_scope() {
        let distributor = ResourceDistributor::new();
        let t1 = tenant("t1");
        let t2 = tenant("t2");
        distributor.provision_scope(t1.clone());
        distributor.provision_scope(t2.clone());
        distributor.set_resource(&t1, KEY_A, Arc::new(1_u32)).unwrap();
        distributor.set_resource(&t2, KEY_A, Arc::new(2_u32)).unwrap();

        distributor.clear_scope_resources(&t1);

        assert!(distributor.get_resource::<u32>(&t1, KEY_A).is_err());
        assert!(distributor.is_provisioned(&t1));
        assert!(distributor.get_resource::<u32>(&t2, KEY_A).is_ok());
    }

    #[test]
    fn refresh_scopes_carries_over_unchanged_resources() {
        let distributor = ResourceDistributor::new();
        let keep = tenant("keep");
        let changed = tenant("changed");
        let removed = tenant("removed");
        for scope in [&keep, &changed, &removed] {
            distributor.provision_scope(scope.clone());
            distributor.set_resource(scope, KEY_A, Arc::new(1_u32)).unwrap();
        }

        distributor.refresh_scopes(
            vec![TenantScope::base(), keep.clone(), changed.clone()],
            &[changed.clone()],
        );

        assert!(distributor.get_resource::<u32>(&keep, KEY_A).is_ok());
        // Changed scope stays provisioned but starts from an empty set.
        assert!(distributor.get_resource::<u32>(&changed, KEY_A).is_err());
        assert!(distributor.is_provisioned(&changed));
        // Removed scope is fully deprovisioned.
        assert!(!distributor.is_provisioned(&removed));
        assert!(matches!(
            distributor.get_resource::<u32>(&removed, KEY_A),
            Err(DistributorError::TenantOrAppNotFound { .. })
        ));
    }
}
