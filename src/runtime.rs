//! Process-wide runtime context.
//!
//! One `RuntimeContext` exists per server process and is threaded explicitly
//! through every entry point; there is no ambient global lookup. It owns the
//! resource distributor, the storage handle, and the clock, and installs each
//! app's `CoreConfig` as a distributor resource so tenant reloads replace
//! configuration atomically.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::clock::Clock;
use crate::config::{ConfigError, CoreConfig};
use crate::distributor::{DistributorError, ResourceDistributor};
use crate::storage::SessionStorage;
use crate::tenant::TenantScope;

/// Distributor key under which each app scope's config lives.
pub const CONFIG_RESOURCE_KEY: &str = "core-config";

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Distributor(#[from] DistributorError),
}

pub struct RuntimeContext {
    distributor: ResourceDistributor,
    storage: Arc<dyn SessionStorage>,
    clock: Arc<dyn Clock>,
}

impl RuntimeContext {
    /// Initializes the context with the base scope provisioned and
    /// `base_config` installed for it.
    ///
    /// # Errors
    /// Fails when `base_config` does not validate.
    pub fn new(
        storage: Arc<dyn SessionStorage>,
        base_config: CoreConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RuntimeError> {
        base_config.validate()?;
        let context = Self {
            distributor: ResourceDistributor::new(),
            storage,
            clock,
        };
        context
            .distributor
            .set_resource(&TenantScope::base(), CONFIG_RESOURCE_KEY, Arc::new(base_config))?;
        info!("runtime context initialized");
        Ok(context)
    }

    /// Provisions a tenant scope (and its app scope) and installs its config.
    ///
    /// # Errors
    /// Fails when the config does not validate.
    pub fn add_tenant(&self, scope: TenantScope, config: CoreConfig) -> Result<(), RuntimeError> {
        config.validate()?;
        let app_scope = scope.app_scope();
        self.distributor.provision_scope(scope);
        self.distributor.provision_scope(app_scope.clone());
        self.distributor
            .set_resource(&app_scope, CONFIG_RESOURCE_KEY, Arc::new(config))?;
        Ok(())
    }

    /// Atomically replaces the tenant set.
    ///
    /// Scopes listed in `changed` (and scopes that disappeared) lose all
    /// their resources; everything else is carried over, so unchanged
    /// tenants keep their existing singletons. In-flight requests keep
    /// whatever snapshots they already hold.
    ///
    /// # Errors
    /// Fails when any supplied config does not validate; in that case
    /// nothing is replaced.
    pub fn reload_tenants(
        &self,
        tenants: Vec<(TenantScope, CoreConfig)>,
        changed: &[TenantScope],
    ) -> Result<(), RuntimeError> {
        for (_, config) in &tenants {
            config.validate()?;
        }

        let mut scopes = vec![TenantScope::base()];
        for (scope, _) in &tenants {
            scopes.push(scope.clone());
            scopes.push(scope.app_scope());
        }
        self.distributor.refresh_scopes(scopes, changed);

        for (scope, config) in tenants {
            let app_scope = scope.app_scope();
            if self
                .distributor
                .get_resource::<CoreConfig>(&app_scope, CONFIG_RESOURCE_KEY)
                .is_err()
            {
                self.distributor
                    .set_resource(&app_scope, CONFIG_RESOURCE_KEY, Arc::new(config))?;
            }
        }
        Ok(())
    }

    /// Resolves the config governing `scope` (app granularity).
    ///
    /// # Errors
    /// Fails with a tenant-or-app-not-found condition for unknown scopes.
    pub fn config_for(&self, scope: &TenantScope) -> Result<Arc<CoreConfig>, DistributorError> {
        self.distributor
            .get_resource(&scope.app_scope(), CONFIG_RESOURCE_KEY)
    }

    #[must_use]
    pub fn distributor(&self) -> &ResourceDistributor {
        &self.distributor
    }

    #[must_use]
    pub fn storage(&self) -> Arc<dyn SessionStorage> {
        Arc::clone(&self.storage)
    }

    #[must_use]
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    #[must_use]
    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Drops every distributor resource. Called on shutdown so singletons
    /// release their handles deterministically.
    pub fn teardown(&self) {
        let scopes = self.distributor.scopes();
        for scope in scopes {
            self.distributor.clear_scope_resources(&scope);
        }
        info!("runtime context torn down");
    }
}
