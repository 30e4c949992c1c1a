//! Tenant and app scoping for resources and stored data.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Sentinel app/tenant id for the base namespace.
pub const PUBLIC: &str = "public";

/// Identifies a resource namespace: connection domain, app, and tenant.
///
/// Sessions and users live at tenant granularity; signing keys and
/// configuration live at app granularity (see [`TenantScope::app_scope`]).
/// The value is immutable and only ever used as a lookup key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantScope {
    connection_uri_domain: String,
    app_id: String,
    tenant_id: String,
}

impl TenantScope {
    #[must_use]
    pub fn new(
        connection_uri_domain: impl Into<String>,
        app_id: impl Into<String>,
        tenant_id: impl Into<String>,
    ) -> Self {
        Self {
            connection_uri_domain: connection_uri_domain.into(),
            app_id: app_id.into(),
            tenant_id: tenant_id.into(),
        }
    }

    /// The base scope: empty connection domain, public app, public tenant.
    #[must_use]
    pub fn base() -> Self {
        Self::new("", PUBLIC, PUBLIC)
    }

    #[must_use]
    pub fn connection_uri_domain(&self) -> &str {
        &self.connection_uri_domain
    }

    #[must_use]
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    #[must_use]
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Drops the tenant component, keeping the app namespace.
    ///
    /// App-scoped state (signing keys, config) is shared by all tenants of an
    /// app, so lookups normalize through this before hitting storage.
    #[must_use]
    pub fn app_scope(&self) -> Self {
        Self::new(self.connection_uri_domain.clone(), self.app_id.clone(), PUBLIC)
    }

    #[must_use]
    pub fn is_base(&self) -> bool {
        self.connection_uri_domain.is_empty() && self.app_id == PUBLIC && self.tenant_id == PUBLIC
    }
}

impl fmt::Display for TenantScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}|{}|{})",
            self.connection_uri_domain, self.app_id, self.tenant_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_scope_uses_public_sentinels() {
        let scope = TenantScope::base();
        assert_eq!(scope.app_id(), PUBLIC);
        assert_eq!(scope.tenant_id(), PUBLIC);
        assert!(scope.is_base());
    }

    #[test]
    fn app_scope_drops_tenant() {
        let scope = TenantScope::new("customer.example.com", "app1", "tenant-a");
        let app = scope.app_scope();
        assert_eq!(app.app_id(), "app1");
        assert_eq!(app.tenant_id(), PUBLIC);
        assert_eq!(app.connection_uri_domain(), "customer.example.com");
        assert!(!app.is_base());
    }

    #[test]
    fn scopes_with_same_parts_are_equal_keys() {
        let a = TenantScope::new("d", "a", "t");
        let b = TenantScope::new("d", "a", "t");
        assert_eq!(a, b);
        assert_eq!(format!("{a}"), "(d|a|t)");
    }
}
