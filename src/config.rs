//! Core configuration values, consumed as plain data.
//!
//! Parsing files is the caller's concern; this type just carries validated
//! values, built programmatically or deserialized from JSON. Renamed keys
//! keep their old spelling as serde aliases so existing deployments keep
//! working.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::crypto;

const DEFAULT_ACCESS_TOKEN_VALIDITY_MILLIS: u64 = 60 * 60 * 1000;
const DEFAULT_SIGNING_KEY_UPDATE_INTERVAL_MILLIS: u64 = 7 * 24 * 60 * 60 * 1000;
const DEFAULT_REFRESH_TOKEN_VALIDITY_MILLIS: u64 = 60 * 24 * 60 * 60 * 1000;

// A superseded signing key stays verifiable for the update interval plus this
// many access-token lifetimes, so tokens signed just before rotation outlive
// the rotation itself.
const SIGNING_KEY_VALIDITY_OVERLAP: u64 = 2;

/// License tier, which decides the refresh-token wire type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LicenseTier {
    #[default]
    Free,
    Paid,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("installation secret is not in <iterations>:<salt>:<key> form")]
    InvalidInstallationSecret,

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

/// Values every component of the core reads.
///
/// One instance exists per app scope, installed through the resource
/// distributor; replacing it on config reload swaps the whole scope
/// atomically.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    access_token_validity_millis: u64,

    // Renamed when static signing keys were split out; accept the old key.
    #[serde(alias = "access_token_signing_key_update_interval_millis")]
    access_token_dynamic_signing_key_update_interval_millis: u64,

    refresh_token_validity_millis: u64,

    /// Window after a rotation during which replaying the superseded token
    /// returns the already-issued successor instead of tripping theft
    /// detection. Zero disables the window.
    refresh_token_rotation_grace_millis: u64,

    enable_anti_csrf: bool,

    // Was "access_token_blacklisting" before the cookie settings rework.
    #[serde(alias = "access_token_blacklisting")]
    access_token_blacklisting_enabled: bool,

    cookie_domain: Option<String>,
    cookie_secure: bool,
    access_token_path: String,

    #[serde(alias = "refresh_api_path")]
    refresh_token_path: String,

    license_tier: LicenseTier,

    #[serde(skip)]
    installation_secret: SecretString,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            access_token_validity_millis: DEFAULT_ACCESS_TOKEN_VALIDITY_MILLIS,
            access_token_dynamic_signing_key_update_interval_millis:
                DEFAULT_SIGNING_KEY_UPDATE_INTERVAL_MILLIS,
            refresh_token_validity_millis: DEFAULT_REFRESH_TOKEN_VALIDITY_MILLIS,
            refresh_token_rotation_grace_millis: 0,
            enable_anti_csrf: false,
            access_token_blacklisting_enabled: false,
            cookie_domain: None,
            cookie_secure: false,
            access_token_path: "/".to_string(),
            refresh_token_path: "/session/refresh".to_string(),
            license_tier: LicenseTier::Free,
            installation_secret: SecretString::default(),
        }
    }
}

impl CoreConfig {
    #[must_use]
    pub fn new(installation_secret: SecretString) -> Self {
        Self {
            installation_secret,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_access_token_validity_millis(mut self, millis: u64) -> Self {
        self.access_token_validity_millis = millis;
        self
    }

    #[must_use]
    pub fn with_signing_key_update_interval_millis(mut self, millis: u64) -> Self {
        self.access_token_dynamic_signing_key_update_interval_millis = millis;
        self
    }

    #[must_use]
    pub fn with_refresh_token_validity_millis(mut self, millis: u64) -> Self {
        self.refresh_token_validity_millis = millis;
        self
    }

    #[must_use]
    pub fn with_rotation_grace_millis(mut self, millis: u64) -> Self {
        self.refresh_token_rotation_grace_millis = millis;
        self
    }

    #[must_use]
    pub fn with_anti_csrf(mut self, enabled: bool) -> Self {
        self.enable_anti_csrf = enabled;
        self
    }

    #[must_use]
    pub fn with_access_token_blacklisting(mut self, enabled: bool) -> Self {
        self.access_token_blacklisting_enabled = enabled;
        self
    }

    /// Derives cookie domain and the secure flag from the public API origin.
    #[must_use]
    pub fn with_api_origin(mut self, origin: &str) -> Self {
        if let Ok(url) = Url::parse(origin) {
            self.cookie_domain = url.host_str().map(ToString::to_string);
            self.cookie_secure = url.scheme() == "https";
        }
        self
    }

    #[must_use]
    pub fn with_license_tier(mut self, tier: LicenseTier) -> Self {
        self.license_tier = tier;
        self
    }

    #[must_use]
    pub fn with_installation_secret(mut self, secret: SecretString) -> Self {
        self.installation_secret = secret;
        self
    }

    /// # Errors
    /// Returns an error when the installation secret is malformed or a
    /// validity window is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !crypto::is_valid_installation_secret(self.installation_secret.expose_secret()) {
            return Err(ConfigError::InvalidInstallationSecret);
        }
        if self.access_token_validity_millis == 0 {
            return Err(ConfigError::ZeroDuration("access_token_validity_millis"));
        }
        if self.refresh_token_validity_millis == 0 {
            return Err(ConfigError::ZeroDuration("refresh_token_validity_millis"));
        }
        if self.access_token_dynamic_signing_key_update_interval_millis == 0 {
            return Err(ConfigError::ZeroDuration(
                "access_token_dynamic_signing_key_update_interval_millis",
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn access_token_validity_millis(&self) -> u64 {
        self.access_token_validity_millis
    }

    #[must_use]
    pub fn signing_key_update_interval_millis(&self) -> u64 {
        self.access_token_dynamic_signing_key_update_interval_millis
    }

    /// Total verification lifetime of a signing key from its creation.
    #[must_use]
    pub fn signing_key_validity_millis(&self) -> u64 {
        self.access_token_dynamic_signing_key_update_interval_millis
            + SIGNING_KEY_VALIDITY_OVERLAP * self.access_token_validity_millis
    }

    #[must_use]
    pub fn refresh_token_validity_millis(&self) -> u64 {
        self.refresh_token_validity_millis
    }

    #[must_use]
    pub fn rotation_grace_millis(&self) -> u64 {
        self.refresh_token_rotation_grace_millis
    }

    #[must_use]
    pub fn anti_csrf_enabled(&self) -> bool {
        self.enable_anti_csrf
    }

    #[must_use]
    pub fn access_token_blacklisting_enabled(&self) -> bool {
        self.access_token_blacklisting_enabled
    }

    #[must_use]
    pub fn cookie_domain(&self) -> Option<&str> {
        self.cookie_domain.as_deref()
    }

    #[must_use]
    pub fn cookie_secure(&self) -> bool {
        self.cookie_secure
    }

    #[must_use]
    pub fn access_token_path(&self) -> &str {
        &self.access_token_path
    }

    #[must_use]
    pub fn refresh_token_path(&self) -> &str {
        &self.refresh_token_path
    }

    #[must_use]
    pub fn license_tier(&self) -> LicenseTier {
        self.license_tier
    }

    #[must_use]
    pub fn installation_secret(&self) -> &SecretString {
        &self.installation_secret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> SecretString {
        SecretString::from(crypto::generate_installation_secret())
    }

    #[test]
    fn defaults_are_sane() {
        let config = CoreConfig::new(secret());
        assert_eq!(config.access_token_validity_millis(), 3_600_000);
        assert_eq!(config.refresh_token_path(), "/session/refresh");
        assert!(!config.anti_csrf_enabled());
        assert_eq!(config.license_tier(), LicenseTier::Free);
        config.validate().unwrap();
    }

    #[test]
    fn signing_key_validity_includes_overlap() {
        let config = CoreConfig::new(secret())
            .with_access_token_validity_millis(1_000)
            .with_signing_key_update_interval_millis(10_000);
        assert_eq!(config.signing_key_validity_millis(), 12_000);
    }

    #[test]
    fn api_origin_sets_cookie_fields() {
        let config = CoreConfig::new(secret()).with_api_origin("https://api.example.com/base");
        assert_eq!(config.cookie_domain(), Some("api.example.com"));
        assert!(config.cookie_secure());

        let plain = CoreConfig::new(secret()).with_api_origin("http://localhost:3567");
        assert!(!plain.cookie_secure());
    }

    #[test]
    fn validate_rejects_bad_secret_and_zero_windows() {
        let bad = CoreConfig::new(SecretString::from("not-a-secret"));
        assert!(matches!(
            bad.validate(),
            Err(ConfigError::InvalidInstallationSecret)
        ));

        let zero = CoreConfig::new(secret()).with_access_token_validity_millis(0);
        assert!(matches!(zero.validate(), Err(ConfigError::ZeroDuration(_))));
    }

    #[test]
    fn deserializes_with_legacy_key_names() {
        let json = r#"{
            "access_token_signing_key_update_interval_millis": 12345,
            "access_token_blacklisting": true,
            "refresh_api_path": "/auth/session/refresh"
        }"#;
        let config: CoreConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.signing_key_update_interval_millis(), 12_345);
        assert!(config.access_token_blacklisting_enabled());
        assert_eq!(config.refresh_token_path(), "/auth/session/refresh");
    }

    #[test]
    fn deserializes_with_current_key_names() {
        let json = r#"{
            "access_token_dynamic_signing_key_update_interval_millis": 999,
            "license_tier": "paid"
        }"#;
        let config: CoreConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.signing_key_update_interval_millis(), 999);
        assert_eq!(config.license_tier(), LicenseTier::Paid);
    }
}
