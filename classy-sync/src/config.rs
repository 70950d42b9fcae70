//! Sync configuration loaded from TOML.
//!
//! # Examples
//!
//! ```
//! use classy_sync::config::{StoreKind, SyncConfig};
//!
//! let config = SyncConfig::from_toml(
//!     r#"
//!     [server]
//!     base_url = "https://us-central1-classy-taxi.cloudfunctions.net/"
//!
//!     [store]
//!     kind = "memory"
//!     "#,
//! )?;
//! assert_eq!(config.store.kind, StoreKind::Memory);
//! assert_eq!(config.refresh.interval_secs, 900);
//! # Ok::<(), classy_sync::SyncError>(())
//! ```

use std::{path::Path, path::PathBuf, sync::Arc, time::Duration};

use serde::Deserialize;

use crate::{
    error::{Result, SyncError},
    models::ProductCatalog,
    reliability::RetryConfig,
    remote::{HttpConfig, ServerConfig},
    store::{JsonFileStore, MemoryStore, SubscriptionStore},
};

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Backend location and endpoints.
    pub server: ServerConfig,
    /// HTTP client tuning.
    #[serde(default)]
    pub http: HttpConfig,
    /// Backoff for transient failures.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Periodic refresh.
    #[serde(default)]
    pub refresh: RefreshConfig,
    /// Local store backend.
    #[serde(default)]
    pub store: StoreConfig,
    /// Product ids of the content tiers.
    #[serde(default)]
    pub products: ProductCatalog,
}

impl SyncConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] if parsing or validation fails.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Self = toml::from_str(toml_str)
            .map_err(|e| SyncError::Config(format!("invalid TOML config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] if the file cannot be read or is invalid.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Validates every section.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.http.validate()?;
        self.retry.validate()?;
        self.refresh.validate()?;
        self.store.validate()?;
        if self.products.basic == self.products.premium {
            return Err(SyncError::Config(
                "products.basic and products.premium must differ".to_owned(),
            ));
        }
        Ok(())
    }
}

/// `[refresh]` table.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RefreshConfig {
    /// Seconds between periodic refreshes.
    pub interval_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self { interval_secs: 900 }
    }
}

impl RefreshConfig {
    /// Refresh interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.interval_secs < 10 || self.interval_secs > 86_400 {
            return Err(SyncError::Config(
                "refresh.interval_secs must be between 10 and 86400".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Store backend selector.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// Process-local, lost on exit.
    #[default]
    Memory,
    /// One JSON document per account under `path`.
    File,
}

/// `[store]` table.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    /// Backend.
    #[serde(default)]
    pub kind: StoreKind,
    /// Directory of the file store.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    fn validate(&self) -> Result<()> {
        if self.kind == StoreKind::File && self.path.as_ref().is_none_or(|p| p.as_os_str().is_empty())
        {
            return Err(SyncError::Config("store.path is required for the file store".to_owned()));
        }
        Ok(())
    }

    /// Opens the configured store.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] if the file store has no path, or
    /// [`SyncError::LocalStore`] if its directory cannot be created.
    pub fn open(&self) -> Result<Arc<dyn SubscriptionStore>> {
        match self.kind {
            StoreKind::Memory => Ok(Arc::new(MemoryStore::new())),
            StoreKind::File => {
                let path = self.path.as_ref().ok_or_else(|| {
                    SyncError::Config("store.path is required for the file store".to_owned())
                })?;
                Ok(Arc::new(JsonFileStore::open(path)?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::HttpVersion;

    const MINIMAL: &str = r#"
        [server]
        base_url = "https://backend.example.com/"
    "#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = SyncConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.http.timeout_secs, 30);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.refresh.interval(), Duration::from_secs(900));
        assert_eq!(config.store.kind, StoreKind::Memory);
        assert_eq!(config.products.basic.as_str(), "basic_subscription");
        assert_eq!(config.server.endpoints.subscription_status, "subscription_status_v2");
    }

    #[test]
    fn test_full_config() {
        let config = SyncConfig::from_toml(
            r#"
            [server]
            base_url = "https://backend.example.com/"

            [server.endpoints]
            register_instance_id = "instanceId_register_v2"

            [http]
            timeout_secs = 20
            http_version = "http2"

            [retry]
            max_attempts = 3
            initial_delay_ms = 250

            [refresh]
            interval_secs = 60

            [store]
            kind = "file"
            path = "/var/lib/classy-sync"

            [products]
            basic = "basic_monthly"
            premium = "premium_monthly"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.endpoints.register_instance_id, "instanceId_register_v2");
        assert_eq!(config.http.http_version, HttpVersion::Http2);
        assert_eq!(config.retry.policy().initial_delay, Duration::from_millis(250));
        assert_eq!(config.store.path.as_deref(), Some(Path::new("/var/lib/classy-sync")));
        assert_eq!(config.products.premium.as_str(), "premium_monthly");
    }

    #[test]
    fn test_missing_base_url_is_rejected() {
        assert!(matches!(SyncConfig::from_toml("[http]\ntimeout_secs = 5"), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let cases = [
            "[server]\nbase_url = \"http://backend.example.com/\"",
            "[server]\nbase_url = \"https://b.example.com/\"\n[http]\ntimeout_secs = 0",
            "[server]\nbase_url = \"https://b.example.com/\"\n[retry]\nmax_attempts = 0",
            "[server]\nbase_url = \"https://b.example.com/\"\n[refresh]\ninterval_secs = 1",
            "[server]\nbase_url = \"https://b.example.com/\"\n[store]\nkind = \"file\"",
            "[server]\nbase_url = \"https://b.example.com/\"\n[store]\nkind = \"sqlite\"",
            "[server]\nbase_url = \"https://b.example.com/\"\n[products]\nbasic = \"x\"\npremium = \"x\"",
        ];
        for case in cases {
            assert!(SyncConfig::from_toml(case).is_err(), "{case}");
        }
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = SyncConfig::from_file(&path).unwrap();
        assert_eq!(config.server.base_url, "https://backend.example.com/");
        assert!(SyncConfig::from_file(dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_open_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig { kind: StoreKind::File, path: Some(dir.path().join("store")) };
        let store = config.open().unwrap();
        let account = crate::models::AccountId::new("uid-1").unwrap();
        assert!(store.load(&account).unwrap().is_empty());
        assert!(dir.path().join("store").is_dir());
    }
}
