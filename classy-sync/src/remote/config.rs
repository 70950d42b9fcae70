//! Remote client configuration types.
//!
//! These structures deserialize from the `[server]` and `[http]` tables of
//! the sync configuration file.

use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::{Result, SyncError};

/// Backend location and endpoint paths.
///
/// # Examples
///
/// ```toml
/// [server]
/// base_url = "https://us-central1-classy-taxi.cloudfunctions.net/"
///
/// [server.endpoints]
/// register_instance_id = "instanceId_register_v2"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Base URL every endpoint path is resolved against.
    pub base_url: String,

    /// Permit plain `http://` and loopback hosts. Local testing only.
    #[serde(default)]
    pub allow_insecure_http: bool,

    /// Endpoint path overrides.
    #[serde(default)]
    pub endpoints: EndpointConfig,
}

impl ServerConfig {
    /// Creates a server config with default endpoints.
    #[must_use]
    pub fn new<S: Into<String>>(base_url: S) -> Self {
        Self {
            base_url: base_url.into(),
            allow_insecure_http: false,
            endpoints: EndpointConfig::default(),
        }
    }

    /// Parses and checks the base URL.
    ///
    /// The returned URL always ends in `/` so relative endpoint paths join
    /// below it instead of replacing its last segment.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] if the URL is malformed, is not HTTPS, or
    /// points at a loopback host while `allow_insecure_http` is off.
    pub fn parsed_base_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| SyncError::Config(format!("invalid base_url: {e}")))?;

        if !self.allow_insecure_http {
            if url.scheme() != "https" {
                return Err(SyncError::Config("base_url must use HTTPS".to_owned()));
            }
            if let Some(host) = url.host_str()
                && (host == "localhost" || host == "127.0.0.1" || host == "::1" || host == "[::1]")
            {
                return Err(SyncError::Config("base_url must not be a loopback host".to_owned()));
            }
        } else if url.scheme() != "https" && url.scheme() != "http" {
            return Err(SyncError::Config("base_url must use HTTP or HTTPS".to_owned()));
        }

        if url.host_str().is_none() {
            return Err(SyncError::Config("base_url is missing a host".to_owned()));
        }
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(url)
    }

    /// Validates the base URL and every endpoint path.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        self.parsed_base_url()?;
        self.endpoints.validate()
    }
}

/// Paths of the backend operations, relative to the base URL.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EndpointConfig {
    /// `GET` basic content.
    pub content_basic: String,
    /// `GET` premium content.
    pub content_premium: String,
    /// `GET` subscription status list.
    pub subscription_status: String,
    /// `PUT` subscription registration.
    pub register_subscription: String,
    /// `PUT` subscription transfer.
    pub transfer_subscription: String,
    /// `PUT` instance id registration.
    pub register_instance_id: String,
    /// `PUT` instance id removal.
    pub unregister_instance_id: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            content_basic: "content_basic_v2".to_owned(),
            content_premium: "content_premium_v2".to_owned(),
            subscription_status: "subscription_status_v2".to_owned(),
            register_subscription: "subscription_register_v2".to_owned(),
            transfer_subscription: "subscription_transfer_v2".to_owned(),
            register_instance_id: "subscription_register_v2".to_owned(),
            unregister_instance_id: "instanceId_unregister_v2".to_owned(),
        }
    }
}

impl EndpointConfig {
    fn all(&self) -> [(&'static str, &str); 7] {
        [
            ("content_basic", self.content_basic.as_str()),
            ("content_premium", self.content_premium.as_str()),
            ("subscription_status", self.subscription_status.as_str()),
            ("register_subscription", self.register_subscription.as_str()),
            ("transfer_subscription", self.transfer_subscription.as_str()),
            ("register_instance_id", self.register_instance_id.as_str()),
            ("unregister_instance_id", self.unregister_instance_id.as_str()),
        ]
    }

    /// Rejects empty, absolute, or traversing paths.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] naming the offending endpoint.
    pub fn validate(&self) -> Result<()> {
        for (name, path) in self.all() {
            if path.is_empty() {
                return Err(SyncError::Config(format!("endpoint {name} cannot be empty")));
            }
            if path.starts_with('/') || path.contains("://") {
                return Err(SyncError::Config(format!(
                    "endpoint {name} must be relative to base_url"
                )));
            }
            if path.contains("..") || path.contains("//") {
                return Err(SyncError::Config(format!(
                    "endpoint {name} contains traversal sequences"
                )));
            }
            if path.chars().any(|c| c.is_control() || c.is_whitespace()) {
                return Err(SyncError::Config(format!(
                    "endpoint {name} contains invalid characters"
                )));
            }
        }
        Ok(())
    }
}

/// `[http]` table: reqwest client tuning.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HttpConfig {
    /// Idle pooled connections kept per backend host.
    pub pool_max_idle_per_host: usize,
    /// Whole-request deadline, in seconds (1..=300).
    pub timeout_secs: u64,
    /// TCP/TLS connect deadline, in seconds (1..=60).
    pub connect_timeout_secs: u64,
    /// Protocol selection.
    pub http_version: HttpVersion,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            pool_max_idle_per_host: 16,
            timeout_secs: 30,
            connect_timeout_secs: 10,
            http_version: HttpVersion::Auto,
        }
    }
}

impl HttpConfig {
    /// Checks both deadlines are in range.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] naming the out-of-range key.
    pub fn validate(&self) -> Result<()> {
        if !(1..=300).contains(&self.timeout_secs) {
            return Err(SyncError::Config("http.timeout_secs must be in 1..=300".to_owned()));
        }
        if !(1..=60).contains(&self.connect_timeout_secs) {
            return Err(SyncError::Config("http.connect_timeout_secs must be in 1..=60".to_owned()));
        }
        Ok(())
    }

    /// Request deadline.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Connect deadline.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Protocol used towards the backend.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HttpVersion {
    /// HTTP/1.1 only.
    Http1,
    /// HTTP/2 with prior knowledge.
    Http2,
    /// Whatever ALPN negotiates.
    #[default]
    Auto,
}
