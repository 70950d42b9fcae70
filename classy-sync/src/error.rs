//! Error types for subscription synchronization.
//!
//! Every fallible operation in this crate returns [`Result<T>`], whose error
//! type [`SyncError`] is the taxonomy the reconciliation engine reasons about.
//! Transport failures are classified at the client boundary, so a raw
//! [`reqwest::Error`] never escapes to presentation code.
//!
//! # Error Categories
//!
//! - **Transient** ([`SyncError::Network`]): retried with exponential backoff
//! - **Identity** ([`SyncError::Unauthorized`]): credential must be refreshed
//! - **Ownership** ([`SyncError::Conflict`]): purchase bound to another account,
//!   drives the register → transfer fallback
//! - **Permanent** ([`SyncError::ServerRejected`]): surfaced, never retried
//! - **Local** ([`SyncError::LocalStore`]): the pass is abandoned without writes
//!
//! # Examples
//!
//! ```
//! use classy_sync::error::SyncError;
//!
//! let error = SyncError::Network("connection reset".to_owned());
//! assert!(error.is_retryable());
//!
//! let error = SyncError::Conflict("token owned by another account".to_owned());
//! assert!(!error.is_retryable());
//! ```

use thiserror::Error;

use crate::store::StoreError;

/// Result type alias for synchronization operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur while synchronizing subscription state.
#[must_use = "errors should be handled, propagated, or explicitly panicked"]
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// Transient transport failure.
    ///
    /// Timeouts, refused connections, 5xx responses, 408 and 429 all land here.
    ///
    /// # Recovery
    ///
    /// Retried through the retry scheduler. Last-known-good state stays visible
    /// in the meantime.
    #[error("network failure: {0}")]
    Network(String),

    /// The account credential is invalid or expired.
    ///
    /// # Recovery
    ///
    /// The identity collaborator must refresh the credential. Nothing is retried
    /// until it does.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The purchase token is already bound to another account.
    ///
    /// # Recovery
    ///
    /// The engine follows a failed registration with a single transfer call.
    #[error("purchase conflict: {0}")]
    Conflict(String),

    /// The server permanently rejected the request.
    ///
    /// # Recovery
    ///
    /// None. Surfaced to the user as "subscription status unavailable".
    #[error("server rejected request (status {status}): {message}")]
    ServerRejected {
        /// HTTP status code, or 0 when the body could not be understood.
        status: u16,
        /// Server-provided or decode failure message.
        message: String,
    },

    /// The local subscription store failed.
    ///
    /// Fatal for the current reconciliation pass; no partial writes happen.
    #[error("local store failure: {0}")]
    LocalStore(#[from] StoreError),

    /// Configuration is missing or invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Caller-supplied input failed validation.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl SyncError {
    /// Returns `true` when retrying the same request may succeed.
    ///
    /// Only [`SyncError::Network`] is retryable. Conflicts are resolved by a
    /// transfer, not by repeating the registration.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// Returns `true` for failures that should not be retried and should be
    /// surfaced as a permanent "status unavailable" condition.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::ServerRejected { .. } | Self::InvalidInput(_) | Self::Config(_))
    }

    /// Short machine-readable label, used as a structured log field.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Unauthorized(_) => "unauthorized",
            Self::Conflict(_) => "conflict",
            Self::ServerRejected { .. } => "server_rejected",
            Self::LocalStore(_) => "local_store",
            Self::Config(_) => "config",
            Self::InvalidInput(_) => "invalid_input",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = SyncError::Network("timed out".to_owned());
        assert_eq!(error.to_string(), "network failure: timed out");
    }

    #[test]
    fn test_server_rejected_display() {
        let error = SyncError::ServerRejected { status: 400, message: "bad sku".to_owned() };
        assert_eq!(error.to_string(), "server rejected request (status 400): bad sku");
    }

    #[test]
    fn test_only_network_is_retryable() {
        assert!(SyncError::Network("reset".to_owned()).is_retryable());
        assert!(!SyncError::Unauthorized("expired".to_owned()).is_retryable());
        assert!(!SyncError::Conflict("owned".to_owned()).is_retryable());
        assert!(
            !SyncError::ServerRejected { status: 400, message: String::new() }.is_retryable()
        );
        assert!(!SyncError::Config("missing".to_owned()).is_retryable());
    }

    #[test]
    fn test_permanent_classification() {
        assert!(SyncError::ServerRejected { status: 422, message: String::new() }.is_permanent());
        assert!(!SyncError::Network("reset".to_owned()).is_permanent());
        assert!(!SyncError::Unauthorized("expired".to_owned()).is_permanent());
    }

    #[test]
    fn test_store_error_converts() {
        let error: SyncError = StoreError::Io("disk full".to_owned()).into();
        assert!(matches!(error, SyncError::LocalStore(_)));
        assert_eq!(error.kind(), "local_store");
    }
}
