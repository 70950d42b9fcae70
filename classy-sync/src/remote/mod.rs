//! Remote subscription-status client.
//!
//! [`RemoteStatusClient`] is the contract the reconciliation engine consumes.
//! The server is the source of truth for entitlement state; implementations
//! only move data and classify failures into [`SyncError`](crate::SyncError).
//!
//! # Examples
//!
//! ```rust,no_run
//! use classy_sync::{
//!     models::{AccountCredential, AccountId},
//!     remote::{HttpConfig, HttpStatusClient, RemoteStatusClient, ServerConfig},
//! };
//!
//! # async fn example() -> classy_sync::Result<()> {
//! let server = ServerConfig::new("https://backend.example.com/");
//! let client = HttpStatusClient::new(&server, &HttpConfig::default())?;
//!
//! let credential = AccountCredential::new(AccountId::new("uid-123")?, "id-token")?;
//! let statuses = client.fetch_subscription_status(&credential).await?;
//! println!("{} subscriptions", statuses.len());
//! # Ok(())
//! # }
//! ```

#[allow(
    redundant_imports,
    reason = "Future needed for RPITIT despite being in Edition 2024 prelude"
)]
use std::future::Future;

use crate::{
    error::Result,
    models::{AccountCredential, Ack, ContentResource, PurchaseEvent, SubscriptionStatusList},
};

pub mod config;
pub mod http;

pub use config::{EndpointConfig, HttpConfig, HttpVersion, ServerConfig};
pub use http::HttpStatusClient;

/// Network-facing subscription-status operations.
///
/// Every call carries the caller's credential; implementations attach it out
/// of band (an `Authorization` header for HTTP). Register and transfer are
/// idempotent per purchase token on the server side.
pub trait RemoteStatusClient: Send + Sync {
    /// Fetches every subscription record of the credential's account.
    ///
    /// # Errors
    ///
    /// Returns the classified failure.
    fn fetch_subscription_status<'a>(
        &'a self,
        credential: &'a AccountCredential,
    ) -> impl Future<Output = Result<SubscriptionStatusList>> + Send + 'a;

    /// Binds a purchase to the credential's account.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Conflict`](crate::SyncError::Conflict) when the
    /// token is already bound to another account.
    fn register_subscription<'a>(
        &'a self,
        credential: &'a AccountCredential,
        purchase: &'a PurchaseEvent,
    ) -> impl Future<Output = Result<SubscriptionStatusList>> + Send + 'a;

    /// Moves a purchase bound elsewhere onto the credential's account.
    ///
    /// # Errors
    ///
    /// Returns the classified failure.
    fn transfer_subscription<'a>(
        &'a self,
        credential: &'a AccountCredential,
        purchase: &'a PurchaseEvent,
    ) -> impl Future<Output = Result<SubscriptionStatusList>> + Send + 'a;

    /// Registers an app install for push routing.
    ///
    /// # Errors
    ///
    /// Returns the classified failure.
    fn register_instance_id<'a>(
        &'a self,
        credential: &'a AccountCredential,
        instance_id: &'a str,
    ) -> impl Future<Output = Result<Ack>> + Send + 'a;

    /// Removes an app install from push routing.
    ///
    /// # Errors
    ///
    /// Returns the classified failure.
    fn unregister_instance_id<'a>(
        &'a self,
        credential: &'a AccountCredential,
        instance_id: &'a str,
    ) -> impl Future<Output = Result<Ack>> + Send + 'a;

    /// Fetches the basic-tier content location.
    ///
    /// # Errors
    ///
    /// Returns the classified failure; the server answers
    /// [`SyncError::Unauthorized`](crate::SyncError::Unauthorized) without an
    /// entitlement.
    fn fetch_basic_content<'a>(
        &'a self,
        credential: &'a AccountCredential,
    ) -> impl Future<Output = Result<ContentResource>> + Send + 'a;

    /// Fetches the premium-tier content location.
    ///
    /// # Errors
    ///
    /// Returns the classified failure.
    fn fetch_premium_content<'a>(
        &'a self,
        credential: &'a AccountCredential,
    ) -> impl Future<Output = Result<ContentResource>> + Send + 'a;
}
