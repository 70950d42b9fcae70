//! Classy Taxi subscription sync
//!
//! Reconciles subscription purchases observed on a device with the
//! entitlement state held by the Classy Taxi subscription-status backend,
//! across sign-in, sign-out, account switches, renewals and device
//! transfers. The server is the source of truth; this crate keeps a durable
//! local copy of what it last said and publishes a merged, read-only view.
//!
//! # Architecture
//!
//! ```text
//!  billing ──PurchaseEvent──┐          ┌──IdentityEvent── identity
//!                           ▼          ▼
//!                   ┌────────────────────────────┐
//!                   │ EventDispatcher (per acct) │◄── due retries
//!                   └─────────────┬──────────────┘
//!                                 ▼
//!   RemoteStatusClient ◄── ReconciliationEngine ──► SubscriptionStore
//!       (reqwest)                 │                   (memory / JSON)
//!                                 ▼
//!                  watch<SyncSnapshot> + broadcast<SyncNotice>
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use classy_sync::{
//!     config::SyncConfig,
//!     identity::IdentityEvent,
//!     models::{AccountCredential, AccountId, PurchaseEvent},
//!     runtime::SyncRuntime,
//! };
//!
//! # async fn example() -> classy_sync::Result<()> {
//! let config = SyncConfig::from_file("classy-sync.toml")?;
//! let runtime = SyncRuntime::from_config(&config, Some("install-42".to_owned()))?;
//!
//! let credential = AccountCredential::new(AccountId::new("uid-123")?, "id-token")?;
//! runtime.on_identity(IdentityEvent::SignedIn(credential)).await?;
//! runtime.on_purchase(PurchaseEvent::new("premium_subscription", "token-1", false)?).await?;
//!
//! let snapshot = runtime.subscribe().borrow().clone();
//! println!("{:?}", snapshot.entitled_tiers(&config.products));
//! # Ok(())
//! # }
//! ```
//!
//! # Module Organization
//!
//! - [`models`]: wire and domain types
//! - [`remote`]: the [`RemoteStatusClient`](remote::RemoteStatusClient) contract and its HTTP implementation
//! - [`store`]: the local subscription store
//! - [`engine`]: reconciliation, retry scheduling and event dispatch
//! - [`identity`]: sign-in / sign-out handling and instance-id registration
//! - [`reliability`]: exponential backoff
//! - [`config`]: TOML configuration
//! - [`runtime`]: component wiring
//! - [`error`]: the error taxonomy

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![allow(
    clippy::multiple_crate_versions,
    reason = "transitive dependencies from reqwest and wiremock"
)]

pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod models;
pub mod reliability;
pub mod remote;
pub mod runtime;
pub mod store;

pub use engine::{PassOutcome, ReconciliationEngine, SyncNotice, SyncSnapshot};
pub use error::{Result, SyncError};
