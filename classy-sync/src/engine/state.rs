//! Published engine state: per-subscription entries, snapshots and notices.

use std::{collections::BTreeMap, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::scheduler::RetryTask;
use crate::{
    error::SyncError,
    models::{
        AccountId, ContentTier, ProductCatalog, PurchaseEvent, PurchaseToken, SubscriptionId,
        SubscriptionStatus,
    },
};

/// Reconciliation state of one subscription id.
///
/// `Unknown` is never stored in a snapshot; it is what
/// [`SyncSnapshot::state_of`] reports for ids without an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// No record for the id under the current identity.
    Unknown,
    /// A local purchase awaits server confirmation. Memory only.
    Pending,
    /// The server reports the entitlement active.
    Active,
    /// The server reports the entitlement inactive, or stopped reporting it.
    Expired,
    /// The purchase is owned by another account.
    Transferred,
}

impl EntryState {
    /// Derives the state the server reports for `account`.
    #[must_use]
    pub fn of(status: &SubscriptionStatus, account: &AccountId) -> Self {
        if status.is_owned_elsewhere(account) {
            Self::Transferred
        } else if status.is_entitlement_active {
            Self::Active
        } else {
            Self::Expired
        }
    }
}

/// One subscription id in the merged view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedEntry {
    /// Current state.
    pub state: EntryState,
    /// Token of the purchase the entry tracks.
    pub purchase_token: PurchaseToken,
    /// Last record the server sent for the id. `None` while pending.
    pub status: Option<SubscriptionStatus>,
}

impl TrackedEntry {
    /// Entry confirmed by the server.
    #[must_use]
    pub fn confirmed(status: SubscriptionStatus, account: &AccountId) -> Self {
        Self {
            state: EntryState::of(&status, account),
            purchase_token: status.purchase_token.clone(),
            status: Some(status),
        }
    }

    /// Entry for a purchase the server has not confirmed yet.
    #[must_use]
    pub fn pending(event: &PurchaseEvent) -> Self {
        Self { state: EntryState::Pending, purchase_token: event.purchase_token.clone(), status: None }
    }

    /// Marker for a previously active id the server no longer reports.
    #[must_use]
    pub fn expired(mut self) -> Self {
        self.state = EntryState::Expired;
        self
    }
}

/// How current the published view is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    /// Nothing fetched yet for the current identity.
    #[default]
    Unknown,
    /// Matches the last successful server response.
    Fresh,
    /// Last-known-good data; the latest attempt failed or has not run.
    Stale,
    /// The server permanently rejected the latest refresh.
    Unavailable,
}

/// Read-only merged view published to presentation layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    /// Signed-in account, `None` when signed out.
    pub account: Option<AccountId>,
    /// Entries keyed by subscription id.
    pub entries: BTreeMap<SubscriptionId, TrackedEntry>,
    /// Freshness of `entries`.
    pub availability: Availability,
    /// Time of the last successful refresh.
    pub last_refreshed: Option<DateTime<Utc>>,
    /// Time this snapshot was published.
    pub published_at: DateTime<Utc>,
}

impl SyncSnapshot {
    /// View of a signed-out device.
    #[must_use]
    pub fn signed_out() -> Self {
        Self::empty(None)
    }

    /// Empty view for an account whose status has not been fetched.
    #[must_use]
    pub fn empty(account: Option<AccountId>) -> Self {
        Self {
            account,
            entries: BTreeMap::new(),
            availability: Availability::Unknown,
            last_refreshed: None,
            published_at: Utc::now(),
        }
    }

    /// State of a subscription id.
    #[must_use]
    pub fn state_of(&self, id: &SubscriptionId) -> EntryState {
        self.entries.get(id).map_or(EntryState::Unknown, |entry| entry.state)
    }

    /// Content tiers unlocked by active entries.
    #[must_use]
    pub fn entitled_tiers(&self, products: &ProductCatalog) -> Vec<ContentTier> {
        let active: Vec<&SubscriptionStatus> = self
            .entries
            .values()
            .filter(|entry| entry.state == EntryState::Active)
            .filter_map(|entry| entry.status.as_ref())
            .collect();

        let mut tiers = Vec::new();
        if active.iter().any(|status| status.is_basic(products)) {
            tiers.push(ContentTier::Basic);
        }
        if active.iter().any(|status| status.is_premium(products)) {
            tiers.push(ContentTier::Premium);
        }
        tiers
    }

    /// Returns `true` if any active entry is in grace period or account hold.
    #[must_use]
    pub fn needs_attention(&self) -> bool {
        self.entries.values().any(|entry| {
            entry.state == EntryState::Active
                && entry.status.as_ref().is_some_and(SubscriptionStatus::needs_attention)
        })
    }
}

/// Out-of-band conditions for collaborators.
#[derive(Debug, Clone)]
pub enum SyncNotice {
    /// The credential was rejected; the identity collaborator must refresh it.
    IdentityRefreshRequired {
        /// Account whose credential failed.
        account: AccountId,
    },
    /// A response held several records for one subscription id.
    AmbiguousStatus {
        /// Account of the response.
        account: AccountId,
        /// Duplicated id.
        subscription_id: SubscriptionId,
        /// Number of records for the id.
        candidates: usize,
        /// Token of the record that was kept.
        chosen: PurchaseToken,
    },
    /// An operation failed without a retry.
    OperationFailed {
        /// Account of the operation.
        account: AccountId,
        /// Operation label.
        operation: &'static str,
        /// Classified failure.
        error: SyncError,
    },
    /// A transient failure was handed to the retry scheduler.
    RetryScheduled {
        /// Account of the operation.
        account: AccountId,
        /// Task that will be retried.
        task: RetryTask,
        /// Failed attempts so far.
        attempt: u32,
        /// Backoff before the retry runs.
        delay: Duration,
    },
}
