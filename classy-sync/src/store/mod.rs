//! Local subscription store.
//!
//! The store is the durable record of the last entitlements the server
//! confirmed for each account. It is deliberately synchronous: the engine
//! writes to it under a short lock after the network part of a pass has
//! finished, and reads must never wait on the network.
//!
//! Two implementations ship with the crate:
//!
//! - [`MemoryStore`]: process-local, for tests and short-lived agents
//! - [`JsonFileStore`]: one JSON document per account, replaced atomically

use std::{
    collections::{BTreeMap, HashMap},
    sync::RwLock,
};

use thiserror::Error;

use crate::models::{AccountId, SubscriptionId, SubscriptionStatus};

mod file;

pub use file::JsonFileStore;

/// Records for one account, keyed by subscription id.
pub type StoredRecords = BTreeMap<SubscriptionId, SubscriptionStatus>;

/// Errors raised by store implementations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Reading or writing the backing medium failed.
    #[error("store I/O failed: {0}")]
    Io(String),

    /// Stored data could not be encoded or decoded.
    #[error("store serialization failed: {0}")]
    Serialization(String),

    /// A writer panicked while holding the store lock.
    #[error("store lock poisoned")]
    Poisoned,
}

/// Durable key-value mapping from subscription id to status, scoped per account.
///
/// Implementations must make [`replace_all`](Self::replace_all) and
/// [`replace_many`](Self::replace_many) atomic: after a failure the previous
/// records for the account are still intact.
pub trait SubscriptionStore: Send + Sync {
    /// Returns the records stored for an account. Unknown accounts are empty.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backing medium cannot be read.
    fn load(&self, account: &AccountId) -> Result<StoredRecords, StoreError>;

    /// Replaces every record of an account in one step.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails; nothing is changed then.
    fn replace_all(&self, account: &AccountId, records: &StoredRecords) -> Result<(), StoreError>;

    /// Replaces the records for the given subscription ids in one step,
    /// leaving the other ids alone.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails; nothing is changed then.
    fn replace_many(&self, account: &AccountId, records: &StoredRecords) -> Result<(), StoreError>;

    /// Replaces the record for one subscription id, leaving the rest alone.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    fn replace_one(&self, account: &AccountId, record: &SubscriptionStatus) -> Result<(), StoreError> {
        let records = StoredRecords::from([(record.subscription_id.clone(), record.clone())]);
        self.replace_many(account, &records)
    }

    /// Removes every record of an account.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    fn clear(&self, account: &AccountId) -> Result<(), StoreError>;
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    accounts: RwLock<HashMap<AccountId, StoredRecords>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SubscriptionStore for MemoryStore {
    fn load(&self, account: &AccountId) -> Result<StoredRecords, StoreError> {
        let accounts = self.accounts.read().map_err(|_| StoreError::Poisoned)?;
        Ok(accounts.get(account).cloned().unwrap_or_default())
    }

    fn replace_all(&self, account: &AccountId, records: &StoredRecords) -> Result<(), StoreError> {
        let mut accounts = self.accounts.write().map_err(|_| StoreError::Poisoned)?;
        accounts.insert(account.clone(), records.clone());
        Ok(())
    }

    fn replace_many(&self, account: &AccountId, records: &StoredRecords) -> Result<(), StoreError> {
        let mut accounts = self.accounts.write().map_err(|_| StoreError::Poisoned)?;
        accounts
            .entry(account.clone())
            .or_default()
            .extend(records.iter().map(|(id, record)| (id.clone(), record.clone())));
        Ok(())
    }

    fn clear(&self, account: &AccountId) -> Result<(), StoreError> {
        let mut accounts = self.accounts.write().map_err(|_| StoreError::Poisoned)?;
        accounts.remove(account);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PurchaseEvent;

    fn record(sku: &str, token: &str, active: bool) -> SubscriptionStatus {
        let event = PurchaseEvent::new(sku, token, true).unwrap();
        let mut status = SubscriptionStatus::for_purchase(&event);
        status.is_entitlement_active = active;
        status
    }

    fn records(items: &[SubscriptionStatus]) -> StoredRecords {
        items.iter().map(|r| (r.subscription_id.clone(), r.clone())).collect()
    }

    #[test]
    fn test_memory_store_unknown_account_is_empty() {
        let store = MemoryStore::new();
        let account = AccountId::new("a").unwrap();
        assert!(store.load(&account).unwrap().is_empty());
    }

    #[test]
    fn test_memory_store_replace_all_overwrites() {
        let store = MemoryStore::new();
        let account = AccountId::new("a").unwrap();

        store
            .replace_all(&account, &records(&[record("basic", "t1", true), record("premium", "t2", true)]))
            .unwrap();
        store.replace_all(&account, &records(&[record("basic", "t3", false)])).unwrap();

        let loaded = store.load(&account).unwrap();
        assert_eq!(loaded.len(), 1);
        let basic = &loaded[&SubscriptionId::new("basic").unwrap()];
        assert_eq!(basic.purchase_token.as_str(), "t3");
        assert!(!basic.is_entitlement_active);
    }

    #[test]
    fn test_memory_store_replace_one_keeps_others() {
        let store = MemoryStore::new();
        let account = AccountId::new("a").unwrap();
        store
            .replace_all(&account, &records(&[record("basic", "t1", true), record("premium", "t2", true)]))
            .unwrap();

        store.replace_one(&account, &record("premium", "t9", false)).unwrap();

        let loaded = store.load(&account).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[&SubscriptionId::new("premium").unwrap()].purchase_token.as_str(), "t9");
        assert_eq!(loaded[&SubscriptionId::new("basic").unwrap()].purchase_token.as_str(), "t1");
    }

    #[test]
    fn test_memory_store_replace_many_merges() {
        let store = MemoryStore::new();
        let account = AccountId::new("a").unwrap();
        store
            .replace_all(&account, &records(&[record("basic", "t1", true), record("legacy", "t0", false)]))
            .unwrap();

        store
            .replace_many(&account, &records(&[record("basic", "t5", false), record("premium", "t6", true)]))
            .unwrap();

        let loaded = store.load(&account).unwrap();
        let tokens: Vec<&str> = loaded.values().map(|r| r.purchase_token.as_str()).collect();
        assert_eq!(tokens, vec!["t5", "t0", "t6"]);
    }

    #[test]
    fn test_memory_store_accounts_are_isolated() {
        let store = MemoryStore::new();
        let a = AccountId::new("a").unwrap();
        let b = AccountId::new("b").unwrap();
        store.replace_one(&a, &record("basic", "t1", true)).unwrap();

        assert!(store.load(&b).unwrap().is_empty());
        store.clear(&a).unwrap();
        assert!(store.load(&a).unwrap().is_empty());
    }
}
