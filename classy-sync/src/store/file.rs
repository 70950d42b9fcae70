//! JSON file store.
//!
//! Each account gets one file under the store directory. Writes go to a
//! sibling temp file that is renamed over the target, so readers only ever
//! see a complete document.

use std::{
    fmt::Write as _,
    fs,
    io::{self, Write as _},
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{StoreError, StoredRecords, SubscriptionStore};
use crate::models::{AccountId, SubscriptionStatus};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountDocument {
    account_id: AccountId,
    subscriptions: Vec<SubscriptionStatus>,
}

/// Durable store keeping one JSON document per account.
#[derive(Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
    /// Serializes read-modify-write cycles of `replace_many`.
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Opens a store rooted at `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory cannot be created.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|e| StoreError::Io(format!("cannot create {}: {e}", dir.display())))?;
        Ok(Self { dir, write_lock: Mutex::new(()) })
    }

    /// Directory holding the account documents.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, account: &AccountId) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(account)))
    }

    fn read(&self, account: &AccountId) -> Result<StoredRecords, StoreError> {
        let path = self.path_for(account);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(StoredRecords::new()),
            Err(e) => return Err(StoreError::Io(format!("cannot read {}: {e}", path.display()))),
        };
        let document: AccountDocument = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Serialization(format!("{}: {e}", path.display())))?;
        Ok(document.subscriptions.into_iter().map(|s| (s.subscription_id.clone(), s)).collect())
    }

    fn write(&self, account: &AccountId, records: &StoredRecords) -> Result<(), StoreError> {
        let document = AccountDocument {
            account_id: account.clone(),
            subscriptions: records.values().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&document)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let path = self.path_for(account);
        let tmp = path.with_extension("json.tmp");
        let io_err = |e: io::Error| StoreError::Io(format!("cannot write {}: {e}", path.display()));

        let mut file = fs::File::create(&tmp).map_err(io_err)?;
        file.write_all(&bytes).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);
        fs::rename(&tmp, &path).map_err(io_err)?;

        debug!(account = %account, records = records.len(), "Wrote account document");
        Ok(())
    }
}

/// Maps an account id to a file-system safe, collision-free file stem.
fn file_stem(account: &AccountId) -> String {
    let mut stem = String::with_capacity(account.as_str().len());
    for byte in account.as_str().bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            stem.push(char::from(byte));
        } else {
            let _ = write!(stem, "%{byte:02X}");
        }
    }
    stem
}

impl SubscriptionStore for JsonFileStore {
    fn load(&self, account: &AccountId) -> Result<StoredRecords, StoreError> {
        self.read(account)
    }

    fn replace_all(&self, account: &AccountId, records: &StoredRecords) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
        self.write(account, records)
    }

    fn replace_many(&self, account: &AccountId, records: &StoredRecords) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut merged = self.read(account)?;
        merged.extend(records.iter().map(|(id, record)| (id.clone(), record.clone())));
        self.write(account, &merged)
    }

    fn clear(&self, account: &AccountId) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
        let path = self.path_for(account);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(format!("cannot remove {}: {e}", path.display()))),
        }
    }
}
