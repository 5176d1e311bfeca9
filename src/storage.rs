//! Sled-backed key-value storage for settings, quota, cooldown and history.
//!
//! Values are stored as JSON under fixed keys. The summary cache lives in its
//! own tree so it can be scanned and evicted without touching the rest.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

/// Persisted user settings.
pub const KEY_SETTINGS: &str = "summary_settings";
/// Global cooldown deadline.
pub const KEY_COOLDOWN_UNTIL: &str = "cooldown_until";
/// Device quota and entitlement state.
pub const KEY_QUOTA_STATE: &str = "quota_state";
/// Model that produced the most recent fresh summary.
pub const KEY_LAST_MODEL: &str = "last_model_used";
/// Bounded summary history, newest first.
pub const KEY_HISTORY: &str = "summary_history";
/// License endpoint that answered most recently.
pub const KEY_LICENSE_PREFERRED: &str = "license_preferred_base";
/// Tree holding the summary cache entries.
pub const TREE_CACHE: &str = "summary_cache";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    DbError(#[from] sled::Error),
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Handle to a sled database. Cloning is cheap and shares the same database.
#[derive(Clone)]
pub struct Storage {
    db: sled::Db,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("entries", &self.db.len())
            .finish()
    }
}

impl Storage {
    /// Open or create storage at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Open a throwaway database that is removed when dropped.
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    /// Read and decode a JSON value.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        match self.db.get(key.as_bytes())? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// Encode and write a JSON value, flushing before returning.
    pub fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(value)?;
        self.db.insert(key.as_bytes(), bytes)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<bool, StorageError> {
        let existed = self.db.remove(key.as_bytes())?.is_some();
        self.db.flush()?;
        Ok(existed)
    }

    /// Open a named tree inside this database.
    pub fn tree(&self, name: &str) -> Result<sled::Tree, StorageError> {
        Ok(self.db.open_tree(name)?)
    }
}
