use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;

use crate::error::{CustodianError, Result};

pub const ACCOUNTS_TREE: &str = "accounts";
pub const AUDIT_TREE: &str = "audit";
pub const TASKS_TREE: &str = "tasks";
pub const DEFERRED_TREE: &str = "deferred";
pub const META_TREE: &str = "meta";

/// Explicit database handle. Cheap to clone; every store call receives one.
#[derive(Clone)]
pub struct Storage {
    db: sled::Db,
}

impl Storage {
    pub fn open(path: &str) -> Result<Self> {
        let db = sled::open(Path::new(path))?;
        Ok(Storage { db })
    }

    /// In-memory database removed on drop.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Storage { db })
    }

    fn tree(&self, name: &str) -> Result<sled::Tree> {
        Ok(self.db.open_tree(name)?)
    }

    // Generic Helper: Put (bincode)
    pub fn put<T: Serialize>(&self, tree: &str, key: &str, value: &T) -> Result<()> {
        let serialized = bincode::serialize(value)
            .map_err(|e| CustodianError::SerializationError(e.to_string()))?;
        self.tree(tree)?.insert(key.as_bytes(), serialized)?;
        Ok(())
    }

    // Generic Helper: Get (bincode)
    pub fn get<T: DeserializeOwned>(&self, tree: &str, key: &str) -> Result<Option<T>> {
        match self.tree(tree)?.get(key.as_bytes())? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    pub fn values<T: DeserializeOwned>(&self, tree: &str) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for item in self.tree(tree)?.iter() {
            let (_, data) = item?;
            out.push(bincode::deserialize(&data)?);
        }
        Ok(out)
    }

    // Records carrying free-form JSON detail are stored as JSON; bincode cannot
    // round-trip serde_json::Value.
    pub fn put_json<T: Serialize>(&self, tree: &str, key: &str, value: &T) -> Result<()> {
        let serialized = serde_json::to_vec(value)?;
        self.tree(tree)?.insert(key.as_bytes(), serialized)?;
        Ok(())
    }

    pub fn get_json<T: DeserializeOwned>(&self, tree: &str, key: &str) -> Result<Option<T>> {
        match self.tree(tree)?.get(key.as_bytes())? {
            Some(data) => serde_json::from_slice(&data)
                .map(Some)
                .map_err(|e| CustodianError::DeserializationError(e.to_string())),
            None => Ok(None),
        }
    }

    pub fn scan_json<T: DeserializeOwned>(&self, tree: &str, prefix: &str) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for item in self.tree(tree)?.scan_prefix(prefix.as_bytes()) {
            let (_, data) = item?;
            out.push(
                serde_json::from_slice(&data)
                    .map_err(|e| CustodianError::DeserializationError(e.to_string()))?,
            );
        }
        Ok(out)
    }

    pub fn remove(&self, tree: &str, key: &str) -> Result<bool> {
        Ok(self.tree(tree)?.remove(key.as_bytes())?.is_some())
    }

    /// Monotonic id, unique for the lifetime of the database.
    pub fn next_id(&self) -> Result<u64> {
        Ok(self.db.generate_id()?)
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
