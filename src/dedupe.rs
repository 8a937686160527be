//! Idempotency record storage

use crate::{IdempotencyKey, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Execution status of a guarded operation
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
pub enum IdempotencyStatus {
    /// Reserved, effect not confirmed yet
    InProgress,
    /// Effect done, result stored
    Completed,
    /// Effect rejected; the key may be reused
    Failed,
}

/// One reserved logical operation
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
pub struct IdempotencyRecord {
    /// Idempotency key
    pub key: String,
    /// Operation the key was reserved for
    pub operation: String,
    /// Where the operation stands
    pub status: IdempotencyStatus,
    /// Encoded result once completed
    pub result: Option<Vec<u8>>,
    /// Reservation time
    pub created_at_millis: u64,
}

/// Durable keyed store for idempotency records.
///
/// Every method must be atomic with respect to the others for the same key.
pub trait IdempotencyStore: Send + Sync + 'static {
    /// Insert if no record exists under the key. Returns whether it was inserted.
    fn insert_if_absent(&self, record: IdempotencyRecord) -> Result<bool, StoreError>;

    /// Fetch the record under `key`
    fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Delete the record only if it is still the one created at `created_at_millis`
    fn remove_if_created_at(
        &self,
        key: &IdempotencyKey,
        created_at_millis: u64,
    ) -> Result<bool, StoreError>;

    /// Move an in-progress record to `status`. Returns false if the record
    /// is missing or already final.
    fn finalize(
        &self,
        key: &IdempotencyKey,
        status: IdempotencyStatus,
        result: Option<Vec<u8>>,
    ) -> Result<bool, StoreError>;

    /// Delete records created before `cutoff_millis`. Returns how many went.
    fn purge_older_than(&self, cutoff_millis: u64) -> Result<usize, StoreError>;
}

/// In-memory idempotency store
pub struct InMemoryIdempotencyStore {
    data: RwLock<HashMap<String, IdempotencyRecord>>,
}

impl InMemoryIdempotencyStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    /// Check if no records are held
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IdempotencyStore for InMemoryIdempotencyStore {
    fn insert_if_absent(&self, record: IdempotencyRecord) -> Result<bool, StoreError> {
        let mut data = self.data.write().map_err(StoreError::poisoned)?;
        if data.contains_key(&record.key) {
            return Ok(false);
        }
        data.insert(record.key.clone(), record);
        Ok(true)
    }

    fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, StoreError> {
        let data = self.data.read().map_err(StoreError::poisoned)?;
        Ok(data.get(key.as_str()).cloned())
    }

    fn remove_if_created_at(
        &self,
        key: &IdempotencyKey,
        created_at_millis: u64,
    ) -> Result<bool, StoreError> {
        let mut data = self.data.write().map_err(StoreError::poisoned)?;
        let same = data
            .get(key.as_str())
            .is_some_and(|record| record.created_at_millis == created_at_millis);
        if same {
            data.remove(key.as_str());
        }
        Ok(same)
    }

    fn finalize(
        &self,
        key: &IdempotencyKey,
        status: IdempotencyStatus,
        result: Option<Vec<u8>>,
    ) -> Result<bool, StoreError> {
        let mut data = self.data.write().map_err(StoreError::poisoned)?;
        match data.get_mut(key.as_str()) {
            Some(record) if record.status == IdempotencyStatus::InProgress => {
                record.status = status;
                record.result = result;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn purge_older_than(&self, cutoff_millis: u64) -> Result<usize, StoreError> {
        let mut data = self.data.write().map_err(StoreError::poisoned)?;
        let before = data.len();
        data.retain(|_, record| record.created_at_millis >= cutoff_millis);
        Ok(before - data.len())
    }
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}
