// Licensed under the MIT License.

//! A deterministic fake [`StoreAdapter`], used by unit and integration tests
//! and by doc examples. Not gated behind a feature: the base spec requires the
//! protocol to be testable against an in-memory fake by construction.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::store::{LockRecord, StoreAdapter, StoreError};

/// A single named table of lock records, held entirely in process memory.
#[derive(Default)]
pub struct InMemoryStore {
    records: Mutex<HashMap<String, LockRecord>>,
}

impl InMemoryStore {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of the record for `key`, for test assertions.
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<LockRecord> {
        self.records
            .lock()
            .expect("in-memory store mutex poisoned")
            .get(key)
            .cloned()
    }
}

impl StoreAdapter for InMemoryStore {
    async fn put_if_absent(&self, key: &str, record: LockRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().expect("in-memory store mutex poisoned");
        if records.contains_key(key) {
            return Err(StoreError::Conflict);
        }
        records.insert(key.to_string(), record);
        Ok(())
    }

    async fn put_if_version(
        &self,
        key: &str,
        record: LockRecord,
        expected_version: &str,
    ) -> Result<(), StoreError> {
        let mut records = self.records.lock().expect("in-memory store mutex poisoned");
        match records.get(key) {
            Some(current) if current.version_number == expected_version => {
                records.insert(key.to_string(), record);
                Ok(())
            }
            _ => Err(StoreError::Conflict),
        }
    }

    async fn delete_if_version(&self, key: &str, expected_version: &str) -> Result<(), StoreError> {
        let mut records = self.records.lock().expect("in-memory store mutex poisoned");
        match records.get(key) {
            Some(current) if current.version_number == expected_version => {
                records.remove(key);
                Ok(())
            }
            _ => Err(StoreError::Conflict),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<LockRecord>, StoreError> {
        Ok(self
            .records
            .lock()
            .expect("in-memory store mutex poisoned")
            .get(key)
            .cloned())
    }
}
