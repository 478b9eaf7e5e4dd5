// Licensed under the MIT License.

//! The narrow capability the lock protocol is written against.
//!
//! The protocol never depends on a concrete vendor SDK; it depends only on
//! [`StoreAdapter`]. This is what makes the protocol testable against
//! [`memory::InMemoryStore`] instead of a real hosted document store.

pub mod memory;

use std::future::Future;

use thiserror::Error;

/// The sole on-store entity, keyed by lock name within a table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockRecord {
    /// Advertised lease window, in seconds.
    pub lease_duration: u64,
    /// Fencing token. Changes on every write.
    pub version_number: String,
    /// Diagnostic only; never used for correctness decisions.
    pub host_identifier: String,
}

/// Failure modes of a [`StoreAdapter`] call.
///
/// `Conflict` is a protocol signal, not a transport error: the adapter must
/// never retry it internally, since retrying would erase the information the
/// protocol layer needs to decide whether to steal, wait, or give up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The conditional precondition (absence, or a specific version) did not hold.
    #[error("conditional write precondition did not hold")]
    Conflict,
    /// The store could not be reached after bounded retries at the transport level.
    #[error("{0}")]
    Transient(String),
}

/// Four conditional operations against a single backing table.
///
/// All four must be backed by strongly consistent, linearizable conditional
/// writes on a single key; no multi-key transaction is required. Expressed as
/// a native `async fn` trait so both a real store client and
/// [`memory::InMemoryStore`] implement the identical interface.
pub trait StoreAdapter: Send + Sync {
    /// Writes `record` for `key` only if no record currently exists for `key`.
    ///
    /// # Errors
    /// [`StoreError::Conflict`] if a record for `key` already exists.
    /// [`StoreError::Transient`] on a transport-level failure after bounded retries.
    fn put_if_absent(
        &self,
        key: &str,
        record: LockRecord,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Writes `record` for `key` only if the stored record's version equals `expected_version`.
    ///
    /// # Errors
    /// [`StoreError::Conflict`] if the stored version differs from `expected_version`, or the
    /// record is absent.
    /// [`StoreError::Transient`] on a transport-level failure after bounded retries.
    fn put_if_version(
        &self,
        key: &str,
        record: LockRecord,
        expected_version: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Deletes the record for `key` only if its version equals `expected_version`.
    ///
    /// # Errors
    /// [`StoreError::Conflict`] on a version mismatch or absence.
    /// [`StoreError::Transient`] on a transport-level failure after bounded retries.
    fn delete_if_version(
        &self,
        key: &str,
        expected_version: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Reads the record for `key`, if any.
    ///
    /// # Errors
    /// [`StoreError::Transient`] on a transport-level failure after bounded retries.
    fn get(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<LockRecord>, StoreError>> + Send;
}
