// Licensed under the MIT License.

//! Errors surfaced by the lock protocol.

use thiserror::Error;

/// Represents an error that occurred while using the distributed lock manager.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct Error(#[from] ErrorKind);

impl Error {
    /// Returns the [`ErrorKind`] of the error.
    #[must_use]
    pub fn kind(&self) -> &ErrorKind {
        &self.0
    }
}

/// Represents the kinds of errors that occur in the distributed lock manager.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// `acquire` exceeded its deadline while the lock stayed continuously held by another agent.
    #[error("acquire timed out waiting for lock {0:?}")]
    AcquireTimeout(String),
    /// Deserialization raced with a steal/release/refresh and the carried version is no longer current.
    #[error("lock {0:?} is already in use")]
    AlreadyInUse(String),
    /// The serialization blob was unparseable or missing a required field.
    #[error("malformed lock token: {0}")]
    MalformedToken(String),
    /// Deserialization was attempted against a session bound to a different table.
    #[error("lock token is bound to table {expected:?}, not {actual:?}")]
    WrongTable {
        /// The table the session is bound to.
        expected: String,
        /// The table named in the token.
        actual: String,
    },
    /// The handle or parameters were not in a state that permits the requested operation.
    #[error("illegal state: {0}")]
    IllegalState(String),
    /// The store failed to respond after bounded retries.
    #[error("transient store failure: {0}")]
    Transient(String),
}
