// Licensed under the MIT License.

//! Factory bound to a table: creates handles, deserializes foreign handles,
//! and owns the background [`Refresher`].

use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, ErrorKind};
use crate::handle::{LockHandle, SerializedLock};
use crate::params::{LockParams, LockParamsBuilder};
use crate::refresher::Refresher;
use crate::store::{LockRecord, StoreAdapter, StoreError};

/// A table-scoped factory for [`LockHandle`]s.
///
/// Lifetime is process-scoped: dropping a `Session` does not forcibly delete
/// any records it holds, because crash semantics rely on lease expiry rather
/// than on graceful teardown. Call [`Session::close`] to stop the background
/// refresher deliberately; otherwise it runs until the process exits.
pub struct Session<S, C = SystemClock>
where
    S: StoreAdapter + 'static,
    C: Clock + 'static,
{
    table: String,
    store: Arc<S>,
    clock: Arc<C>,
    refresher: Refresher<S, C>,
}

impl<S> Session<S, SystemClock>
where
    S: StoreAdapter + 'static,
{
    /// Creates a session bound to `table`, using the real system clock and
    /// OS-resolved host identity.
    #[must_use]
    pub fn new(table: impl Into<String>, store: S) -> Self {
        Self::with_clock(table, store, SystemClock)
    }
}

impl<S, C> Session<S, C>
where
    S: StoreAdapter + 'static,
    C: Clock + 'static,
{
    /// Creates a session bound to `table` with an injected [`Clock`], for
    /// deterministic tests.
    #[must_use]
    pub fn with_clock(table: impl Into<String>, store: S, clock: C) -> Self {
        Self {
            table: table.into(),
            store: Arc::new(store),
            clock: Arc::new(clock),
            refresher: Refresher::spawn(),
        }
    }

    /// The table this session is bound to.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Creates a free [`LockHandle`] for `name`, governed by `params`.
    #[must_use]
    pub fn create_lock(&self, name: impl Into<String>, params: LockParams) -> LockHandle<S, C> {
        LockHandle::new_free(
            self.table.clone(),
            name.into(),
            params,
            self.store.clone(),
            self.clock.clone(),
            self.refresher.handle(),
        )
    }

    /// Parses `token` (produced by [`LockHandle::serialize`]) and attempts to
    /// prove its carried version is still current, rotating it in the same
    /// write. On success, returns a `Held` handle registered with this
    /// session's refresher.
    ///
    /// # Errors
    /// [`ErrorKind::MalformedToken`] if `token` is not valid JSON for the
    /// expected shape, or carries an unknown top-level field.
    ///
    /// [`ErrorKind::WrongTable`] if `token` names a table other than this
    /// session's.
    ///
    /// [`ErrorKind::AlreadyInUse`] if the carried version is no longer
    /// current (the lock was stolen or released between serialization and
    /// deserialization).
    pub async fn deserialize_lock(&self, token: &str) -> Result<LockHandle<S, C>, Error> {
        let blob: SerializedLock = serde_json::from_str(token)
            .map_err(|e| ErrorKind::MalformedToken(e.to_string()))?;

        if blob.table != self.table {
            return Err(ErrorKind::WrongTable {
                expected: self.table.clone(),
                actual: blob.table,
            }
            .into());
        }

        // A numeric-policy violation here comes from the foreign blob's carried
        // lease/refresh_period, not from this call site's own arguments, so it is
        // reported as a malformed token rather than as the builder's own
        // IllegalState.
        let params = LockParamsBuilder::default()
            .lease(std::time::Duration::from_secs(blob.lease))
            .refresh_period(std::time::Duration::from_secs(blob.refresh_period))
            .build()
            .map_err(|e| ErrorKind::MalformedToken(e.to_string()))?;

        let new_record = LockRecord {
            lease_duration: blob.lease,
            version_number: self.clock.new_version(),
            host_identifier: self.clock.host_id(),
        };
        let new_version = new_record.version_number.clone();

        match self
            .store
            .put_if_version(&blob.name, new_record, &blob.version)
            .await
        {
            Ok(()) => {
                log::info!("deserialized lock {:?} onto table {:?}", blob.name, self.table);
                Ok(LockHandle::from_held(
                    self.table.clone(),
                    blob.name,
                    new_version,
                    params,
                    self.store.clone(),
                    self.clock.clone(),
                    self.refresher.handle(),
                ))
            }
            Err(StoreError::Conflict) => {
                log::warn!(
                    "deserialize of lock {:?} raced a steal/release/refresh",
                    blob.name
                );
                Err(ErrorKind::AlreadyInUse(blob.name).into())
            }
            Err(StoreError::Transient(message)) => Err(ErrorKind::Transient(message).into()),
        }
    }

    /// Stops the background refresher. Outstanding lock records are left to
    /// expire naturally; this never forcibly deletes them.
    pub async fn close(self) {
        self.refresher.shutdown().await;
    }
}

/// Convenience sugar over `Session::new(table, store)`.
///
/// Deliberately does **not** cache sessions in a global registry: each
/// session owns a background worker whose lifetime the caller must control,
/// so a hidden global cache would make that lifetime uncontrollable.
pub fn get_session<S>(table: impl Into<String>, store: S) -> Session<S, SystemClock>
where
    S: StoreAdapter + 'static,
{
    Session::new(table, store)
}
