// Licensed under the MIT License.

//! The lock protocol state machine (acquire/refresh/release/steal) and the
//! per-caller [`LockHandle`] that exposes it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::clock::Clock;
use crate::error::{Error, ErrorKind};
use crate::params::LockParams;
use crate::refresher::RefresherHandle;
use crate::store::{LockRecord, StoreAdapter, StoreError};

/// How many times a background refresh retries a transient store failure
/// before the lock is treated as `Stolen` from the caller's perspective.
const REFRESH_TRANSIENT_RETRIES: u32 = 3;
/// Delay between bounded transient retries during refresh.
const REFRESH_TRANSIENT_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HandleState {
    Free,
    Held { version: String },
    Stolen,
}

/// The result of one background refresh attempt, consumed by the
/// [`crate::refresher::Refresher`] to decide whether to keep rescheduling.
pub(crate) enum RefreshOutcome {
    Renewed,
    Stopped,
}

/// Shared, mutex-guarded state behind a [`LockHandle`]. Held by both the
/// handle and (weakly, via an `Arc`) the [`crate::refresher::Refresher`], so
/// that the background worker can mutate `state` on a `Stolen` transition
/// without the `Refresher` owning the handle's lifetime.
pub(crate) struct HandleInner<S, C> {
    pub(crate) table: String,
    pub(crate) name: String,
    pub(crate) params: LockParams,
    store: Arc<S>,
    clock: Arc<C>,
    state: Mutex<HandleState>,
}

impl<S, C> HandleInner<S, C>
where
    S: StoreAdapter,
    C: Clock,
{
    fn new_record(&self) -> LockRecord {
        LockRecord {
            lease_duration: self.params.lease.as_secs(),
            version_number: self.clock.new_version(),
            host_identifier: self.clock.host_id(),
        }
    }

    /// Runs one 4.3-Refresh step. Bounded retries on `Transient`; any
    /// `Conflict` (immediate or after retry exhaustion) transitions the
    /// handle to `Stolen`.
    pub(crate) async fn refresh_once(&self) -> RefreshOutcome {
        let state = self.state.lock().await;
        let HandleState::Held { version } = &*state else {
            return RefreshOutcome::Stopped;
        };
        let expected_version = version.clone();
        drop(state);

        let mut attempt = 0;
        loop {
            let record = self.new_record();
            let new_version = record.version_number.clone();
            match self
                .store
                .put_if_version(&self.name, record, &expected_version)
                .await
            {
                Ok(()) => {
                    let mut state = self.state.lock().await;
                    *state = HandleState::Held {
                        version: new_version,
                    };
                    log::debug!("refreshed lock {:?} at {}", self.name, self.clock.now());
                    return RefreshOutcome::Renewed;
                }
                Err(StoreError::Conflict) => {
                    let mut state = self.state.lock().await;
                    *state = HandleState::Stolen;
                    log::warn!("lock {:?} was stolen before its refresh arrived", self.name);
                    return RefreshOutcome::Stopped;
                }
                Err(StoreError::Transient(message)) => {
                    attempt += 1;
                    if attempt >= REFRESH_TRANSIENT_RETRIES {
                        let mut state = self.state.lock().await;
                        *state = HandleState::Stolen;
                        log::warn!(
                            "lock {:?} refresh exhausted retries after transient failures ({message}); treating as stolen",
                            self.name
                        );
                        return RefreshOutcome::Stopped;
                    }
                    tokio::time::sleep(REFRESH_TRANSIENT_BACKOFF).await;
                }
            }
        }
    }
}

/// Per-caller object bound to a logical lock name.
///
/// Created `Free` by [`crate::session::Session::create_lock`]; transitions to
/// `Held` on [`LockHandle::acquire`] and back to `Free` on
/// [`LockHandle::release`]. May be serialized while held (see
/// [`LockHandle::serialize`]) to hand ownership to another process.
pub struct LockHandle<S, C = crate::clock::SystemClock>
where
    S: StoreAdapter + 'static,
    C: Clock + 'static,
{
    inner: Arc<HandleInner<S, C>>,
    refresher: RefresherHandle<S, C>,
}

impl<S, C> std::fmt::Debug for LockHandle<S, C>
where
    S: StoreAdapter + 'static,
    C: Clock + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("table", &self.inner.table)
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

/// The wire format produced by [`LockHandle::serialize`] and consumed by
/// [`crate::session::Session::deserialize_lock`]. Unknown top-level fields are
/// rejected so that a blob meant for a different protocol version fails fast
/// as [`ErrorKind::MalformedToken`] rather than silently losing data.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SerializedLock {
    pub(crate) table: String,
    pub(crate) name: String,
    pub(crate) version: String,
    pub(crate) lease: u64,
    pub(crate) refresh_period: u64,
}

impl<S, C> LockHandle<S, C>
where
    S: StoreAdapter + 'static,
    C: Clock + 'static,
{
    pub(crate) fn new_free(
        table: String,
        name: String,
        params: LockParams,
        store: Arc<S>,
        clock: Arc<C>,
        refresher: RefresherHandle<S, C>,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                table,
                name,
                params,
                store,
                clock,
                state: Mutex::new(HandleState::Free),
            }),
            refresher,
        }
    }

    pub(crate) fn from_held(
        table: String,
        name: String,
        version: String,
        params: LockParams,
        store: Arc<S>,
        clock: Arc<C>,
        refresher: RefresherHandle<S, C>,
    ) -> Self {
        let inner = Arc::new(HandleInner {
            table,
            name,
            params,
            store,
            clock,
            state: Mutex::new(HandleState::Held { version }),
        });
        refresher.register(inner.clone());
        Self { inner, refresher }
    }

    /// The logical lock name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The configured advertised lease window.
    #[must_use]
    pub fn lease_duration(&self) -> Duration {
        self.inner.params.lease
    }

    /// Whether the handle is currently `Held`. A `Stolen` handle reports
    /// `false`, matching its equivalence to `Free` for reuse.
    pub async fn is_held(&self) -> bool {
        matches!(*self.inner.state.lock().await, HandleState::Held { .. })
    }

    /// Runs the acquire loop (§4.3) until the lock is held or
    /// `acquire_timeout` elapses.
    ///
    /// # Errors
    /// [`ErrorKind::IllegalState`] if the handle is already `Held`.
    /// [`ErrorKind::AcquireTimeout`] if `acquire_timeout` elapses while the
    /// lock stays continuously held by another agent.
    /// [`ErrorKind::Transient`] if the store is unreachable.
    pub async fn acquire(&self) -> Result<(), Error> {
        {
            let state = self.inner.state.lock().await;
            if !matches!(*state, HandleState::Free) {
                return Err(ErrorKind::IllegalState(format!(
                    "acquire called on lock {:?} that is not Free",
                    self.inner.name
                ))
                .into());
            }
        }

        let deadline = self
            .inner
            .params
            .acquire_timeout
            .map(|timeout| Instant::now() + timeout);

        loop {
            self.check_deadline(deadline)?;

            let record = self.inner.new_record();
            let acquired_version = record.version_number.clone();
            match self.inner.store.put_if_absent(&self.inner.name, record).await {
                Ok(()) => {
                    self.enter_held(acquired_version).await;
                    log::info!("acquired lock {:?}", self.inner.name);
                    return Ok(());
                }
                Err(StoreError::Conflict) => {}
                Err(StoreError::Transient(message)) => {
                    return Err(ErrorKind::Transient(message).into());
                }
            }

            match self.poll_for_steal_or_retry(deadline).await? {
                StealAttempt::Acquired(version) => {
                    self.enter_held(version).await;
                    log::info!("stole expired lock {:?}", self.inner.name);
                    return Ok(());
                }
                StealAttempt::RetryOuterLoop => {}
            }
        }
    }

    /// Implements the inner conflict-handling branch of 4.3-Acquire: reads
    /// the current record, sleeps for `min(lease, retry_interval)`, re-reads,
    /// and either signals that the outer loop should retry from the top, or
    /// returns a freshly-stolen version.
    async fn poll_for_steal_or_retry(
        &self,
        deadline: Option<Instant>,
    ) -> Result<StealAttempt, Error> {
        let Some(existing) = self.get_record().await? else {
            // Raced a release; caller retries `put_if_absent` immediately.
            return Ok(StealAttempt::RetryOuterLoop);
        };
        let observed_version = existing.version_number;

        let sleep_for = self
            .inner
            .params
            .lease
            .min(self.inner.params.retry_interval());
        self.sleep_bounded(sleep_for, deadline).await?;

        let Some(after) = self.get_record().await? else {
            return Ok(StealAttempt::RetryOuterLoop);
        };

        if after.version_number != observed_version {
            // Lock is still live under a different holder; keep retrying.
            self.check_deadline(deadline)?;
            return Ok(StealAttempt::RetryOuterLoop);
        }

        // The holder failed to refresh within its lease. Presume it is dead.
        let record = self.inner.new_record();
        let new_version = record.version_number.clone();
        match self
            .inner
            .store
            .put_if_version(&self.inner.name, record, &observed_version)
            .await
        {
            Ok(()) => Ok(StealAttempt::Acquired(new_version)),
            Err(StoreError::Conflict) => Ok(StealAttempt::RetryOuterLoop),
            Err(StoreError::Transient(message)) => Err(ErrorKind::Transient(message).into()),
        }
    }

    async fn get_record(&self) -> Result<Option<LockRecord>, Error> {
        self.inner
            .store
            .get(&self.inner.name)
            .await
            .map_err(|e| match e {
                StoreError::Transient(message) => ErrorKind::Transient(message).into(),
                StoreError::Conflict => {
                    unreachable!("get never returns Conflict")
                }
            })
    }

    async fn sleep_bounded(&self, duration: Duration, deadline: Option<Instant>) -> Result<(), Error> {
        match deadline {
            None => {
                tokio::time::sleep(duration).await;
                Ok(())
            }
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                tokio::time::sleep(duration.min(remaining)).await;
                self.check_deadline(Some(deadline))
            }
        }
    }

    fn check_deadline(&self, deadline: Option<Instant>) -> Result<(), Error> {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err(ErrorKind::AcquireTimeout(self.inner.name.clone()).into());
            }
        }
        Ok(())
    }

    async fn enter_held(&self, version: String) {
        let mut state = self.inner.state.lock().await;
        *state = HandleState::Held { version };
        drop(state);
        self.refresher.register(self.inner.clone());
    }

    /// Runs 4.3-Release. Idempotent; a no-op (not an error) if the handle is
    /// already `Free` or `Stolen`.
    pub async fn release(&self) {
        self.refresher.deregister(&self.inner.name);

        let version = {
            let mut state = self.inner.state.lock().await;
            match std::mem::replace(&mut *state, HandleState::Free) {
                HandleState::Held { version } => Some(version),
                HandleState::Free | HandleState::Stolen => None,
            }
        };

        let Some(version) = version else {
            return;
        };

        match self
            .inner
            .store
            .delete_if_version(&self.inner.name, &version)
            .await
        {
            Ok(()) => log::info!("released lock {:?}", self.inner.name),
            Err(StoreError::Conflict) => {
                // Already stolen or released by someone else; not our record to delete.
                log::debug!(
                    "release of lock {:?} found a version mismatch; treating as already gone",
                    self.inner.name
                );
            }
            Err(StoreError::Transient(message)) => {
                log::warn!(
                    "release of lock {:?} failed transiently ({message}); the lease will expire naturally",
                    self.inner.name
                );
            }
        }
    }

    /// Acquires on entry and returns a guard that releases on drop, on every
    /// exit path including panics during the caller's critical section.
    ///
    /// Because [`Drop`] cannot `.await`, the guard's release is spawned as a
    /// best-effort detached task; callers that need a release they can await
    /// should prefer [`with_lock`] instead.
    ///
    /// # Errors
    /// Same as [`LockHandle::acquire`].
    pub async fn scoped_use(&self) -> Result<ScopedLock<'_, S, C>, Error> {
        self.acquire().await?;
        Ok(ScopedLock { handle: self })
    }

    /// Serializes a `Held` handle to a self-contained UTF-8 JSON blob for
    /// cross-process transfer.
    ///
    /// `serialize` implies `detach`: it atomically deregisters the handle
    /// from this session's background refresher as part of producing the
    /// blob. The handle remains `Held` and may still be released locally, but
    /// is no longer auto-refreshed, so the intended pattern is to serialize
    /// and then stop using the source handle (see the base specification's
    /// design notes on why automatic detach makes the handoff reliable).
    ///
    /// # Errors
    /// [`ErrorKind::IllegalState`] if the handle is not `Held`.
    pub async fn serialize(&self) -> Result<String, Error> {
        let version = {
            let state = self.inner.state.lock().await;
            match &*state {
                HandleState::Held { version } => version.clone(),
                HandleState::Free | HandleState::Stolen => {
                    return Err(ErrorKind::IllegalState(format!(
                        "serialize called on lock {:?} that is not Held",
                        self.inner.name
                    ))
                    .into());
                }
            }
        };

        self.refresher.deregister(&self.inner.name);

        let blob = SerializedLock {
            table: self.inner.table.clone(),
            name: self.inner.name.clone(),
            version,
            lease: self.inner.params.lease.as_secs(),
            refresh_period: self.inner.params.refresh_period.as_secs(),
        };
        serde_json::to_string(&blob)
            .map_err(|e| ErrorKind::MalformedToken(e.to_string()).into())
    }
}

enum StealAttempt {
    Acquired(String),
    RetryOuterLoop,
}

/// RAII guard returned by [`LockHandle::scoped_use`]. Releases the lock on
/// drop, on every exit path including an early return or panic inside the
/// scope.
pub struct ScopedLock<'a, S, C = crate::clock::SystemClock>
where
    S: StoreAdapter + 'static,
    C: Clock + 'static,
{
    handle: &'a LockHandle<S, C>,
}

impl<S, C> Drop for ScopedLock<'_, S, C>
where
    S: StoreAdapter + 'static,
    C: Clock + 'static,
{
    fn drop(&mut self) {
        let inner = self.handle.inner.clone();
        let refresher = self.handle.refresher.clone();
        if tokio::runtime::Handle::try_current().is_err() {
            log::warn!(
                "scoped lock for {:?} dropped outside a tokio runtime; release could not be spawned",
                inner.name
            );
            return;
        }
        tokio::spawn(async move {
            let handle = LockHandle { inner, refresher };
            handle.release().await;
        });
    }
}

/// Awaitable equivalent of [`LockHandle::scoped_use`]: acquires on entry,
/// runs `body`, and guarantees an *awaited* release on every exit path,
/// including when `body` returns an error.
///
/// # Errors
/// Propagates [`LockHandle::acquire`]'s errors, or `body`'s error if acquire
/// succeeded but `body` failed.
pub async fn with_lock<S, C, F, Fut, T>(handle: &LockHandle<S, C>, body: F) -> Result<T, Error>
where
    S: StoreAdapter + 'static,
    C: Clock + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    handle.acquire().await?;
    let result = body().await;
    handle.release().await;
    result
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::clock::FakeClock;
    use crate::params::LockParamsBuilder;
    use crate::refresher::Refresher;
    use crate::store::StoreAdapter;
    use crate::store::memory::InMemoryStore;

    use super::{HandleInner, HandleState, LockHandle, RefreshOutcome};

    fn free_handle(
        store: Arc<InMemoryStore>,
        clock: Arc<FakeClock>,
        lease_secs: u64,
    ) -> LockHandle<InMemoryStore, FakeClock> {
        let params = LockParamsBuilder::default()
            .lease(Duration::from_secs(lease_secs))
            .refresh_period(Duration::from_secs(lease_secs / 4))
            .build()
            .unwrap();
        let refresher = Refresher::spawn();
        LockHandle::new_free(
            "table".to_string(),
            "lock-a".to_string(),
            params,
            store,
            clock,
            refresher.handle(),
        )
    }

    #[tokio::test]
    async fn uncontended_acquire_then_release_round_trips() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(FakeClock::new(0, "host-a"));
        let handle = free_handle(store.clone(), clock, 20);

        handle.acquire().await.unwrap();
        assert!(handle.is_held().await);
        let record = store.peek("lock-a").unwrap();
        assert_eq!(record.lease_duration, 20);
        assert_eq!(record.host_identifier, "host-a");

        handle.release().await;
        assert!(!handle.is_held().await);
        assert!(store.peek("lock-a").is_none());
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(FakeClock::new(0, "host-a"));
        let handle = free_handle(store, clock, 20);

        handle.acquire().await.unwrap();
        handle.release().await;
        handle.release().await;
        assert!(!handle.is_held().await);
    }

    #[tokio::test]
    async fn reacquire_on_held_handle_is_illegal_state() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(FakeClock::new(0, "host-a"));
        let handle = free_handle(store, clock, 20);

        handle.acquire().await.unwrap();
        let err = handle.acquire().await.unwrap_err();
        assert!(matches!(err.kind(), crate::error::ErrorKind::IllegalState(_)));
    }

    #[tokio::test]
    async fn every_successful_write_gets_a_fresh_version() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(FakeClock::new(0, "host-a"));
        let handle = free_handle(store.clone(), clock, 20);

        handle.acquire().await.unwrap();
        let v1 = store.peek("lock-a").unwrap().version_number;

        let inner = handle_inner_for_test(&handle);
        assert!(matches!(
            inner.refresh_once().await,
            RefreshOutcome::Renewed
        ));
        let v2 = store.peek("lock-a").unwrap().version_number;

        assert_ne!(v1, v2);
    }

    #[tokio::test]
    async fn refresh_after_steal_transitions_to_stolen() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(FakeClock::new(0, "host-a"));
        let handle = free_handle(store.clone(), clock.clone(), 2);

        handle.acquire().await.unwrap();
        let stale_version = store.peek("lock-a").unwrap().version_number;

        // Simulate B stealing the expired record directly against the store,
        // bypassing A's in-memory state the way a second process would.
        store
            .put_if_version(
                "lock-a",
                crate::store::LockRecord {
                    lease_duration: 2,
                    version_number: "b-version".to_string(),
                    host_identifier: "host-b".to_string(),
                },
                &stale_version,
            )
            .await
            .unwrap();

        let inner = handle_inner_for_test(&handle);
        assert!(matches!(inner.refresh_once().await, RefreshOutcome::Stopped));

        let state = inner_state_for_test(&inner).await;
        assert_eq!(state, HandleState::Stolen);
        assert!(!handle.is_held().await);
    }

    fn handle_inner_for_test(
        handle: &LockHandle<InMemoryStore, FakeClock>,
    ) -> Arc<HandleInner<InMemoryStore, FakeClock>> {
        handle.inner.clone()
    }

    async fn inner_state_for_test(inner: &HandleInner<InMemoryStore, FakeClock>) -> HandleState {
        let state = inner.state.lock().await;
        state.clone()
    }
}
