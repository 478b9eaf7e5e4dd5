// Licensed under the MIT License.

//! A single background activity per [`crate::session::Session`], shared by all
//! held handles, that periodically re-asserts ownership before a lease expires.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::handle::{HandleInner, RefreshOutcome};
use crate::store::StoreAdapter;

/// How long the worker idles when it holds no entries, before re-checking the
/// command channel. Any `Register`/`Deregister` wakes it immediately.
const IDLE_WAKEUP: Duration = Duration::from_secs(3600);

enum Command<S, C> {
    Register(Arc<HandleInner<S, C>>),
    Deregister(String),
}

/// A cloneable front for submitting register/deregister commands to the
/// running [`Refresher`] worker.
pub(crate) struct RefresherHandle<S, C> {
    sender: mpsc::UnboundedSender<Command<S, C>>,
}

impl<S, C> Clone for RefresherHandle<S, C> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<S, C> RefresherHandle<S, C>
where
    S: StoreAdapter + 'static,
    C: Clock + 'static,
{
    /// Registers `inner` for periodic background refresh. A no-op if the
    /// worker has already shut down.
    pub(crate) fn register(&self, inner: Arc<HandleInner<S, C>>) {
        let _ = self.sender.send(Command::Register(inner));
    }

    /// Stops background refresh for `name`. A no-op if `name` was never
    /// registered, or if the worker has already shut down.
    pub(crate) fn deregister(&self, name: &str) {
        let _ = self.sender.send(Command::Deregister(name.to_string()));
    }
}

/// Owns the background refresh task for one [`crate::session::Session`].
pub(crate) struct Refresher<S, C> {
    handle: RefresherHandle<S, C>,
    cancellation: CancellationToken,
    worker: JoinHandle<()>,
}

impl<S, C> Refresher<S, C>
where
    S: StoreAdapter + 'static,
    C: Clock + 'static,
{
    /// Spawns the background worker.
    pub(crate) fn spawn() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let cancellation = CancellationToken::new();
        let worker_cancellation = cancellation.clone();
        let worker = tokio::spawn(Self::run(receiver, worker_cancellation));
        Self {
            handle: RefresherHandle { sender },
            cancellation,
            worker,
        }
    }

    /// Returns a cloneable handle for registering/deregistering entries.
    pub(crate) fn handle(&self) -> RefresherHandle<S, C> {
        self.handle.clone()
    }

    /// Stops the worker and waits for it to exit. Outstanding lock records
    /// are left to expire naturally; this never deletes them.
    pub(crate) async fn shutdown(self) {
        self.cancellation.cancel();
        let _ = self.worker.await;
    }

    async fn run(
        mut receiver: mpsc::UnboundedReceiver<Command<S, C>>,
        cancellation: CancellationToken,
    ) {
        let mut entries: HashMap<String, (Arc<HandleInner<S, C>>, Instant)> = HashMap::new();

        loop {
            let sleep_duration = entries
                .values()
                .map(|(_, due)| *due)
                .min()
                .map(|due| due.saturating_duration_since(Instant::now()))
                .unwrap_or(IDLE_WAKEUP);

            tokio::select! {
                () = cancellation.cancelled() => {
                    log::debug!("refresher shutting down with {} outstanding entries", entries.len());
                    break;
                }
                () = tokio::time::sleep(sleep_duration) => {
                    Self::refresh_due_entries(&mut entries).await;
                }
                command = receiver.recv() => {
                    match command {
                        Some(Command::Register(inner)) => {
                            let due = Instant::now() + inner.params.refresh_period;
                            log::debug!("refresher registered lock {:?}", inner.name);
                            entries.insert(inner.name.clone(), (inner, due));
                        }
                        Some(Command::Deregister(name)) => {
                            log::debug!("refresher deregistered lock {name:?}");
                            entries.remove(&name);
                        }
                        None => break,
                    }
                }
            }
        }
    }

    async fn refresh_due_entries(entries: &mut HashMap<String, (Arc<HandleInner<S, C>>, Instant)>) {
        let now = Instant::now();
        let due: Vec<String> = entries
            .iter()
            .filter(|(_, (_, due))| *due <= now)
            .map(|(name, _)| name.clone())
            .collect();

        for name in due {
            let Some((inner, _)) = entries.get(&name) else {
                continue;
            };
            let inner = inner.clone();
            match inner.refresh_once().await {
                RefreshOutcome::Renewed => {
                    let due = Instant::now() + inner.params.refresh_period;
                    entries.insert(name, (inner, due));
                }
                RefreshOutcome::Stopped => {
                    log::warn!("lock {name:?} was stolen or lost; stopping background refresh");
                    entries.remove(&name);
                }
            }
        }
    }
}
