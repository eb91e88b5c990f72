//! Drives a [`Model`] from the store's change feed.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::claims::ClaimId;
use crate::error::{Error, Result};
use crate::feed::{FeedSubscription, StoreChange};
use crate::store::EventStore;
use crate::types::EventId;

use super::{Model, Reaction};

// =============================================================================
// Live View
// =============================================================================

/// A model bound to a store.
///
/// The view is pull-based: [`sync`](Self::sync) folds in whatever changes are
/// buffered, [`changed`](Self::changed) waits for the output to move. For a
/// push-style handle, see [`watch`](Self::watch).
///
/// Every event the output references is claimed under the view's own
/// [`ClaimId`], so pruning leaves it alone. Dropping the view releases those
/// claims.
pub struct LiveView<M: Model> {
    store: EventStore,
    model: M,
    subscription: FeedSubscription,
    claim: ClaimId,
    held: HashSet<EventId>,
    output: M::Output,
    version: u64,
    loader_requested: bool,
    retired: Arc<AtomicBool>,
}

impl<M: Model> std::fmt::Debug for LiveView<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveView")
            .field("claim", &self.claim)
            .field("held", &self.held.len())
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl<M: Model> LiveView<M> {
    /// Seeds `model` from a snapshot of `store` and starts following changes.
    pub(crate) fn new(store: EventStore, mut model: M) -> Result<Self> {
        let seeded = store.snapshot_and_subscribe(|backend| model.seed(backend))?;
        let output = model.output();
        let mut view = Self {
            store,
            model,
            subscription: seeded.subscription,
            claim: ClaimId::next(),
            held: HashSet::new(),
            output,
            version: 0,
            loader_requested: false,
            retired: Arc::new(AtomicBool::new(false)),
        };
        view.sync_claims();
        view.maybe_load();
        debug!(claim = %view.claim, head = %seeded.head, "view seeded");
        Ok(view)
    }

    /// The current output.
    pub fn current(&self) -> M::Output {
        self.output.clone()
    }

    /// Bumped every time the output changes.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The claim this view pins its events under.
    pub fn claim_id(&self) -> ClaimId {
        self.claim
    }

    /// The underlying model.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Applies every buffered change. Returns true if the output changed.
    pub fn sync(&mut self) -> Result<bool> {
        let mut changed = false;
        while let Some(next) = self.subscription.try_next() {
            changed |= self.handle(next)?;
        }
        Ok(changed)
    }

    /// Waits until the output differs from what it was on entry and returns
    /// the new output. Fails with `Error::Closed` once the store is closed.
    pub async fn changed(&mut self) -> Result<M::Output> {
        if self.sync()? {
            return Ok(self.current());
        }
        loop {
            let Some(next) = self.subscription.next().await else {
                return Err(Error::Closed);
            };
            if self.handle(next)? {
                // Fold in whatever else arrived so callers see the latest state.
                self.sync()?;
                return Ok(self.current());
            }
        }
    }

    /// Moves the view into a background task that publishes every output
    /// change on a `tokio::sync::watch` channel.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn watch(mut self) -> ViewWatch<M::Output> {
        let (sender, receiver) = watch::channel(self.current());
        let claim = self.claim;
        let store = self.store.clone();
        let retired = self.retired.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sender.closed() => break,
                    result = self.changed() => match result {
                        Ok(output) => {
                            if sender.send(output).is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            debug!(%claim, "view watch stopped: {err}");
                            break;
                        }
                    },
                }
            }
        });
        ViewWatch {
            receiver,
            task,
            store,
            claim,
            retired,
        }
    }

    fn handle(&mut self, next: Result<StoreChange>) -> Result<bool> {
        match next {
            Ok(change) => match self.model.apply(&change) {
                Reaction::Ignored => Ok(false),
                Reaction::Updated => Ok(self.refresh()),
                Reaction::Reseed => self.reseed(),
            },
            Err(Error::SubscriptionLagged(missed)) => {
                warn!(claim = %self.claim, missed, "view fell behind the change feed, re-seeding");
                self.reseed()
            }
            Err(err) => Err(err),
        }
    }

    /// Takes a fresh snapshot. Buffered changes on the old subscription are
    /// already covered by it and get dropped with it.
    fn reseed(&mut self) -> Result<bool> {
        let seeded = self
            .store
            .snapshot_and_subscribe(|backend| self.model.seed(backend))?;
        self.subscription = seeded.subscription;
        // A removal the snapshot skipped over took our claim with it, even if
        // the event has been stored again since.
        for id in self.model.held() {
            self.pin(&id);
        }
        Ok(self.refresh())
    }

    fn refresh(&mut self) -> bool {
        let output = self.model.output();
        let changed = output != self.output;
        if changed {
            self.output = output;
            self.version += 1;
        }
        self.sync_claims();
        self.maybe_load();
        changed
    }

    fn sync_claims(&mut self) {
        let now: HashSet<EventId> = self.model.held().into_iter().collect();
        for id in now.difference(&self.held) {
            self.pin(id);
        }
        for id in self.held.difference(&now) {
            self.store.remove_claim(id, self.claim);
        }
        self.held = now;
    }

    /// Claims `id` unless the watch owning this view has been dropped.
    fn pin(&self, id: &EventId) {
        if !self.retired.load(Ordering::Acquire) {
            self.store.claim(id, self.claim);
        }
    }

    /// Asks the loader, once, for what the model is missing.
    fn maybe_load(&mut self) {
        if self.loader_requested || !self.held.is_empty() {
            return;
        }
        let Some(pointer) = self.model.missing() else {
            return;
        };
        let Some(loader) = self.store.loader() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(%pointer, "no runtime to run the loader on");
            return;
        };

        self.loader_requested = true;
        let store = self.store.clone();
        runtime.spawn(async move {
            match loader.load(pointer.clone()).await {
                Ok(Some(event)) => {
                    if let Err(err) = store.add(event) {
                        warn!(%pointer, "loaded event was not stored: {err}");
                    }
                }
                Ok(None) => debug!(%pointer, "loader found nothing"),
                Err(err) => warn!(%pointer, "loader failed: {err}"),
            }
        });
    }
}

impl<M: Model> Drop for LiveView<M> {
    fn drop(&mut self) {
        self.store.clear_claims(self.claim);
        self.model.reset();
    }
}

// =============================================================================
// Watch Handle
// =============================================================================

/// Push-style handle returned by [`LiveView::watch`].
///
/// Dropping it releases the view's claims right away and stops the
/// background task.
pub struct ViewWatch<T> {
    receiver: watch::Receiver<T>,
    task: JoinHandle<()>,
    store: EventStore,
    claim: ClaimId,
    retired: Arc<AtomicBool>,
}

impl<T> std::fmt::Debug for ViewWatch<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewWatch")
            .field("claim", &self.claim)
            .field("finished", &self.task.is_finished())
            .finish_non_exhaustive()
    }
}

impl<T: Clone> ViewWatch<T> {
    /// The latest published output.
    pub fn current(&self) -> T {
        self.receiver.borrow().clone()
    }

    /// Waits for the next output. `None` once the view has stopped.
    pub async fn changed(&mut self) -> Option<T> {
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }

    /// Another receiver on the same channel.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.receiver.clone()
    }

    /// True once the background task has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl<T> Drop for ViewWatch<T> {
    fn drop(&mut self) {
        // The task may still be mid-sync on another worker; the flag keeps it
        // from pinning anything new, and dropping the view clears stragglers.
        self.retired.store(true, Ordering::Release);
        self.store.clear_claims(self.claim);
        self.task.abort();
    }
}
