//! # The Event Store
//!
//! [`EventStore`] composes a backend, the change feed and the claim tracker
//! into the one object the rest of an application talks to.
//!
//! ## Locking
//!
//! ```text
//! EventStore (cheap clone, Arc inside)
//!   ├── RwLock<State>         backend + feed + deletion memory
//!   │      write: add / remove / prune / close   (mutation AND publish)
//!   │      read:  get / query / subscribe / snapshot_and_subscribe
//!   └── Mutex<ClaimTracker>   claims, touches
//! ```
//!
//! A mutation applies to the backend and publishes its notification while
//! holding the write lock, so the feed order is exactly the mutation order and
//! no reader can see an index state whose notification hasn't been sent.
//! `snapshot_and_subscribe` runs its query and creates the subscription under
//! one read lock, so nothing can slip between the seed and the first delta.
//!
//! Lock order is always `State` before `ClaimTracker`.
//!
//! ## Ingest Policy
//!
//! Before an event reaches the backend:
//!
//! 1. id check (when `verify_ids` is set)
//! 2. validity predicate (when one is installed)
//! 3. expiration (unless `keep_expired`)
//! 4. deletion memory (unless `remember_deletions` is off)
//!
//! Kind-5 deletion events are stored like any other event and then remove
//! the events they reference, provided the deletion's author wrote them.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::backend::EventBackend;
use crate::claims::{ClaimId, ClaimTracker};
use crate::codec;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::feed::{ChangeFeed, ChangeKind, ChangeSeq, FeedSubscription};
use crate::filter::{self, Filter};
use crate::hybrid::HybridBackend;
use crate::index::MemoryIndex;
use crate::models::{
    EventLoader, LiveView, ReplaceableModel, SingleEventModel, TimelineModel,
};
use crate::pointer::{AddressPointer, Pointer};
use crate::schema::Database;
use crate::sqlite::SqliteBackend;
use crate::types::{Event, EventId, Kind, PubKey, ReplaceableKey, Timestamp};

/// Validity predicate applied to every event before it is stored.
///
/// Signature checking belongs here; the store never verifies signatures
/// itself.
pub type Verifier = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// A seed value together with the subscription that continues it.
#[derive(Debug)]
pub struct Seeded<T> {
    /// Result of the snapshot closure.
    pub value: T,
    /// Sees every change after the snapshot, starting at `head + 1`.
    pub subscription: FeedSubscription,
    /// Feed head at snapshot time.
    pub head: ChangeSeq,
}

// =============================================================================
// Internal State
// =============================================================================

struct State {
    backend: Box<dyn EventBackend>,
    feed: ChangeFeed,
    /// (deleted id, author of the deletion)
    deleted_ids: HashSet<(EventId, PubKey)>,
    /// Versions created at or before the timestamp are deleted.
    deleted_addresses: HashMap<ReplaceableKey, Timestamp>,
    closed: bool,
}

impl State {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Removes one event and publishes the removal.
    fn remove_event(
        &mut self,
        claims: &mut ClaimTracker,
        id: &EventId,
    ) -> Result<Option<Arc<Event>>> {
        let Some(removed) = self.backend.remove(id)? else {
            return Ok(None);
        };
        claims.forget(id);
        let seq = self.feed.publish(ChangeKind::Removed, removed.clone());
        debug!(%id, %seq, "event removed");
        Ok(Some(removed))
    }

    fn check_not_deleted(&self, event: &Event) -> Result<()> {
        if self
            .deleted_ids
            .contains(&(event.id.clone(), event.pubkey.clone()))
        {
            return Err(Error::Rejected {
                id: event.id.to_string(),
                reason: "deleted by its author".to_string(),
            });
        }
        if let Some(key) = event.replaceable_key() {
            if let Some(&deleted_until) = self.deleted_addresses.get(&key) {
                if event.created_at <= deleted_until {
                    return Err(Error::Rejected {
                        id: event.id.to_string(),
                        reason: format!("address {key} deleted up to {deleted_until}"),
                    });
                }
            }
        }
        Ok(())
    }

    /// Records what `deletion` deletes so the targets can't come back.
    fn remember_deletion(&mut self, deletion: &Event) {
        for id in deletion.tag_values("e") {
            self.deleted_ids
                .insert((EventId::new(id), deletion.pubkey.clone()));
        }
        for address in deletion.tag_values("a") {
            let Ok(pointer) = AddressPointer::parse(address) else {
                continue;
            };
            if pointer.key.pubkey != deletion.pubkey {
                continue;
            }
            let until = self.deleted_addresses.entry(pointer.key).or_insert(0);
            *until = (*until).max(deletion.created_at);
        }
    }

    /// Applies a kind-5 deletion that was just stored.
    fn apply_deletion(
        &mut self,
        claims: &mut ClaimTracker,
        deletion: &Event,
        remember: bool,
    ) -> Result<usize> {
        let mut removed = 0;

        if remember {
            self.remember_deletion(deletion);
        }

        for id in deletion.tag_values("e") {
            let id = EventId::new(id);
            let Some(target) = self.backend.get(&id)? else {
                continue;
            };
            if target.pubkey != deletion.pubkey || target.kind == Kind::DELETION {
                continue;
            }
            if self.remove_event(claims, &id)?.is_some() {
                removed += 1;
            }
        }

        for address in deletion.tag_values("a") {
            let key = match AddressPointer::parse(address) {
                Ok(pointer) => pointer.key,
                Err(err) => {
                    debug!(deletion = %deletion.id, "skipping a-tag: {err}");
                    continue;
                }
            };
            if key.pubkey != deletion.pubkey {
                continue;
            }
            for version in self.backend.get_replaceable_history(&key)? {
                if version.created_at <= deletion.created_at
                    && self.remove_event(claims, &version.id)?.is_some()
                {
                    removed += 1;
                }
            }
        }

        Ok(removed)
    }
}

struct Shared {
    state: RwLock<State>,
    claims: Mutex<ClaimTracker>,
    config: StoreConfig,
    verifier: RwLock<Option<Verifier>>,
    loader: RwLock<Option<Arc<dyn EventLoader>>>,
}

// =============================================================================
// Event Store
// =============================================================================

/// The shared, thread-safe event store.
///
/// Cloning is cheap and every clone refers to the same store.
///
/// # Example
///
/// ```rust
/// use nestdb::{EventBuilder, EventStore, Filter};
///
/// let store = EventStore::in_memory();
/// let note = EventBuilder::new(1, "79be").created_at(100).content("gm").build();
///
/// let (stored, is_new) = store.add(note.clone())?;
/// assert!(is_new);
/// assert!(!store.add(note)?.1);
///
/// let notes = store.query_timeline(&[Filter::new().kinds([1u16])], false)?;
/// assert_eq!(notes[0].id, stored.id);
/// # Ok::<(), nestdb::Error>(())
/// ```
#[derive(Clone)]
pub struct EventStore {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore")
            .field("config", &self.shared.config)
            .field("claims", &*self.shared.claims.lock())
            .finish_non_exhaustive()
    }
}

impl EventStore {
    // =========================================================================
    // Construction
    // =========================================================================

    /// A store backed by a fresh [`MemoryIndex`] with default configuration.
    pub fn in_memory() -> Self {
        Self::in_memory_with_config(StoreConfig::default())
    }

    /// A fresh in-memory store with the given configuration.
    pub fn in_memory_with_config(config: StoreConfig) -> Self {
        Self::build(Box::new(MemoryIndex::new()), config, Vec::new())
    }

    /// Opens a persistent store: SQLite on disk with an in-memory index in
    /// front ([`HybridBackend`]).
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let backend = HybridBackend::open(path, config.intern_cache_size)?;
        Self::new(backend, config)
    }

    /// Opens a store that reads and writes SQLite directly.
    pub fn open_sqlite(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let backend = SqliteBackend::new(Database::open(path)?, config.intern_cache_size);
        Self::new(backend, config)
    }

    /// Wraps any backend. Events it already holds start out unclaimed, and
    /// stored deletion events are remembered again.
    pub fn new(backend: impl EventBackend + 'static, config: StoreConfig) -> Result<Self> {
        let existing = backend.all()?;
        Ok(Self::build(Box::new(backend), config, existing))
    }

    fn build(
        backend: Box<dyn EventBackend>,
        config: StoreConfig,
        existing: Vec<Arc<Event>>,
    ) -> Self {
        let mut claims = ClaimTracker::new();
        let mut state = State {
            backend,
            feed: ChangeFeed::new(config.feed_capacity),
            deleted_ids: HashSet::new(),
            deleted_addresses: HashMap::new(),
            closed: false,
        };
        for event in &existing {
            claims.track(&event.id);
            if config.remember_deletions && event.kind == Kind::DELETION {
                state.remember_deletion(event);
            }
        }
        if !existing.is_empty() {
            info!(events = existing.len(), "event store opened");
        }
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(state),
                claims: Mutex::new(claims),
                config,
                verifier: RwLock::new(None),
                loader: RwLock::new(None),
            }),
        }
    }

    /// Installs a validity predicate, replacing any previous one.
    pub fn set_verifier(&self, verifier: Verifier) {
        *self.shared.verifier.write() = Some(verifier);
    }

    /// Builder form of [`set_verifier`](Self::set_verifier).
    pub fn with_verifier(self, verifier: impl Fn(&Event) -> bool + Send + Sync + 'static) -> Self {
        self.set_verifier(Arc::new(verifier));
        self
    }

    /// Installs the loader views call when their seed query finds nothing.
    pub fn set_loader(&self, loader: Arc<dyn EventLoader>) {
        *self.shared.loader.write() = Some(loader);
    }

    /// The installed loader, if any.
    pub fn loader(&self) -> Option<Arc<dyn EventLoader>> {
        self.shared.loader.read().clone()
    }

    /// The configuration the store was built with.
    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    fn check_ingest(&self, event: &Event) -> Result<()> {
        if self.shared.config.verify_ids {
            codec::verify_id(event)?;
        }
        if let Some(verifier) = self.shared.verifier.read().as_ref() {
            if !verifier(event) {
                return Err(Error::InvalidEvent {
                    id: event.id.to_string(),
                    reason: "rejected by validity predicate".to_string(),
                });
            }
        }
        if !self.shared.config.keep_expired && event.is_expired(codec::current_time_secs()) {
            return Err(Error::Rejected {
                id: event.id.to_string(),
                reason: "expired".to_string(),
            });
        }
        Ok(())
    }

    /// Stores an event.
    ///
    /// Returns the stored instance and whether it was new. A duplicate id
    /// returns the instance stored earlier and publishes nothing. A new event
    /// publishes exactly one `Inserted`, including an older version of a
    /// replaceable identity (views decide recency themselves).
    ///
    /// # Errors
    ///
    /// - `Error::InvalidEvent` - id mismatch or validity predicate failed
    /// - `Error::Rejected` - expired, or deleted earlier by its author
    /// - backend errors; nothing was stored and nothing published
    ///
    /// A kind-5 event is stored and published before its targets are removed.
    /// If removing a target fails, the error is returned with the deletion
    /// already in place; targets removed before the failure stay removed and
    /// the rest stay stored.
    pub fn add(&self, event: Event) -> Result<(Arc<Event>, bool)> {
        self.check_ingest(&event)?;

        let mut state = self.shared.state.write();
        state.ensure_open()?;

        if let Some(existing) = state.backend.get(&event.id)? {
            return Ok((existing, false));
        }
        if self.shared.config.remember_deletions {
            state.check_not_deleted(&event)?;
        }

        let (stored, is_new) = state.backend.add(event)?;
        if !is_new {
            return Ok((stored, false));
        }

        let mut claims = self.shared.claims.lock();
        claims.track(&stored.id);
        let seq = state.feed.publish(ChangeKind::Inserted, stored.clone());
        debug!(id = %stored.id, kind = %stored.kind, %seq, "event inserted");

        if stored.kind == Kind::DELETION {
            let remember = self.shared.config.remember_deletions;
            match state.apply_deletion(&mut claims, &stored, remember) {
                Ok(0) => {}
                Ok(n) => debug!(deletion = %stored.id, removed = n, "deletion applied"),
                Err(err) => {
                    warn!(deletion = %stored.id, "deletion only partly applied: {err}");
                    return Err(err);
                }
            }
        }

        Ok((stored, true))
    }

    /// Removes an event. Returns whether anything was removed; only then is a
    /// `Removed` notification published.
    pub fn remove(&self, id: &EventId) -> Result<bool> {
        let mut state = self.shared.state.write();
        state.ensure_open()?;
        let mut claims = self.shared.claims.lock();
        Ok(state.remove_event(&mut claims, id)?.is_some())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    fn read<T>(&self, f: impl FnOnce(&dyn EventBackend) -> Result<T>) -> Result<T> {
        let state = self.shared.state.read();
        state.ensure_open()?;
        f(state.backend.as_ref())
    }

    /// Looks up an event by id and marks it recently used.
    pub fn get(&self, id: &EventId) -> Result<Option<Arc<Event>>> {
        let found = self.read(|b| b.get(id))?;
        if found.is_some() {
            self.shared.claims.lock().touch(id);
        }
        Ok(found)
    }

    /// True if the event is stored.
    pub fn has(&self, id: &EventId) -> Result<bool> {
        self.read(|b| b.has(id))
    }

    /// The current version of a replaceable identity.
    pub fn get_replaceable(&self, key: &ReplaceableKey) -> Result<Option<Arc<Event>>> {
        let found = self.read(|b| b.get_replaceable(key))?;
        if let Some(event) = &found {
            self.shared.claims.lock().touch(&event.id);
        }
        Ok(found)
    }

    /// Every retained version of a replaceable identity, most recent first.
    pub fn get_replaceable_history(&self, key: &ReplaceableKey) -> Result<Vec<Arc<Event>>> {
        self.read(|b| b.get_replaceable_history(key))
    }

    /// Resolves a pointer: by id, or to the current version of an address.
    pub fn get_by_pointer(&self, pointer: &Pointer) -> Result<Option<Arc<Event>>> {
        match pointer {
            Pointer::Event(p) => self.get(&p.id),
            Pointer::Address(p) => self.get_replaceable(&p.key),
        }
    }

    /// Events matching any filter, capped at the list's smallest `limit`
    /// (most recent kept). Treat the result as a set.
    ///
    /// # Errors
    ///
    /// `Error::MalformedFilter` before anything is read.
    pub fn query(&self, filters: &[Filter]) -> Result<Vec<Arc<Event>>> {
        filter::validate_all(filters)?;
        self.read(|b| b.query(filters))
    }

    /// Matching events sorted by descending `(created_at, id)`. Replaceable
    /// identities contribute only their most recent matching version unless
    /// `include_old_versions` is set.
    pub fn query_timeline(
        &self,
        filters: &[Filter],
        include_old_versions: bool,
    ) -> Result<Vec<Arc<Event>>> {
        filter::validate_all(filters)?;
        self.read(|b| b.query_timeline(filters, include_old_versions))
    }

    /// Number of stored events.
    pub fn len(&self) -> Result<usize> {
        self.read(|b| b.len())
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    // =========================================================================
    // Change Feed
    // =========================================================================

    /// Subscribes to every change from now on. Past changes are not replayed.
    pub fn subscribe(&self) -> FeedSubscription {
        self.shared.state.read().feed.subscribe()
    }

    /// Sequence number of the last published change.
    pub fn feed_head(&self) -> ChangeSeq {
        self.shared.state.read().feed.head()
    }

    /// Runs `seed` against the backend and subscribes, with no mutation able
    /// to happen in between.
    pub fn snapshot_and_subscribe<T>(
        &self,
        seed: impl FnOnce(&dyn EventBackend) -> Result<T>,
    ) -> Result<Seeded<T>> {
        let state = self.shared.state.read();
        state.ensure_open()?;
        let value = seed(state.backend.as_ref())?;
        Ok(Seeded {
            value,
            subscription: state.feed.subscribe(),
            head: state.feed.head(),
        })
    }

    // =========================================================================
    // Claims
    // =========================================================================

    /// Pins `id` on behalf of `claim`. Returns false if `id` isn't stored.
    pub fn claim(&self, id: &EventId, claim: ClaimId) -> bool {
        self.shared.claims.lock().claim(id, claim)
    }

    /// Releases one pin.
    pub fn remove_claim(&self, id: &EventId, claim: ClaimId) {
        self.shared.claims.lock().remove_claim(id, claim);
    }

    /// Releases every pin held by `claim`.
    pub fn clear_claims(&self, claim: ClaimId) -> usize {
        self.shared.claims.lock().clear_claims(claim)
    }

    /// True if anything pins `id`.
    pub fn is_claimed(&self, id: &EventId) -> bool {
        self.shared.claims.lock().is_claimed(id)
    }

    /// Number of distinct claims on `id`.
    pub fn claim_count(&self, id: &EventId) -> usize {
        self.shared.claims.lock().claim_count(id)
    }

    /// Marks `id` recently used.
    pub fn touch(&self, id: &EventId) {
        self.shared.claims.lock().touch(id);
    }

    /// Snapshot of stored events nothing claims, least recently used first.
    pub fn unclaimed(&self) -> Result<Vec<Arc<Event>>> {
        let ids = self.shared.claims.lock().unclaimed();
        self.read(|b| {
            let mut events = Vec::with_capacity(ids.len());
            for id in &ids {
                if let Some(event) = b.get(id)? {
                    events.push(event);
                }
            }
            Ok(events)
        })
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Evicts up to `max` unclaimed events, least recently used first.
    /// Returns how many were removed.
    pub fn prune(&self, max: usize) -> Result<usize> {
        let mut state = self.shared.state.write();
        state.ensure_open()?;
        let mut claims = self.shared.claims.lock();

        let mut removed = 0;
        for id in claims.unclaimed() {
            if removed >= max {
                break;
            }
            if state.remove_event(&mut claims, &id)?.is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "pruned unclaimed events");
        }
        Ok(removed)
    }

    /// Removes every event whose expiration time has passed.
    pub fn prune_expired(&self) -> Result<usize> {
        let now = codec::current_time_secs();
        let mut state = self.shared.state.write();
        state.ensure_open()?;
        let mut claims = self.shared.claims.lock();

        let expired: Vec<EventId> = state
            .backend
            .all()?
            .into_iter()
            .filter(|e| e.is_expired(now))
            .map(|e| e.id.clone())
            .collect();

        let mut removed = 0;
        for id in &expired {
            if state.remove_event(&mut claims, id)?.is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "pruned expired events");
        }
        Ok(removed)
    }

    /// Closes the backend and ends every feed subscription. Further
    /// operations fail with `Error::Closed`. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut state = self.shared.state.write();
        if state.closed {
            return Ok(());
        }
        state.backend.close()?;
        state.closed = true;
        // Dropping the old sender ends every receiver.
        state.feed = ChangeFeed::new(1);
        info!("event store closed");
        Ok(())
    }

    // =========================================================================
    // Views
    // =========================================================================

    /// A live view of one event by id.
    pub fn event_view(&self, id: impl Into<EventId>) -> Result<LiveView<SingleEventModel>> {
        LiveView::new(self.clone(), SingleEventModel::new(id.into()))
    }

    /// A live view of the current version of a replaceable identity.
    pub fn replaceable_view(&self, key: ReplaceableKey) -> Result<LiveView<ReplaceableModel>> {
        LiveView::new(self.clone(), ReplaceableModel::new(key))
    }

    /// A live, sorted timeline of events matching `filters`.
    pub fn timeline_view(&self, filters: Vec<Filter>) -> Result<LiveView<TimelineModel>> {
        filter::validate_all(&filters)?;
        LiveView::new(self.clone(), TimelineModel::new(filters, false))
    }

    /// Like [`timeline_view`](Self::timeline_view) but keeps superseded
    /// versions of replaceable events.
    pub fn timeline_view_with_history(
        &self,
        filters: Vec<Filter>,
    ) -> Result<LiveView<TimelineModel>> {
        filter::validate_all(&filters)?;
        LiveView::new(self.clone(), TimelineModel::new(filters, true))
    }
}

// =============================================================================
// Tests
// =============================================================================
