//! # Reactive Views
//!
//! A view is a small state machine driven by two inputs: a seed taken from a
//! consistent snapshot, and the changes published after it.
//!
//! ```text
//!            snapshot_and_subscribe
//!  EventStore ───────────────────────► Model::seed(backend)
//!      │                                    │
//!      │ StoreChange (Inserted / Removed)   ▼
//!      └──────────────────────────────► Model::apply(change) ──► Reaction
//!                                           │
//!                                           ▼
//!                                  LiveView: output, claims
//! ```
//!
//! [`Model`] implementations hold only their own state and never touch the
//! store directly. [`LiveView`] does the plumbing: it owns the feed
//! subscription, re-seeds when a model asks for it (or when the subscription
//! lagged), keeps the store's claims in sync with what the model holds, and
//! calls the [`EventLoader`] once when a seed comes back empty.
//!
//! Three models ship with the crate:
//!
//! | Model | Output |
//! |-------|--------|
//! | [`SingleEventModel`] | [`ViewState`] of one event id |
//! | [`ReplaceableModel`] | [`ViewState`] of the current version of an identity |
//! | [`TimelineModel`] | [`TimelineSnapshot`], most recent first |

mod event;
mod live;
mod registry;
mod replaceable;
mod timeline;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::backend::EventBackend;
use crate::error::Result;
use crate::feed::StoreChange;
use crate::pointer::Pointer;
use crate::types::{Event, EventId};

pub use event::SingleEventModel;
pub use live::{LiveView, ViewWatch};
pub use registry::{ErasedView, ModelFactory, ModelOutput, ModelRegistry};
pub use replaceable::ReplaceableModel;
pub use timeline::{TimelineModel, TimelineSnapshot};

// =============================================================================
// Model Trait
// =============================================================================

/// What a model wants after seeing a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    /// The change didn't concern this model.
    Ignored,
    /// State was updated in place.
    Updated,
    /// State can't be derived from the change alone; take a fresh snapshot.
    Reseed,
}

/// A view's state machine.
pub trait Model: Send + 'static {
    /// What the view exposes. Compared against the previous output to decide
    /// whether watchers are woken.
    type Output: Clone + PartialEq + Send + Sync + 'static;

    /// Rebuilds state from a consistent snapshot.
    fn seed(&mut self, backend: &dyn EventBackend) -> Result<()>;

    /// Folds one change into the state.
    fn apply(&mut self, change: &StoreChange) -> Reaction;

    /// The current output.
    fn output(&self) -> Self::Output;

    /// Ids of the events the state references. The driver claims them.
    fn held(&self) -> Vec<EventId>;

    /// What to ask the loader for if seeding found nothing.
    fn missing(&self) -> Option<Pointer> {
        None
    }

    /// Drops all state. Called when the view is torn down.
    fn reset(&mut self);
}

// =============================================================================
// Single-Value State
// =============================================================================

/// State of a single-value view.
///
/// Equality compares event ids, so re-delivery of the same event is not a
/// change.
#[derive(Debug, Clone, Default)]
pub enum ViewState {
    /// Not seeded yet.
    #[default]
    Unseeded,
    /// The event the view currently shows.
    Current(Arc<Event>),
    /// Seeded, and nothing to show.
    Missing,
}

impl ViewState {
    /// The current event, if any.
    pub fn event(&self) -> Option<&Arc<Event>> {
        match self {
            ViewState::Current(event) => Some(event),
            _ => None,
        }
    }

    /// True for `Missing`.
    pub fn is_missing(&self) -> bool {
        matches!(self, ViewState::Missing)
    }

    fn id(&self) -> Option<&EventId> {
        self.event().map(|e| &e.id)
    }
}

impl PartialEq for ViewState {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ViewState::Unseeded, ViewState::Unseeded) => true,
            (ViewState::Missing, ViewState::Missing) => true,
            (ViewState::Current(_), ViewState::Current(_)) => self.id() == other.id(),
            _ => false,
        }
    }
}

impl Eq for ViewState {}

impl fmt::Display for ViewState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViewState::Unseeded => write!(f, "unseeded"),
            ViewState::Current(event) => write!(f, "current({})", event.id),
            ViewState::Missing => write!(f, "missing"),
        }
    }
}

// =============================================================================
// Loader
// =============================================================================

/// Fetches an event the store doesn't have, typically from the network.
///
/// Views call the loader at most once, in a spawned task, and feed a returned
/// event through [`crate::store::EventStore::add`]; the view then picks it up
/// from the change feed like any other insert. Errors are logged and leave the
/// view `Missing`.
///
/// Any `Fn(Pointer) -> impl Future<Output = Result<Option<Event>>>` is a
/// loader:
///
/// ```rust,ignore
/// store.set_loader(Arc::new(|pointer: Pointer| async move {
///     relay_pool.fetch(pointer).await
/// }));
/// ```
pub trait EventLoader: Send + Sync {
    /// Loads the event `pointer` refers to.
    fn load(&self, pointer: Pointer) -> BoxFuture<'static, Result<Option<Event>>>;
}

impl<F, Fut> EventLoader for F
where
    F: Fn(Pointer) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<Event>>> + Send + 'static,
{
    fn load(&self, pointer: Pointer) -> BoxFuture<'static, Result<Option<Event>>> {
        Box::pin(self(pointer))
    }
}
