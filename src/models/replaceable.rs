//! View of the current version of a replaceable identity.
//!
//! ```text
//!            seed: found                 insert: strictly newer
//! Unseeded ──────────────► Current(e) ◄──────────────────────┐
//!     │                       │  └───────────────────────────┘
//!     │ seed: none            │ remove e itself
//!     ▼                       ▼
//!  Missing ◄──── reseed ── (re-query)  ──► Current(next most recent)
//!     │
//!     └── insert of this identity ──► Current(e)
//! ```
//!
//! Removing an older version while a newer one is current is ignored.
//! Removing the current version triggers a re-seed: the driver takes a fresh
//! snapshot, so the view moves straight to the next most recent version if
//! one is retained and never reports `Missing` in between.
//!
//! "Newer" uses the store's recency order: later `created_at`, then higher id.

use crate::backend::EventBackend;
use crate::error::Result;
use crate::feed::{ChangeKind, StoreChange};
use crate::pointer::{AddressPointer, Pointer};
use crate::types::{EventId, ReplaceableKey};

use super::{Model, Reaction, ViewState};

/// Shows the latest version of `(kind, pubkey, identifier)`.
#[derive(Debug)]
pub struct ReplaceableModel {
    key: ReplaceableKey,
    state: ViewState,
}

impl ReplaceableModel {
    /// A view of `key`, unseeded.
    pub fn new(key: ReplaceableKey) -> Self {
        Self {
            key,
            state: ViewState::Unseeded,
        }
    }

    /// The identity this view follows.
    pub fn key(&self) -> &ReplaceableKey {
        &self.key
    }
}

impl Model for ReplaceableModel {
    type Output = ViewState;

    fn seed(&mut self, backend: &dyn EventBackend) -> Result<()> {
        self.state = match backend.get_replaceable(&self.key)? {
            Some(event) => ViewState::Current(event),
            None => ViewState::Missing,
        };
        Ok(())
    }

    fn apply(&mut self, change: &StoreChange) -> Reaction {
        if change.event.replaceable_key().as_ref() != Some(&self.key) {
            return Reaction::Ignored;
        }

        match change.kind {
            ChangeKind::Inserted => match &self.state {
                ViewState::Current(held) if !change.event.is_newer_than(held) => Reaction::Ignored,
                _ => {
                    self.state = ViewState::Current(change.event.clone());
                    Reaction::Updated
                }
            },
            ChangeKind::Removed => match &self.state {
                ViewState::Current(held) if held.id == change.event.id => {
                    self.state = ViewState::Missing;
                    Reaction::Reseed
                }
                _ => Reaction::Ignored,
            },
        }
    }

    fn output(&self) -> ViewState {
        self.state.clone()
    }

    fn held(&self) -> Vec<EventId> {
        self.state.event().map(|e| e.id.clone()).into_iter().collect()
    }

    fn missing(&self) -> Option<Pointer> {
        Some(Pointer::Address(AddressPointer::new(self.key.clone())))
    }

    fn reset(&mut self) {
        self.state = ViewState::Unseeded;
    }
}
