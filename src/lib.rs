//! # NestDB - Reactive Event Store
//!
//! NestDB is an in-process store for signed, Nostr-style events. It provides:
//!
//! - **Indexed storage**: by id, kind, author, single-letter tag and time
//! - **Replaceable identities**: latest-version lookup with retained history
//! - **A change feed**: every insert and removal, in order, to any number of
//!   subscribers
//! - **Live views**: single event, replaceable and timeline models that stay
//!   current without re-querying
//! - **Claims**: events held by a view survive pruning
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │          Live Views (event / replaceable / timeline)            │
//! │        seed from snapshot, follow the feed, hold claims         │
//! └───────────────▲─────────────────────────────────┬───────────────┘
//!                 │ StoreChange                     │ claim / release
//!                 │                                 ▼
//! ┌───────────────┴─────────────────────────────────────────────────┐
//! │                          EventStore                             │
//! │                                                                 │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐  │
//! │  │ Change Feed │  │Claim Tracker│  │ Validity / Deletions    │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────────┘  │
//! └───────────────────────────────┬─────────────────────────────────┘
//!                                 │ EventBackend
//!            ┌────────────────────┼────────────────────┐
//!            ▼                    ▼                    ▼
//!      MemoryIndex          SqliteBackend        HybridBackend
//!                                               (SQLite + memory)
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Unique ids**: an event is stored at most once; re-adding is a no-op
//! 2. **One current version**: per replaceable identity the most recent
//!    version wins, ties broken by the higher id
//! 3. **Atomic publish**: a change is published exactly when the backend
//!    mutation happened, and subscribers see changes in mutation order
//! 4. **Gapless seeding**: a view's snapshot and its subscription meet with
//!    nothing lost and nothing repeated
//! 5. **Claims**: an event claimed by a live view is never pruned
//!
//! ## Module Organization
//!
//! - [`error`]: Error type for every failure mode
//! - [`types`]: Events, ids, kinds, tags and replaceable keys
//! - [`codec`]: Canonical serialization and id hashing
//! - [`filter`]: Filter model and evaluator
//! - [`pointer`]: Event and address pointers
//! - [`backend`]: The storage trait
//! - [`index`], [`sqlite`], [`hybrid`]: Backend implementations
//! - [`feed`]: Change feed
//! - [`claims`]: Claim tracking and recency
//! - [`store`]: The event store (main entry point)
//! - [`models`]: Live views
//! - [`api`]: Async handle

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for NestDB operations.
pub mod error;

/// Domain types: events, identities and the event builder.
pub mod types;

/// Canonical event serialization, id computation and JSON codec.
pub mod codec;

/// Event and address pointers.
pub mod pointer;

/// Filters and the matching rules they follow.
pub mod filter;

/// The backend trait and shared query shaping.
pub mod backend;

/// In-memory indexed backend.
pub mod index;

/// SQLite schema definitions and database initialization.
///
/// Holds the DDL for every table and the logic to initialize a new database
/// or verify an existing one.
pub mod schema;

/// Durable SQLite backend.
pub mod sqlite;

/// SQLite backend fronted by an in-memory index.
pub mod hybrid;

/// Ordered change notifications.
pub mod feed;

/// Claim tracking.
///
/// Views claim the events they hold; pruning only evicts unclaimed events,
/// least recently used first.
pub mod claims;

/// Store configuration from defaults and environment.
pub mod config;

/// The event store.
///
/// The main entry point is [`EventStore`](store::EventStore).
pub mod store;

/// Live views and the model registry.
pub mod models;

/// Async handle running store calls on a dedicated thread.
pub mod api;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::StoreHandle;
pub use backend::EventBackend;
pub use claims::ClaimId;
pub use config::StoreConfig;
pub use error::{Error, Result};
pub use feed::{ChangeKind, ChangeSeq, FeedSubscription, StoreChange};
pub use filter::Filter;
pub use hybrid::HybridBackend;
pub use index::MemoryIndex;
pub use models::{
    ErasedView, EventLoader, LiveView, Model, ModelOutput, ModelRegistry, ReplaceableModel,
    SingleEventModel, TimelineModel, TimelineSnapshot, ViewState, ViewWatch,
};
pub use pointer::{AddressPointer, EventPointer, Pointer};
pub use schema::Database;
pub use sqlite::SqliteBackend;
pub use store::{EventStore, Seeded, Verifier};
pub use types::{Event, EventBuilder, EventId, Kind, KindClass, PubKey, ReplaceableKey, Tag, Timestamp};
