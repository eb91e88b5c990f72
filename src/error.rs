//! # Error Handling for NestDB
//!
//! This module defines the error types used throughout NestDB. A single error
//! enum ([`Error`]) covers every failure mode so callers can match on one type
//! whether they talk to the in-memory index, the SQLite backend, or the async
//! handle.
//!
//! ## Error Categories
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Backend | SQLite error, closed store | Surface to caller, retry later |
//! | Rejected | Bad id, expired, deleted | Drop the event |
//! | Filter | Unknown key, bad tag name | Fix the caller |
//! | Feed | Subscriber lagged | Re-seed from a query |
//!
//! ## What Is NOT an Error
//!
//! Looking up an event that isn't stored is a normal outcome. Getters return
//! `Option` or an empty collection, never `Err`.
//!
//! Index invariant violations (a tag row pointing at an event the id index
//! doesn't know) are programming errors and panic instead of being reported
//! here.

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in NestDB operations.
///
/// # Example
///
/// ```rust,ignore
/// use nestdb::{Error, Filter};
///
/// match Filter::from_value(&serde_json::json!({ "search": "cats" })) {
///     Err(Error::MalformedFilter(reason)) => eprintln!("bad filter: {reason}"),
///     _ => unreachable!(),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Backend Failures (recoverable, surfaced to the caller)
    // =========================================================================

    /// SQLite operation failed.
    ///
    /// The SQLite backend wraps every write in a transaction, so when this is
    /// returned from `add` or `remove` nothing was committed and the in-memory
    /// index was not touched.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Stored event JSON could not be encoded or decoded.
    #[error("event codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// A pluggable backend failed for a reason that isn't SQLite-specific.
    #[error("backend failure: {0}")]
    Backend(String),

    /// Schema version mismatch or corruption detected.
    #[error("schema error: {0}")]
    Schema(String),

    /// The store (or its actor thread) has been closed.
    #[error("store is closed")]
    Closed,

    // =========================================================================
    // Ingest Rejections (the event is dropped, the store is unchanged)
    // =========================================================================

    /// The event failed the validity predicate or its id does not match the
    /// hash of its contents.
    #[error("invalid event '{id}': {reason}")]
    InvalidEvent {
        /// Id carried by the rejected event
        id: String,
        /// Human-readable reason
        reason: String,
    },

    /// The event is well formed but store policy refuses it (it already
    /// expired, or a deletion event removed it earlier).
    #[error("event '{id}' rejected: {reason}")]
    Rejected {
        /// Id carried by the rejected event
        id: String,
        /// Human-readable reason
        reason: String,
    },

    // =========================================================================
    // Query Errors
    // =========================================================================

    /// A filter used a constraint shape the evaluator does not support.
    ///
    /// Filters are validated synchronously before any index is touched. An
    /// unsupported key is never silently ignored, because ignoring it would
    /// widen the result set.
    #[error("malformed filter: {0}")]
    MalformedFilter(String),

    /// An address pointer (`kind:pubkey:identifier`) could not be parsed.
    #[error("invalid pointer: {0}")]
    InvalidPointer(String),

    // =========================================================================
    // Change Feed / Views
    // =========================================================================

    /// A feed subscriber fell behind and `n` notifications were dropped.
    ///
    /// Views react to this by re-seeding from a fresh query.
    #[error("subscription lagged: {0} notifications dropped")]
    SubscriptionLagged(u64),

    /// The missing-event loader failed.
    #[error("loader error: {0}")]
    Loader(String),

    /// A model registry lookup named a key nothing was registered under.
    #[error("unknown model '{0}'")]
    UnknownModel(String),

    /// Model parameters were missing or had the wrong shape.
    #[error("invalid model parameters: {0}")]
    InvalidModelParams(String),
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
