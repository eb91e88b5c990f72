//! # SQLite Schema for NestDB
//!
//! This module defines the tables the SQL backend persists events in and
//! handles initialization.
//!
//! ## Table Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                          Schema Overview                            │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                                                                     │
//! │  events                 event_tags             replaceable          │
//! │  ┌──────────────┐       ┌──────────────┐       ┌──────────────┐     │
//! │  │ id (PK)      │◄──────│ event_id     │       │ event_id (PK)│─┐   │
//! │  │ pubkey       │       │ name         │       │ kind         │ │   │
//! │  │ kind         │       │ value        │       │ pubkey       │ │   │
//! │  │ created_at   │       └──────────────┘       │ identifier   │ │   │
//! │  │ raw (JSON)   │◄─────────────────────────────│ created_at   │◄┘   │
//! │  └──────────────┘                              └──────────────┘     │
//! │                                                                     │
//! │  nestdb_metadata (schema_version)                                   │
//! │                                                                     │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! One `add` writes one `events` row, one `event_tags` row per distinct
//! indexable tag, and (for replaceable kinds) one `replaceable` row, all in a
//! single transaction.
//!
//! ## Why a `replaceable` Table?
//!
//! The current version of an identity is the first row of
//! `ORDER BY created_at DESC, event_id DESC` over its history. Keeping history
//! rows in their own narrow table makes that an index-only lookup instead of a
//! scan over `events` filtered by a `d` tag.

use std::path::Path;

use rusqlite::Connection;

use crate::error::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment when making breaking schema changes.
///
/// There are no migrations; a mismatched database is refused.
const SCHEMA_VERSION: i32 = 1;

// =============================================================================
// DDL Statements
// =============================================================================

/// One row per stored event.
///
/// `raw` is the full event JSON (see [`crate::codec::encode_event`]). The other
/// columns duplicate fields of `raw` so filters can be answered by indexes.
const CREATE_EVENTS: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id         TEXT PRIMARY KEY,
    pubkey     TEXT NOT NULL,
    kind       INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    raw        TEXT NOT NULL
)
"#;

const CREATE_EVENTS_KIND_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS events_kind
ON events(kind, created_at)
"#;

const CREATE_EVENTS_PUBKEY_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS events_pubkey
ON events(pubkey, created_at)
"#;

const CREATE_EVENTS_CREATED_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS events_created
ON events(created_at)
"#;

/// Inverted index over indexable tags (single-letter name with a value).
///
/// Duplicate tags on one event collapse to one row.
const CREATE_EVENT_TAGS: &str = r#"
CREATE TABLE IF NOT EXISTS event_tags (
    event_id TEXT NOT NULL,
    name     TEXT NOT NULL,
    value    TEXT NOT NULL,
    PRIMARY KEY (event_id, name, value)
)
"#;

const CREATE_EVENT_TAGS_LOOKUP_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS event_tags_lookup
ON event_tags(name, value)
"#;

/// Replaceable history rows, one per stored version.
const CREATE_REPLACEABLE: &str = r#"
CREATE TABLE IF NOT EXISTS replaceable (
    event_id   TEXT PRIMARY KEY,
    kind       INTEGER NOT NULL,
    pubkey     TEXT NOT NULL,
    identifier TEXT NOT NULL,
    created_at INTEGER NOT NULL
)
"#;

const CREATE_REPLACEABLE_KEY_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS replaceable_key
ON replaceable(kind, pubkey, identifier, created_at DESC, event_id DESC)
"#;

/// Key-value metadata, currently only `schema_version`.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS nestdb_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the NestDB schema applied.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Schema` if the schema version doesn't match
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use nestdb::Database;
    ///
    /// let db = Database::open("events.db")?;
    /// # Ok::<(), nestdb::Error>(())
    /// ```
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Creates an in-memory database. Contents are lost on drop.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    fn initialize(&mut self) -> Result<()> {
        // WAL: readers see a consistent snapshot while a write is in flight.
        self.conn.execute_batch("PRAGMA journal_mode = WAL")?;
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;

        self.conn.execute_batch(CREATE_METADATA)?;
        self.conn.execute_batch(CREATE_EVENTS)?;
        self.conn.execute_batch(CREATE_EVENTS_KIND_INDEX)?;
        self.conn.execute_batch(CREATE_EVENTS_PUBKEY_INDEX)?;
        self.conn.execute_batch(CREATE_EVENTS_CREATED_INDEX)?;
        self.conn.execute_batch(CREATE_EVENT_TAGS)?;
        self.conn.execute_batch(CREATE_EVENT_TAGS_LOOKUP_INDEX)?;
        self.conn.execute_batch(CREATE_REPLACEABLE)?;
        self.conn.execute_batch(CREATE_REPLACEABLE_KEY_INDEX)?;

        self.verify_or_set_version()
    }

    fn verify_or_set_version(&mut self) -> Result<()> {
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM nestdb_metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        match existing {
            None => {
                self.conn.execute(
                    "INSERT INTO nestdb_metadata (key, value) VALUES ('schema_version', ?)",
                    [SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v == SCHEMA_VERSION.to_string() => {}
            Some(v) => {
                return Err(Error::Schema(format!(
                    "schema version mismatch: database has version {v}, but this NestDB version requires {SCHEMA_VERSION}"
                )));
            }
        }

        Ok(())
    }

    /// The underlying connection, for the SQL backend.
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Mutable access, needed to open transactions.
    pub(crate) fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

// =============================================================================
// Tests
// =============================================================================
