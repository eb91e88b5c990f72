//! # SQLite Backend
//!
//! Persists events in the tables defined in [`crate::schema`].
//!
//! ## Atomic Writes
//!
//! Every `add` runs in one transaction:
//!
//! ```text
//! BEGIN
//!   INSERT events        (id, pubkey, kind, created_at, raw)
//!   INSERT event_tags    one row per distinct indexable tag
//!   INSERT replaceable   only for replaceable / addressable kinds
//! COMMIT                 ── any failure: the transaction is dropped,
//!                           SQLite rolls back, Err is returned
//! ```
//!
//! `remove` deletes from the three tables in one transaction the same way.
//!
//! ## Interning
//!
//! Decoded events are kept in an LRU map keyed by id, so repeated reads of a
//! hot event return the same `Arc` and skip JSON decoding. Entries are only
//! inserted after a commit or a successful read, so the cache never holds an
//! event the database doesn't.

use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::{debug, warn};

use crate::backend::{self, EventBackend};
use crate::codec::{decode_event, encode_event};
use crate::config::DEFAULT_INTERN_CACHE_SIZE;
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::schema::Database;
use crate::types::{Event, EventId, ReplaceableKey, Timestamp};

struct Inner {
    /// `None` once closed.
    db: Option<Database>,
    interned: LruCache<EventId, Arc<Event>>,
}

impl Inner {
    fn conn(&self) -> Result<&Connection> {
        self.db.as_ref().map(Database::connection).ok_or(Error::Closed)
    }

    /// Loads an event by id through the intern cache.
    fn load(&mut self, id: &EventId) -> Result<Option<Arc<Event>>> {
        if let Some(event) = self.interned.get(id) {
            return Ok(Some(event.clone()));
        }
        let raw: Option<String> = self
            .conn()?
            .query_row("SELECT raw FROM events WHERE id = ?", [id.as_str()], |row| {
                row.get(0)
            })
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(self.intern(decode_event(&raw)?))),
            None => Ok(None),
        }
    }

    /// Returns the cached instance for `event.id`, caching `event` if absent.
    fn intern(&mut self, event: Event) -> Arc<Event> {
        if let Some(existing) = self.interned.get(&event.id) {
            return existing.clone();
        }
        let event = Arc::new(event);
        self.interned.put(event.id.clone(), event.clone());
        event
    }

    /// Runs a statement returning `(id, raw)` rows and interns the events.
    fn load_rows(&mut self, sql: &str, params: Vec<SqlValue>) -> Result<Vec<Arc<Event>>> {
        let rows: Vec<(String, String)> = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare_cached(sql)?;
            let rows = stmt.query_map(params_from_iter(params), |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        let mut events = Vec::with_capacity(rows.len());
        for (id, raw) in rows {
            let id = EventId::new(id);
            if let Some(event) = self.interned.get(&id) {
                events.push(event.clone());
                continue;
            }
            events.push(self.intern(decode_event(&raw)?));
        }
        Ok(events)
    }
}

/// Event storage in a SQLite database.
pub struct SqliteBackend {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SqliteBackend")
            .field("open", &inner.db.is_some())
            .field("interned", &inner.interned.len())
            .finish()
    }
}

impl SqliteBackend {
    /// Opens (or creates) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Database::open(path)?, DEFAULT_INTERN_CACHE_SIZE))
    }

    /// Opens an in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?, DEFAULT_INTERN_CACHE_SIZE))
    }

    /// Wraps an initialized database, interning up to `intern_cache_size`
    /// decoded events.
    pub fn new(db: Database, intern_cache_size: usize) -> Self {
        let capacity = NonZeroUsize::new(intern_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                db: Some(db),
                interned: LruCache::new(capacity),
            }),
        }
    }

    fn write_event(conn: &mut Connection, event: &Event) -> Result<()> {
        let raw = encode_event(event)?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO events (id, pubkey, kind, created_at, raw) VALUES (?, ?, ?, ?, ?)",
            params![
                event.id.as_str(),
                event.pubkey.as_str(),
                i64::from(event.kind.as_u16()),
                sql_timestamp(event.created_at),
                raw,
            ],
        )?;

        let tags: BTreeSet<(char, &str)> = event.indexable_tags().collect();
        for (name, value) in tags {
            tx.execute(
                "INSERT INTO event_tags (event_id, name, value) VALUES (?, ?, ?)",
                params![event.id.as_str(), name.to_string(), value],
            )?;
        }

        if let Some(key) = event.replaceable_key() {
            tx.execute(
                "INSERT INTO replaceable (event_id, kind, pubkey, identifier, created_at)
                 VALUES (?, ?, ?, ?, ?)",
                params![
                    event.id.as_str(),
                    i64::from(key.kind.as_u16()),
                    key.pubkey.as_str(),
                    key.identifier,
                    sql_timestamp(event.created_at),
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn delete_event(conn: &mut Connection, id: &EventId) -> Result<()> {
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM event_tags WHERE event_id = ?", [id.as_str()])?;
        tx.execute("DELETE FROM replaceable WHERE event_id = ?", [id.as_str()])?;
        tx.execute("DELETE FROM events WHERE id = ?", [id.as_str()])?;
        tx.commit()?;
        Ok(())
    }

    fn replaceable_rows(&self, key: &ReplaceableKey, limit: Option<usize>) -> Result<Vec<Arc<Event>>> {
        let mut sql = String::from(
            "SELECT e.id, e.raw FROM replaceable r JOIN events e ON e.id = r.event_id
             WHERE r.kind = ? AND r.pubkey = ? AND r.identifier = ?
             ORDER BY r.created_at DESC, r.event_id DESC",
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let params = vec![
            SqlValue::Integer(i64::from(key.kind.as_u16())),
            SqlValue::Text(key.pubkey.to_string()),
            SqlValue::Text(key.identifier.clone()),
        ];
        self.inner.lock().load_rows(&sql, params)
    }

    fn matches(&self, filters: &[Filter]) -> Result<Vec<Arc<Event>>> {
        let mut inner = self.inner.lock();
        let mut found: HashMap<EventId, Arc<Event>> = HashMap::new();
        for filter in filters {
            if filter.matches_nothing() {
                continue;
            }
            let (sql, params) = filter_sql(filter);
            for event in inner.load_rows(&sql, params)? {
                found.entry(event.id.clone()).or_insert(event);
            }
        }
        Ok(found.into_values().collect())
    }

    /// Runs raw SQL against the database. Test-only fault injection.
    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        self.inner.lock().conn()?.execute_batch(sql)?;
        Ok(())
    }
}

// =============================================================================
// Filter Translation
// =============================================================================

/// SQLite integers are signed; timestamps past `i64::MAX` saturate on both
/// the write and the query side.
fn sql_timestamp(ts: Timestamp) -> i64 {
    i64::try_from(ts).unwrap_or(i64::MAX)
}

fn timestamp_param(ts: Timestamp) -> SqlValue {
    SqlValue::Integer(sql_timestamp(ts))
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Translates one filter into `SELECT id, raw` with bound parameters.
///
/// Empty constraint sets never reach here (`matches_nothing` is checked
/// first), so every `IN (...)` list is non-empty.
fn filter_sql(filter: &Filter) -> (String, Vec<SqlValue>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut params: Vec<SqlValue> = Vec::new();

    if let Some(ids) = &filter.ids {
        clauses.push(format!("e.id IN ({})", placeholders(ids.len())));
        params.extend(ids.iter().map(|id| SqlValue::Text(id.to_string())));
    }
    if let Some(kinds) = &filter.kinds {
        clauses.push(format!("e.kind IN ({})", placeholders(kinds.len())));
        params.extend(kinds.iter().map(|k| SqlValue::Integer(i64::from(k.as_u16()))));
    }
    if let Some(authors) = &filter.authors {
        clauses.push(format!("e.pubkey IN ({})", placeholders(authors.len())));
        params.extend(authors.iter().map(|a| SqlValue::Text(a.to_string())));
    }
    if let Some(since) = filter.since {
        clauses.push("e.created_at >= ?".to_string());
        params.push(timestamp_param(since));
    }
    if let Some(until) = filter.until {
        clauses.push("e.created_at <= ?".to_string());
        params.push(timestamp_param(until));
    }
    for (name, values) in &filter.tags {
        clauses.push(format!(
            "EXISTS (SELECT 1 FROM event_tags t WHERE t.event_id = e.id AND t.name = ? AND t.value IN ({}))",
            placeholders(values.len())
        ));
        params.push(SqlValue::Text(name.to_string()));
        params.extend(values.iter().map(|v| SqlValue::Text(v.clone())));
    }

    let mut sql = String::from("SELECT e.id, e.raw FROM events e");
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    (sql, params)
}

// =============================================================================
// Backend Implementation
// =============================================================================

impl EventBackend for SqliteBackend {
    fn add(&mut self, event: Event) -> Result<(Arc<Event>, bool)> {
        let inner = self.inner.get_mut();
        if let Some(existing) = inner.load(&event.id)? {
            return Ok((existing, false));
        }

        let db = inner.db.as_mut().ok_or(Error::Closed)?;
        if let Err(err) = Self::write_event(db.connection_mut(), &event) {
            warn!(id = %event.id, "insert rolled back: {err}");
            return Err(err);
        }
        debug!(id = %event.id, kind = %event.kind, "event persisted");
        Ok((inner.intern(event), true))
    }

    fn remove(&mut self, id: &EventId) -> Result<Option<Arc<Event>>> {
        let inner = self.inner.get_mut();
        let Some(event) = inner.load(id)? else {
            return Ok(None);
        };

        let db = inner.db.as_mut().ok_or(Error::Closed)?;
        if let Err(err) = Self::delete_event(db.connection_mut(), id) {
            warn!(%id, "delete rolled back: {err}");
            return Err(err);
        }
        inner.interned.pop(id);
        Ok(Some(event))
    }

    fn get(&self, id: &EventId) -> Result<Option<Arc<Event>>> {
        self.inner.lock().load(id)
    }

    fn has(&self, id: &EventId) -> Result<bool> {
        let inner = self.inner.lock();
        if inner.interned.contains(id) {
            return Ok(true);
        }
        let found: Option<i64> = inner
            .conn()?
            .query_row("SELECT 1 FROM events WHERE id = ?", [id.as_str()], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(found.is_some())
    }

    fn get_replaceable(&self, key: &ReplaceableKey) -> Result<Option<Arc<Event>>> {
        Ok(self.replaceable_rows(key, Some(1))?.into_iter().next())
    }

    fn get_replaceable_history(&self, key: &ReplaceableKey) -> Result<Vec<Arc<Event>>> {
        self.replaceable_rows(key, None)
    }

    fn query(&self, filters: &[Filter]) -> Result<Vec<Arc<Event>>> {
        Ok(backend::shape_query(self.matches(filters)?, filters))
    }

    fn query_timeline(
        &self,
        filters: &[Filter],
        include_old_versions: bool,
    ) -> Result<Vec<Arc<Event>>> {
        Ok(backend::shape_timeline(
            self.matches(filters)?,
            filters,
            include_old_versions,
        ))
    }

    fn len(&self) -> Result<usize> {
        let inner = self.inner.lock();
        let count: i64 = inner
            .conn()?
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn all(&self) -> Result<Vec<Arc<Event>>> {
        self.inner
            .lock()
            .load_rows("SELECT e.id, e.raw FROM events e", Vec::new())
    }

    fn close(&mut self) -> Result<()> {
        let inner = self.inner.get_mut();
        inner.interned.clear();
        if let Some(db) = inner.db.take() {
            drop(db);
            debug!("sqlite backend closed");
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
