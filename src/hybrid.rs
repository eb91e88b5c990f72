//! Memory cache in front of SQLite.
//!
//! Reads are served entirely by a [`MemoryIndex`] that is warmed from the
//! database at open. Writes go to SQLite first and reach memory only after the
//! SQL transaction committed, so memory never leads disk: a failed write
//! leaves both sides unchanged.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::backend::EventBackend;
use crate::error::Result;
use crate::filter::Filter;
use crate::index::MemoryIndex;
use crate::schema::Database;
use crate::sqlite::SqliteBackend;
use crate::types::{Event, EventId, ReplaceableKey};

/// Write-through backend: durable in SQLite, queried in memory.
#[derive(Debug)]
pub struct HybridBackend {
    memory: MemoryIndex,
    sql: SqliteBackend,
}

impl HybridBackend {
    /// Opens a database file and loads every stored event into memory.
    pub fn open(path: impl AsRef<Path>, intern_cache_size: usize) -> Result<Self> {
        Self::from_sql(SqliteBackend::new(Database::open(path)?, intern_cache_size))
    }

    /// Wraps an existing SQL backend, warming memory from it.
    pub fn from_sql(sql: SqliteBackend) -> Result<Self> {
        let mut memory = MemoryIndex::new();
        for event in sql.all()? {
            memory.insert_arc(event);
        }
        info!(events = memory.len()?, "hybrid backend warmed from sqlite");
        Ok(Self { memory, sql })
    }

    #[cfg(test)]
    pub(crate) fn sql(&self) -> &SqliteBackend {
        &self.sql
    }
}

impl EventBackend for HybridBackend {
    fn add(&mut self, event: Event) -> Result<(Arc<Event>, bool)> {
        if let Some(existing) = self.memory.get(&event.id)? {
            return Ok((existing, false));
        }
        let (stored, _) = self.sql.add(event)?;
        Ok(self.memory.insert_arc(stored))
    }

    fn remove(&mut self, id: &EventId) -> Result<Option<Arc<Event>>> {
        if !self.memory.has(id)? {
            return Ok(None);
        }
        self.sql.remove(id)?;
        self.memory.remove(id)
    }

    fn get(&self, id: &EventId) -> Result<Option<Arc<Event>>> {
        self.memory.get(id)
    }

    fn has(&self, id: &EventId) -> Result<bool> {
        self.memory.has(id)
    }

    fn get_replaceable(&self, key: &ReplaceableKey) -> Result<Option<Arc<Event>>> {
        self.memory.get_replaceable(key)
    }

    fn get_replaceable_history(&self, key: &ReplaceableKey) -> Result<Vec<Arc<Event>>> {
        self.memory.get_replaceable_history(key)
    }

    fn query(&self, filters: &[Filter]) -> Result<Vec<Arc<Event>>> {
        self.memory.query(filters)
    }

    fn query_timeline(
        &self,
        filters: &[Filter],
        include_old_versions: bool,
    ) -> Result<Vec<Arc<Event>>> {
        self.memory.query_timeline(filters, include_old_versions)
    }

    fn len(&self) -> Result<usize> {
        self.memory.len()
    }

    fn all(&self) -> Result<Vec<Arc<Event>>> {
        self.memory.all()
    }

    fn close(&mut self) -> Result<()> {
        self.sql.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventBuilder, Kind};

    #[test]
    fn test_warm_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hybrid.db");
        let profile = EventBuilder::new(0, "pk").created_at(5).build();

        {
            let mut backend = HybridBackend::open(&path, 16).unwrap();
            backend.add(profile.clone()).unwrap();
            backend.add(EventBuilder::new(1, "pk").build()).unwrap();
            backend.close().unwrap();
        }

        let backend = HybridBackend::open(&path, 16).unwrap();
        assert_eq!(backend.len().unwrap(), 2);
        let key = ReplaceableKey::new(Kind::METADATA, "pk", "");
        assert_eq!(backend.get_replaceable(&key).unwrap().unwrap().id, profile.id);
    }

    #[test]
    fn test_sql_failure_leaves_memory_untouched() {
        let mut backend = HybridBackend::from_sql(SqliteBackend::open_in_memory().unwrap()).unwrap();
        backend
            .sql()
            .execute_batch(
                "CREATE TRIGGER reject_all BEFORE INSERT ON events
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .unwrap();

        let event = EventBuilder::new(1, "pk").build();
        assert!(backend.add(event.clone()).is_err());
        assert!(!backend.has(&event.id).unwrap());
        assert!(backend.query(&[Filter::new()]).unwrap().is_empty());
    }

    #[test]
    fn test_remove_hits_both_layers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hybrid.db");
        let event = EventBuilder::new(1, "pk").build();

        {
            let mut backend = HybridBackend::open(&path, 16).unwrap();
            backend.add(event.clone()).unwrap();
            assert!(backend.remove(&event.id).unwrap().is_some());
            assert!(backend.remove(&event.id).unwrap().is_none());
        }

        let backend = HybridBackend::open(&path, 16).unwrap();
        assert!(backend.is_empty().unwrap());
    }
}
