//! In-memory view-state cache contract.
//!
//! The UI keeps per-table in-memory copies of the local store for rendering.
//! The engine updates this cache synchronously whenever it accepts a
//! local-store mutation, and bulk-reloads it after every reconciliation run
//! (not incrementally - the post-sync reload replaces each table wholesale).

use crate::model::{LocalRecord, Table};
use std::collections::HashMap;
use std::sync::RwLock;

/// UI-facing view cache collaborator.
///
/// Methods are synchronous: the cache sits on the UI path and must never
/// await.
pub trait ViewCache: Send + Sync + 'static {
    /// Replace the cached contents of a table wholesale.
    fn set_all(&self, table: Table, records: Vec<LocalRecord>);

    /// Insert or replace a single record.
    fn upsert(&self, table: Table, record: LocalRecord);

    /// Remove a record, if cached.
    fn remove(&self, table: Table, id: &str);
}

/// Simple in-memory view cache.
#[derive(Default)]
pub struct MemoryViewCache {
    tables: RwLock<HashMap<Table, HashMap<String, LocalRecord>>>,
}

impl MemoryViewCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a cached record (test/diagnostic accessor).
    pub fn get(&self, table: Table, id: &str) -> Option<LocalRecord> {
        self.tables
            .read()
            .expect("view cache poisoned")
            .get(&table)
            .and_then(|t| t.get(id))
            .cloned()
    }

    /// Number of cached records in a table.
    pub fn len(&self, table: Table) -> usize {
        self.tables
            .read()
            .expect("view cache poisoned")
            .get(&table)
            .map(|t| t.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, table: Table) -> bool {
        self.len(table) == 0
    }
}

impl ViewCache for MemoryViewCache {
    fn set_all(&self, table: Table, records: Vec<LocalRecord>) {
        let mut tables = self.tables.write().expect("view cache poisoned");
        let entries = records.into_iter().map(|r| (r.id.clone(), r)).collect();
        tables.insert(table, entries);
    }

    fn upsert(&self, table: Table, record: LocalRecord) {
        let mut tables = self.tables.write().expect("view cache poisoned");
        tables
            .entry(table)
            .or_default()
            .insert(record.id.clone(), record);
    }

    fn remove(&self, table: Table, id: &str) {
        let mut tables = self.tables.write().expect("view cache poisoned");
        if let Some(entries) = tables.get_mut(&table) {
            entries.remove(id);
        }
    }
}
