// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local store integration trait.
//!
//! Defines the interface the engine needs from the device-local record
//! store. The app provides the real implementation; the engine only relies
//! on this contract, which keeps it testable with [`MemoryStore`] and
//! decoupled from the app's storage internals.
//!
//! # Example
//!
//! ```rust,no_run
//! use brew_sync::store::{LocalStore, StoreFuture};
//! use brew_sync::model::{LocalRecord, SettingsDoc, Table};
//!
//! struct MyStore { /* ... */ }
//!
//! impl LocalStore for MyStore {
//!     fn get(&self, _table: Table, _id: &str) -> StoreFuture<'_, Option<LocalRecord>> {
//!         Box::pin(async move { Ok(None) })
//!     }
//!     // ... remaining methods
//! #   fn put(&self, _table: Table, _record: LocalRecord) -> StoreFuture<'_, ()> {
//! #       Box::pin(async move { Ok(()) })
//! #   }
//! #   fn bulk_put(&self, _table: Table, _records: Vec<LocalRecord>) -> StoreFuture<'_, ()> {
//! #       Box::pin(async move { Ok(()) })
//! #   }
//! #   fn delete(&self, _table: Table, _id: &str) -> StoreFuture<'_, bool> {
//! #       Box::pin(async move { Ok(false) })
//! #   }
//! #   fn bulk_delete(&self, _table: Table, _ids: Vec<String>) -> StoreFuture<'_, usize> {
//! #       Box::pin(async move { Ok(0) })
//! #   }
//! #   fn all(&self, _table: Table) -> StoreFuture<'_, Vec<LocalRecord>> {
//! #       Box::pin(async move { Ok(Vec::new()) })
//! #   }
//! #   fn get_settings(&self) -> StoreFuture<'_, Option<SettingsDoc>> {
//! #       Box::pin(async move { Ok(None) })
//! #   }
//! #   fn put_settings(&self, _doc: SettingsDoc) -> StoreFuture<'_, ()> {
//! #       Box::pin(async move { Ok(()) })
//! #   }
//! }
//! ```

use crate::error::Result;
use crate::model::{LocalRecord, SettingsDoc, Table};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::RwLock;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Trait defining what the engine needs from the device-local store.
///
/// `bulk_put` is expected to be transactional: either every record in the
/// batch lands or none do. The engine relies on this when applying a
/// reconciliation download set.
pub trait LocalStore: Send + Sync + 'static {
    /// Fetch a single record.
    fn get(&self, table: Table, id: &str) -> StoreFuture<'_, Option<LocalRecord>>;

    /// Insert or replace a single record.
    fn put(&self, table: Table, record: LocalRecord) -> StoreFuture<'_, ()>;

    /// Insert or replace a batch of records in one transaction.
    fn bulk_put(&self, table: Table, records: Vec<LocalRecord>) -> StoreFuture<'_, ()>;

    /// Delete a record. Returns whether it existed.
    fn delete(&self, table: Table, id: &str) -> StoreFuture<'_, bool>;

    /// Delete a batch of records. Returns how many existed.
    fn bulk_delete(&self, table: Table, ids: Vec<String>) -> StoreFuture<'_, usize>;

    /// All records in a table.
    fn all(&self, table: Table) -> StoreFuture<'_, Vec<LocalRecord>>;

    /// The app-level settings document, if any.
    fn get_settings(&self) -> StoreFuture<'_, Option<SettingsDoc>>;

    /// Replace the app-level settings document.
    fn put_settings(&self, doc: SettingsDoc) -> StoreFuture<'_, ()>;
}

/// In-memory implementation for tests and standalone use.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<Table, BTreeMap<String, LocalRecord>>>,
    settings: RwLock<Option<SettingsDoc>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record count for a table (test accessor).
    pub async fn len(&self, table: Table) -> usize {
        self.tables
            .read()
            .await
            .get(&table)
            .map(|t| t.len())
            .unwrap_or(0)
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, table: Table, id: &str) -> StoreFuture<'_, Option<LocalRecord>> {
        let id = id.to_string();
        Box::pin(async move {
            Ok(self
                .tables
                .read()
                .await
                .get(&table)
                .and_then(|t| t.get(&id))
                .cloned())
        })
    }

    fn put(&self, table: Table, record: LocalRecord) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut tables = self.tables.write().await;
            tables
                .entry(table)
                .or_default()
                .insert(record.id.clone(), record);
            Ok(())
        })
    }

    fn bulk_put(&self, table: Table, records: Vec<LocalRecord>) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut tables = self.tables.write().await;
            let entries = tables.entry(table).or_default();
            for record in records {
                entries.insert(record.id.clone(), record);
            }
            Ok(())
        })
    }

    fn delete(&self, table: Table, id: &str) -> StoreFuture<'_, bool> {
        let id = id.to_string();
        Box::pin(async move {
            let mut tables = self.tables.write().await;
            Ok(tables
                .get_mut(&table)
                .map(|t| t.remove(&id).is_some())
                .unwrap_or(false))
        })
    }

    fn bulk_delete(&self, table: Table, ids: Vec<String>) -> StoreFuture<'_, usize> {
        Box::pin(async move {
            let mut tables = self.tables.write().await;
            let Some(entries) = tables.get_mut(&table) else {
                return Ok(0);
            };
            let mut removed = 0;
            for id in ids {
                if entries.remove(&id).is_some() {
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }

    fn all(&self, table: Table) -> StoreFuture<'_, Vec<LocalRecord>> {
        Box::pin(async move {
            Ok(self
                .tables
                .read()
                .await
                .get(&table)
                .map(|t| t.values().cloned().collect())
                .unwrap_or_default())
        })
    }

    fn get_settings(&self) -> StoreFuture<'_, Option<SettingsDoc>> {
        Box::pin(async move { Ok(self.settings.read().await.clone()) })
    }

    fn put_settings(&self, doc: SettingsDoc) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            *self.settings.write().await = Some(doc);
            Ok(())
        })
    }
}
