//! SQLite-backed record store

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use crate::{Filter, FilterOp, Record, StoreError, StoreResult};

/// The record store
///
/// One SQLite database holds every collection. Records are JSON documents;
/// indexed fields are mirrored into `record_index` on every write.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        debug!(path = %path.display(), "Opened store");
        Self::init(conn)
    }

    /// Open an in-memory store (tests and dry runs)
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;
            CREATE TABLE IF NOT EXISTS records (
                collection TEXT NOT NULL,
                id         TEXT NOT NULL,
                json       TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (collection, id)
            );
            CREATE TABLE IF NOT EXISTS record_index (
                collection TEXT NOT NULL,
                field      TEXT NOT NULL,
                value      TEXT NOT NULL,
                id         TEXT NOT NULL,
                PRIMARY KEY (collection, field, id)
            );
            CREATE INDEX IF NOT EXISTS idx_record_index_lookup
                ON record_index (collection, field, value);",
        )?;
        Ok(Self { conn })
    }

    /// Insert or replace a record
    pub fn put<T: Record>(&mut self, record: &T) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        put_impl(&tx, record)?;
        tx.commit()?;
        Ok(())
    }

    /// Fetch a record by id
    pub fn get<T: Record>(&self, id: &str) -> StoreResult<Option<T>> {
        get_impl(&self.conn, id)
    }

    /// Delete a record; returns whether it existed
    pub fn delete<T: Record>(&mut self, id: &str) -> StoreResult<bool> {
        let tx = self.conn.transaction()?;
        let existed = delete_impl::<T>(&tx, id)?;
        tx.commit()?;
        Ok(existed)
    }

    /// List records in a collection, optionally filtered by indexed fields
    pub fn list<T: Record>(&self, filters: &[Filter]) -> StoreResult<Vec<T>> {
        list_impl(&self.conn, filters)
    }

    /// Count records matching filters without deserializing them all
    pub fn count<T: Record>(&self, filters: &[Filter]) -> StoreResult<usize> {
        Ok(list_impl::<T>(&self.conn, filters)?.len())
    }

    /// Rebuild the secondary index for a collection
    ///
    /// Returns the number of records reindexed. Needed after the indexed
    /// field set of a record type changes between versions.
    pub fn rebuild_indexes<T: Record>(&mut self) -> StoreResult<usize> {
        let records: Vec<T> = list_impl(&self.conn, &[])?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM record_index WHERE collection = ?1",
            params![T::collection_name()],
        )?;
        for record in &records {
            index_impl(&tx, record)?;
        }
        tx.commit()?;
        debug!(
            collection = T::collection_name(),
            count = records.len(),
            "Rebuilt indexes"
        );
        Ok(records.len())
    }

    /// Run a multi-record mutation atomically
    ///
    /// The closure sees a [`StoreTxn`] with the same operations as the
    /// store itself; any error rolls the whole transaction back.
    pub fn transaction<R>(&mut self, f: impl FnOnce(&mut StoreTxn<'_>) -> StoreResult<R>) -> StoreResult<R> {
        let tx = self.conn.transaction()?;
        let result = {
            let mut txn = StoreTxn { tx: &tx };
            f(&mut txn)?
        };
        tx.commit()?;
        Ok(result)
    }
}

/// Transaction handle passed to [`Store::transaction`] closures
pub struct StoreTxn<'a> {
    tx: &'a rusqlite::Transaction<'a>,
}

impl StoreTxn<'_> {
    pub fn put<T: Record>(&mut self, record: &T) -> StoreResult<()> {
        put_impl(self.tx, record)
    }

    pub fn get<T: Record>(&self, id: &str) -> StoreResult<Option<T>> {
        get_impl(self.tx, id)
    }

    /// Fetch a record, failing with `NotFound` when absent
    pub fn get_required<T: Record>(&self, id: &str) -> StoreResult<T> {
        get_impl(self.tx, id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    pub fn delete<T: Record>(&mut self, id: &str) -> StoreResult<bool> {
        delete_impl::<T>(self.tx, id)
    }

    pub fn list<T: Record>(&self, filters: &[Filter]) -> StoreResult<Vec<T>> {
        list_impl(self.tx, filters)
    }
}

fn put_impl<T: Record>(conn: &Connection, record: &T) -> StoreResult<()> {
    let json = serde_json::to_string(record)?;
    conn.execute(
        "INSERT OR REPLACE INTO records (collection, id, json, updated_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![T::collection_name(), record.id(), json, record.updated_at()],
    )?;
    conn.execute(
        "DELETE FROM record_index WHERE collection = ?1 AND id = ?2",
        params![T::collection_name(), record.id()],
    )?;
    index_impl(conn, record)?;
    Ok(())
}

fn index_impl<T: Record>(conn: &Connection, record: &T) -> StoreResult<()> {
    for (field, value) in record.indexed_fields() {
        conn.execute(
            "INSERT OR REPLACE INTO record_index (collection, field, value, id)
             VALUES (?1, ?2, ?3, ?4)",
            params![T::collection_name(), field, value.as_sql_text(), record.id()],
        )?;
    }
    Ok(())
}

fn get_impl<T: Record>(conn: &Connection, id: &str) -> StoreResult<Option<T>> {
    let json: Option<String> = conn
        .query_row(
            "SELECT json FROM records WHERE collection = ?1 AND id = ?2",
            params![T::collection_name(), id],
            |row| row.get(0),
        )
        .optional()?;

    match json {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

fn delete_impl<T: Record>(conn: &Connection, id: &str) -> StoreResult<bool> {
    let deleted = conn.execute(
        "DELETE FROM records WHERE collection = ?1 AND id = ?2",
        params![T::collection_name(), id],
    )?;
    conn.execute(
        "DELETE FROM record_index WHERE collection = ?1 AND id = ?2",
        params![T::collection_name(), id],
    )?;
    Ok(deleted > 0)
}

fn list_impl<T: Record>(conn: &Connection, filters: &[Filter]) -> StoreResult<Vec<T>> {
    // Equality filters run in SQL against the index; the rest are applied
    // in memory over the indexed field set.
    let eq_filters: Vec<&Filter> = filters.iter().filter(|f| f.op == FilterOp::Eq).collect();
    let rest: Vec<&Filter> = filters.iter().filter(|f| f.op != FilterOp::Eq).collect();

    let mut sql = String::from("SELECT json FROM records r WHERE r.collection = ?1");
    for (i, _) in eq_filters.iter().enumerate() {
        sql.push_str(&format!(
            " AND EXISTS (SELECT 1 FROM record_index i WHERE i.collection = r.collection \
             AND i.id = r.id AND i.field = ?{} AND i.value = ?{})",
            i * 2 + 2,
            i * 2 + 3
        ));
    }
    sql.push_str(" ORDER BY r.updated_at ASC, r.id ASC");

    let mut params: Vec<String> = vec![T::collection_name().to_string()];
    for f in &eq_filters {
        params.push(f.field.clone());
        params.push(f.value.as_sql_text());
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
        row.get::<_, String>(0)
    })?;

    let mut records = Vec::new();
    for row in rows {
        let record: T = serde_json::from_str(&row?)?;
        if rest.iter().all(|f| f.matches(&record.indexed_fields())) {
            records.push(record);
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{IndexValue, now_ms};
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Widget {
        id: String,
        status: String,
        weight: i64,
        updated_at: i64,
    }

    impl Widget {
        fn new(id: &str, status: &str, weight: i64) -> Self {
            Self {
                id: id.to_string(),
                status: status.to_string(),
                weight,
                updated_at: now_ms(),
            }
        }
    }

    impl Record for Widget {
        fn id(&self) -> &str {
            &self.id
        }

        fn updated_at(&self) -> i64 {
            self.updated_at
        }

        fn collection_name() -> &'static str {
            "widgets"
        }

        fn indexed_fields(&self) -> HashMap<String, IndexValue> {
            let mut fields = HashMap::new();
            fields.insert("status".to_string(), IndexValue::from(self.status.clone()));
            fields.insert("weight".to_string(), IndexValue::from(self.weight));
            fields
        }
    }

    #[test]
    fn test_put_get_roundtrip() {
        let mut store = Store::open_in_memory().unwrap();
        let widget = Widget::new("w-1", "pending", 10);

        store.put(&widget).unwrap();
        let loaded: Widget = store.get("w-1").unwrap().unwrap();
        assert_eq!(loaded, widget);

        assert!(store.get::<Widget>("w-missing").unwrap().is_none());
    }

    #[test]
    fn test_put_replaces_and_reindexes() {
        let mut store = Store::open_in_memory().unwrap();
        let mut widget = Widget::new("w-1", "pending", 10);
        store.put(&widget).unwrap();

        widget.status = "running".to_string();
        store.put(&widget).unwrap();

        let pending: Vec<Widget> = store.list(&[Filter::eq("status", "pending")]).unwrap();
        assert!(pending.is_empty());

        let running: Vec<Widget> = store.list(&[Filter::eq("status", "running")]).unwrap();
        assert_eq!(running.len(), 1);
    }

    #[test]
    fn test_list_with_filters() {
        let mut store = Store::open_in_memory().unwrap();
        store.put(&Widget::new("w-1", "pending", 10)).unwrap();
        store.put(&Widget::new("w-2", "pending", 30)).unwrap();
        store.put(&Widget::new("w-3", "running", 20)).unwrap();

        let all: Vec<Widget> = store.list(&[]).unwrap();
        assert_eq!(all.len(), 3);

        let pending: Vec<Widget> = store.list(&[Filter::eq("status", "pending")]).unwrap();
        assert_eq!(pending.len(), 2);

        let heavy: Vec<Widget> = store
            .list(&[Filter::new("weight", FilterOp::Gt, 15i64)])
            .unwrap();
        assert_eq!(heavy.len(), 2);

        let heavy_pending: Vec<Widget> = store
            .list(&[
                Filter::eq("status", "pending"),
                Filter::new("weight", FilterOp::Gt, 15i64),
            ])
            .unwrap();
        assert_eq!(heavy_pending.len(), 1);
        assert_eq!(heavy_pending[0].id, "w-2");
    }

    #[test]
    fn test_delete() {
        let mut store = Store::open_in_memory().unwrap();
        store.put(&Widget::new("w-1", "pending", 10)).unwrap();

        assert!(store.delete::<Widget>("w-1").unwrap());
        assert!(!store.delete::<Widget>("w-1").unwrap());
        assert!(store.get::<Widget>("w-1").unwrap().is_none());
    }

    #[test]
    fn test_transaction_rollback() {
        let mut store = Store::open_in_memory().unwrap();
        store.put(&Widget::new("w-1", "pending", 10)).unwrap();

        let result: StoreResult<()> = store.transaction(|txn| {
            txn.put(&Widget::new("w-2", "pending", 20))?;
            Err(StoreError::NotFound("boom".to_string()))
        });
        assert!(result.is_err());

        // w-2 must not have been persisted
        assert!(store.get::<Widget>("w-2").unwrap().is_none());
        assert!(store.get::<Widget>("w-1").unwrap().is_some());
    }

    #[test]
    fn test_transaction_commit() {
        let mut store = Store::open_in_memory().unwrap();

        store
            .transaction(|txn| {
                txn.put(&Widget::new("w-1", "pending", 10))?;
                txn.put(&Widget::new("w-2", "running", 20))?;
                Ok(())
            })
            .unwrap();

        assert_eq!(store.list::<Widget>(&[]).unwrap().len(), 2);
    }

    #[test]
    fn test_get_required() {
        let mut store = Store::open_in_memory().unwrap();
        store.put(&Widget::new("w-1", "pending", 10)).unwrap();

        let err = store
            .transaction(|txn| txn.get_required::<Widget>("w-9").map(|_| ()))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_rebuild_indexes() {
        let mut store = Store::open_in_memory().unwrap();
        store.put(&Widget::new("w-1", "pending", 10)).unwrap();
        store.put(&Widget::new("w-2", "running", 20)).unwrap();

        let count = store.rebuild_indexes::<Widget>().unwrap();
        assert_eq!(count, 2);

        let pending: Vec<Widget> = store.list(&[Filter::eq("status", "pending")]).unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_persistence_across_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");

        {
            let mut store = Store::open(&path).unwrap();
            store.put(&Widget::new("w-1", "pending", 10)).unwrap();
        }

        let store = Store::open(&path).unwrap();
        let loaded: Widget = store.get("w-1").unwrap().unwrap();
        assert_eq!(loaded.id, "w-1");
    }
}
