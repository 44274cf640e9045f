//! The Store: versioned local collections
//!
//! Generic transactional CRUD over the collections declared in a
//! [`SchemaCatalog`]. The store is opened once per process; opening runs the
//! migration engine to completion before any other operation is possible.
//!
//! Architecture:
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         STORE                                    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  DuckDB (file or in-memory), one Mutex-guarded connection        │
//! │  ├── col__<collection>         key → JSON body                   │
//! │  └── ix__<collection>__<field> value → key                       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Installed schema (read-only after migration)                    │
//! │  └── collection → key field, indexes                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  CollectionTx                                                    │
//! │  └── one DuckDB transaction scoped to one collection             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Keys and index values are strings or numbers, stored as canonical JSON
//! text so `"7"` and `7` stay distinct. Records whose indexed field is
//! missing or not indexable simply have no entry in that index.

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::migrate;
use crate::schema::{CollectionSchema, IndexSchema, SchemaCatalog};
use duckdb::{params, Connection};
use log::{debug, info};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

/// A stored record: field name → value, keyed by its collection's key field
pub type Record = serde_json::Map<String, Value>;

// ============================================================================
// TABLE LAYOUT
// ============================================================================

pub(crate) fn collection_table(collection: &str) -> String {
    format!("\"col__{}\"", collection)
}

pub(crate) fn index_table(collection: &str, field: &str) -> String {
    format!("\"ix__{}__{}\"", collection, field)
}

/// Canonical text of a key or index value, `None` if it cannot be one
fn canonical(value: &Value) -> Option<String> {
    match value {
        Value::String(_) => serde_json::to_string(value).ok(),
        Value::Number(n) => Some(match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => i.to_string(),
            // 3.0 and 3 are the same key
            (None, Some(f)) if f.fract() == 0.0 && f.abs() < 9.0e15 => (f as i64).to_string(),
            _ => n.to_string(),
        }),
        _ => None,
    }
}

pub(crate) fn encode_key(key: &Value) -> Result<String> {
    canonical(key)
        .ok_or_else(|| StoreError::Validation(format!("{} is not a valid key", key)))
}

pub(crate) fn index_value(record: &Record, field: &str) -> Option<String> {
    record.get(field).and_then(canonical)
}

fn key_is_absent(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        _ => false,
    }
}

// ============================================================================
// TRANSACTIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

/// Handle to one transaction over one collection.
///
/// Everything done through the handle commits together when the closure
/// passed to [`Store::transact`] returns `Ok`, and is rolled back otherwise.
pub struct CollectionTx<'a> {
    conn: &'a Connection,
    schema: &'a CollectionSchema,
    mode: TxMode,
}

impl<'a> CollectionTx<'a> {
    pub fn collection(&self) -> &str {
        &self.schema.name
    }

    pub fn get(&self, key: &Value) -> Result<Option<Record>> {
        let key = encode_key(key)?;
        let mut stmt = self.conn.prepare(&format!(
            "SELECT body FROM {} WHERE key = ?",
            collection_table(&self.schema.name)
        ))?;
        let bodies = stmt
            .query_map(params![key], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        match bodies.first() {
            Some(body) => Ok(Some(serde_json::from_str(body)?)),
            None => Ok(None),
        }
    }

    pub fn all(&self) -> Result<Vec<Record>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT body FROM {} ORDER BY key",
            collection_table(&self.schema.name)
        ))?;
        let bodies = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut records = Vec::with_capacity(bodies.len());
        for body in &bodies {
            records.push(serde_json::from_str(body)?);
        }
        Ok(records)
    }

    pub fn count(&self) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {}",
                collection_table(&self.schema.name)
            ),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Add a record, failing if its key or a unique index value is taken
    pub fn insert(&self, record: Record) -> Result<Value> {
        self.write(record, false)
    }

    /// Add or replace a record by key
    pub fn upsert(&self, record: Record) -> Result<Value> {
        self.write(record, true)
    }

    /// Remove a record; removing a missing key succeeds
    pub fn delete(&self, key: &Value) -> Result<()> {
        self.ensure_writable()?;
        let key = encode_key(key)?;
        self.remove(&key)?;
        debug!("Deleted {} from '{}'", key, self.schema.name);
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        self.ensure_writable()?;
        self.conn.execute_batch(&format!(
            "DELETE FROM {};",
            collection_table(&self.schema.name)
        ))?;
        for index in &self.schema.indexes {
            self.conn.execute_batch(&format!(
                "DELETE FROM {};",
                index_table(&self.schema.name, &index.field)
            ))?;
        }
        Ok(())
    }

    /// First record whose `field` equals `value` (the only one, for unique indexes)
    pub fn find_by_index(&self, field: &str, value: &Value) -> Result<Option<Record>> {
        Ok(self.lookup(field, value, Some(1))?.into_iter().next())
    }

    pub fn find_all_by_index(&self, field: &str, value: &Value) -> Result<Vec<Record>> {
        self.lookup(field, value, None)
    }

    fn lookup(&self, field: &str, value: &Value, limit: Option<usize>) -> Result<Vec<Record>> {
        let index = self.index(field)?;
        let Some(value) = canonical(value) else {
            return Ok(Vec::new());
        };

        let limit = limit.map(|n| format!(" LIMIT {}", n)).unwrap_or_default();
        let mut stmt = self.conn.prepare(&format!(
            "SELECT c.body FROM {} i JOIN {} c ON c.key = i.key WHERE i.value = ? ORDER BY c.key{}",
            index_table(&self.schema.name, &index.field),
            collection_table(&self.schema.name),
            limit
        ))?;
        let bodies = stmt
            .query_map(params![value], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut records = Vec::with_capacity(bodies.len());
        for body in &bodies {
            records.push(serde_json::from_str(body)?);
        }
        Ok(records)
    }

    fn write(&self, mut record: Record, overwrite: bool) -> Result<Value> {
        self.ensure_writable()?;
        let key_field = &self.schema.key_field;

        let key = if key_is_absent(record.get(key_field)) {
            let generated = Value::String(Uuid::new_v4().to_string());
            record.insert(key_field.clone(), generated.clone());
            generated
        } else {
            record[key_field].clone()
        };
        let encoded = encode_key(&key)?;

        let exists = self.contains(&encoded)?;
        if exists && !overwrite {
            return Err(StoreError::ConstraintViolation(format!(
                "key {} already exists in '{}'",
                encoded, self.schema.name
            )));
        }

        for index in self.schema.indexes.iter().filter(|i| i.unique) {
            let Some(value) = index_value(&record, &index.field) else {
                continue;
            };
            if let Some(holder) = self.index_holder(&index.field, &value, &encoded)? {
                return Err(StoreError::ConstraintViolation(format!(
                    "{}.{} = {} is already used by {}",
                    self.schema.name, index.field, value, holder
                )));
            }
        }

        if exists {
            self.remove(&encoded)?;
        }

        let body = serde_json::to_string(&record)?;
        self.conn.execute(
            &format!(
                "INSERT INTO {} (key, body) VALUES (?, ?)",
                collection_table(&self.schema.name)
            ),
            params![encoded, body],
        )?;
        for index in &self.schema.indexes {
            if let Some(value) = index_value(&record, &index.field) {
                self.conn.execute(
                    &format!(
                        "INSERT INTO {} (value, key) VALUES (?, ?)",
                        index_table(&self.schema.name, &index.field)
                    ),
                    params![value, encoded],
                )?;
            }
        }

        debug!("Wrote {} to '{}'", encoded, self.schema.name);
        Ok(key)
    }

    fn contains(&self, encoded: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE key = ?",
                collection_table(&self.schema.name)
            ),
            params![encoded],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Key of another record holding `value` in a unique index
    fn index_holder(&self, field: &str, value: &str, own_key: &str) -> Result<Option<String>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT key FROM {} WHERE value = ? AND key <> ? LIMIT 1",
            index_table(&self.schema.name, field)
        ))?;
        let keys = stmt
            .query_map(params![value, own_key], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(keys.into_iter().next())
    }

    fn remove(&self, encoded: &str) -> Result<()> {
        self.conn.execute(
            &format!(
                "DELETE FROM {} WHERE key = ?",
                collection_table(&self.schema.name)
            ),
            params![encoded],
        )?;
        for index in &self.schema.indexes {
            self.conn.execute(
                &format!(
                    "DELETE FROM {} WHERE key = ?",
                    index_table(&self.schema.name, &index.field)
                ),
                params![encoded],
            )?;
        }
        Ok(())
    }

    fn index(&self, field: &str) -> Result<&IndexSchema> {
        self.schema.find_index(field).ok_or_else(|| {
            StoreError::NotFound(format!("index '{}.{}'", self.schema.name, field))
        })
    }

    fn ensure_writable(&self) -> Result<()> {
        match self.mode {
            TxMode::ReadWrite => Ok(()),
            TxMode::ReadOnly => Err(StoreError::Storage(
                "read-only transaction".to_string(),
            )),
        }
    }
}

// ============================================================================
// THE STORE
// ============================================================================

pub struct Store {
    /// DuckDB connection, one transaction at a time
    conn: Mutex<Connection>,
    /// Catalog the store was migrated to
    catalog: SchemaCatalog,
    /// Schema as installed, by collection name
    installed: HashMap<String, CollectionSchema>,
    /// StoreVersion after migration
    version: u32,
    /// Database file, `None` when in memory
    path: Option<PathBuf>,
}

impl Store {
    /// Open the store described by `config` against the POS catalog
    pub fn open(config: &StoreConfig) -> Result<Self> {
        Self::open_with_catalog(config, SchemaCatalog::pos())
    }

    /// Open a store and migrate it to `catalog`.
    ///
    /// The store is only returned once migration succeeded; on failure the
    /// connection is closed and nothing else may run against it.
    pub fn open_with_catalog(config: &StoreConfig, catalog: SchemaCatalog) -> Result<Self> {
        config.validate()?;

        let path = config.db_path();
        let conn = match &path {
            Some(path) => {
                if let Some(dir) = path.parent() {
                    fs::create_dir_all(dir).map_err(|e| {
                        StoreError::Storage(format!("cannot create {}: {}", dir.display(), e))
                    })?;
                }
                info!("Opening store '{}' at {}", config.name, path.display());
                Connection::open(path)?
            }
            None => {
                info!("Opening in-memory store '{}'", config.name);
                Connection::open_in_memory()?
            }
        };

        Self::from_connection(conn, catalog, path)
    }

    /// In-memory POS store, gone when dropped
    pub fn open_in_memory() -> Result<Self> {
        Self::open(&StoreConfig::in_memory())
    }

    fn from_connection(
        mut conn: Connection,
        catalog: SchemaCatalog,
        path: Option<PathBuf>,
    ) -> Result<Self> {
        let current = migrate::installed_version(&conn)?;
        let version = migrate::ensure_schema(&mut conn, &catalog, current)?;
        let installed = Self::load_installed(&conn)?;

        info!("Store ready (schema v{})", version);

        Ok(Store {
            conn: Mutex::new(conn),
            catalog,
            installed,
            version,
            path,
        })
    }

    fn load_installed(conn: &Connection) -> Result<HashMap<String, CollectionSchema>> {
        Ok(migrate::installed_schema(conn)?
            .into_iter()
            .map(|c| (c.name.clone(), c))
            .collect())
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Indexes installed on a collection
    pub fn indexes(&self, collection: &str) -> Result<&[IndexSchema]> {
        Ok(&self.schema(collection)?.indexes)
    }

    /// Drop an index and rebuild it from the catalog.
    ///
    /// The explicit way to change an index's uniqueness; refuses with
    /// `SchemaConflict` when stored records violate the new definition, in
    /// which case the index is left dropped until the data is fixed.
    pub fn rebuild_index(&mut self, collection: &str, field: &str) -> Result<()> {
        let conn = self
            .conn
            .get_mut()
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        migrate::drop_index(conn, collection, field)?;
        let result = migrate::ensure_schema(conn, &self.catalog, self.version);
        self.installed = Self::load_installed(conn)?;
        result.map(|_| ())
    }

    fn schema(&self, collection: &str) -> Result<&CollectionSchema> {
        self.installed
            .get(collection)
            .ok_or_else(|| StoreError::NotFound(format!("collection '{}'", collection)))
    }

    /// Run `f` inside one transaction scoped to `collection`.
    ///
    /// Read-write transactions commit when `f` returns `Ok`; any error rolls
    /// back everything `f` did.
    pub fn transact<T, F>(&self, collection: &str, mode: TxMode, f: F) -> Result<T>
    where
        F: FnOnce(&CollectionTx<'_>) -> Result<T>,
    {
        let schema = self.schema(collection)?;
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        let tx = conn.transaction()?;

        let handle = CollectionTx {
            conn: &tx,
            schema,
            mode,
        };
        let value = f(&handle)?;

        if mode == TxMode::ReadWrite {
            tx.commit()?;
        }
        Ok(value)
    }

    pub fn get(&self, collection: &str, key: &Value) -> Result<Option<Record>> {
        self.transact(collection, TxMode::ReadOnly, |tx| tx.get(key))
    }

    pub fn get_all(&self, collection: &str) -> Result<Vec<Record>> {
        self.transact(collection, TxMode::ReadOnly, |tx| tx.all())
    }

    /// Insert a record, assigning a generated key if it carries none
    pub fn insert(&self, collection: &str, record: Record) -> Result<Value> {
        self.transact(collection, TxMode::ReadWrite, |tx| tx.insert(record))
    }

    pub fn upsert(&self, collection: &str, record: Record) -> Result<Value> {
        self.transact(collection, TxMode::ReadWrite, |tx| tx.upsert(record))
    }

    pub fn delete(&self, collection: &str, key: &Value) -> Result<()> {
        self.transact(collection, TxMode::ReadWrite, |tx| tx.delete(key))
    }

    pub fn count(&self, collection: &str) -> Result<u64> {
        self.transact(collection, TxMode::ReadOnly, |tx| tx.count())
    }

    /// Upsert every record or none of them
    pub fn bulk_upsert(&self, collection: &str, records: Vec<Record>) -> Result<()> {
        let total = records.len();
        self.transact(collection, TxMode::ReadWrite, |tx| {
            for record in records {
                tx.upsert(record)?;
            }
            Ok(())
        })?;
        info!("Bulk upserted {} records into '{}'", total, collection);
        Ok(())
    }

    pub fn find_by_index(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Option<Record>> {
        self.transact(collection, TxMode::ReadOnly, |tx| {
            tx.find_by_index(field, value)
        })
    }

    pub fn find_all_by_index(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Record>> {
        self.transact(collection, TxMode::ReadOnly, |tx| {
            tx.find_all_by_index(field, value)
        })
    }

    pub fn clear(&self, collection: &str) -> Result<()> {
        self.transact(collection, TxMode::ReadWrite, |tx| tx.clear())
    }
}
