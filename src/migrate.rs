//! Migration Engine
//!
//! Brings an installed store up to a [`SchemaCatalog`] without touching
//! existing records. Every step is individually idempotent, so a failed
//! migration can be retried in full; the whole diff also runs inside one
//! transaction, so a failure leaves the previous schema and version intact.
//!
//! Installed schema lives next to the data:
//! ```text
//! __meta(name, value)                    version → StoreVersion
//! __collections(name, key_field)         one row per collection
//! __indexes(collection, field, is_unique)
//! col__<collection>(key, body)           records
//! ix__<collection>__<field>(value, key)  index entries
//! ```

use crate::error::{Result, StoreError};
use crate::schema::{is_valid_identifier, CollectionSchema, IndexSchema, SchemaCatalog};
use crate::store::{collection_table, index_table, index_value, Record};
use duckdb::{params, Connection};
use log::{debug, info, warn};
use std::collections::HashSet;

const VERSION_KEY: &str = "version";

/// Create the metadata tables if this is a fresh store.
fn bootstrap(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS __meta (name VARCHAR, value VARCHAR);
        CREATE TABLE IF NOT EXISTS __collections (name VARCHAR, key_field VARCHAR);
        CREATE TABLE IF NOT EXISTS __indexes (collection VARCHAR, field VARCHAR, is_unique BOOLEAN);
        "#,
    )?;
    Ok(())
}

/// Read the persisted StoreVersion (0 for a fresh store)
pub fn installed_version(conn: &Connection) -> Result<u32> {
    bootstrap(conn)?;

    let mut stmt = conn.prepare("SELECT value FROM __meta WHERE name = ?")?;
    let values = stmt
        .query_map(params![VERSION_KEY], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;

    match values.first() {
        None => Ok(0),
        Some(v) => v
            .parse()
            .map_err(|_| StoreError::Storage(format!("corrupt store version: {}", v))),
    }
}

/// Read back the schema actually installed in the store
pub fn installed_schema(conn: &Connection) -> Result<Vec<CollectionSchema>> {
    bootstrap(conn)?;

    let mut stmt = conn.prepare("SELECT name, key_field FROM __collections ORDER BY name")?;
    let collections = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut schema = Vec::with_capacity(collections.len());
    for (name, key_field) in collections {
        let mut collection = CollectionSchema::new(&name, &key_field);
        collection.indexes = installed_indexes(conn, &name)?;
        schema.push(collection);
    }
    Ok(schema)
}

fn installed_indexes(conn: &Connection, collection: &str) -> Result<Vec<IndexSchema>> {
    let mut stmt = conn.prepare(
        "SELECT field, is_unique FROM __indexes WHERE collection = ? ORDER BY field",
    )?;
    let indexes = stmt
        .query_map(params![collection], |row| {
            Ok(IndexSchema {
                field: row.get(0)?,
                unique: row.get(1)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(indexes)
}

fn installed_key_field(conn: &Connection, collection: &str) -> Result<Option<String>> {
    let mut stmt = conn.prepare("SELECT key_field FROM __collections WHERE name = ?")?;
    let fields = stmt
        .query_map(params![collection], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(fields.into_iter().next())
}

/// Bring the store to `catalog.version`.
///
/// Creates missing collections and indexes, tightens an index from
/// non-unique to unique when the stored data allows it, and refuses
/// (`SchemaConflict`) when:
/// - a collection's key field differs from the installed one
/// - a unique index would be violated by records already stored
///
/// A unique index is never loosened automatically; see [`drop_index`].
/// Returns the new StoreVersion, which is only persisted once every step
/// succeeded.
pub fn ensure_schema(
    conn: &mut Connection,
    catalog: &SchemaCatalog,
    current_version: u32,
) -> Result<u32> {
    if current_version > catalog.version {
        return Err(StoreError::Storage(format!(
            "store is at version {} but this build only knows version {}",
            current_version, catalog.version
        )));
    }
    validate_catalog(catalog)?;

    if current_version < catalog.version {
        info!(
            "Migrating store from v{} to v{}",
            current_version, catalog.version
        );
    } else {
        debug!("Store at v{}, verifying schema", current_version);
    }

    let tx = conn.transaction()?;
    bootstrap(&tx)?;

    for collection in &catalog.collections {
        ensure_collection(&tx, collection)?;
        for index in &collection.indexes {
            ensure_index(&tx, &collection.name, index)?;
        }
    }

    tx.execute("DELETE FROM __meta WHERE name = ?", params![VERSION_KEY])?;
    tx.execute(
        "INSERT INTO __meta (name, value) VALUES (?, ?)",
        params![VERSION_KEY, catalog.version.to_string()],
    )?;
    tx.commit()?;

    Ok(catalog.version)
}

/// Names must be identifiers, and every collection and index must get a
/// table of its own. `__` separates the parts of a table name, so it may not
/// appear inside collection or index names.
fn validate_catalog(catalog: &SchemaCatalog) -> Result<()> {
    let mut tables = HashSet::new();
    for collection in &catalog.collections {
        let names = std::iter::once(&collection.name)
            .chain(std::iter::once(&collection.key_field))
            .chain(collection.indexes.iter().map(|i| &i.field));
        for name in names {
            if !is_valid_identifier(name) {
                return Err(StoreError::SchemaConflict(format!(
                    "'{}' is not a valid name in collection '{}'",
                    name, collection.name
                )));
            }
        }

        let table_names = std::iter::once(&collection.name)
            .chain(collection.indexes.iter().map(|i| &i.field));
        for name in table_names {
            if name.contains("__") {
                return Err(StoreError::SchemaConflict(format!(
                    "'{}' in collection '{}' may not contain '__'",
                    name, collection.name
                )));
            }
        }

        if !tables.insert(collection_table(&collection.name)) {
            return Err(StoreError::SchemaConflict(format!(
                "collection '{}' declared twice",
                collection.name
            )));
        }
        for index in &collection.indexes {
            if !tables.insert(index_table(&collection.name, &index.field)) {
                return Err(StoreError::SchemaConflict(format!(
                    "index '{}.{}' declared twice",
                    collection.name, index.field
                )));
            }
        }
    }
    Ok(())
}

fn ensure_collection(conn: &Connection, collection: &CollectionSchema) -> Result<()> {
    match installed_key_field(conn, &collection.name)? {
        Some(key_field) if key_field == collection.key_field => Ok(()),
        Some(key_field) => Err(StoreError::SchemaConflict(format!(
            "collection '{}' is keyed by '{}', cannot change to '{}'",
            collection.name, key_field, collection.key_field
        ))),
        None => {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} (key VARCHAR, body VARCHAR);",
                collection_table(&collection.name)
            ))?;
            conn.execute(
                "INSERT INTO __collections (name, key_field) VALUES (?, ?)",
                params![collection.name, collection.key_field],
            )?;
            info!(
                "Created collection '{}' (key: {})",
                collection.name, collection.key_field
            );
            Ok(())
        }
    }
}

fn ensure_index(conn: &Connection, collection: &str, index: &IndexSchema) -> Result<()> {
    let installed = installed_indexes(conn, collection)?
        .into_iter()
        .find(|i| i.field == index.field);

    match installed {
        None => create_index(conn, collection, index),
        Some(existing) if existing.unique == index.unique => Ok(()),
        Some(_) if index.unique => {
            if let Some(value) = first_duplicate(conn, collection, &index.field)? {
                return Err(StoreError::SchemaConflict(format!(
                    "cannot make index '{}.{}' unique: value {} is held by several records",
                    collection, index.field, value
                )));
            }
            conn.execute(
                "UPDATE __indexes SET is_unique = true WHERE collection = ? AND field = ?",
                params![collection, index.field],
            )?;
            info!("Index '{}.{}' is now unique", collection, index.field);
            Ok(())
        }
        Some(_) => {
            warn!(
                "Index '{}.{}' stays unique; drop it explicitly to relax it",
                collection, index.field
            );
            Ok(())
        }
    }
}

/// Build the entry table for an index from the records already stored.
fn create_index(conn: &Connection, collection: &str, index: &IndexSchema) -> Result<()> {
    let table = index_table(collection, &index.field);
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} (value VARCHAR, key VARCHAR); DELETE FROM {};",
        table, table
    ))?;

    let mut stmt = conn.prepare(&format!(
        "SELECT key, body FROM {}",
        collection_table(collection)
    ))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut seen = HashSet::new();
    let mut entries = 0usize;
    let insert = format!("INSERT INTO {} (value, key) VALUES (?, ?)", table);
    for (key, body) in &rows {
        let record: Record = serde_json::from_str(body)?;
        let Some(value) = index_value(&record, &index.field) else {
            continue;
        };
        if index.unique && !seen.insert(value.clone()) {
            return Err(StoreError::SchemaConflict(format!(
                "cannot create unique index '{}.{}': value {} is held by several records",
                collection, index.field, value
            )));
        }
        conn.execute(&insert, params![value, key])?;
        entries += 1;
    }

    conn.execute(
        "INSERT INTO __indexes (collection, field, is_unique) VALUES (?, ?, ?)",
        params![collection, index.field, index.unique],
    )?;
    info!(
        "Created index '{}.{}' (unique: {}, {} entries)",
        collection,
        index.field,
        index.unique,
        entries
    );
    Ok(())
}

fn first_duplicate(conn: &Connection, collection: &str, field: &str) -> Result<Option<String>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT value FROM {} GROUP BY value HAVING COUNT(*) > 1 LIMIT 1",
        index_table(collection, field)
    ))?;
    let values = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(values.into_iter().next())
}

/// Drop an index and its entries.
///
/// This is the explicit step for changing an index definition: the next
/// [`ensure_schema`] recreates it from the catalog.
pub fn drop_index(conn: &mut Connection, collection: &str, field: &str) -> Result<()> {
    let tx = conn.transaction()?;
    bootstrap(&tx)?;

    let exists = installed_indexes(&tx, collection)?
        .iter()
        .any(|i| i.field == field);
    if !exists {
        return Err(StoreError::NotFound(format!(
            "index '{}.{}'",
            collection, field
        )));
    }

    tx.execute_batch(&format!(
        "DROP TABLE IF EXISTS {};",
        index_table(collection, field)
    ))?;
    tx.execute(
        "DELETE FROM __indexes WHERE collection = ? AND field = ?",
        params![collection, field],
    )?;
    tx.commit()?;

    info!("Dropped index '{}.{}'", collection, field);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fresh() -> Connection {
        Connection::open_in_memory().expect("open in-memory store")
    }

    /// Write a record the way an older build would have, bypassing indexes.
    fn put_raw(conn: &Connection, collection: &str, key: &str, body: serde_json::Value) {
        conn.execute(
            &format!(
                "INSERT INTO {} (key, body) VALUES (?, ?)",
                collection_table(collection)
            ),
            params![format!("\"{}\"", key), body.to_string()],
        )
        .expect("raw insert");
    }

    fn users_v2() -> SchemaCatalog {
        SchemaCatalog::new(
            2,
            vec![CollectionSchema::new("users", "id").index("username", false)],
        )
    }

    fn users_v3() -> SchemaCatalog {
        SchemaCatalog::new(
            3,
            vec![CollectionSchema::new("users", "id").index("username", true)],
        )
    }

    #[test]
    fn test_fresh_store_reaches_catalog_version() {
        let mut conn = fresh();
        let catalog = SchemaCatalog::pos();

        assert_eq!(installed_version(&conn).unwrap(), 0);
        let version = ensure_schema(&mut conn, &catalog, 0).unwrap();
        assert_eq!(version, catalog.version);
        assert_eq!(installed_version(&conn).unwrap(), catalog.version);

        let schema = installed_schema(&conn).unwrap();
        assert_eq!(schema.len(), catalog.collections.len());
        for declared in &catalog.collections {
            let installed = schema.iter().find(|c| c.name == declared.name).unwrap();
            assert_eq!(installed.key_field, declared.key_field);
            assert_eq!(installed.indexes.len(), declared.indexes.len());
        }
    }

    #[test]
    fn test_migration_is_idempotent() {
        let mut conn = fresh();
        let catalog = SchemaCatalog::pos();

        ensure_schema(&mut conn, &catalog, 0).unwrap();
        let first = installed_schema(&conn).unwrap();

        let current = installed_version(&conn).unwrap();
        ensure_schema(&mut conn, &catalog, current).expect("second run");
        assert_eq!(installed_schema(&conn).unwrap(), first);
        assert_eq!(installed_version(&conn).unwrap(), catalog.version);
    }

    #[test]
    fn test_newer_store_is_refused() {
        let mut conn = fresh();
        let err = ensure_schema(&mut conn, &SchemaCatalog::pos(), 99).unwrap_err();
        assert!(matches!(err, StoreError::Storage(_)));
    }

    #[test]
    fn test_existing_records_are_indexed() {
        let mut conn = fresh();
        ensure_schema(
            &mut conn,
            &SchemaCatalog::new(1, vec![CollectionSchema::new("products", "id")]),
            0,
        )
        .unwrap();
        put_raw(&conn, "products", "p1", json!({"id": "p1", "barcode": "111"}));
        put_raw(&conn, "products", "p2", json!({"id": "p2"}));

        ensure_schema(&mut conn, &SchemaCatalog::pos(), 1).unwrap();

        let entries: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM {}", index_table("products", "barcode")),
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(entries, 1, "only records carrying a barcode are indexed");
    }

    #[test]
    fn test_key_field_is_immutable() {
        let mut conn = fresh();
        ensure_schema(&mut conn, &users_v2(), 0).unwrap();

        let rekeyed = SchemaCatalog::new(
            3,
            vec![CollectionSchema::new("users", "username")],
        );
        let err = ensure_schema(&mut conn, &rekeyed, 2).unwrap_err();
        assert!(matches!(err, StoreError::SchemaConflict(_)));
        assert_eq!(installed_version(&conn).unwrap(), 2);
    }

    #[test]
    fn test_tightening_refused_on_duplicates() {
        let mut conn = fresh();
        ensure_schema(&mut conn, &users_v2(), 0).unwrap();
        // Rebuild the index with two colliding users in place.
        put_raw(&conn, "users", "u1", json!({"id": "u1", "username": "sam"}));
        put_raw(&conn, "users", "u2", json!({"id": "u2", "username": "sam"}));
        drop_index(&mut conn, "users", "username").unwrap();
        ensure_schema(&mut conn, &users_v2(), 2).unwrap();

        let err = ensure_schema(&mut conn, &users_v3(), 2).unwrap_err();
        assert!(matches!(err, StoreError::SchemaConflict(_)));

        // Nothing from the failed run is kept.
        assert_eq!(installed_version(&conn).unwrap(), 2);
        let users = installed_schema(&conn).unwrap();
        assert!(!users[0].indexes[0].unique);
    }

    #[test]
    fn test_tightening_applied_on_clean_data() {
        let mut conn = fresh();
        ensure_schema(&mut conn, &users_v2(), 0).unwrap();
        put_raw(&conn, "users", "u1", json!({"id": "u1", "username": "sam"}));
        put_raw(&conn, "users", "u2", json!({"id": "u2", "username": "alex"}));
        drop_index(&mut conn, "users", "username").unwrap();
        ensure_schema(&mut conn, &users_v2(), 2).unwrap();

        ensure_schema(&mut conn, &users_v3(), 2).unwrap();
        let users = installed_schema(&conn).unwrap();
        assert!(users[0].indexes[0].unique);
        assert_eq!(installed_version(&conn).unwrap(), 3);
    }

    #[test]
    fn test_unique_index_is_not_loosened() {
        let mut conn = fresh();
        ensure_schema(&mut conn, &users_v2(), 0).unwrap();
        ensure_schema(&mut conn, &users_v3(), 2).unwrap();

        let loose = SchemaCatalog::new(
            4,
            vec![CollectionSchema::new("users", "id").index("username", false)],
        );
        ensure_schema(&mut conn, &loose, 3).unwrap();
        assert!(installed_schema(&conn).unwrap()[0].indexes[0].unique);
    }

    #[test]
    fn test_drop_missing_index() {
        let mut conn = fresh();
        ensure_schema(&mut conn, &users_v2(), 0).unwrap();
        let err = drop_index(&mut conn, "users", "email").unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_index_tables_cannot_collide() {
        let mut conn = fresh();
        let colliding = SchemaCatalog::new(
            1,
            vec![
                CollectionSchema::new("a", "id").index("b__c", true),
                CollectionSchema::new("a__b", "id").index("c", false),
            ],
        );
        let err = ensure_schema(&mut conn, &colliding, 0).unwrap_err();
        assert!(matches!(err, StoreError::SchemaConflict(_)));
        assert!(installed_schema(&conn).unwrap().is_empty());

        let separated = SchemaCatalog::new(
            1,
            vec![
                CollectionSchema::new("a", "id").index("b_c", true),
                CollectionSchema::new("a_b", "id").index("c", false),
            ],
        );
        ensure_schema(&mut conn, &separated, 0).unwrap();
        assert_eq!(installed_schema(&conn).unwrap().len(), 2);
    }

    #[test]
    fn test_index_declared_twice() {
        let mut conn = fresh();
        let twice = SchemaCatalog::new(
            1,
            vec![CollectionSchema::new("products", "id")
                .index("barcode", false)
                .index("barcode", true)],
        );
        let err = ensure_schema(&mut conn, &twice, 0).unwrap_err();
        assert!(matches!(err, StoreError::SchemaConflict(_)));
    }

    #[test]
    fn test_index_entries_skip_records_without_field() {
        let mut conn = fresh();
        ensure_schema(
            &mut conn,
            &SchemaCatalog::new(1, vec![CollectionSchema::new("sales", "id")]),
            0,
        )
        .unwrap();
        put_raw(&conn, "sales", "s1", json!({"id": "s1", "customerId": "c1"}));
        put_raw(&conn, "sales", "s2", json!({"id": "s2"}));
        put_raw(&conn, "sales", "s3", json!({"id": "s3", "customerId": null}));

        create_index(
            &conn,
            "sales",
            &IndexSchema {
                field: "customerId".to_string(),
                unique: false,
            },
        )
        .unwrap();

        let entries: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM {}", index_table("sales", "customerId")),
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_invalid_names_rejected() {
        let mut conn = fresh();
        let bad = SchemaCatalog::new(
            1,
            vec![CollectionSchema::new("bad name", "id")],
        );
        let err = ensure_schema(&mut conn, &bad, 0).unwrap_err();
        assert!(matches!(err, StoreError::SchemaConflict(_)));
    }
}
