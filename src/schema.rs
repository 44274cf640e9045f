//! Schema Catalog
//!
//! Declarative description of every collection the POS keeps on device.
//! The catalog is pure data: the migration engine diffs it against the
//! installed schema, the store reads it to know each collection's key field.
//!
//! ```text
//! ┌──────────────┬─────────────┬──────────────────────────────────┐
//! │ collection   │ primary key │ indexes (unique?)                │
//! ├──────────────┼─────────────┼──────────────────────────────────┤
//! │ products     │ id          │ name (no), barcode (yes)         │
//! │ sales        │ id          │ timestamp (no), customerId (no)  │
//! │ purchases    │ id          │ timestamp (no), supplierId (no)  │
//! │ customers    │ id          │ name (no)                        │
//! │ suppliers    │ id          │ name (no)                        │
//! │ users        │ id          │ username (yes)                   │
//! │ settings     │ key         │                                  │
//! │ counters     │ id          │                                  │
//! └──────────────┴─────────────┴──────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};

/// Version the POS catalog migrates a store to.
///
/// v1 shipped products/sales/customers/suppliers, v2 added users with a
/// non-unique username index, v3 added purchases/settings/counters and made
/// the username index unique.
pub const POS_SCHEMA_VERSION: u32 = 3;

/// A secondary index over one record field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSchema {
    /// Record field the index reads (also the index name)
    pub field: String,
    /// At most one record per value
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub name: String,
    /// Field holding each record's key; immutable once created
    pub key_field: String,
    pub indexes: Vec<IndexSchema>,
}

impl CollectionSchema {
    pub fn new(name: &str, key_field: &str) -> Self {
        CollectionSchema {
            name: name.to_string(),
            key_field: key_field.to_string(),
            indexes: Vec::new(),
        }
    }

    pub fn index(mut self, field: &str, unique: bool) -> Self {
        self.indexes.push(IndexSchema {
            field: field.to_string(),
            unique,
        });
        self
    }

    pub fn find_index(&self, field: &str) -> Option<&IndexSchema> {
        self.indexes.iter().find(|i| i.field == field)
    }
}

/// The full set of collections at a target version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaCatalog {
    pub version: u32,
    pub collections: Vec<CollectionSchema>,
}

impl SchemaCatalog {
    pub fn new(version: u32, collections: Vec<CollectionSchema>) -> Self {
        SchemaCatalog {
            version,
            collections,
        }
    }

    /// The catalog the point-of-sale application runs against
    pub fn pos() -> Self {
        SchemaCatalog::new(
            POS_SCHEMA_VERSION,
            vec![
                CollectionSchema::new("products", "id")
                    .index("name", false)
                    .index("barcode", true),
                CollectionSchema::new("sales", "id")
                    .index("timestamp", false)
                    .index("customerId", false),
                CollectionSchema::new("purchases", "id")
                    .index("timestamp", false)
                    .index("supplierId", false),
                CollectionSchema::new("customers", "id").index("name", false),
                CollectionSchema::new("suppliers", "id").index("name", false),
                CollectionSchema::new("users", "id").index("username", true),
                CollectionSchema::new("settings", "key"),
                CollectionSchema::new("counters", "id"),
            ],
        )
    }

    pub fn collection(&self, name: &str) -> Option<&CollectionSchema> {
        self.collections.iter().find(|c| c.name == name)
    }
}

/// Collection, index and field names end up in table identifiers.
pub(crate) fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
