//! POS Store: offline persistence for the point of sale
//!
//! A versioned on-device store of named record collections with secondary
//! indexes, the migration engine that evolves it, and the staff
//! authentication layer built on its `users` collection.
//!
//! Architecture:
//! ```text
//! Commands (async, spawn_blocking)
//!     │
//!     ├─────► AuthService ──► SessionStorage (process-local)
//!     │         │
//!     │         ▼
//!     └─────► Store (CRUD, one transaction per call)
//!               │
//!               ▼
//!             Migration Engine ◄── SchemaCatalog
//!               │
//!               ▼
//!             DuckDB (file or in-memory)
//! ```
//!
//! Lifecycle: [`Store::open`] migrates before returning, so nothing can reach
//! the data until the schema is current. The store and the auth service are
//! created once at startup, shared through `Arc`, and dropped at exit.

pub mod auth;
pub mod commands;
pub mod config;
pub mod error;
pub mod migrate;
pub mod schema;
pub mod session;
pub mod store;

pub use auth::{AuthService, Role, User, UserSummary, UserUpdate};
pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use schema::{CollectionSchema, IndexSchema, SchemaCatalog, POS_SCHEMA_VERSION};
pub use session::{Session, SessionStorage, SESSION_KEY};
pub use store::{CollectionTx, Record, Store, TxMode};
