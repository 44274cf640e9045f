//! Async command surface
//!
//! What the application shell calls. Store calls block on the connection
//! mutex, so every command hops onto the blocking pool; errors cross this
//! boundary as strings.

use crate::auth::{AuthService, Role, UserSummary, UserUpdate};
use crate::config::StoreConfig;
use crate::session::Session;
use crate::store::{Record, Store};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

// ============================================================================
// STATE
// ============================================================================

/// Application state shared across commands
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub auth: Arc<AuthService>,
}

impl AppState {
    pub fn new(store: Store) -> Self {
        let store = Arc::new(store);
        let auth = Arc::new(AuthService::new(store.clone()));
        AppState { store, auth }
    }
}

#[derive(Serialize, Debug)]
pub struct StoreInfo {
    pub version: u32,
    /// Record count per collection
    pub collections: BTreeMap<String, u64>,
}

async fn blocking<T, F>(f: F) -> Result<T, String>
where
    F: FnOnce() -> crate::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| format!("store task failed: {}", e))?
        .map_err(String::from)
}

// ============================================================================
// STORE COMMANDS
// ============================================================================

/// Open (and migrate) the store, then build the shared state
pub async fn open_store(config: StoreConfig) -> Result<AppState, String> {
    let store = blocking(move || Store::open(&config)).await?;
    Ok(AppState::new(store))
}

pub async fn store_info(state: &AppState) -> Result<StoreInfo, String> {
    let store = state.store.clone();
    blocking(move || {
        let mut collections = BTreeMap::new();
        for collection in &store.catalog().collections {
            collections.insert(collection.name.clone(), store.count(&collection.name)?);
        }
        Ok(StoreInfo {
            version: store.version(),
            collections,
        })
    })
    .await
}

pub async fn get(
    state: &AppState,
    collection: String,
    key: Value,
) -> Result<Option<Record>, String> {
    let store = state.store.clone();
    blocking(move || store.get(&collection, &key)).await
}

/// Insert a record, returning its (possibly generated) key
pub async fn insert(state: &AppState, collection: String, record: Record) -> Result<Value, String> {
    let store = state.store.clone();
    blocking(move || store.insert(&collection, record)).await
}

pub async fn upsert(state: &AppState, collection: String, record: Record) -> Result<Value, String> {
    let store = state.store.clone();
    blocking(move || store.upsert(&collection, record)).await
}

pub async fn delete(state: &AppState, collection: String, key: Value) -> Result<(), String> {
    let store = state.store.clone();
    blocking(move || store.delete(&collection, &key)).await
}

pub async fn find_by_index(
    state: &AppState,
    collection: String,
    field: String,
    value: Value,
) -> Result<Option<Record>, String> {
    let store = state.store.clone();
    blocking(move || store.find_by_index(&collection, &field, &value)).await
}

pub async fn count(state: &AppState, collection: String) -> Result<u64, String> {
    let store = state.store.clone();
    blocking(move || store.count(&collection)).await
}

pub async fn get_all(state: &AppState, collection: String) -> Result<Vec<Record>, String> {
    let store = state.store.clone();
    blocking(move || store.get_all(&collection)).await
}

/// Upsert a batch in one transaction, returning how many were written
pub async fn import_records(
    state: &AppState,
    collection: String,
    records: Vec<Record>,
) -> Result<usize, String> {
    let store = state.store.clone();
    let total = records.len();
    blocking(move || store.bulk_upsert(&collection, records)).await?;
    Ok(total)
}

// ============================================================================
// AUTH COMMANDS
// ============================================================================

pub async fn login(state: &AppState, username: String, pin: String) -> Result<Session, String> {
    let auth = state.auth.clone();
    blocking(move || auth.login(&username, &pin)).await
}

pub async fn logout(state: &AppState) {
    state.auth.logout();
}

pub async fn current_session(state: &AppState) -> Option<Session> {
    state.auth.current_session()
}

pub async fn check_permission(state: &AppState, role: Role) -> bool {
    state.auth.check_permission(role)
}

pub async fn add_user(
    state: &AppState,
    username: String,
    pin: String,
    role: String,
) -> Result<UserSummary, String> {
    let auth = state.auth.clone();
    let user = blocking(move || auth.add_user(&username, &pin, &role)).await?;
    Ok(UserSummary::from(&user))
}

pub async fn list_users(state: &AppState) -> Result<Vec<UserSummary>, String> {
    let auth = state.auth.clone();
    let users = blocking(move || auth.all_users()).await?;
    Ok(users.iter().map(UserSummary::from).collect())
}

pub async fn update_user(
    state: &AppState,
    user_id: String,
    update: UserUpdate,
) -> Result<UserSummary, String> {
    let auth = state.auth.clone();
    let user = blocking(move || auth.update_user(&user_id, update)).await?;
    Ok(UserSummary::from(&user))
}

pub async fn delete_user(state: &AppState, user_id: String) -> Result<(), String> {
    let auth = state.auth.clone();
    blocking(move || auth.delete_user(&user_id)).await
}
