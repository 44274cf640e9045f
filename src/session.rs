//! Ephemeral session state
//!
//! The current identity lives in a process-local key-value slot, never in the
//! durable store. It is gone on logout or when the process exits.

use crate::auth::Role;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Slot holding the serialized [`Session`]
pub const SESSION_KEY: &str = "pos_session";

/// Proof of the currently authenticated staff member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user_id: String,
    pub username: String,
    pub role: Role,
}

/// String slots scoped to one application instance
#[derive(Debug, Default)]
pub struct SessionStorage {
    slots: RwLock<HashMap<String, String>>,
}

impl SessionStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_item(&self, key: &str) -> Option<String> {
        match self.slots.read() {
            Ok(slots) => slots.get(key).cloned(),
            Err(poisoned) => poisoned.into_inner().get(key).cloned(),
        }
    }

    pub fn set_item(&self, key: &str, value: String) {
        match self.slots.write() {
            Ok(mut slots) => slots.insert(key.to_string(), value),
            Err(poisoned) => poisoned.into_inner().insert(key.to_string(), value),
        };
    }

    pub fn remove_item(&self, key: &str) {
        match self.slots.write() {
            Ok(mut slots) => slots.remove(key),
            Err(poisoned) => poisoned.into_inner().remove(key),
        };
    }

    /// Store `session` under [`SESSION_KEY`]
    pub fn save(&self, session: &Session) -> serde_json::Result<()> {
        self.set_item(SESSION_KEY, serde_json::to_string(session)?);
        Ok(())
    }

    /// The session under [`SESSION_KEY`]; an unreadable slot counts as none
    pub fn load(&self) -> Option<Session> {
        let raw = self.get_item(SESSION_KEY)?;
        match serde_json::from_str(&raw) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!("Ignoring unreadable session slot: {}", e);
                None
            }
        }
    }

    pub fn clear_session(&self) {
        self.remove_item(SESSION_KEY);
    }
}
