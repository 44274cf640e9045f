//! Staff authentication
//!
//! PIN login, the current session, role checks, and user provisioning on top
//! of the store's `users` collection. Invariant: once any user exists, at
//! least one of them is an Owner.

use crate::error::{Result, StoreError};
use crate::session::{Session, SessionStorage};
use crate::store::{CollectionTx, Record, Store, TxMode};
use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

const USERS: &str = "users";
const USERNAME_INDEX: &str = "username";

// ============================================================================
// DATA STRUCTURES
// ============================================================================

/// Staff role; Owner > Manager > Cashier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Cashier,
    Manager,
    Owner,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Cashier, Role::Manager, Role::Owner];

    pub fn rank(self) -> u8 {
        match self {
            Role::Cashier => 1,
            Role::Manager => 2,
            Role::Owner => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Cashier => "Cashier",
            Role::Manager => "Manager",
            Role::Owner => "Owner",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        Role::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| StoreError::Validation(format!("unknown role '{}'", s)))
    }
}

/// A user record as persisted in `users`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    /// Hex SHA-256 of the trimmed PIN; keep out of any user-facing output
    pub pin_hash: String,
    pub role: Role,
    /// RFC 3339
    pub created_at: String,
}

impl User {
    fn from_record(record: Record) -> Result<Self> {
        Ok(serde_json::from_value(Value::Object(record))?)
    }

    fn to_record(&self) -> Result<Record> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(StoreError::Storage(format!(
                "user encoded as non-object: {}",
                other
            ))),
        }
    }
}

/// User without credentials, for listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: String,
    pub username: String,
    pub role: Role,
    pub created_at: String,
}

impl From<&User> for UserSummary {
    fn from(user: &User) -> Self {
        UserSummary {
            id: user.id.clone(),
            username: user.username.clone(),
            role: user.role,
            created_at: user.created_at.clone(),
        }
    }
}

/// Fields to change on a user; `None` keeps the stored value
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserUpdate {
    pub username: Option<String>,
    /// Plain PIN, hashed before it is stored
    pub pin: Option<String>,
    pub role: Option<Role>,
}

// ============================================================================
// CREDENTIALS
// ============================================================================

pub mod credentials {
    use sha2::{Digest, Sha256};

    /// Lowercase hex SHA-256 of the trimmed PIN
    pub fn hash_pin(pin: &str) -> String {
        hex::encode(Sha256::digest(pin.trim().as_bytes()))
    }

    pub fn verify_pin(pin: &str, pin_hash: &str) -> bool {
        hash_pin(pin) == pin_hash
    }
}

// ============================================================================
// THE AUTH SERVICE
// ============================================================================

pub struct AuthService {
    store: Arc<Store>,
    sessions: SessionStorage,
}

impl AuthService {
    pub fn new(store: Arc<Store>) -> Self {
        AuthService {
            store,
            sessions: SessionStorage::new(),
        }
    }

    /// Check a username/PIN pair and start a session
    pub fn login(&self, username: &str, pin: &str) -> Result<Session> {
        let username = username.trim();

        let record = self
            .store
            .find_by_index(USERS, USERNAME_INDEX, &json!(username))?
            .ok_or_else(|| {
                warn!("Login refused: unknown user '{}'", username);
                StoreError::Auth("user not found".to_string())
            })?;
        let user = User::from_record(record)?;

        if !credentials::verify_pin(pin, &user.pin_hash) {
            warn!("Login refused: wrong PIN for '{}'", username);
            return Err(StoreError::Auth("invalid pin".to_string()));
        }

        let session = Session {
            user_id: user.id,
            username: user.username,
            role: user.role,
        };
        self.sessions.save(&session)?;
        info!("'{}' logged in as {}", session.username, session.role);
        Ok(session)
    }

    pub fn logout(&self) {
        if let Some(session) = self.sessions.load() {
            info!("'{}' logged out", session.username);
        }
        self.sessions.clear_session();
    }

    pub fn current_session(&self) -> Option<Session> {
        self.sessions.load()
    }

    /// Whether the logged-in user ranks at least `required`
    pub fn check_permission(&self, required: Role) -> bool {
        self.current_session()
            .map(|s| s.role.rank() >= required.rank())
            .unwrap_or(false)
    }

    pub fn add_user(&self, username: &str, pin: &str, role: &str) -> Result<User> {
        let username = username.trim();
        let pin = pin.trim();
        let role = role.trim();

        if username.is_empty() || pin.is_empty() || role.is_empty() {
            return Err(StoreError::Validation(
                "username, pin and role are required".to_string(),
            ));
        }
        let role: Role = role.parse()?;

        let user = User {
            id: format!("user-{}", Uuid::new_v4()),
            username: username.to_string(),
            pin_hash: credentials::hash_pin(pin),
            role,
            created_at: Utc::now().to_rfc3339(),
        };

        self.store.transact(USERS, TxMode::ReadWrite, |tx| {
            if tx.find_by_index(USERNAME_INDEX, &json!(username))?.is_some() {
                return Err(StoreError::ConstraintViolation(format!(
                    "username '{}' already exists",
                    username
                )));
            }
            if role != Role::Owner && tx.count()? == 0 {
                return Err(StoreError::InvariantViolation(
                    "the first user must be an Owner".to_string(),
                ));
            }
            tx.insert(user.to_record()?)?;
            Ok(())
        })?;

        info!("Added user '{}' ({})", user.username, user.role);
        Ok(user)
    }

    /// Merge `update` into a stored user.
    ///
    /// Fields the update leaves out, including ones this build does not know
    /// about, are kept from the stored record.
    pub fn update_user(&self, user_id: &str, update: UserUpdate) -> Result<User> {
        let key = json!(user_id);

        let user = self.store.transact(USERS, TxMode::ReadWrite, |tx| {
            let mut record = tx
                .get(&key)?
                .ok_or_else(|| StoreError::NotFound(format!("user '{}'", user_id)))?;
            let current = User::from_record(record.clone())?;

            if let Some(username) = &update.username {
                let username = username.trim();
                if username.is_empty() {
                    return Err(StoreError::Validation("username is required".to_string()));
                }
                if let Some(holder) = tx.find_by_index(USERNAME_INDEX, &json!(username))? {
                    if holder.get("id") != Some(&key) {
                        return Err(StoreError::ConstraintViolation(format!(
                            "username '{}' already exists",
                            username
                        )));
                    }
                }
                record.insert("username".to_string(), json!(username));
            }

            if let Some(pin) = &update.pin {
                if pin.trim().is_empty() {
                    return Err(StoreError::Validation("pin is required".to_string()));
                }
                record.insert("pinHash".to_string(), json!(credentials::hash_pin(pin)));
            }

            if let Some(role) = update.role {
                if current.role == Role::Owner && role != Role::Owner && owner_count(tx)? <= 1 {
                    return Err(StoreError::InvariantViolation(
                        "cannot demote the last owner".to_string(),
                    ));
                }
                record.insert("role".to_string(), json!(role));
            }

            let user = User::from_record(record.clone())?;
            tx.upsert(record)?;
            Ok(user)
        })?;

        info!("Updated user '{}'", user.username);
        Ok(user)
    }

    /// Remove a user; the last Owner cannot be removed
    pub fn delete_user(&self, user_id: &str) -> Result<()> {
        let key = json!(user_id);

        // Owner count and delete share one snapshot of `users`.
        let user = self.store.transact(USERS, TxMode::ReadWrite, |tx| {
            let record = tx
                .get(&key)?
                .ok_or_else(|| StoreError::NotFound(format!("user '{}'", user_id)))?;
            let user = User::from_record(record)?;

            if user.role == Role::Owner && owner_count(tx)? <= 1 {
                return Err(StoreError::InvariantViolation(
                    "cannot delete last owner".to_string(),
                ));
            }
            tx.delete(&key)?;
            Ok(user)
        })?;

        info!("Deleted user '{}'", user.username);
        Ok(())
    }

    pub fn all_users(&self) -> Result<Vec<User>> {
        self.store
            .get_all(USERS)?
            .into_iter()
            .map(User::from_record)
            .collect()
    }
}

fn owner_count(tx: &CollectionTx<'_>) -> Result<usize> {
    let owner = json!(Role::Owner);
    Ok(tx
        .all()?
        .iter()
        .filter(|r| r.get("role") == Some(&owner))
        .count())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> AuthService {
        AuthService::new(Arc::new(Store::open_in_memory().unwrap()))
    }

    fn with_owner() -> (AuthService, User) {
        let auth = service();
        let owner = auth.add_user("owner", "0000", "Owner").unwrap();
        (auth, owner)
    }

    #[test]
    fn test_hash_is_deterministic() {
        let a = credentials::hash_pin("0000");
        assert_eq!(a, credentials::hash_pin("0000"));
        assert_eq!(a, credentials::hash_pin(" 0000 "));
        assert_ne!(a, credentials::hash_pin("0001"));
        assert_eq!(a.len(), 64);
        assert_ne!(a, "0000");
    }

    #[test]
    fn test_role_parsing_and_rank() {
        assert_eq!("Manager".parse::<Role>().unwrap(), Role::Manager);
        assert!(matches!(
            "Admin".parse::<Role>().unwrap_err(),
            StoreError::Validation(_)
        ));
        assert!(Role::Owner.rank() > Role::Manager.rank());
        assert!(Role::Manager.rank() > Role::Cashier.rank());
        assert_eq!(Role::Cashier.to_string(), "Cashier");
    }

    #[test]
    fn test_add_and_login() {
        let (auth, owner) = with_owner();
        assert_eq!(owner.role, Role::Owner);
        assert_ne!(owner.pin_hash, "0000");
        assert!(owner.id.starts_with("user-"));

        let session = auth.login("owner", "0000").unwrap();
        assert_eq!(session.role, Role::Owner);
        assert_eq!(session.user_id, owner.id);
        assert_eq!(auth.current_session(), Some(session));
    }

    #[test]
    fn test_login_failures() {
        let (auth, _) = with_owner();

        let err = auth.login("owner", "0001").unwrap_err();
        assert!(matches!(err, StoreError::Auth(ref m) if m == "invalid pin"));

        let err = auth.login("nobody", "0000").unwrap_err();
        assert!(matches!(err, StoreError::Auth(ref m) if m == "user not found"));

        assert!(auth.current_session().is_none());
    }

    #[test]
    fn test_login_trims_input() {
        let (auth, _) = with_owner();
        assert!(auth.login("  owner ", " 0000 ").is_ok());
    }

    #[test]
    fn test_logout() {
        let (auth, _) = with_owner();
        auth.login("owner", "0000").unwrap();
        auth.logout();
        assert!(auth.current_session().is_none());
        assert!(!auth.check_permission(Role::Cashier));
        // Logging out twice is harmless.
        auth.logout();
    }

    #[test]
    fn test_permissions_follow_rank() {
        let (auth, _) = with_owner();
        auth.add_user("cashier", "1111", "Cashier").unwrap();

        assert!(!auth.check_permission(Role::Cashier));

        auth.login("cashier", "1111").unwrap();
        assert!(auth.check_permission(Role::Cashier));
        assert!(!auth.check_permission(Role::Manager));
        assert!(!auth.check_permission(Role::Owner));

        auth.login("owner", "0000").unwrap();
        for role in Role::ALL {
            assert!(auth.check_permission(role));
        }
    }

    #[test]
    fn test_add_user_validation() {
        let (auth, _) = with_owner();
        for (username, pin, role) in [("", "1", "Cashier"), ("a", "  ", "Cashier"), ("a", "1", "")] {
            let err = auth.add_user(username, pin, role).unwrap_err();
            assert!(matches!(err, StoreError::Validation(_)));
        }
        let err = auth.add_user("a", "1", "Admin").unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[test]
    fn test_duplicate_username_after_trim() {
        let (auth, _) = with_owner();
        let err = auth.add_user(" owner ", "1234", "Manager").unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(_)));
        assert_eq!(auth.all_users().unwrap().len(), 1);
    }

    #[test]
    fn test_first_user_must_be_owner() {
        let auth = service();
        let err = auth.add_user("cashier", "1111", "Cashier").unwrap_err();
        assert!(matches!(err, StoreError::InvariantViolation(_)));
    }

    #[test]
    fn test_update_user_merges() {
        let (auth, owner) = with_owner();
        let cashier = auth.add_user("cashier", "1111", "Cashier").unwrap();

        let updated = auth
            .update_user(
                &cashier.id,
                UserUpdate {
                    username: Some("  till1 ".to_string()),
                    pin: Some("2222".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.username, "till1");
        assert_eq!(updated.role, Role::Cashier);
        assert_eq!(updated.created_at, cashier.created_at);

        assert!(auth.login("till1", "2222").is_ok());
        assert!(auth.login("till1", "1111").is_err());
        assert!(auth.login("cashier", "1111").is_err());

        // The plain PIN never reaches the store.
        let stored = auth.store.get(USERS, &json!(cashier.id)).unwrap().unwrap();
        assert!(stored.get("pin").is_none());

        let err = auth
            .update_user(
                &cashier.id,
                UserUpdate {
                    username: Some(owner.username.clone()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(_)));
    }

    #[test]
    fn test_update_keeps_unknown_fields() {
        let (auth, owner) = with_owner();
        let mut record = auth.store.get(USERS, &json!(owner.id)).unwrap().unwrap();
        record.insert("displayName".to_string(), json!("The Boss"));
        auth.store.upsert(USERS, record).unwrap();

        auth.update_user(
            &owner.id,
            UserUpdate {
                pin: Some("4321".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

        let stored = auth.store.get(USERS, &json!(owner.id)).unwrap().unwrap();
        assert_eq!(stored["displayName"], "The Boss");
    }

    #[test]
    fn test_update_missing_user() {
        let (auth, _) = with_owner();
        let err = auth
            .update_user("user-nope", UserUpdate::default())
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_last_owner_cannot_be_demoted() {
        let (auth, owner) = with_owner();
        let err = auth
            .update_user(
                &owner.id,
                UserUpdate {
                    role: Some(Role::Manager),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::InvariantViolation(_)));
    }

    #[test]
    fn test_last_owner_cannot_be_deleted() {
        let (auth, owner) = with_owner();
        let err = auth.delete_user(&owner.id).unwrap_err();
        assert!(matches!(err, StoreError::InvariantViolation(ref m) if m == "cannot delete last owner"));
        assert_eq!(auth.all_users().unwrap().len(), 1);
    }

    #[test]
    fn test_delete_one_of_two_owners() {
        let (auth, owner) = with_owner();
        auth.add_user("partner", "5555", "Owner").unwrap();

        auth.delete_user(&owner.id).unwrap();
        let users = auth.all_users().unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].role, Role::Owner);
        assert_eq!(users[0].username, "partner");
    }

    #[test]
    fn test_delete_non_owner_and_missing() {
        let (auth, _) = with_owner();
        let cashier = auth.add_user("cashier", "1111", "Cashier").unwrap();
        auth.delete_user(&cashier.id).unwrap();

        let err = auth.delete_user(&cashier.id).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_summary_hides_pin_hash() {
        let (_, owner) = with_owner();
        let summary = serde_json::to_value(UserSummary::from(&owner)).unwrap();
        assert!(summary.get("pinHash").is_none());
        assert_eq!(summary["role"], "Owner");
    }
}
