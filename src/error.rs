//! Error taxonomy shared by the store, the migration engine and auth.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Underlying engine I/O or open failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Primary-key or unique-index collision
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller input failed structural checks
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Operation would break a domain invariant
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Migration refused to apply a catalog against the installed schema
    #[error("Schema conflict: {0}")]
    SchemaConflict(String),
}

impl StoreError {
    /// Whether the caller can re-prompt and retry.
    ///
    /// Storage and schema failures leave the store unusable until it is
    /// reopened; everything else is a rejected request.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, StoreError::Storage(_) | StoreError::SchemaConflict(_))
    }
}

impl From<duckdb::Error> for StoreError {
    fn from(e: duckdb::Error) -> Self {
        StoreError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Storage(format!("record encoding: {}", e))
    }
}

impl From<StoreError> for String {
    fn from(e: StoreError) -> String {
        e.to_string()
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
