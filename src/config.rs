//! Store configuration
//!
//! Read from the environment by the binary, overridable on the command line.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const ENV_STORE_NAME: &str = "POS_STORE_NAME";
pub const ENV_DATA_DIR: &str = "POS_DATA_DIR";

const DEFAULT_STORE_NAME: &str = "pos";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store name; the database file is `<data_dir>/<name>.duckdb`
    pub name: String,
    /// Directory holding the database, `None` for an in-memory store
    pub data_dir: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            name: DEFAULT_STORE_NAME.to_string(),
            data_dir: None,
        }
    }
}

impl StoreConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn at(data_dir: impl Into<PathBuf>) -> Self {
        StoreConfig {
            data_dir: Some(data_dir.into()),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Build from `POS_STORE_NAME` / `POS_DATA_DIR`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(name) = lookup(ENV_STORE_NAME).filter(|n| !n.trim().is_empty()) {
            config.name = name.trim().to_string();
        }
        config.data_dir = lookup(ENV_DATA_DIR)
            .filter(|d| !d.trim().is_empty())
            .map(PathBuf::from);
        config
    }

    pub fn db_path(&self) -> Option<PathBuf> {
        self.data_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.duckdb", self.name)))
    }

    pub fn validate(&self) -> Result<()> {
        let valid = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if valid {
            Ok(())
        } else {
            Err(StoreError::Validation(format!(
                "invalid store name '{}'",
                self.name
            )))
        }
    }
}
