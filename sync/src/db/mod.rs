//! Local persistence over SQLite.
//!
//! Each database is one SQLite file holding any number of sub-stores. A
//! sub-store is a named set of JSON records with a key field and optional
//! indexes; sub-stores are created on demand through [`StoreManager`].

mod handle;
mod manager;
mod pool;

pub use handle::StoreHandle;
pub use manager::{StoreManager, MAX_UPGRADE_ATTEMPTS};
pub use pool::*;

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};

/// A secondary index: equality on `field`, results sorted by `order_by`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSpec {
    pub name: String,
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,
}

/// Sub-store options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreOptions {
    /// Field holding each record's string key
    pub key_field: String,
    #[serde(default)]
    pub indexes: Vec<IndexSpec>,
}

impl StoreOptions {
    pub fn keyed_by(key_field: impl Into<String>) -> Self {
        Self {
            key_field: key_field.into(),
            indexes: Vec::new(),
        }
    }

    pub fn with_index(
        mut self,
        name: impl Into<String>,
        field: impl Into<String>,
        order_by: Option<&str>,
    ) -> Self {
        self.indexes.push(IndexSpec {
            name: name.into(),
            field: field.into(),
            order_by: order_by.map(str::to_string),
        });
        self
    }

    pub fn index(&self, name: &str) -> Option<&IndexSpec> {
        self.indexes.iter().find(|i| i.name == name)
    }

    /// Field and index names end up in SQL text, so only identifiers pass.
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.key_field)?;
        for index in &self.indexes {
            validate_name(&index.name)?;
            validate_name(&index.field)?;
            if let Some(order_by) = &index.order_by {
                validate_name(order_by)?;
            }
        }
        Ok(())
    }
}

/// Accept ASCII identifiers: letters, digits, `_` and `-`, not empty.
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(SyncError::InvalidName(name.to_string()))
    }
}
