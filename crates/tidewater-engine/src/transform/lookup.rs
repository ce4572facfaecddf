//! Read-only reference data for referential checks and enrichment.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

use crate::config::types::ReferenceTable;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    /// The table exists but cannot be read right now. Retried.
    #[error("reference table '{table}' unavailable: {reason}")]
    Unavailable { table: String, reason: String },
    /// No such table. Not retried.
    #[error("unknown reference table '{0}'")]
    UnknownTable(String),
}

/// Read-only keyed lookup shared by all workers.
pub trait ReferenceLookup: Send + Sync {
    /// Whether `key` exists in `table`.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError`] when the table is unknown or unavailable.
    fn contains(&self, table: &str, key: &str) -> Result<bool, LookupError>;

    /// Attribute row for `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError`] when the table is unknown or unavailable.
    fn row(&self, table: &str, key: &str) -> Result<Option<Map<String, Value>>, LookupError>;
}

enum Table {
    Keys(BTreeSet<String>),
    Rows(BTreeMap<String, Map<String, Value>>),
}

/// In-memory tables loaded from pipeline configuration.
#[derive(Default)]
pub struct StaticReferences {
    tables: BTreeMap<String, Table>,
}

impl StaticReferences {
    #[must_use]
    pub fn from_config(references: &BTreeMap<String, ReferenceTable>) -> Self {
        let tables = references
            .iter()
            .map(|(name, table)| {
                let table = match table {
                    ReferenceTable::Keys(keys) => Table::Keys(keys.iter().cloned().collect()),
                    ReferenceTable::Rows(rows) => Table::Rows(rows.clone()),
                };
                (name.clone(), table)
            })
            .collect();
        Self { tables }
    }

    fn table(&self, name: &str) -> Result<&Table, LookupError> {
        self.tables
            .get(name)
            .ok_or_else(|| LookupError::UnknownTable(name.to_string()))
    }
}

impl ReferenceLookup for StaticReferences {
    fn contains(&self, table: &str, key: &str) -> Result<bool, LookupError> {
        Ok(match self.table(table)? {
            Table::Keys(keys) => keys.contains(key),
            Table::Rows(rows) => rows.contains_key(key),
        })
    }

    fn row(&self, table: &str, key: &str) -> Result<Option<Map<String, Value>>, LookupError> {
        Ok(match self.table(table)? {
            Table::Keys(keys) => keys.contains(key).then(Map::new),
            Table::Rows(rows) => rows.get(key).cloned(),
        })
    }
}

/// Key text for a scalar JSON value; `None` for null, arrays and objects.
pub(crate) fn key_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}
