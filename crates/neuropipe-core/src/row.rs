//! Rows and row addresses.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::key::Key;
use crate::value::Value;

/// One committed instance of a table's schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub key: Key,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,
    /// Candidate key this row was computed for. Absent for ingested rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Key>,
}

impl Row {
    pub fn new(key: Key) -> Self {
        Self {
            key,
            attributes: BTreeMap::new(),
            source: None,
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Look an attribute up in the key first, then the secondary attributes.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.key.get(name).or_else(|| self.attributes.get(name))
    }

    /// Key and secondary attributes flattened into one mapping.
    pub fn flatten(&self) -> Key {
        let mut out = self.key.clone();
        for (name, value) in &self.attributes {
            if !out.contains(name) {
                out.insert(name.clone(), value.clone());
            }
        }
        out
    }
}

/// Address of a row: table name plus key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableKey {
    pub table: String,
    pub key: Key,
}

impl TableKey {
    pub fn new(table: impl Into<String>, key: Key) -> Self {
        Self {
            table: table.into(),
            key,
        }
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.table, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_prefers_key_then_attributes() {
        let row = Row::new(Key::new().with("session_id", 1)).with("subject", "rat1");
        assert_eq!(row.get("session_id"), Some(&Value::Int(1)));
        assert_eq!(row.get("subject"), Some(&Value::text("rat1")));
        assert_eq!(row.get("missing"), None);
        assert_eq!(row.flatten().len(), 2);
    }

    #[test]
    fn table_key_display() {
        let tk = TableKey::new("Session", Key::new().with("session_id", 1));
        assert_eq!(tk.to_string(), "Session{session_id=1}");
    }
}
