//! Row type mirrored from a remote table.

use crate::{error::Result, Error, RowId};
use serde::{Deserialize, Serialize};

/// Caller-defined fields of a row.
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// A record of a remote table.
///
/// Serialized flat: `{"id": "...", "name": "...", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Unique identifier, assigned by the backend and never changed
    pub id: RowId,
    /// Every other column
    #[serde(flatten)]
    pub fields: Fields,
}

impl Row {
    /// Create a row from an id and its fields.
    pub fn new(id: impl Into<RowId>, fields: Fields) -> Self {
        let mut fields = fields;
        fields.remove("id");
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Build a row from a JSON object containing a string `id`.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let serde_json::Value::Object(mut fields) = value else {
            return Err(Error::InvalidPayload("row must be an object".into()));
        };
        let id = match fields.remove("id") {
            Some(serde_json::Value::String(id)) => id,
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => return Err(Error::InvalidPayload("row is missing a string id".into())),
        };
        Ok(Self { id, fields })
    }

    /// Get a column value. `id` resolves to the row id.
    pub fn get(&self, column: &str) -> Option<serde_json::Value> {
        if column == "id" {
            return Some(serde_json::Value::String(self.id.clone()));
        }
        self.fields.get(column).cloned()
    }

    /// Borrow a non-id column value.
    pub fn field(&self, column: &str) -> Option<&serde_json::Value> {
        self.fields.get(column)
    }

    /// Overwrite the given columns, leaving the others untouched.
    ///
    /// An `id` key in `patch` is ignored.
    pub fn merge(&mut self, patch: &Fields) {
        for (key, value) in patch {
            if key != "id" {
                self.fields.insert(key.clone(), value.clone());
            }
        }
    }

    /// The row as a flat JSON object.
    pub fn to_value(&self) -> serde_json::Value {
        let mut obj = self.fields.clone();
        obj.insert("id".into(), serde_json::Value::String(self.id.clone()));
        serde_json::Value::Object(obj)
    }
}
