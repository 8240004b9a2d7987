//! Domain types for the admin API.
//!
//! # Design
//! The server owns the item schema and keeps adding fields to it, so `Item`
//! is an open JSON object rather than a fixed struct. Only the key fields the
//! client relies on get accessors. An `Item` is always a snapshot: holding one
//! says nothing about the server's current state.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::ApiError;

/// Name of the stable, human-assigned item key.
pub const DISP_ID: &str = "disp_id";

/// Name of the server-assigned internal identifier.
pub const INTERNAL_ID: &str = "_id";

/// A single item record.
///
/// Guaranteed to carry a non-empty string `disp_id`; every other field is
/// passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Item {
    fields: Map<String, Value>,
}

impl Item {
    /// Wrap a JSON object, rejecting it if `disp_id` is absent or empty.
    pub fn from_fields(fields: Map<String, Value>) -> Result<Self, ApiError> {
        match fields.get(DISP_ID) {
            Some(Value::String(s)) if !s.is_empty() => Ok(Self { fields }),
            Some(_) => Err(ApiError::InvalidResponseShape(format!(
                "`{DISP_ID}` must be a non-empty string"
            ))),
            None => Err(ApiError::InvalidResponseShape(format!("missing `{DISP_ID}`"))),
        }
    }

    /// Wrap any JSON value; non-objects are rejected.
    pub fn from_value(value: Value) -> Result<Self, ApiError> {
        match value {
            Value::Object(fields) => Self::from_fields(fields),
            other => Err(ApiError::InvalidResponseShape(format!(
                "expected an item object, got {}",
                json_type_name(&other)
            ))),
        }
    }

    pub fn disp_id(&self) -> &str {
        self.fields
            .get(DISP_ID)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// The server-assigned `_id`, if the item has been stored.
    pub fn internal_id(&self) -> Option<&str> {
        self.fields.get(INTERNAL_ID).and_then(Value::as_str)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }
}

impl<'de> Deserialize<'de> for Item {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let fields = Map::deserialize(deserializer)?;
        Item::from_fields(fields).map_err(serde::de::Error::custom)
    }
}

/// Publication state of an item's assets, set through `SetAssetStatus`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AssetStatus {
    Draft,
    PendingQa,
    Released,
    Archived,
    /// A status this client does not know yet. Sent back verbatim.
    Other(String),
}

impl AssetStatus {
    pub fn as_str(&self) -> &str {
        match self {
            AssetStatus::Draft => "draft",
            AssetStatus::PendingQa => "pending_qa",
            AssetStatus::Released => "released",
            AssetStatus::Archived => "archived",
            AssetStatus::Other(s) => s,
        }
    }
}

impl From<&str> for AssetStatus {
    fn from(s: &str) -> Self {
        match s {
            "draft" => AssetStatus::Draft,
            "pending_qa" => AssetStatus::PendingQa,
            "released" => AssetStatus::Released,
            "archived" => AssetStatus::Archived,
            other => AssetStatus::Other(other.to_string()),
        }
    }
}

impl fmt::Display for AssetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for AssetStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AssetStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(AssetStatus::from(s.as_str()))
    }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
