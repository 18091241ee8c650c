use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tenant identifier, e.g. `"acme"`.
pub type TenantId = String;
/// Document identifier as stored in the index. For multi-tenant indexes this
/// is the tenant-scoped form produced by the multi-tenancy strategy.
pub type DocumentId = String;

/// The serialized field set written for one document.
///
/// Opaque to the coordination core: it is produced by a
/// [`DocumentMapper`](crate::plan::DocumentMapper) at `prepare()` time and only
/// ever tagged (tenant field) before reaching a backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DocumentPayload {
    pub fields: BTreeMap<String, FieldValue>,
}

impl DocumentPayload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a payload from a JSON object.
    ///
    /// Nulls are dropped; every other JSON value maps to a [`FieldValue`].
    ///
    /// # Errors
    ///
    /// Returns [`crate::SearchBindError::InvalidDocument`] if the value is not a
    /// JSON object.
    pub fn from_json(json: &serde_json::Value) -> crate::error::Result<Self> {
        use crate::error::SearchBindError;

        let obj = json
            .as_object()
            .ok_or_else(|| SearchBindError::InvalidDocument("Expected JSON object".to_string()))?;

        let mut fields = BTreeMap::new();
        for (key, val) in obj {
            if let Some(field_value) = json_value_to_field_value(val) {
                fields.insert(key.clone(), field_value);
            }
        }

        Ok(DocumentPayload { fields })
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (key, field_value) in &self.fields {
            map.insert(key.clone(), field_value_to_json_value(field_value));
        }
        serde_json::Value::Object(map)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.insert(name, value);
        self
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

pub fn json_value_to_field_value(val: &serde_json::Value) -> Option<FieldValue> {
    match val {
        serde_json::Value::String(s) => Some(FieldValue::Text(s.clone())),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(FieldValue::Integer(i))
            } else {
                n.as_f64().map(FieldValue::Float)
            }
        }
        serde_json::Value::Bool(b) => Some(FieldValue::Bool(*b)),
        serde_json::Value::Array(arr) => {
            let items: Vec<FieldValue> = arr.iter().filter_map(json_value_to_field_value).collect();
            Some(FieldValue::Array(items))
        }
        serde_json::Value::Object(obj) => {
            let mut nested = BTreeMap::new();
            for (k, v) in obj {
                if let Some(field_val) = json_value_to_field_value(v) {
                    nested.insert(k.clone(), field_val);
                }
            }
            Some(FieldValue::Object(nested))
        }
        serde_json::Value::Null => None,
    }
}

pub fn field_value_to_json_value(field_value: &FieldValue) -> serde_json::Value {
    match field_value {
        FieldValue::Text(s) => serde_json::Value::String(s.clone()),
        FieldValue::Integer(i) => serde_json::json!(i),
        FieldValue::Float(f) => serde_json::json!(f),
        FieldValue::Bool(b) => serde_json::Value::Bool(*b),
        FieldValue::Array(arr) => {
            let items: Vec<serde_json::Value> = arr.iter().map(field_value_to_json_value).collect();
            serde_json::Value::Array(items)
        }
        FieldValue::Object(obj) => {
            let mut map = serde_json::Map::new();
            for (k, v) in obj {
                map.insert(k.clone(), field_value_to_json_value(v));
            }
            serde_json::Value::Object(map)
        }
    }
}

/// A dynamically-typed field value stored in a [`DocumentPayload`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FieldValue {
    Object(BTreeMap<String, FieldValue>),
    Array(Vec<FieldValue>),
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Render scalar values as a routing-friendly string. Composite values
    /// have no canonical string form.
    pub fn to_key_string(&self) -> Option<String> {
        match self {
            FieldValue::Text(s) => Some(s.clone()),
            FieldValue::Integer(i) => Some(i.to_string()),
            FieldValue::Float(f) => Some(f.to_string()),
            FieldValue::Bool(b) => Some(b.to_string()),
            FieldValue::Array(_) | FieldValue::Object(_) => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        FieldValue::Integer(i)
    }
}
