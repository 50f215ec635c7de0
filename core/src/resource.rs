use serde_json::{Map, Value};

/// A resource (or set of search criteria) that may still be missing fields.
///
/// Always rebuilt from caller input; nothing here outlives a single call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PartialResource {
    pub resource_type: String,
    pub fields: Map<String, Value>,
}

impl PartialResource {
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            fields: Map::new(),
        }
    }

    /// Copy the entries of a JSON object. Non-objects yield an empty resource;
    /// a `resourceType` key is dropped in favour of `resource_type`.
    pub fn from_value(resource_type: impl Into<String>, value: Option<&Value>) -> Self {
        let mut partial = Self::new(resource_type);
        if let Some(Value::Object(map)) = value {
            for (key, value) in map {
                if key != "resourceType" {
                    partial.fields.insert(key.clone(), value.clone());
                }
            }
        }
        partial
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.fields.insert(key.into(), value);
    }

    /// True when `key` is absent or holds an empty value.
    pub fn is_missing(&self, key: &str) -> bool {
        self.fields.get(key).is_none_or(is_empty_value)
    }

    /// True when no field holds a non-empty value.
    pub fn is_empty(&self) -> bool {
        self.fields.values().all(is_empty_value)
    }

    /// Field map without `resourceType`, e.g. for search parameters.
    pub fn fields_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    /// FHIR JSON with `resourceType` first.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(
            "resourceType".to_string(),
            Value::String(self.resource_type.clone()),
        );
        for (key, value) in &self.fields {
            map.insert(key.clone(), value.clone());
        }
        Value::Object(map)
    }
}

/// Null, blank strings, empty arrays and empty objects all count as missing.
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}
