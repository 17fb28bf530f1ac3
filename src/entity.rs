//! Untyped persistable records
//!
//! Assignments arrive from form-shaped external input, so entities carry a
//! JSON attribute map instead of typed fields. The core only creates, updates,
//! and links these records; it never extends the child's own type.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Attribute map shared by entities and incoming payload fragments
pub type AttributeMap = Map<String, Value>;

/// Persistence state of an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersistenceState {
    /// Not yet saved; has no identity
    New,
    /// Durably saved; has an identity
    Persisted,
}

/// A persistable record: a type tag, an optional identity, and attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Collection name in the persistence layer, e.g. `"categories"`
    pub entity_type: String,
    /// Present exactly when the entity is persisted
    pub id: Option<i64>,
    pub attributes: AttributeMap,
}

impl Entity {
    /// Create a new, unsaved entity
    pub fn new(entity_type: impl Into<String>, attributes: AttributeMap) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: None,
            attributes,
        }
    }

    /// Rebuild a persisted entity from backend storage
    pub fn persisted(entity_type: impl Into<String>, id: i64, attributes: AttributeMap) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: Some(id),
            attributes,
        }
    }

    pub fn state(&self) -> PersistenceState {
        if self.id.is_some() {
            PersistenceState::Persisted
        } else {
            PersistenceState::New
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }

    pub fn get(&self, attribute: &str) -> Option<&Value> {
        self.attributes.get(attribute)
    }

    /// String view of an attribute, when it holds one
    pub fn get_str(&self, attribute: &str) -> Option<&str> {
        self.attributes.get(attribute).and_then(Value::as_str)
    }

    pub fn set(&mut self, attribute: impl Into<String>, value: Value) {
        self.attributes.insert(attribute.into(), value);
    }

    /// Merge partial attributes over the current ones
    pub fn merge(&mut self, attributes: &AttributeMap) {
        for (key, value) in attributes {
            self.attributes.insert(key.clone(), value.clone());
        }
    }

    /// Display label: the label attribute's value when configured and present,
    /// otherwise a type-plus-state placeholder.
    pub fn describe(&self, label_attribute: Option<&str>) -> String {
        if let Some(label) = label_attribute.and_then(|attr| self.get_str(attr)) {
            if !label.trim().is_empty() {
                return label.to_string();
            }
        }
        match self.id {
            Some(id) => format!("{}#{}", self.entity_type, id),
            None => format!("{}(new)", self.entity_type),
        }
    }
}

/// Whether a payload value counts as blank: JSON null, a string that is empty
/// or whitespace, or an empty array/object.
pub fn value_is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// An attribute map is blank when it is empty or every value is blank.
/// Untouched form sections arrive in exactly this shape.
pub fn attributes_blank(attributes: &AttributeMap) -> bool {
    attributes.values().all(value_is_blank)
}
