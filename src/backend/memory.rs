//! In-memory backend
//!
//! Reference implementation of [`Backend`] over plain maps, with per-type
//! required-attribute validation so child save failures can be exercised.
//! The test suite runs entirely against this backend.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use crate::backend::Backend;
use crate::entity::{value_is_blank, AttributeMap, Entity};
use crate::error::{RelationError, RelationResult, SaveError, SaveResult, ValidationErrors};
use crate::relation::{Linkage, RelationDescriptor};

#[derive(Debug, Default)]
pub struct MemoryBackend {
    tables: HashMap<String, BTreeMap<i64, AttributeMap>>,
    required: HashMap<String, Vec<String>>,
    next_id: i64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an attribute that must be present and non-blank for the type
    /// to save
    pub fn require_attribute(
        mut self,
        entity_type: impl Into<String>,
        attribute: impl Into<String>,
    ) -> Self {
        self.required
            .entry(entity_type.into())
            .or_default()
            .push(attribute.into());
        self
    }

    /// Validate-and-save convenience for seeding test data
    pub fn create(
        &mut self,
        entity_type: impl Into<String>,
        attributes: AttributeMap,
    ) -> RelationResult<Entity> {
        let mut entity = Entity::new(entity_type, attributes);
        match self.save(&mut entity) {
            Ok(()) => Ok(entity),
            Err(SaveError::Invalid(errors)) => Err(RelationError::Backend(format!(
                "seed record invalid: {}",
                errors
            ))),
            Err(SaveError::Fatal(error)) => Err(error),
        }
    }

    pub fn count(&self, entity_type: &str) -> usize {
        self.tables.get(entity_type).map_or(0, BTreeMap::len)
    }

    /// First entity of the type whose attribute equals the value
    pub fn find_first_by(&self, entity_type: &str, attribute: &str, value: &str) -> Option<Entity> {
        let table = self.tables.get(entity_type)?;
        table
            .iter()
            .find(|(_, attrs)| attrs.get(attribute).and_then(Value::as_str) == Some(value))
            .map(|(id, attrs)| Entity::persisted(entity_type, *id, attrs.clone()))
    }

    fn validate(&self, entity_type: &str, attributes: &AttributeMap) -> ValidationErrors {
        let mut errors = ValidationErrors::new();
        if let Some(required) = self.required.get(entity_type) {
            for attribute in required {
                let blank = attributes.get(attribute).map_or(true, value_is_blank);
                if blank {
                    errors.add(attribute.clone(), "can't be blank");
                }
            }
        }
        errors
    }

    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn table(&self, entity_type: &str) -> Option<&BTreeMap<i64, AttributeMap>> {
        self.tables.get(entity_type)
    }

    fn id_of(attributes: &AttributeMap, key: &str) -> Option<i64> {
        attributes.get(key).and_then(Value::as_i64)
    }
}

impl Backend for MemoryBackend {
    fn find_by_id(&self, entity_type: &str, id: i64) -> RelationResult<Entity> {
        self.table(entity_type)
            .and_then(|table| table.get(&id))
            .map(|attrs| Entity::persisted(entity_type, id, attrs.clone()))
            .ok_or_else(|| RelationError::NotFound {
                entity_type: entity_type.to_string(),
                id,
            })
    }

    fn find_or_init_by(
        &self,
        entity_type: &str,
        attribute: &str,
        value: &str,
    ) -> RelationResult<Entity> {
        if let Some(found) = self.find_first_by(entity_type, attribute, value) {
            return Ok(found);
        }
        let mut attributes = AttributeMap::new();
        attributes.insert(attribute.to_string(), Value::String(value.to_string()));
        Ok(Entity::new(entity_type, attributes))
    }

    fn save(&mut self, entity: &mut Entity) -> SaveResult {
        let errors = self.validate(&entity.entity_type, &entity.attributes);
        if !errors.is_empty() {
            return Err(SaveError::Invalid(errors));
        }
        let id = match entity.id {
            Some(id) => id,
            None => {
                let id = self.allocate_id();
                entity.id = Some(id);
                id
            }
        };
        self.tables
            .entry(entity.entity_type.clone())
            .or_default()
            .insert(id, entity.attributes.clone());
        Ok(())
    }

    fn update(&mut self, entity_type: &str, id: i64, attributes: &AttributeMap) -> SaveResult {
        let current = self
            .tables
            .get(entity_type)
            .and_then(|table| table.get(&id))
            .cloned()
            .ok_or_else(|| {
                SaveError::Fatal(RelationError::NotFound {
                    entity_type: entity_type.to_string(),
                    id,
                })
            })?;

        let mut merged = current;
        for (key, value) in attributes {
            merged.insert(key.clone(), value.clone());
        }
        let errors = self.validate(entity_type, &merged);
        if !errors.is_empty() {
            return Err(SaveError::Invalid(errors));
        }
        if let Some(table) = self.tables.get_mut(entity_type) {
            table.insert(id, merged);
        }
        Ok(())
    }

    fn member_ids(&self, parent: &Entity, relation: &RelationDescriptor) -> RelationResult<Vec<i64>> {
        let Some(parent_id) = parent.id else {
            return Ok(Vec::new());
        };
        match &relation.linkage {
            Linkage::Direct { foreign_key } => {
                let ids = self
                    .table(&relation.target)
                    .map(|table| {
                        table
                            .iter()
                            .filter(|(_, attrs)| Self::id_of(attrs, foreign_key) == Some(parent_id))
                            .map(|(id, _)| *id)
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(ids)
            }
            Linkage::ThroughJoin {
                join_type,
                parent_key,
                child_key,
            } => {
                let ids = self
                    .table(join_type)
                    .map(|table| {
                        table
                            .values()
                            .filter(|attrs| Self::id_of(attrs, parent_key) == Some(parent_id))
                            .filter_map(|attrs| Self::id_of(attrs, child_key))
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(ids)
            }
        }
    }

    fn clear_membership(
        &mut self,
        parent: &Entity,
        relation: &RelationDescriptor,
    ) -> RelationResult<()> {
        let Some(parent_id) = parent.id else {
            return Ok(());
        };
        match &relation.linkage {
            Linkage::Direct { foreign_key } => {
                if let Some(table) = self.tables.get_mut(&relation.target) {
                    for attrs in table.values_mut() {
                        if Self::id_of(attrs, foreign_key) == Some(parent_id) {
                            attrs.insert(foreign_key.clone(), Value::Null);
                        }
                    }
                }
            }
            Linkage::ThroughJoin {
                join_type,
                parent_key,
                ..
            } => {
                if let Some(table) = self.tables.get_mut(join_type) {
                    table.retain(|_, attrs| Self::id_of(attrs, parent_key) != Some(parent_id));
                }
            }
        }
        Ok(())
    }

    fn attach(
        &mut self,
        parent: &Entity,
        relation: &RelationDescriptor,
        child_id: i64,
    ) -> RelationResult<()> {
        let parent_id = parent.id.ok_or_else(|| {
            RelationError::Backend(format!(
                "cannot attach to unsaved parent '{}'",
                parent.entity_type
            ))
        })?;
        match &relation.linkage {
            Linkage::Direct { foreign_key } => {
                let attrs = self
                    .tables
                    .get_mut(&relation.target)
                    .and_then(|table| table.get_mut(&child_id))
                    .ok_or_else(|| RelationError::NotFound {
                        entity_type: relation.target.clone(),
                        id: child_id,
                    })?;
                attrs.insert(foreign_key.clone(), Value::from(parent_id));
                Ok(())
            }
            Linkage::ThroughJoin {
                join_type,
                parent_key,
                child_key,
            } => {
                let id = self.allocate_id();
                let mut attrs = AttributeMap::new();
                attrs.insert(parent_key.clone(), Value::from(parent_id));
                attrs.insert(child_key.clone(), Value::from(child_id));
                self.tables
                    .entry(join_type.clone())
                    .or_default()
                    .insert(id, attrs);
                Ok(())
            }
        }
    }
}
