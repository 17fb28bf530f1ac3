//! Relation registry - the static per-parent-type registration table
//!
//! Replaces open-ended generated accessors with one table built once at
//! parent-type definition time; all dispatch is keyed by relation name plus
//! mode.

use std::sync::Arc;

use crate::entity::Entity;
use crate::error::{RelationError, RelationResult};
use crate::relation::{BeforeCreate, BlankPolicy, RelationDescriptor, RelationMode};

/// Immutable set of relation declarations for one parent type
#[derive(Debug, Clone, Default)]
pub struct RelationRegistry {
    relations: Vec<RelationDescriptor>,
    strict: bool,
}

impl RelationRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Look up a relation by its (plural) name
    pub fn get(&self, name: &str) -> Option<&RelationDescriptor> {
        self.relations.iter().find(|r| r.name == name)
    }

    /// Look up a relation by its singular form
    pub fn get_by_singular(&self, singular: &str) -> Option<&RelationDescriptor> {
        self.relations.iter().find(|r| r.singular == singular)
    }

    /// Look up a relation by name, failing with `UnknownRelation`
    pub fn resolve(&self, name: &str) -> RelationResult<&RelationDescriptor> {
        self.get(name).ok_or_else(|| RelationError::UnknownRelation {
            name: name.to_string(),
        })
    }

    pub fn has_relation(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn relation_names(&self) -> Vec<&str> {
        self.relations.iter().map(|r| r.name.as_str()).collect()
    }

    /// Child failures are aggregated and raised when strict, silently
    /// discarded otherwise
    pub fn strict(&self) -> bool {
        self.strict
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }
}

/// Declarative setup for a parent type's relations
///
/// Each verb wires one relation into a mode; every mode also carries the
/// default `add_`/`manage_` machinery. Per-relation overrides are recorded
/// here and resolved at `build`, where a name matching no declared relation
/// is a configuration error.
#[derive(Default)]
pub struct RegistryBuilder {
    relations: Vec<RelationDescriptor>,
    blank_policies: Vec<(String, BlankPolicy)>,
    before_creates: Vec<(String, BeforeCreate)>,
    strict: bool,
}

impl RegistryBuilder {
    /// Id-set mode: replace membership with exactly the given existing ids
    pub fn by_ids(mut self, relation: RelationDescriptor) -> Self {
        self.push(relation, RelationMode::ByIds);
        self
    }

    /// String mode: find-or-create children by the given label attribute
    pub fn by_string(mut self, relation: RelationDescriptor, label_attribute: &str) -> Self {
        let relation = relation.with_label(label_attribute);
        self.push(relation, RelationMode::ByString);
        self
    }

    /// Forced mode: as `by_ids`, plus early creation that survives a failed
    /// parent save
    pub fn by_force(mut self, relation: RelationDescriptor) -> Self {
        self.push(relation, RelationMode::ByForce);
        self
    }

    /// Only the default create/manage accessors, no id or string sugar
    pub fn just_defaults(mut self, relation: RelationDescriptor) -> Self {
        self.push(relation, RelationMode::JustDefaults);
        self
    }

    /// Aggregate and raise child failures instead of discarding them
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Override blank detection for a declared relation; an unknown name
    /// fails at `build`
    pub fn blank_policy(mut self, name: &str, policy: BlankPolicy) -> Self {
        self.blank_policies.push((name.to_string(), policy));
        self
    }

    /// Attach a before-create callback to a declared relation; an unknown
    /// name fails at `build`
    pub fn before_create<F>(mut self, name: &str, callback: F) -> Self
    where
        F: Fn(&mut Entity, &Entity) + Send + Sync + 'static,
    {
        self.before_creates.push((name.to_string(), Arc::new(callback)));
        self
    }

    fn push(&mut self, mut relation: RelationDescriptor, mode: RelationMode) {
        relation.mode = mode;
        self.relations.push(relation);
    }

    /// Validate every declaration, resolve overrides, and freeze the registry
    pub fn build(mut self) -> RelationResult<RelationRegistry> {
        for (name, policy) in std::mem::take(&mut self.blank_policies) {
            let relation = self
                .relations
                .iter_mut()
                .find(|r| r.name == name)
                .ok_or_else(|| {
                    RelationError::Configuration(format!(
                        "blank policy names undeclared relation '{}'",
                        name
                    ))
                })?;
            relation.blank_policy = policy;
        }
        for (name, callback) in std::mem::take(&mut self.before_creates) {
            let relation = self
                .relations
                .iter_mut()
                .find(|r| r.name == name)
                .ok_or_else(|| {
                    RelationError::Configuration(format!(
                        "before-create callback names undeclared relation '{}'",
                        name
                    ))
                })?;
            relation.before_create = Some(callback);
        }

        for (index, relation) in self.relations.iter().enumerate() {
            relation.validate()?;
            let duplicate = self.relations[..index]
                .iter()
                .any(|other| other.name == relation.name || other.singular == relation.singular);
            if duplicate {
                return Err(RelationError::Configuration(format!(
                    "relation '{}' is declared more than once",
                    relation.name
                )));
            }
        }
        Ok(RelationRegistry {
            relations: self.relations,
            strict: self.strict,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn categories() -> RelationDescriptor {
        RelationDescriptor::through(
            "categories",
            "category",
            "categories",
            "categorizations",
            "document_id",
            "category_id",
        )
    }

    fn tags() -> RelationDescriptor {
        RelationDescriptor::through(
            "tags",
            "tag",
            "tags",
            "taggings",
            "document_id",
            "tag_id",
        )
    }

    #[test]
    fn test_registry_lookup() {
        let registry = RelationRegistry::builder()
            .by_ids(categories())
            .by_string(tags(), "title")
            .build()
            .unwrap();

        assert!(registry.has_relation("categories"));
        assert_eq!(registry.get("categories").unwrap().mode, RelationMode::ByIds);
        assert_eq!(
            registry.get_by_singular("tag").unwrap().name,
            "tags".to_string()
        );
        assert!(registry.get("nope").is_none());
        assert_eq!(registry.relation_names(), vec!["categories", "tags"]);
    }

    #[test]
    fn test_by_string_sets_label() {
        let registry = RelationRegistry::builder()
            .by_string(tags(), "title")
            .build()
            .unwrap();
        assert_eq!(
            registry.get("tags").unwrap().label_attribute.as_deref(),
            Some("title")
        );
    }

    #[test]
    fn test_duplicate_relation_rejected() {
        let result = RelationRegistry::builder()
            .by_ids(categories())
            .just_defaults(categories())
            .build();
        assert!(matches!(result, Err(RelationError::Configuration(_))));
    }

    #[test]
    fn test_strict_flag() {
        let registry = RelationRegistry::builder()
            .by_ids(categories())
            .strict()
            .build()
            .unwrap();
        assert!(registry.strict());
    }

    #[test]
    fn test_before_create_wired_through_builder() {
        let registry = RelationRegistry::builder()
            .by_ids(categories())
            .before_create("categories", |child, _| {
                child.set("kind", "default".into());
            })
            .build()
            .unwrap();
        assert!(registry.get("categories").unwrap().before_create.is_some());
    }

    #[test]
    fn test_blank_policy_applies_to_declared_relation() {
        let registry = RelationRegistry::builder()
            .by_ids(categories())
            .blank_policy("categories", BlankPolicy::TopLevelOnly)
            .build()
            .unwrap();
        assert_eq!(
            registry.get("categories").unwrap().blank_policy,
            BlankPolicy::TopLevelOnly
        );
    }

    #[test]
    fn test_blank_policy_on_undeclared_relation_fails_build() {
        // a typo'd name must not silently configure nothing
        let result = RelationRegistry::builder()
            .by_ids(categories())
            .blank_policy("catgeories", BlankPolicy::TopLevelOnly)
            .build();
        assert!(matches!(result, Err(RelationError::Configuration(_))));
    }

    #[test]
    fn test_before_create_on_undeclared_relation_fails_build() {
        let result = RelationRegistry::builder()
            .by_ids(categories())
            .before_create("catgeories", |_, _| {})
            .build();
        assert!(matches!(result, Err(RelationError::Configuration(_))));
    }
}
