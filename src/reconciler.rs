//! Reconciler - applies one assignment against the persistence layer
//!
//! Resolves the relation, diffs desired against current membership, and
//! creates/fetches/links/updates children. Child validation failures are
//! collected per sibling and returned to the caller; persistence failures
//! propagate immediately and abort the current replay.

use serde_json::Value;

use crate::assignment::{Assignment, CreateEntries};
use crate::backend::Backend;
use crate::entity::{attributes_blank, AttributeMap, Entity};
use crate::error::{ChildError, RelationError, RelationResult, SaveError};
use crate::registry::RelationRegistry;
use crate::relation::{BlankPolicy, Linkage, RelationDescriptor};
use crate::staging::PendingAssignments;

pub struct Reconciler<'a, B: Backend> {
    backend: &'a mut B,
    registry: &'a RelationRegistry,
}

impl<'a, B: Backend> Reconciler<'a, B> {
    pub fn new(backend: &'a mut B, registry: &'a RelationRegistry) -> Self {
        Self { backend, registry }
    }

    /// Apply one assignment. The parent must be persisted except on the
    /// forced early-creation path, where created ids are folded back into
    /// the pending store for ordinary replay.
    pub fn apply(
        &mut self,
        parent: &Entity,
        pending: &mut PendingAssignments,
        assignment: &Assignment,
    ) -> RelationResult<Vec<ChildError>> {
        let relation = self.registry.resolve(assignment.relation())?.clone();
        tracing::debug!(
            relation = %relation.name,
            parent_id = ?parent.id,
            "applying {} assignment",
            kind_name(assignment)
        );
        match assignment {
            Assignment::IdSet { ids, .. } => {
                self.apply_id_set(parent, &relation, ids)?;
                Ok(Vec::new())
            }
            Assignment::TextList { raw, .. } => self.apply_text_list(parent, &relation, raw),
            Assignment::CreateMany { entries, .. } => {
                self.apply_create_many(parent, pending, &relation, entries)
            }
            Assignment::ManageMany { updates, .. } => {
                self.apply_manage_many(parent, &relation, updates)
            }
        }
    }

    /// Whether the assignment's desired canonical form already equals the
    /// relation's current one, making the whole apply a no-op
    pub fn unchanged(&self, parent: &Entity, assignment: &Assignment) -> RelationResult<bool> {
        if !parent.is_persisted() {
            return Ok(false);
        }
        let relation = self.registry.resolve(assignment.relation())?;
        match assignment {
            Assignment::IdSet { ids, .. } => {
                let current = self.backend.member_ids(parent, relation)?;
                let desired: std::collections::BTreeSet<i64> = ids.iter().copied().collect();
                let current: std::collections::BTreeSet<i64> = current.into_iter().collect();
                Ok(desired == current)
            }
            Assignment::TextList { raw, .. } => {
                Ok(*raw == self.canonical_string(parent, relation)?)
            }
            _ => Ok(false),
        }
    }

    /// Current membership rendered as the label-joined canonical string
    pub fn canonical_string(
        &self,
        parent: &Entity,
        relation: &RelationDescriptor,
    ) -> RelationResult<String> {
        let label = relation.label_attribute.as_deref().ok_or_else(|| {
            RelationError::Configuration(format!(
                "relation '{}' has no label attribute",
                relation.name
            ))
        })?;
        let members = self.backend.members(parent, relation)?;
        let labels: Vec<&str> = members
            .iter()
            .filter_map(|member| member.get_str(label))
            .collect();
        Ok(labels.join(", "))
    }

    fn apply_id_set(
        &mut self,
        parent: &Entity,
        relation: &RelationDescriptor,
        ids: &[i64],
    ) -> RelationResult<()> {
        self.backend.clear_membership(parent, relation)?;
        // fetch before linking so a missing id aborts as a fatal lookup
        self.backend.find_many_by_ids(&relation.target, ids)?;
        for id in ids {
            self.backend.attach(parent, relation, *id)?;
        }
        Ok(())
    }

    fn apply_text_list(
        &mut self,
        parent: &Entity,
        relation: &RelationDescriptor,
        raw: &str,
    ) -> RelationResult<Vec<ChildError>> {
        let label = relation.label_attribute.as_deref().ok_or_else(|| {
            RelationError::Configuration(format!(
                "relation '{}' has no label attribute",
                relation.name
            ))
        })?;

        let mut segments: Vec<&str> = Vec::new();
        for segment in raw.split(relation.separator.as_str()) {
            let segment = segment.trim();
            if !segment.is_empty() && !segments.contains(&segment) {
                segments.push(segment);
            }
        }

        self.backend.clear_membership(parent, relation)?;

        let mut child_errors = Vec::new();
        for segment in segments {
            let mut child = self.backend.find_or_init_by(&relation.target, label, segment)?;
            if !child.is_persisted() {
                if let Some(callback) = &relation.before_create {
                    callback(&mut child, parent);
                }
                match self.backend.save(&mut child) {
                    Ok(()) => {}
                    Err(SaveError::Invalid(errors)) => {
                        child_errors.push(ChildError::new(
                            relation.target.clone(),
                            child.describe(Some(label)),
                            errors,
                        ));
                        continue;
                    }
                    Err(SaveError::Fatal(error)) => return Err(error),
                }
            }
            let child_id = child.id.ok_or_else(|| {
                RelationError::Backend("save did not assign an id".to_string())
            })?;
            self.backend.attach(parent, relation, child_id)?;
        }
        Ok(child_errors)
    }

    fn apply_create_many(
        &mut self,
        parent: &Entity,
        pending: &mut PendingAssignments,
        relation: &RelationDescriptor,
        entries: &CreateEntries,
    ) -> RelationResult<Vec<ChildError>> {
        let mut child_errors = Vec::new();
        for attributes in effective_entries(entries, relation.blank_policy) {
            if let Some(error) = self.create_one(parent, pending, relation, attributes)? {
                child_errors.push(error);
            }
        }
        Ok(child_errors)
    }

    /// Construct, link, and save a single new child; returns the collected
    /// error when its save fails validation
    fn create_one(
        &mut self,
        parent: &Entity,
        pending: &mut PendingAssignments,
        relation: &RelationDescriptor,
        attributes: &AttributeMap,
    ) -> RelationResult<Option<ChildError>> {
        let mut child = Entity::new(relation.target.clone(), attributes.clone());

        // Direct children carry the parent's key from birth when the parent
        // already has an identity; forced ones get it linked at replay.
        if let (Linkage::Direct { foreign_key }, Some(parent_id)) = (&relation.linkage, parent.id) {
            child.set(foreign_key.clone(), Value::from(parent_id));
        }
        if let Some(callback) = &relation.before_create {
            callback(&mut child, parent);
        }

        match self.backend.save(&mut child) {
            Ok(()) => {}
            Err(SaveError::Invalid(errors)) => {
                return Ok(Some(ChildError::new(
                    relation.target.clone(),
                    child.describe(relation.label_attribute.as_deref()),
                    errors,
                )));
            }
            Err(SaveError::Fatal(error)) => return Err(error),
        }

        let child_id = child.id.ok_or_else(|| {
            RelationError::Backend("save did not assign an id".to_string())
        })?;
        match &relation.linkage {
            Linkage::ThroughJoin { .. } => {
                self.backend.attach(parent, relation, child_id)?;
            }
            Linkage::Direct { .. } => {
                if !parent.is_persisted() {
                    // forced path: the parent has no identity yet, so stage a
                    // synthetic id-set that links the child on replay
                    pending.fold_created_id(relation, child_id);
                }
            }
        }
        Ok(None)
    }

    fn apply_manage_many(
        &mut self,
        parent: &Entity,
        relation: &RelationDescriptor,
        updates: &[(i64, AttributeMap)],
    ) -> RelationResult<Vec<ChildError>> {
        let current = self.backend.member_ids(parent, relation)?;
        let mut child_errors = Vec::new();
        for (child_id, attributes) in updates {
            // lookups are scoped to current membership; a miss is caller error
            if !current.contains(child_id) {
                return Err(RelationError::ImproperAccess {
                    relation: relation.name.clone(),
                    id: *child_id,
                });
            }
            match self.backend.update(&relation.target, *child_id, attributes) {
                Ok(()) => {}
                Err(SaveError::Invalid(errors)) => {
                    let child = self.backend.find_by_id(&relation.target, *child_id)?;
                    child_errors.push(ChildError::new(
                        relation.target.clone(),
                        child.describe(relation.label_attribute.as_deref()),
                        errors,
                    ));
                }
                Err(SaveError::Fatal(error)) => return Err(error),
            }
        }
        Ok(child_errors)
    }
}

/// The entries a create should actually attempt, after blank filtering
fn effective_entries(entries: &CreateEntries, policy: BlankPolicy) -> Vec<&AttributeMap> {
    let all: Vec<&AttributeMap> = entries
        .entries()
        .into_iter()
        .map(|(_, attributes)| attributes)
        .collect();
    match policy {
        BlankPolicy::PerEntry => all
            .into_iter()
            .filter(|attributes| !attributes_blank(attributes))
            .collect(),
        BlankPolicy::TopLevelOnly => {
            if all.iter().all(|attributes| attributes_blank(attributes)) {
                Vec::new()
            } else {
                all
            }
        }
    }
}

fn kind_name(assignment: &Assignment) -> &'static str {
    match assignment {
        Assignment::IdSet { .. } => "id-set",
        Assignment::TextList { .. } => "text-list",
        Assignment::CreateMany { .. } => "create-many",
        Assignment::ManageMany { .. } => "manage-many",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::registry::RelationRegistry;
    use crate::relation::RelationDescriptor;
    use serde_json::json;

    fn attrs(pairs: &[(&str, Value)]) -> AttributeMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn registry() -> RelationRegistry {
        RelationRegistry::builder()
            .by_ids(RelationDescriptor::through(
                "categories",
                "category",
                "categories",
                "categorizations",
                "document_id",
                "category_id",
            ))
            .by_string(
                RelationDescriptor::through(
                    "tags",
                    "tag",
                    "tags",
                    "taggings",
                    "document_id",
                    "tag_id",
                ),
                "title",
            )
            .by_force(RelationDescriptor::direct(
                "attachments",
                "attachment",
                "attachments",
                "document_id",
            ))
            .build()
            .unwrap()
    }

    fn backend() -> MemoryBackend {
        MemoryBackend::new()
            .require_attribute("tags", "title")
            .require_attribute("categories", "title")
    }

    fn persisted_parent(backend: &mut MemoryBackend) -> Entity {
        backend
            .create("documents", attrs(&[("title", json!("doc"))]))
            .unwrap()
    }

    #[test]
    fn test_id_set_replaces_membership() {
        let registry = registry();
        let mut backend = backend();
        let parent = persisted_parent(&mut backend);
        let relation = registry.get("categories").unwrap().clone();
        let old = backend
            .create("categories", attrs(&[("title", json!("old"))]))
            .unwrap();
        let new = backend
            .create("categories", attrs(&[("title", json!("new"))]))
            .unwrap();
        backend.attach(&parent, &relation, old.id.unwrap()).unwrap();

        let mut pending = PendingAssignments::new(false);
        let mut reconciler = Reconciler::new(&mut backend, &registry);
        let errors = reconciler
            .apply(
                &parent,
                &mut pending,
                &Assignment::IdSet {
                    relation: "categories".to_string(),
                    ids: vec![new.id.unwrap()],
                },
            )
            .unwrap();

        assert!(errors.is_empty());
        assert_eq!(
            backend.member_ids(&parent, &relation).unwrap(),
            vec![new.id.unwrap()]
        );
    }

    #[test]
    fn test_id_set_missing_id_is_fatal() {
        let registry = registry();
        let mut backend = backend();
        let parent = persisted_parent(&mut backend);

        let mut pending = PendingAssignments::new(false);
        let mut reconciler = Reconciler::new(&mut backend, &registry);
        let result = reconciler.apply(
            &parent,
            &mut pending,
            &Assignment::IdSet {
                relation: "categories".to_string(),
                ids: vec![999],
            },
        );
        assert!(matches!(result, Err(RelationError::NotFound { .. })));
    }

    #[test]
    fn test_text_list_dedupes_and_drops_blanks() {
        let registry = registry();
        let mut backend = backend();
        let parent = persisted_parent(&mut backend);
        let relation = registry.get("tags").unwrap().clone();

        let mut pending = PendingAssignments::new(false);
        let mut reconciler = Reconciler::new(&mut backend, &registry);
        let errors = reconciler
            .apply(
                &parent,
                &mut pending,
                &Assignment::TextList {
                    relation: "tags".to_string(),
                    raw: "check, , check".to_string(),
                },
            )
            .unwrap();

        assert!(errors.is_empty());
        assert_eq!(backend.count("tags"), 1);
        assert_eq!(backend.member_ids(&parent, &relation).unwrap().len(), 1);
    }

    #[test]
    fn test_text_list_links_existing_and_creates_fresh() {
        let registry = registry();
        let mut backend = backend();
        let parent = persisted_parent(&mut backend);
        let relation = registry.get("tags").unwrap().clone();
        let stale = backend
            .create("tags", attrs(&[("title", json!("stale"))]))
            .unwrap();

        let mut pending = PendingAssignments::new(false);
        let mut reconciler = Reconciler::new(&mut backend, &registry);
        reconciler
            .apply(
                &parent,
                &mut pending,
                &Assignment::TextList {
                    relation: "tags".to_string(),
                    raw: "stale, minty fresh".to_string(),
                },
            )
            .unwrap();

        let members = backend.members(&parent, &relation).unwrap();
        assert_eq!(members.len(), 2);
        assert!(members.iter().any(|m| m.id == stale.id));
        assert!(backend.find_first_by("tags", "title", "minty fresh").is_some());
    }

    #[test]
    fn test_create_many_collects_child_errors_without_aborting() {
        let registry = registry();
        let mut backend = backend();
        let parent = persisted_parent(&mut backend);
        let relation = registry.get("categories").unwrap().clone();

        let entries = CreateEntries::Keyed(vec![
            ("0".to_string(), attrs(&[("title", json!("good"))])),
            ("1".to_string(), attrs(&[("title", json!("")), ("note", json!("x"))])),
            ("2".to_string(), attrs(&[("title", json!("also good"))])),
        ]);
        let mut pending = PendingAssignments::new(false);
        let mut reconciler = Reconciler::new(&mut backend, &registry);
        let errors = reconciler
            .apply(
                &parent,
                &mut pending,
                &Assignment::CreateMany {
                    relation: "categories".to_string(),
                    entries,
                },
            )
            .unwrap();

        assert_eq!(errors.len(), 1);
        assert!(errors[0].message().contains("title can't be blank"));
        assert_eq!(backend.member_ids(&parent, &relation).unwrap().len(), 2);
    }

    #[test]
    fn test_create_many_skips_all_blank_entries() {
        let registry = registry();
        let mut backend = backend();
        let parent = persisted_parent(&mut backend);

        let entries = CreateEntries::Single(attrs(&[("title", json!(" "))]));
        let mut pending = PendingAssignments::new(false);
        let mut reconciler = Reconciler::new(&mut backend, &registry);
        let errors = reconciler
            .apply(
                &parent,
                &mut pending,
                &Assignment::CreateMany {
                    relation: "categories".to_string(),
                    entries,
                },
            )
            .unwrap();

        assert!(errors.is_empty());
        assert_eq!(backend.count("categories"), 0);
    }

    fn badges_top_level_only() -> RelationRegistry {
        RelationRegistry::builder()
            .just_defaults(RelationDescriptor::direct(
                "badges",
                "badge",
                "badges",
                "document_id",
            ))
            .blank_policy("badges", BlankPolicy::TopLevelOnly)
            .build()
            .unwrap()
    }

    #[test]
    fn test_top_level_only_attempts_blank_entry_among_nonblank() {
        let registry = badges_top_level_only();
        let mut backend = MemoryBackend::new().require_attribute("badges", "title");
        let parent = backend.create("documents", AttributeMap::new()).unwrap();

        let entries = CreateEntries::Keyed(vec![
            ("0".to_string(), attrs(&[("title", json!("real"))])),
            ("1".to_string(), attrs(&[("title", json!(" "))])),
        ]);
        let mut pending = PendingAssignments::new(false);
        let mut reconciler = Reconciler::new(&mut backend, &registry);
        let errors = reconciler
            .apply(
                &parent,
                &mut pending,
                &Assignment::CreateMany {
                    relation: "badges".to_string(),
                    entries,
                },
            )
            .unwrap();

        // the blank sibling is still attempted and fails its own validation
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message().contains("title can't be blank"));
        assert_eq!(backend.count("badges"), 1);
        assert!(backend.find_first_by("badges", "title", "real").is_some());
    }

    #[test]
    fn test_top_level_only_drops_fully_blank_payload() {
        let registry = badges_top_level_only();
        let mut backend = MemoryBackend::new().require_attribute("badges", "title");
        let parent = backend.create("documents", AttributeMap::new()).unwrap();

        let entries = CreateEntries::Keyed(vec![
            ("0".to_string(), attrs(&[("title", json!(" "))])),
            ("1".to_string(), attrs(&[("title", json!(""))])),
        ]);
        let mut pending = PendingAssignments::new(false);
        let mut reconciler = Reconciler::new(&mut backend, &registry);
        let errors = reconciler
            .apply(
                &parent,
                &mut pending,
                &Assignment::CreateMany {
                    relation: "badges".to_string(),
                    entries,
                },
            )
            .unwrap();

        assert!(errors.is_empty());
        assert_eq!(backend.count("badges"), 0);
    }

    #[test]
    fn test_forced_create_folds_ids_into_pending() {
        let registry = registry();
        let mut backend = backend();
        // parent deliberately unsaved: the forced pre-validation path
        let parent = Entity::new("documents", AttributeMap::new());

        let entries = CreateEntries::Single(attrs(&[("title", json!("upload"))]));
        let mut pending = PendingAssignments::new(false);
        let mut reconciler = Reconciler::new(&mut backend, &registry);
        let errors = reconciler
            .apply(
                &parent,
                &mut pending,
                &Assignment::CreateMany {
                    relation: "attachments".to_string(),
                    entries,
                },
            )
            .unwrap();

        assert!(errors.is_empty());
        assert_eq!(backend.count("attachments"), 1);
        let created = backend.find_first_by("attachments", "title", "upload").unwrap();
        // created standalone, no parent link yet
        assert!(created.get("document_id").is_none());
        match pending.get("attachment_ids") {
            Some(Assignment::IdSet { ids, .. }) => assert_eq!(ids, &vec![created.id.unwrap()]),
            other => panic!("expected synthetic id-set, got {:?}", other),
        }
    }

    #[test]
    fn test_manage_missing_member_is_improper_access() {
        let registry = registry();
        let mut backend = backend();
        let parent = persisted_parent(&mut backend);

        let mut pending = PendingAssignments::new(false);
        let mut reconciler = Reconciler::new(&mut backend, &registry);
        let result = reconciler.apply(
            &parent,
            &mut pending,
            &Assignment::ManageMany {
                relation: "tags".to_string(),
                updates: vec![(77, AttributeMap::new())],
            },
        );
        assert_eq!(
            result,
            Err(RelationError::ImproperAccess {
                relation: "tags".to_string(),
                id: 77,
            })
        );
    }

    #[test]
    fn test_manage_updates_member_in_place() {
        let registry = registry();
        let mut backend = backend();
        let parent = persisted_parent(&mut backend);
        let relation = registry.get("tags").unwrap().clone();
        let tag = backend
            .create("tags", attrs(&[("title", json!("updateable"))]))
            .unwrap();
        backend.attach(&parent, &relation, tag.id.unwrap()).unwrap();

        let mut pending = PendingAssignments::new(false);
        let mut reconciler = Reconciler::new(&mut backend, &registry);
        let errors = reconciler
            .apply(
                &parent,
                &mut pending,
                &Assignment::ManageMany {
                    relation: "tags".to_string(),
                    updates: vec![(tag.id.unwrap(), attrs(&[("title", json!("updated!"))]))],
                },
            )
            .unwrap();

        assert!(errors.is_empty());
        assert_eq!(
            backend
                .find_by_id("tags", tag.id.unwrap())
                .unwrap()
                .get_str("title"),
            Some("updated!")
        );
    }

    #[test]
    fn test_unchanged_short_circuit_forms() {
        let registry = registry();
        let mut backend = backend();
        let parent = persisted_parent(&mut backend);
        let tags = registry.get("tags").unwrap().clone();
        let tag = backend
            .create("tags", attrs(&[("title", json!("same"))]))
            .unwrap();
        backend.attach(&parent, &tags, tag.id.unwrap()).unwrap();

        let reconciler = Reconciler::new(&mut backend, &registry);
        assert!(reconciler
            .unchanged(
                &parent,
                &Assignment::TextList {
                    relation: "tags".to_string(),
                    raw: "same".to_string(),
                },
            )
            .unwrap());
        assert!(!reconciler
            .unchanged(
                &parent,
                &Assignment::TextList {
                    relation: "tags".to_string(),
                    raw: "different".to_string(),
                },
            )
            .unwrap());
    }

    #[test]
    fn test_before_create_copies_attributes_down() {
        let registry = RelationRegistry::builder()
            .just_defaults(
                RelationDescriptor::direct("badges", "badge", "badges", "document_id")
                    .with_before_create(|child, parent| {
                        if let Some(owner) = parent.get_str("owner") {
                            child.set("owner", json!(owner));
                        }
                    }),
            )
            .build()
            .unwrap();
        let mut backend = MemoryBackend::new();
        let parent = backend
            .create("documents", attrs(&[("owner", json!("kim"))]))
            .unwrap();

        let mut pending = PendingAssignments::new(false);
        let mut reconciler = Reconciler::new(&mut backend, &registry);
        reconciler
            .apply(
                &parent,
                &mut pending,
                &Assignment::CreateMany {
                    relation: "badges".to_string(),
                    entries: CreateEntries::Single(attrs(&[("title", json!("b"))])),
                },
            )
            .unwrap();

        let badge = backend.find_first_by("badges", "title", "b").unwrap();
        assert_eq!(badge.get_str("owner"), Some("kim"));
    }
}
