//! Parent host object and its postponed-aware accessor layer
//!
//! Reads are two-tier: a pure persisted read against the backend, wrapped by
//! an outer read that substitutes the postponed view while the parent is new.

use std::sync::Arc;

use serde_json::Value;

use crate::assignment::{classify, Assignment, CreateEntries};
use crate::backend::Backend;
use crate::entity::{AttributeMap, Entity, PersistenceState};
use crate::error::{ChildError, RelationError, RelationResult};
use crate::lifecycle::{save_with_relations, SaveOutcome};
use crate::reconciler::Reconciler;
use crate::registry::RelationRegistry;
use crate::staging::PendingAssignments;

/// The entity owning relations, bundled with its pending assignments for the
/// current save attempt
#[derive(Debug, Clone)]
pub struct Parent {
    pub(crate) entity: Entity,
    pub(crate) registry: Arc<RelationRegistry>,
    pub(crate) pending: PendingAssignments,
    pub(crate) errors: Vec<String>,
}

/// The last staged create, reified as unsaved children for inspection
#[derive(Debug, Clone, PartialEq)]
pub enum AddView {
    /// A flat payload builds one child
    Single(Entity),
    /// A keyed payload builds one child per caller key
    Keyed(Vec<(String, Entity)>),
}

impl Parent {
    /// Create a new, unsaved parent
    pub fn new(
        entity_type: impl Into<String>,
        attributes: AttributeMap,
        registry: Arc<RelationRegistry>,
    ) -> Self {
        let strict = registry.strict();
        Self {
            entity: Entity::new(entity_type, attributes),
            registry,
            pending: PendingAssignments::new(strict),
            errors: Vec::new(),
        }
    }

    /// Wrap an already-persisted entity
    pub fn from_entity(entity: Entity, registry: Arc<RelationRegistry>) -> Self {
        let strict = registry.strict();
        Self {
            entity,
            registry,
            pending: PendingAssignments::new(strict),
            errors: Vec::new(),
        }
    }

    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    pub fn entity_mut(&mut self) -> &mut Entity {
        &mut self.entity
    }

    pub fn id(&self) -> Option<i64> {
        self.entity.id
    }

    pub fn state(&self) -> PersistenceState {
        self.entity.state()
    }

    pub fn pending(&self) -> &PendingAssignments {
        &self.pending
    }

    /// Error messages attached by the lifecycle hooks (aggregated child
    /// failures under strict)
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub(crate) fn registry_handle(&self) -> Arc<RelationRegistry> {
        Arc::clone(&self.registry)
    }

    /// Accept one `(key, payload)` pair from external input.
    ///
    /// While the parent is new the assignment is staged (forced creates into
    /// the forced store, everything else into the ordinary one). Once
    /// persisted, control passes straight to the reconciler; collected child
    /// errors come back to the caller and are additionally accumulated when
    /// strict.
    pub fn assign<B: Backend>(
        &mut self,
        backend: &mut B,
        key: &str,
        payload: &Value,
    ) -> RelationResult<Vec<ChildError>> {
        let assignment = classify(&self.registry, key, payload)?;
        let registry = self.registry_handle();
        let relation = registry.resolve(assignment.relation())?;

        if !self.entity.is_persisted() {
            // Only creation is forced early; id-set and text assignments need
            // a parent identity either way, so they wait in the ordinary
            // store even for forced relations.
            let forced =
                relation.is_forced() && matches!(assignment, Assignment::CreateMany { .. });
            let staging_key = assignment.staging_key(relation);
            self.pending.stage(staging_key, assignment, forced);
            return Ok(Vec::new());
        }

        let mut reconciler = Reconciler::new(backend, registry.as_ref());
        if reconciler.unchanged(&self.entity, &assignment)? {
            return Ok(Vec::new());
        }
        let child_errors = reconciler.apply(&self.entity, &mut self.pending, &assignment)?;
        for error in &child_errors {
            self.pending.record_error(error.message());
        }
        Ok(child_errors)
    }

    /// Accept a whole map of assignments, e.g. one form submission
    pub fn assign_all<B: Backend>(
        &mut self,
        backend: &mut B,
        payload: &serde_json::Map<String, Value>,
    ) -> RelationResult<Vec<ChildError>> {
        let mut child_errors = Vec::new();
        for (key, value) in payload {
            child_errors.extend(self.assign(backend, key, value)?);
        }
        Ok(child_errors)
    }

    /// Run one save attempt: forced replay, the parent's own save, then
    /// ordinary replay with error aggregation
    pub fn save<B: Backend>(&mut self, backend: &mut B) -> RelationResult<SaveOutcome> {
        save_with_relations(self, backend)
    }

    /// Member ids: the staged id set while new, the live ids once persisted
    pub fn ids<B: Backend>(&self, backend: &B, relation_name: &str) -> RelationResult<Vec<i64>> {
        let relation = self.registry.resolve(relation_name)?;
        if !self.entity.is_persisted() {
            return Ok(self.staged_ids(relation_name).unwrap_or_default());
        }
        backend.member_ids(&self.entity, relation)
    }

    /// Members: staged ids resolved to entities while new (forced children
    /// exist early and show up here), the live membership once persisted
    pub fn members<B: Backend>(
        &self,
        backend: &B,
        relation_name: &str,
    ) -> RelationResult<Vec<Entity>> {
        let relation = self.registry.resolve(relation_name)?;
        if !self.entity.is_persisted() {
            return match self.staged_ids(relation_name) {
                Some(ids) => backend.find_many_by_ids(&relation.target, &ids),
                None => Ok(Vec::new()),
            };
        }
        backend.members(&self.entity, relation)
    }

    /// Label-joined string view: the raw postponed text while new, the
    /// canonical joined labels once persisted. Always a string, never absent.
    pub fn as_string<B: Backend>(
        &self,
        backend: &B,
        relation_name: &str,
    ) -> RelationResult<String> {
        let relation = self.registry.resolve(relation_name)?;
        let label = relation.label_attribute.as_deref().ok_or_else(|| {
            RelationError::Configuration(format!(
                "relation '{}' has no label attribute",
                relation_name
            ))
        })?;

        if !self.entity.is_persisted() {
            let key = format!("{}_as_string", relation.name);
            if let Some(Assignment::TextList { raw, .. }) = self.pending.get(&key) {
                return Ok(raw.clone());
            }
            return Ok(String::new());
        }

        let members = backend.members(&self.entity, relation)?;
        let labels: Vec<&str> = members
            .iter()
            .filter_map(|member| member.get_str(label))
            .collect();
        Ok(labels.join(", "))
    }

    /// The newly-constructed (unsaved) children from the last staged create,
    /// for error inspection by the caller
    pub fn add_view(&self, relation_name: &str) -> RelationResult<Option<AddView>> {
        let relation = self.registry.resolve(relation_name)?;
        let key = format!("add_{}", relation.singular);
        let staged = self
            .pending
            .get_forced(&key)
            .or_else(|| self.pending.get(&key));
        let Some(Assignment::CreateMany { entries, .. }) = staged else {
            return Ok(None);
        };
        let view = match entries {
            CreateEntries::Single(attributes) => {
                AddView::Single(Entity::new(relation.target.clone(), attributes.clone()))
            }
            CreateEntries::Keyed(keyed) => AddView::Keyed(
                keyed
                    .iter()
                    .map(|(entry_key, attributes)| {
                        (
                            entry_key.clone(),
                            Entity::new(relation.target.clone(), attributes.clone()),
                        )
                    })
                    .collect(),
            ),
        };
        Ok(Some(view))
    }

    /// Lookup from child id to live child, scoped to current membership
    pub fn manage_view<B: Backend>(
        &self,
        backend: &B,
        relation_name: &str,
    ) -> RelationResult<Vec<(i64, Entity)>> {
        let members = self.members(backend, relation_name)?;
        Ok(members
            .into_iter()
            .filter_map(|member| member.id.map(|id| (id, member)))
            .collect())
    }

    /// Scoped lookup of one member; an id outside current membership is a
    /// fatal `ImproperAccess`
    pub fn manage_lookup<B: Backend>(
        &self,
        backend: &B,
        relation_name: &str,
        id: i64,
    ) -> RelationResult<Entity> {
        let relation = self.registry.resolve(relation_name)?;
        let ids = self.ids(backend, relation_name)?;
        if !ids.contains(&id) {
            return Err(RelationError::ImproperAccess {
                relation: relation.name.clone(),
                id,
            });
        }
        backend.find_by_id(&relation.target, id)
    }

    /// The staged id set joined with commas; companion accessor for forced
    /// relations linked out-of-band before the parent has an identity
    pub fn postponed_ids_string(&self, relation_name: &str) -> RelationResult<String> {
        self.registry.resolve(relation_name)?;
        let ids = self.staged_ids(relation_name).unwrap_or_default();
        Ok(ids
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(","))
    }

    fn staged_ids(&self, relation_name: &str) -> Option<Vec<i64>> {
        let relation = self.registry.get(relation_name)?;
        let key = format!("{}_ids", relation.singular);
        match self.pending.get(&key) {
            Some(Assignment::IdSet { ids, .. }) => Some(ids.clone()),
            _ => None,
        }
    }
}
