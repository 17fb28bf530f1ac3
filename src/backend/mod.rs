//! Persistence backend seam
//!
//! The core never persists anything itself: lookups, saves, updates, and
//! membership mutation all go through this trait, under whatever transaction
//! guarantee the backend provides for a single call. The crate ships an
//! in-memory implementation used by the test suite.

pub mod memory;

pub use memory::MemoryBackend;

use crate::entity::{AttributeMap, Entity};
use crate::error::{RelationResult, SaveResult};
use crate::relation::RelationDescriptor;

/// Synchronous persistence operations consumed by the reconciler and the
/// accessor layer
pub trait Backend {
    /// Fetch one entity; a missing id is a fatal `NotFound`
    fn find_by_id(&self, entity_type: &str, id: i64) -> RelationResult<Entity>;

    /// Fetch several entities; any missing id is a fatal `NotFound`, never
    /// silently dropped
    fn find_many_by_ids(&self, entity_type: &str, ids: &[i64]) -> RelationResult<Vec<Entity>> {
        ids.iter()
            .map(|id| self.find_by_id(entity_type, *id))
            .collect()
    }

    /// Find an entity whose attribute equals the value, or initialize an
    /// unsaved one carrying just that attribute
    fn find_or_init_by(
        &self,
        entity_type: &str,
        attribute: &str,
        value: &str,
    ) -> RelationResult<Entity>;

    /// Persist the entity, assigning an id on first save. Validation failure
    /// is recoverable; anything else is fatal.
    fn save(&mut self, entity: &mut Entity) -> SaveResult;

    /// Apply a partial attribute update to a persisted entity
    fn update(&mut self, entity_type: &str, id: i64, attributes: &AttributeMap) -> SaveResult;

    /// Current member ids of the relation for this parent
    fn member_ids(&self, parent: &Entity, relation: &RelationDescriptor) -> RelationResult<Vec<i64>>;

    /// Current members of the relation for this parent
    fn members(&self, parent: &Entity, relation: &RelationDescriptor) -> RelationResult<Vec<Entity>> {
        let ids = self.member_ids(parent, relation)?;
        self.find_many_by_ids(&relation.target, &ids)
    }

    /// Reset membership: delete join rows for a through-join relation, null
    /// the children's back-reference for a direct one
    fn clear_membership(
        &mut self,
        parent: &Entity,
        relation: &RelationDescriptor,
    ) -> RelationResult<()>;

    /// Link an existing child: append a join row, or set the child's foreign
    /// key
    fn attach(
        &mut self,
        parent: &Entity,
        relation: &RelationDescriptor,
        child_id: i64,
    ) -> RelationResult<()>;
}
