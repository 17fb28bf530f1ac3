//! Staging store - pending assignments awaiting replay
//!
//! One explicit bundle owned by the save attempt, instead of state hidden on
//! the parent object. Both maps preserve insertion order and overwrite at the
//! exact staging key (relation+mode pair): last write wins per key, never a
//! deep combine.

use crate::assignment::Assignment;
use crate::relation::RelationDescriptor;

/// Pending assignments for exactly one save attempt
#[derive(Debug, Clone, Default)]
pub struct PendingAssignments {
    postponed: Vec<(String, Assignment)>,
    postponed_forced: Vec<(String, Assignment)>,
    accumulated_errors: Vec<String>,
    strict: bool,
}

impl PendingAssignments {
    pub fn new(strict: bool) -> Self {
        Self {
            strict,
            ..Self::default()
        }
    }

    pub fn strict(&self) -> bool {
        self.strict
    }

    /// Stage an assignment under its key; a later write to the same key
    /// replaces the value in place, keeping the original position
    pub fn stage(&mut self, key: impl Into<String>, assignment: Assignment, forced: bool) {
        let key = key.into();
        let store = if forced {
            &mut self.postponed_forced
        } else {
            &mut self.postponed
        };
        if let Some(slot) = store.iter_mut().find(|(existing, _)| *existing == key) {
            slot.1 = assignment;
        } else {
            store.push((key, assignment));
        }
    }

    pub fn get(&self, key: &str) -> Option<&Assignment> {
        self.postponed
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, assignment)| assignment)
    }

    pub fn get_forced(&self, key: &str) -> Option<&Assignment> {
        self.postponed_forced
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, assignment)| assignment)
    }

    pub fn postponed(&self) -> &[(String, Assignment)] {
        &self.postponed
    }

    pub fn has_postponed(&self) -> bool {
        !self.postponed.is_empty()
    }

    pub fn has_forced(&self) -> bool {
        !self.postponed_forced.is_empty()
    }

    /// Drain the ordinary staging map for post-persist replay
    pub fn take_postponed(&mut self) -> Vec<(String, Assignment)> {
        std::mem::take(&mut self.postponed)
    }

    /// Drain the forced staging map for the pre-validation hook
    pub fn take_forced(&mut self) -> Vec<(String, Assignment)> {
        std::mem::take(&mut self.postponed_forced)
    }

    /// Fold an early-created child id into the ordinary store as a synthetic
    /// id-set for its relation, so ordinary replay links it once the parent
    /// has an identity
    pub fn fold_created_id(&mut self, relation: &RelationDescriptor, id: i64) {
        let key = format!("{}_ids", relation.singular);
        if let Some((_, Assignment::IdSet { ids, .. })) = self
            .postponed
            .iter_mut()
            .find(|(existing, _)| *existing == key)
        {
            if !ids.contains(&id) {
                ids.push(id);
            }
            return;
        }
        self.postponed.push((
            key,
            Assignment::IdSet {
                relation: relation.name.clone(),
                ids: vec![id],
            },
        ));
    }

    /// Record a child failure message; kept only under strict
    pub fn record_error(&mut self, message: String) {
        if self.strict {
            self.accumulated_errors.push(message);
        }
    }

    pub fn accumulated_errors(&self) -> &[String] {
        &self.accumulated_errors
    }

    pub fn take_accumulated_errors(&mut self) -> Vec<String> {
        std::mem::take(&mut self.accumulated_errors)
    }
}
