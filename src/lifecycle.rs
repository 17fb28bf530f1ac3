//! Lifecycle hooks - when staged assignments are replayed
//!
//! One save attempt runs start to finish: the pre-validation hook replays
//! forced assignments before the parent's own save (so they survive a failed
//! or rolled-back save), the post-persist hook replays everything else once
//! the parent has an identity, and the aggregated child error is raised last.

use crate::backend::Backend;
use crate::error::{ChildError, RelationError, RelationResult, SaveError, ValidationErrors};
use crate::parent::Parent;
use crate::reconciler::Reconciler;

/// Result of one parent save attempt
#[derive(Debug)]
pub enum SaveOutcome {
    /// The parent saved; any replayed child failures ride along for
    /// inspection (they are discarded unless strict, in which case the save
    /// returns `InvalidChildAssignment` instead)
    Saved { child_errors: Vec<ChildError> },
    /// The parent's own validation failed; nothing was replayed and the
    /// staged assignments remain introspectable
    Invalid(ValidationErrors),
}

impl SaveOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, SaveOutcome::Saved { .. })
    }
}

/// Run one save attempt for the parent: forced replay, the parent's own save,
/// then ordinary replay.
pub fn save_with_relations<B: Backend>(
    parent: &mut Parent,
    backend: &mut B,
) -> RelationResult<SaveOutcome> {
    let registry = parent.registry_handle();

    // Pre-validation hook: forced children are created unconditionally,
    // outside the parent's save, and their ids folded into the ordinary
    // staging store as synthetic id-sets.
    if parent.pending.has_forced() {
        tracing::debug!(
            parent = %parent.entity.entity_type,
            "replaying forced assignments before validation"
        );
        let entries = parent.pending.take_forced();
        for (_, assignment) in &entries {
            let mut reconciler = Reconciler::new(backend, registry.as_ref());
            let child_errors =
                reconciler.apply(&parent.entity, &mut parent.pending, assignment)?;
            for error in child_errors {
                parent.pending.record_error(error.message());
            }
        }
        if parent.pending.strict() && !parent.pending.accumulated_errors().is_empty() {
            let messages = parent.pending.take_accumulated_errors();
            parent.errors.extend(messages.iter().cloned());
            return Err(RelationError::InvalidChildAssignment { messages });
        }
    }

    match backend.save(&mut parent.entity) {
        Ok(()) => {}
        Err(SaveError::Invalid(errors)) => {
            // staged assignments stay put for introspection and a retry
            tracing::debug!(
                parent = %parent.entity.entity_type,
                "parent save failed validation; keeping postponed assignments"
            );
            return Ok(SaveOutcome::Invalid(errors));
        }
        Err(SaveError::Fatal(error)) => return Err(error),
    }

    // Post-persist hook: the parent now has an identity, so staged
    // assignments replay in insertion order.
    let mut child_errors = Vec::new();
    if parent.pending.has_postponed() {
        tracing::debug!(
            parent = %parent.entity.entity_type,
            parent_id = ?parent.entity.id,
            "replaying postponed assignments after save"
        );
        let entries = parent.pending.take_postponed();
        for (_, assignment) in &entries {
            let mut reconciler = Reconciler::new(backend, registry.as_ref());
            if reconciler.unchanged(&parent.entity, assignment)? {
                continue;
            }
            let errors = reconciler.apply(&parent.entity, &mut parent.pending, assignment)?;
            for error in &errors {
                parent.pending.record_error(error.message());
            }
            child_errors.extend(errors);
        }
    }

    if parent.pending.strict() && !parent.pending.accumulated_errors().is_empty() {
        // the parent is already durably saved; this reports without undoing
        let messages = parent.pending.take_accumulated_errors();
        parent.errors.extend(messages.iter().cloned());
        return Err(RelationError::InvalidChildAssignment { messages });
    }
    parent.pending.take_accumulated_errors();
    Ok(SaveOutcome::Saved { child_errors })
}
