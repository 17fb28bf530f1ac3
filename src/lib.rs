//! # deferred-relations
//!
//! Defers and reconciles bulk updates to an entity's one-to-many and
//! many-to-many relations, driven by untyped external input such as form
//! submissions.
//!
//! A not-yet-persisted parent cannot have foreign-key-linked children, so
//! relation writes are classified, staged per relation and mode, and replayed
//! once the parent acquires an identity. Forced relations opt into early
//! creation that survives a failed parent save; invalid children are
//! collected per sibling and surfaced as one aggregated error.
//!
//! The persistence layer itself stays external: everything goes through the
//! [`Backend`] trait, and the crate ships an in-memory implementation for
//! tests and reference.

pub mod assignment;
pub mod backend;
pub mod entity;
pub mod error;
pub mod lifecycle;
pub mod parent;
pub mod reconciler;
pub mod registry;
pub mod relation;
pub mod staging;

// Re-export core types
pub use assignment::{classify, Assignment, CreateEntries};
pub use backend::{Backend, MemoryBackend};
pub use entity::{attributes_blank, value_is_blank, AttributeMap, Entity, PersistenceState};
pub use error::{
    ChildError, RelationError, RelationResult, SaveError, SaveResult, ValidationError,
    ValidationErrors,
};
pub use lifecycle::{save_with_relations, SaveOutcome};
pub use parent::{AddView, Parent};
pub use reconciler::Reconciler;
pub use registry::{RegistryBuilder, RelationRegistry};
pub use relation::{BlankPolicy, Linkage, RelationDescriptor, RelationMode};
pub use staging::PendingAssignments;
