//! Error types for relation assignment and replay
//!
//! Child-level validation failures are collected and surfaced late; everything
//! else here is fatal and propagates immediately.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for relation operations
pub type RelationResult<T> = Result<T, RelationError>;

/// Error types for assignment classification, staging, and replay
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RelationError {
    /// An assignment key did not match any configured relation mode
    #[error("unknown assignment key '{key}'")]
    UnknownAssignmentKind { key: String },

    /// A relation name is not registered for this parent type
    #[error("no relation '{name}' is registered for this parent")]
    UnknownRelation { name: String },

    /// An assignment payload did not have the shape its key requires
    #[error("malformed payload for '{key}': {reason}")]
    MalformedPayload { key: String, reason: String },

    /// A lookup by id found nothing; missing ids are never swallowed
    #[error("record not found in '{entity_type}' with id {id}")]
    NotFound { entity_type: String, id: i64 },

    /// A `manage` lookup named a child outside the relation's current membership
    #[error("no member of '{relation}' with id {id}")]
    ImproperAccess { relation: String, id: i64 },

    /// Raised after replay when strict and one or more children failed
    #[error("invalid child assignment: {}", .messages.join("; "))]
    InvalidChildAssignment { messages: Vec<String> },

    /// Relation declaration error, caught at registry build time
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Persistence layer failure
    #[error("backend error: {0}")]
    Backend(String),
}

/// Result of attempting to persist a single entity
pub type SaveResult = Result<(), SaveError>;

/// Failure modes of a single entity save or update
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SaveError {
    /// The entity failed its own validation; recoverable at the child level
    #[error(transparent)]
    Invalid(ValidationErrors),

    /// Persistence layer failure; always fatal
    #[error(transparent)]
    Fatal(RelationError),
}

/// Individual validation error for a specific field
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationError {
    /// The field that failed validation
    pub field: String,
    /// Human-readable error message
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.field, self.message)
    }
}

/// Ordered collection of validation errors for one entity
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ValidationErrors {
    pub errors: Vec<ValidationError>,
}

impl std::error::Error for ValidationErrors {}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a single validation error
    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError::new(field, message));
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Full human-readable messages, one per error
    pub fn full_messages(&self) -> Vec<String> {
        self.errors.iter().map(|e| e.to_string()).collect()
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_messages().join(", "))
    }
}

/// A child entity that failed its own save or update during replay
///
/// Collected per sibling and escalated only after the whole assignment has
/// been processed, so one bad child never blocks the rest.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildError {
    /// Target entity type of the failed child
    pub entity_type: String,
    /// Display label for the child (its label attribute when available)
    pub label: String,
    /// The child's own validation errors
    pub errors: ValidationErrors,
}

impl ChildError {
    pub fn new(
        entity_type: impl Into<String>,
        label: impl Into<String>,
        errors: ValidationErrors,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            label: label.into(),
            errors,
        }
    }

    /// The aggregated-report form of this error
    pub fn message(&self) -> String {
        format!("{} could not be saved because: {}", self.label, self.errors)
    }
}

impl fmt::Display for ChildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}
