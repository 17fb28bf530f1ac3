//! Relation descriptors - per-relation metadata declared once at parent-type
//! definition time and immutable thereafter

use std::fmt;
use std::sync::Arc;

use crate::entity::Entity;
use crate::error::{RelationError, RelationResult};

/// Callback run on each newly constructed child immediately before its save
/// attempt, with the parent in hand. Used to copy attributes down from the
/// parent that the child cannot supply itself.
pub type BeforeCreate = Arc<dyn Fn(&mut Entity, &Entity) + Send + Sync>;

/// How the relation links parent to child
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Linkage {
    /// One-to-many: the child row holds the parent's foreign key
    Direct { foreign_key: String },
    /// Many-to-many through a join entity
    ThroughJoin {
        /// Entity type of the join rows, e.g. `"taggings"`
        join_type: String,
        /// Join-row attribute holding the parent id
        parent_key: String,
        /// Join-row attribute holding the child id
        child_key: String,
    },
}

impl Linkage {
    pub fn is_through_join(&self) -> bool {
        matches!(self, Linkage::ThroughJoin { .. })
    }
}

/// Which generated accessor surface a relation gets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationMode {
    /// Id-set setter/getter pair
    ByIds,
    /// Text setter/getter joined on the label attribute
    ByString,
    /// As `ByIds`, plus forced early creation before the parent save
    ByForce,
    /// Only the default add/manage accessors
    JustDefaults,
}

/// Where blank-attribute detection applies for `CreateMany` payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlankPolicy {
    /// Drop each individually all-blank entry (and, by implication, a fully
    /// blank payload)
    #[default]
    PerEntry,
    /// Only a fully blank payload is dropped; a blank entry among non-blank
    /// ones is still attempted and surfaces as a child error
    TopLevelOnly,
}

/// A named, typed edge from a parent type to a child entity type
#[derive(Clone)]
pub struct RelationDescriptor {
    /// Relation name (plural), e.g. `"categories"`
    pub name: String,
    /// Singular form used in `add_`/`manage_`/`_ids` key shapes
    pub singular: String,
    /// Target child entity type
    pub target: String,
    pub linkage: Linkage,
    pub mode: RelationMode,
    /// Attribute used to display and find-or-create children in string mode
    pub label_attribute: Option<String>,
    /// Separator for splitting text-list input
    pub separator: String,
    pub blank_policy: BlankPolicy,
    pub before_create: Option<BeforeCreate>,
}

impl RelationDescriptor {
    /// Declare a direct one-to-many relation
    pub fn direct(
        name: impl Into<String>,
        singular: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            singular: singular.into(),
            target: target.into(),
            linkage: Linkage::Direct {
                foreign_key: foreign_key.into(),
            },
            mode: RelationMode::JustDefaults,
            label_attribute: None,
            separator: ",".to_string(),
            blank_policy: BlankPolicy::default(),
            before_create: None,
        }
    }

    /// Declare a many-to-many relation through a join entity
    pub fn through(
        name: impl Into<String>,
        singular: impl Into<String>,
        target: impl Into<String>,
        join_type: impl Into<String>,
        parent_key: impl Into<String>,
        child_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            singular: singular.into(),
            target: target.into(),
            linkage: Linkage::ThroughJoin {
                join_type: join_type.into(),
                parent_key: parent_key.into(),
                child_key: child_key.into(),
            },
            mode: RelationMode::JustDefaults,
            label_attribute: None,
            separator: ",".to_string(),
            blank_policy: BlankPolicy::default(),
            before_create: None,
        }
    }

    /// Set the label attribute used by string mode and error display
    pub fn with_label(mut self, attribute: impl Into<String>) -> Self {
        self.label_attribute = Some(attribute.into());
        self
    }

    /// Override the text-list separator (defaults to `","`)
    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    pub fn with_blank_policy(mut self, policy: BlankPolicy) -> Self {
        self.blank_policy = policy;
        self
    }

    /// Attach a before-create callback for children of this relation
    pub fn with_before_create<F>(mut self, callback: F) -> Self
    where
        F: Fn(&mut Entity, &Entity) + Send + Sync + 'static,
    {
        self.before_create = Some(Arc::new(callback));
        self
    }

    pub fn is_forced(&self) -> bool {
        self.mode == RelationMode::ByForce
    }

    pub fn is_through_join(&self) -> bool {
        self.linkage.is_through_join()
    }

    /// Validate the descriptor for consistency with its configured mode
    pub fn validate(&self) -> RelationResult<()> {
        if self.name.is_empty() || self.singular.is_empty() || self.target.is_empty() {
            return Err(RelationError::Configuration(format!(
                "relation '{}' must name itself, its singular, and its target",
                self.name
            )));
        }

        if self.mode == RelationMode::ByString && self.label_attribute.is_none() {
            return Err(RelationError::Configuration(format!(
                "relation '{}' is string-mode but has no label attribute",
                self.name
            )));
        }

        // Forced creation writes the parent foreign key after the fact via an
        // id-set replay; a join row cannot exist before the parent does.
        if self.mode == RelationMode::ByForce && self.is_through_join() {
            return Err(RelationError::Configuration(format!(
                "relation '{}' cannot be forced: forced relations must be direct",
                self.name
            )));
        }

        if self.separator.is_empty() {
            return Err(RelationError::Configuration(format!(
                "relation '{}' has an empty separator",
                self.name
            )));
        }

        Ok(())
    }
}

impl fmt::Debug for RelationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationDescriptor")
            .field("name", &self.name)
            .field("singular", &self.singular)
            .field("target", &self.target)
            .field("linkage", &self.linkage)
            .field("mode", &self.mode)
            .field("label_attribute", &self.label_attribute)
            .field("separator", &self.separator)
            .field("blank_policy", &self.blank_policy)
            .field("before_create", &self.before_create.as_ref().map(|_| ".."))
            .finish()
    }
}
