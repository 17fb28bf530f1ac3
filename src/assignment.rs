//! Assignment classification
//!
//! Parses an incoming `(key, payload)` pair from untyped external input into a
//! typed [`Assignment`]. Dispatch is by a small fixed set of key shapes:
//!
//! - `<singular>_ids`            -> [`Assignment::IdSet`]
//! - `postponed_<singular>_ids`  -> [`Assignment::IdSet`] (forced relations,
//!   comma-separated id string for out-of-band linking)
//! - `<name>_as_string`          -> [`Assignment::TextList`]
//! - `add_<singular>`            -> [`Assignment::CreateMany`]
//! - `manage_<singular>`         -> [`Assignment::ManageMany`]
//!
//! Anything else is rejected as an unknown assignment kind.

use serde_json::Value;

use crate::entity::AttributeMap;
use crate::error::{RelationError, RelationResult};
use crate::registry::RelationRegistry;
use crate::relation::{RelationDescriptor, RelationMode};

/// Payload of a `CreateMany` assignment
///
/// A flat attribute map is a one-element create keyed implicitly; a
/// map-of-maps keeps the caller's keys so per-child outcome stays inspectable.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateEntries {
    Single(AttributeMap),
    Keyed(Vec<(String, AttributeMap)>),
}

impl CreateEntries {
    /// All entries, with the caller's key where one exists
    pub fn entries(&self) -> Vec<(Option<&str>, &AttributeMap)> {
        match self {
            CreateEntries::Single(attributes) => vec![(None, attributes)],
            CreateEntries::Keyed(entries) => entries
                .iter()
                .map(|(key, attributes)| (Some(key.as_str()), attributes))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            CreateEntries::Single(_) => 1,
            CreateEntries::Keyed(entries) => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One parsed assignment request, always naming exactly one relation
#[derive(Debug, Clone, PartialEq)]
pub enum Assignment {
    /// Replace membership with exactly these existing children
    IdSet { relation: String, ids: Vec<i64> },
    /// Replace membership with children found-or-created by label attribute.
    /// The raw string is kept verbatim so it can be echoed while the parent
    /// is new; splitting happens at reconcile time.
    TextList { relation: String, raw: String },
    /// Create and link new children from attribute maps
    CreateMany {
        relation: String,
        entries: CreateEntries,
    },
    /// Apply partial updates to existing children by id, scoped to membership
    ManageMany {
        relation: String,
        updates: Vec<(i64, AttributeMap)>,
    },
}

impl Assignment {
    pub fn relation(&self) -> &str {
        match self {
            Assignment::IdSet { relation, .. }
            | Assignment::TextList { relation, .. }
            | Assignment::CreateMany { relation, .. }
            | Assignment::ManageMany { relation, .. } => relation,
        }
    }

    /// The staging-store key for this assignment: one slot per relation+mode
    /// pair, so an id-set and a create for the same relation coexist.
    pub fn staging_key(&self, relation: &RelationDescriptor) -> String {
        match self {
            Assignment::IdSet { .. } => format!("{}_ids", relation.singular),
            Assignment::TextList { .. } => format!("{}_as_string", relation.name),
            Assignment::CreateMany { .. } => format!("add_{}", relation.singular),
            Assignment::ManageMany { .. } => format!("manage_{}", relation.singular),
        }
    }
}

/// Classify an incoming `(key, payload)` pair against the registry.
///
/// Normalization happens here: id sets drop the literal `0` sentinel and
/// deduplicate preserving order. Create payloads keep their raw entries so the
/// staged attributes stay introspectable; blank filtering is applied when the
/// children are actually built.
pub fn classify(
    registry: &RelationRegistry,
    key: &str,
    payload: &Value,
) -> RelationResult<Assignment> {
    if let Some(singular) = key.strip_prefix("add_") {
        let relation = relation_for_singular(registry, key, singular)?;
        let entries = parse_create_entries(key, payload)?;
        return Ok(Assignment::CreateMany {
            relation: relation.name.clone(),
            entries,
        });
    }

    if let Some(singular) = key.strip_prefix("manage_") {
        let relation = relation_for_singular(registry, key, singular)?;
        let updates = parse_manage_updates(key, payload)?;
        return Ok(Assignment::ManageMany {
            relation: relation.name.clone(),
            updates,
        });
    }

    if let Some(rest) = key.strip_prefix("postponed_") {
        if let Some(singular) = rest.strip_suffix("_ids") {
            let relation = relation_for_singular(registry, key, singular)?;
            if !relation.is_forced() {
                return Err(unknown_kind(key));
            }
            let ids = parse_id_string(key, payload)?;
            return Ok(Assignment::IdSet {
                relation: relation.name.clone(),
                ids,
            });
        }
    }

    if let Some(singular) = key.strip_suffix("_ids") {
        let relation = relation_for_singular(registry, key, singular)?;
        if !matches!(relation.mode, RelationMode::ByIds | RelationMode::ByForce) {
            return Err(unknown_kind(key));
        }
        let ids = parse_id_array(key, payload)?;
        return Ok(Assignment::IdSet {
            relation: relation.name.clone(),
            ids,
        });
    }

    if let Some(name) = key.strip_suffix("_as_string") {
        let relation = registry
            .get(name)
            .ok_or_else(|| unknown_kind(key))?;
        if relation.mode != RelationMode::ByString {
            return Err(unknown_kind(key));
        }
        let raw = payload.as_str().ok_or_else(|| RelationError::MalformedPayload {
            key: key.to_string(),
            reason: "expected a string".to_string(),
        })?;
        return Ok(Assignment::TextList {
            relation: relation.name.clone(),
            raw: raw.to_string(),
        });
    }

    Err(unknown_kind(key))
}

fn unknown_kind(key: &str) -> RelationError {
    RelationError::UnknownAssignmentKind {
        key: key.to_string(),
    }
}

fn relation_for_singular<'a>(
    registry: &'a RelationRegistry,
    key: &str,
    singular: &str,
) -> RelationResult<&'a RelationDescriptor> {
    registry
        .get_by_singular(singular)
        .ok_or_else(|| unknown_kind(key))
}

/// Parse one id from a JSON number or numeric string
fn parse_id(key: &str, value: &Value) -> RelationResult<i64> {
    match value {
        Value::Number(n) => n.as_i64().ok_or_else(|| RelationError::MalformedPayload {
            key: key.to_string(),
            reason: format!("'{}' is not a valid id", n),
        }),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| RelationError::MalformedPayload {
                key: key.to_string(),
                reason: format!("'{}' is not a valid id", s),
            }),
        other => Err(RelationError::MalformedPayload {
            key: key.to_string(),
            reason: format!("'{}' is not a valid id", other),
        }),
    }
}

/// Drop the `0` sentinel (hidden-field placeholder) and deduplicate,
/// preserving first-seen order
fn normalize_ids(ids: Vec<i64>) -> Vec<i64> {
    let mut seen = std::collections::BTreeSet::new();
    ids.into_iter()
        .filter(|id| *id != 0 && seen.insert(*id))
        .collect()
}

fn parse_id_array(key: &str, payload: &Value) -> RelationResult<Vec<i64>> {
    let items = payload
        .as_array()
        .ok_or_else(|| RelationError::MalformedPayload {
            key: key.to_string(),
            reason: "expected an array of ids".to_string(),
        })?;
    let ids = items
        .iter()
        .map(|item| parse_id(key, item))
        .collect::<RelationResult<Vec<i64>>>()?;
    Ok(normalize_ids(ids))
}

/// Comma-separated id string, the `postponed_<singular>_ids` companion shape
fn parse_id_string(key: &str, payload: &Value) -> RelationResult<Vec<i64>> {
    let raw = payload.as_str().ok_or_else(|| RelationError::MalformedPayload {
        key: key.to_string(),
        reason: "expected a comma-separated id string".to_string(),
    })?;
    let mut ids = Vec::new();
    for segment in raw.split(',') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        ids.push(
            segment
                .parse::<i64>()
                .map_err(|_| RelationError::MalformedPayload {
                    key: key.to_string(),
                    reason: format!("'{}' is not a valid id", segment),
                })?,
        );
    }
    Ok(normalize_ids(ids))
}

fn parse_create_entries(key: &str, payload: &Value) -> RelationResult<CreateEntries> {
    let map = payload
        .as_object()
        .ok_or_else(|| RelationError::MalformedPayload {
            key: key.to_string(),
            reason: "expected an attribute map".to_string(),
        })?;

    // Map-of-maps means keyed entries; any scalar value means one flat map.
    let keyed = !map.is_empty() && map.values().all(Value::is_object);
    if !keyed {
        return Ok(CreateEntries::Single(map.clone()));
    }

    let mut entries: Vec<(String, AttributeMap)> = map
        .iter()
        .map(|(entry_key, value)| {
            let attributes = value.as_object().cloned().unwrap_or_default();
            (entry_key.clone(), attributes)
        })
        .collect();
    sort_by_numeric_key(&mut entries);
    Ok(CreateEntries::Keyed(entries))
}

fn parse_manage_updates(key: &str, payload: &Value) -> RelationResult<Vec<(i64, AttributeMap)>> {
    let map = payload
        .as_object()
        .ok_or_else(|| RelationError::MalformedPayload {
            key: key.to_string(),
            reason: "expected a map of id to attributes".to_string(),
        })?;

    let mut updates = Vec::with_capacity(map.len());
    for (id_key, value) in map {
        let id = id_key
            .trim()
            .parse::<i64>()
            .map_err(|_| RelationError::MalformedPayload {
                key: key.to_string(),
                reason: format!("'{}' is not a valid child id", id_key),
            })?;
        let attributes = value
            .as_object()
            .cloned()
            .ok_or_else(|| RelationError::MalformedPayload {
                key: key.to_string(),
                reason: format!("entry '{}' is not an attribute map", id_key),
            })?;
        updates.push((id, attributes));
    }
    updates.sort_by_key(|(id, _)| *id);
    Ok(updates)
}

/// Caller keys are usually small integers; sort them numerically so `"10"`
/// lands after `"2"`, falling back to string order for the rest
fn sort_by_numeric_key(entries: &mut [(String, AttributeMap)]) {
    entries.sort_by(|(a, _), (b, _)| match (a.parse::<i64>(), b.parse::<i64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    });
}
