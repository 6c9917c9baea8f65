//! Field values held by entities.
//!
//! Scalar fields hold a [`Value`]. Reference fields hold an [`IdValue`]: a
//! single ID, an ordered ID list or an unordered ID set. Only reference
//! fields take part in back-reference bookkeeping.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::id::EntityId;

/// Scalar field value.
///
/// # Examples
///
/// ```
/// use kyrocommit::Value;
///
/// let v = Value::from("lantern");
/// assert_eq!(v.as_string(), Some("lantern"));
/// assert_eq!(v.type_name(), "string");
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// UTF-8 text.
    String(String),
    /// Arbitrary nested data, stored as JSON.
    Structured(serde_json::Value),
    /// No value.
    #[default]
    Null,
}

impl Value {
    /// The boolean, if this is one.
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// The integer, if this is one.
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// The number as a float. Integers convert.
    #[allow(clippy::cast_precision_loss)]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// The text, if this is a string.
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    /// True for [`Value::Null`].
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns a human-readable type name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Structured(_) => "structured",
            Self::Null => "null",
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Self::Structured(v)
    }
}

/// Contents of an ID-valued (reference) field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "ids", rename_all = "snake_case")]
pub enum IdValue {
    /// Exactly one referenced entity.
    Single(EntityId),
    /// Ordered references; duplicates allowed.
    List(Vec<EntityId>),
    /// Unordered references.
    Set(BTreeSet<EntityId>),
}

impl IdValue {
    /// Returns the distinct referenced IDs.
    #[must_use]
    pub fn ids(&self) -> BTreeSet<EntityId> {
        match self {
            Self::Single(id) => BTreeSet::from([*id]),
            Self::List(ids) => ids.iter().copied().collect(),
            Self::Set(ids) => ids.clone(),
        }
    }

    /// Whether `id` is referenced.
    #[must_use]
    pub fn contains(&self, id: EntityId) -> bool {
        match self {
            Self::Single(current) => *current == id,
            Self::List(ids) => ids.contains(&id),
            Self::Set(ids) => ids.contains(&id),
        }
    }

    /// True if nothing is referenced. A single reference is never empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Single(_) => false,
            Self::List(ids) => ids.is_empty(),
            Self::Set(ids) => ids.is_empty(),
        }
    }

    /// Removes every occurrence of `id` from a list or set.
    ///
    /// Single-ID fields cannot be emptied in place; the owning entity clears
    /// the whole field instead. Returns true if anything was removed.
    pub(crate) fn remove_from_collection(&mut self, id: EntityId) -> bool {
        match self {
            Self::Single(_) => false,
            Self::List(ids) => {
                let before = ids.len();
                ids.retain(|existing| *existing != id);
                ids.len() != before
            }
            Self::Set(ids) => ids.remove(&id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::SiteId;

    fn id(local: u64) -> EntityId {
        EntityId::new(SiteId::new(1), local)
    }

    #[test]
    fn test_value_accessors() {
        assert_eq!(Value::Int(4).as_float(), Some(4.0));
        assert_eq!(Value::Bool(true).as_bool(), Some(true));
        assert!(Value::default().is_null());
        assert!(Value::Bool(true).as_int().is_none());
    }

    #[test]
    fn test_value_serialization() {
        let val = Value::String("brass key".into());
        let json = serde_json::to_string(&val).unwrap();
        let parsed: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(val, parsed);
    }

    #[test]
    fn test_list_removes_every_occurrence() {
        let mut list = IdValue::List(vec![id(1), id(2), id(1)]);
        assert!(list.remove_from_collection(id(1)));
        assert_eq!(list, IdValue::List(vec![id(2)]));
        assert!(!list.remove_from_collection(id(9)));
    }

    #[test]
    fn test_single_is_not_removed_in_place() {
        let mut single = IdValue::Single(id(1));
        assert!(!single.remove_from_collection(id(1)));
        assert!(single.contains(id(1)));
    }

    #[test]
    fn test_ids_are_distinct() {
        let list = IdValue::List(vec![id(3), id(3), id(4)]);
        assert_eq!(list.ids().len(), 2);
    }
}
