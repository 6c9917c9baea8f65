//! The entity record.
//!
//! An [`Entity`] owns its forward references (ID-valued fields) and the
//! back-reference records other entities left on it. Back-references are
//! derived state maintained by the commit worker; producers never edit them.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::{EntityId, Field, Flag};
use super::value::{IdValue, Value};

/// A mutable, identifiable record in the persistent object graph.
///
/// # Examples
///
/// ```
/// use kyrocommit::{Entity, EntityId, SiteId};
///
/// let entity = Entity::new(EntityId::new(SiteId::new(1), 5));
/// assert_eq!(entity.version, 1);
/// assert!(!entity.deleted);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Immutable identity.
    pub id: EntityId,

    /// Bumped on every local mutation.
    pub version: u64,

    /// Set once the entity has been deleted by application logic.
    #[serde(default)]
    pub deleted: bool,

    /// When the entity was first created.
    pub created_at: DateTime<Utc>,
    /// Time of the last local mutation.
    pub updated_at: DateTime<Utc>,

    /// Plain value fields.
    #[serde(default)]
    pub fields: BTreeMap<Field, Value>,

    /// Set flags.
    #[serde(default)]
    pub flags: BTreeSet<Flag>,

    /// Forward references, keyed by field.
    #[serde(default)]
    pub references: BTreeMap<Field, IdValue>,

    /// Back-reference records: source entity -> fields of the source that
    /// reference this entity.
    #[serde(default, with = "back_reference_pairs")]
    pub back_references: BTreeMap<EntityId, BTreeSet<Field>>,
}

// JSON object keys must be strings, so the back-reference map is stored as a
// list of `(source, fields)` pairs.
mod back_reference_pairs {
    use std::collections::{BTreeMap, BTreeSet};

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::entity::id::{EntityId, Field};

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<EntityId, BTreeSet<Field>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let pairs: Vec<(&EntityId, &BTreeSet<Field>)> = map.iter().collect();
        pairs.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<EntityId, BTreeSet<Field>>, D::Error> {
        let pairs: Vec<(EntityId, BTreeSet<Field>)> = Vec::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}

impl Entity {
    /// Creates an empty entity with the given ID.
    #[must_use]
    pub fn new(id: EntityId) -> Self {
        let now = Utc::now();
        Self {
            id,
            version: 1,
            deleted: false,
            created_at: now,
            updated_at: now,
            fields: BTreeMap::new(),
            flags: BTreeSet::new(),
            references: BTreeMap::new(),
            back_references: BTreeMap::new(),
        }
    }

    /// Every distinct (field, target) forward reference held by this entity.
    #[must_use]
    pub fn forward_references(&self) -> Vec<(Field, EntityId)> {
        self.references
            .iter()
            .flat_map(|(field, value)| value.ids().into_iter().map(move |id| (field.clone(), id)))
            .collect()
    }

    /// Fields of this entity that reference `target`.
    #[must_use]
    pub fn fields_referencing(&self, target: EntityId) -> Vec<Field> {
        self.references
            .iter()
            .filter(|(_, value)| value.contains(target))
            .map(|(field, _)| field.clone())
            .collect()
    }

    /// Whether `source.field` is recorded as referencing this entity.
    #[must_use]
    pub fn has_back_reference(&self, source: EntityId, field: &Field) -> bool {
        self.back_references
            .get(&source)
            .is_some_and(|fields| fields.contains(field))
    }

    /// Total number of (source, field) back-reference records.
    #[must_use]
    pub fn back_reference_count(&self) -> usize {
        self.back_references.values().map(BTreeSet::len).sum()
    }

    pub(crate) fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }

    /// Returns true if the record was not present before.
    pub(crate) fn insert_back_reference(&mut self, source: EntityId, field: &Field) -> bool {
        self.back_references
            .entry(source)
            .or_default()
            .insert(field.clone())
    }

    /// Returns true if the record was present.
    pub(crate) fn delete_back_reference(&mut self, source: EntityId, field: &Field) -> bool {
        let Some(fields) = self.back_references.get_mut(&source) else {
            return false;
        };
        let removed = fields.remove(field);
        if fields.is_empty() {
            self.back_references.remove(&source);
        }
        removed
    }

    /// Removes `target` from the named reference field.
    ///
    /// A single-ID field is cleared entirely; lists and sets lose every
    /// occurrence of the ID. Returns true if the field changed.
    pub(crate) fn remove_reference(&mut self, field: &Field, target: EntityId) -> bool {
        let clear_single = match self.references.get_mut(field) {
            None => return false,
            Some(IdValue::Single(current)) => *current == target,
            Some(collection) => return collection.remove_from_collection(target),
        };
        if clear_single {
            self.references.remove(field);
        }
        clear_single
    }
}
