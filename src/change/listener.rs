//! The change notification capability.

use crate::entity::EntityId;

use super::diff::{FieldSet, FlagChanges, IdChanges};

/// Receives mutation notifications from entities.
///
/// Entities hold one listener and call it synchronously as part of every
/// mutation. The only production implementation is
/// [`PendingChanges`](super::PendingChanges).
pub trait ChangeListener: Send + Sync {
    /// Called after `id` changed. Several changes may be reported at once.
    fn entity_changed(
        &self,
        id: EntityId,
        fields_changed: &FieldSet,
        flags_changed: &FlagChanges,
        ids_changed: &IdChanges,
    );

    /// Whether `id` is queued or in flight for deletion.
    ///
    /// Code that could re-materialize an entity into a live cache must check
    /// this first.
    fn is_delete_pending(&self, id: EntityId) -> bool;
}
