//! Change capture: diffs, the notification capability and the pending
//! change store.

mod diff;
mod listener;
mod pending;

pub use diff::{EntityDiff, FieldSet, FlagChange, FlagChanges, IdChanges, IdDelta};
pub use listener::ChangeListener;
pub use pending::{DrainedBatch, PendingChanges, PendingCounts};
