//! Planning how a cached object is replayed after a serialization failure.

use crate::state::ObjectState;

/// What to do with one cached object when its transaction is replayed on a
/// fresh SQL transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildAction {
    /// Write the attributes this transaction changed back to the existing
    /// row and refresh the others from it.
    Reapply,
    /// The row vanished: insert the object again.
    Reinsert,
    /// Reset to the current row and apply every pending merge in order.
    Remerge,
    /// The row vanished: insert the first merged record, then apply the
    /// remaining merges.
    ReinsertMerged,
    /// Run the delete again.
    Redelete,
    /// Nothing to do.
    Keep,
}

/// Decide the replay of an object from its state and whether its row
/// exists in the new SQL transaction.
pub fn plan_rebuild(state: ObjectState, row_exists: bool) -> RebuildAction {
    match (state, row_exists) {
        (ObjectState::Inserted | ObjectState::Selected | ObjectState::Updated, true) => {
            RebuildAction::Reapply
        }
        (ObjectState::Inserted | ObjectState::Selected | ObjectState::Updated, false) => {
            RebuildAction::Reinsert
        }
        (ObjectState::Merged, true) => RebuildAction::Remerge,
        (ObjectState::Merged, false) => RebuildAction::ReinsertMerged,
        (ObjectState::Deleted, true) => RebuildAction::Redelete,
        _ => RebuildAction::Keep,
    }
}
