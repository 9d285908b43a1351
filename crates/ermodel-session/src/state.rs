//! Object lifecycle states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where an object stands relative to its transaction and the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectState {
    /// Not associated with any transaction.
    Free,
    /// Associated with a transaction but not yet in the database.
    Associated,
    /// Written to the database from this instance.
    Inserted,
    /// Read from a row that existed before.
    Selected,
    /// Read from an existing row and modified since.
    Updated,
    /// Holds the result of one or more merges.
    Merged,
    /// Deleted in this transaction.
    Deleted,
    /// Its transaction has rolled back.
    Orphan,
}

impl ObjectState {
    /// States in which the object has a row in the transaction's view of
    /// the database.
    pub const fn is_persisted(self) -> bool {
        matches!(
            self,
            ObjectState::Inserted
                | ObjectState::Selected
                | ObjectState::Updated
                | ObjectState::Merged
        )
    }

    /// States in which attribute writes go through to the database.
    pub const fn is_attached(self) -> bool {
        !matches!(self, ObjectState::Free | ObjectState::Associated)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ObjectState::Free => "FREE",
            ObjectState::Associated => "ASSOCIATED",
            ObjectState::Inserted => "INSERTED",
            ObjectState::Selected => "SELECTED",
            ObjectState::Updated => "UPDATED",
            ObjectState::Merged => "MERGED",
            ObjectState::Deleted => "DELETED",
            ObjectState::Orphan => "ORPHAN",
        }
    }
}

impl fmt::Display for ObjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
