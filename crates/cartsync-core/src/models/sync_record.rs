//! Synchronization record model

use serde::{Deserialize, Serialize};

use super::{EntityKind, EntityRef, LocalId};

/// Link between a local entity and its document in one shared list.
///
/// The record is the only place the remote id lives. A record with
/// `deleted == true` is a tombstone: the local entity is gone and the remote
/// document still has to be removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    /// Row identifier
    pub id: i64,
    pub kind: EntityKind,
    pub local_id: LocalId,
    /// Key of the document under `lists/{list_id}/{segment}`
    pub external_id: String,
    pub list_id: String,
    /// Last change known to both sides (Unix ms)
    pub last_change_date: Option<i64>,
    pub deleted: bool,
}

impl SyncRecord {
    #[must_use]
    pub const fn entity(&self) -> EntityRef {
        EntityRef::new(self.kind, self.local_id)
    }

    /// Tombstones are pending remote removals
    #[must_use]
    pub const fn is_tombstone(&self) -> bool {
        self.deleted
    }
}

/// Values for a record that has not been inserted yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSyncRecord {
    pub kind: EntityKind,
    pub local_id: LocalId,
    pub external_id: String,
    pub list_id: String,
    pub last_change_date: Option<i64>,
}

impl NewSyncRecord {
    #[must_use]
    pub fn new(
        kind: EntityKind,
        local_id: LocalId,
        external_id: impl Into<String>,
        list_id: impl Into<String>,
        last_change_date: Option<i64>,
    ) -> Self {
        Self {
            kind,
            local_id,
            external_id: external_id.into(),
            list_id: list_id.into(),
            last_change_date,
        }
    }
}
